//! Container image sources.
//!
//! A [`DockerImageAsset`] is a local build context identified by a content
//! hash. Synthesis never builds images; it records each asset in an
//! [`AssetManifest`] so the publishing step can build and push them to the
//! bootstrap repository under the hash tag.

use std::fs;
use std::path::{Path, PathBuf};

use infra_graph::intrinsic::sub;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{ConstructError, ConstructResult};

/// Qualifier of the default bootstrap stack
pub const BOOTSTRAP_QUALIFIER: &str = "hnb659fds";

const REPOSITORY_TEMPLATE: &str =
    "${AWS::AccountId}.dkr.ecr.${AWS::Region}.${AWS::URLSuffix}/cdk-hnb659fds-container-assets-${AWS::AccountId}-${AWS::Region}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerImageAsset {
    pub directory: PathBuf,
    /// SHA-256 over sorted relative paths and file contents
    pub hash: String,
}

impl DockerImageAsset {
    /// Hash a build context. The walk is sorted so the hash only changes
    /// when a file name or file content changes.
    pub fn from_directory(directory: impl AsRef<Path>) -> ConstructResult<Self> {
        let directory = directory.as_ref();
        let asset_error = |reason: String| ConstructError::Asset {
            path: directory.to_path_buf(),
            reason,
        };
        if !directory.is_dir() {
            return Err(asset_error("not an existing directory".to_string()));
        }

        let mut hasher = Sha256::new();
        let mut files = 0usize;
        for entry in WalkDir::new(directory).sort_by_file_name() {
            let entry = entry.map_err(|e| asset_error(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(directory)
                .map_err(|e| asset_error(e.to_string()))?;
            let contents = fs::read(entry.path()).map_err(|e| asset_error(e.to_string()))?;

            // separators keep ("ab", "c") and ("a", "bc") apart
            hasher.update(relative.to_string_lossy().replace('\\', "/").as_bytes());
            hasher.update([0u8]);
            hasher.update((contents.len() as u64).to_be_bytes());
            hasher.update(&contents);
            files += 1;
        }

        let hash = format!("{:x}", hasher.finalize());
        debug!(directory = %directory.display(), files, hash = %hash, "Hashed image asset");
        Ok(Self {
            directory: directory.to_path_buf(),
            hash,
        })
    }

    pub fn image_tag(&self) -> &str {
        &self.hash
    }

    /// Image URI in the bootstrap repository, resolved at deploy time
    pub fn image_uri(&self) -> Value {
        sub(&format!("{}:{}", REPOSITORY_TEMPLATE, self.hash))
    }
}

/// Where a container image comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerImage {
    Asset(DockerImageAsset),
    Registry(String),
}

impl ContainerImage {
    pub fn image_uri(&self) -> Value {
        match self {
            Self::Asset(asset) => asset.image_uri(),
            Self::Registry(image) => Value::String(image.clone()),
        }
    }

    pub fn asset(&self) -> Option<&DockerImageAsset> {
        match self {
            Self::Asset(asset) => Some(asset),
            Self::Registry(_) => None,
        }
    }

    pub fn is_public_registry(&self) -> bool {
        matches!(self, Self::Registry(image) if image.starts_with("public.ecr.aws/"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetEntry {
    pub id: String,
    pub source_directory: PathBuf,
    pub repository_name: String,
    pub image_tag: String,
}

/// Account and region the images are published to. An unresolved account
/// is left to the credentials of the publishing step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDestination {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    pub region: String,
}

impl AssetDestination {
    /// Bootstrap repository name in this destination
    pub fn repository_name(&self) -> String {
        let account = self.account.as_deref().unwrap_or("${AWS::AccountId}");
        format!("cdk-{}-container-assets-{}-{}", BOOTSTRAP_QUALIFIER, account, self.region)
    }
}

/// Every image the stack needs built and pushed before deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetManifest {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<AssetDestination>,
    pub docker_images: Vec<AssetEntry>,
}

impl AssetManifest {
    pub const VERSION: &'static str = "36.0.0";

    pub fn new() -> Self {
        Self {
            version: Self::VERSION.to_string(),
            destination: None,
            docker_images: Vec::new(),
        }
    }

    pub fn for_destination(account: Option<String>, region: impl Into<String>) -> Self {
        Self {
            destination: Some(AssetDestination {
                account,
                region: region.into(),
            }),
            ..Self::new()
        }
    }

    /// Record an asset. The same build context is only listed once.
    pub fn add(&mut self, asset: &DockerImageAsset) {
        if self.docker_images.iter().any(|e| e.id == asset.hash) {
            return;
        }
        self.docker_images.push(AssetEntry {
            id: asset.hash.clone(),
            source_directory: asset.directory.clone(),
            repository_name: match &self.destination {
                Some(destination) => destination.repository_name(),
                None => format!("cdk-{}-container-assets", BOOTSTRAP_QUALIFIER),
            },
            image_tag: asset.hash.clone(),
        });
    }

    pub fn len(&self) -> usize {
        self.docker_images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docker_images.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, contents).unwrap();
        }
        dir
    }

    #[test]
    fn test_hash_is_stable_and_content_sensitive() {
        let a = context(&[("Dockerfile", "FROM python:3.9"), ("main.py", "print('hi')")]);
        let b = context(&[("Dockerfile", "FROM python:3.9"), ("main.py", "print('hi')")]);
        let c = context(&[("Dockerfile", "FROM python:3.9"), ("main.py", "print('bye')")]);

        let hash_a = DockerImageAsset::from_directory(a.path()).unwrap().hash;
        assert_eq!(hash_a.len(), 64);
        assert_eq!(hash_a, DockerImageAsset::from_directory(b.path()).unwrap().hash);
        assert_ne!(hash_a, DockerImageAsset::from_directory(c.path()).unwrap().hash);
    }

    #[test]
    fn test_hash_includes_relative_paths() {
        let a = context(&[("app/main.py", "x")]);
        let b = context(&[("lib/main.py", "x")]);
        assert_ne!(
            DockerImageAsset::from_directory(a.path()).unwrap().hash,
            DockerImageAsset::from_directory(b.path()).unwrap().hash
        );
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("demo_app");
        assert!(matches!(
            DockerImageAsset::from_directory(&missing),
            Err(ConstructError::Asset { .. })
        ));
    }

    #[test]
    fn test_image_uri_uses_bootstrap_repository() {
        let dir = context(&[("Dockerfile", "FROM scratch")]);
        let asset = DockerImageAsset::from_directory(dir.path()).unwrap();
        let uri = asset.image_uri();
        let template = uri["Fn::Sub"].as_str().unwrap();
        assert!(template.starts_with("${AWS::AccountId}.dkr.ecr.${AWS::Region}"));
        assert!(template.ends_with(&format!(":{}", asset.hash)));
        // pseudo parameters only, no resource references
        assert!(infra_graph::intrinsic::references(&uri).is_empty());
    }

    #[test]
    fn test_manifest_deduplicates() {
        let dir = context(&[("Dockerfile", "FROM scratch")]);
        let asset = DockerImageAsset::from_directory(dir.path()).unwrap();
        let mut manifest = AssetManifest::new();
        manifest.add(&asset);
        manifest.add(&asset);
        assert_eq!(manifest.len(), 1);

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["dockerImages"][0]["imageTag"], asset.hash.as_str());
    }

    #[test]
    fn test_destination_names_the_repository() {
        let dir = context(&[("Dockerfile", "FROM scratch")]);
        let asset = DockerImageAsset::from_directory(dir.path()).unwrap();
        let mut manifest = AssetManifest::for_destination(Some("111111111111".into()), "eu-west-1");
        manifest.add(&asset);
        assert_eq!(
            manifest.docker_images[0].repository_name,
            "cdk-hnb659fds-container-assets-111111111111-eu-west-1"
        );

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["destination"]["account"], "111111111111");
        assert_eq!(json["destination"]["region"], "eu-west-1");

        let unresolved = AssetManifest::for_destination(None, "us-west-2");
        let json = serde_json::to_value(&unresolved).unwrap();
        assert!(json["destination"].get("account").is_none());
        assert!(serde_json::to_value(AssetManifest::new()).unwrap().get("destination").is_none());
    }

    #[test]
    fn test_public_registry_detection() {
        assert!(ContainerImage::Registry("public.ecr.aws/nginx/nginx:latest".into()).is_public_registry());
        assert!(!ContainerImage::Registry("123456789012.dkr.ecr.us-west-2.amazonaws.com/x".into()).is_public_registry());
    }
}
