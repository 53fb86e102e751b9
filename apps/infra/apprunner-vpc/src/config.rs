//! Stack configuration.
//!
//! Both deployment variants share one composition; everything that differs
//! between them lives here as a variation point.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use infra_constructs::{AutoScalingProps, HealthCheckProps};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::debug;
use validator::{Validate, ValidationError};

use crate::error::{StackError, StackResult};

/// Prefix combined with the deploy environment into the stack name
pub const DEFAULT_STACK_PREFIX: &str = "AppRunnerVPCDemo";

/// What the edge service sits in front of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EdgeTarget {
    /// Cloud Map discovered service in the private subnets
    InternalService,
    /// Fargate service behind the public load balancer
    LoadBalancedService,
}

/// Where the edge service's image comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EdgeImageSource {
    /// Fresh build of the demo app directory
    Asset,
    /// Same image as the load balanced service
    ReuseServiceImage,
}

fn validate_identifier(name: &str) -> Result<(), ValidationError> {
    let mut chars = name.chars();
    let starts_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    if !starts_ok || !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(ValidationError::new("invalid_sql_identifier"));
    }
    Ok(())
}

fn validate_auto_pause(secs: u64) -> Result<(), ValidationError> {
    if secs != 0 && !(300..=86_400).contains(&secs) {
        return Err(ValidationError::new("auto_pause_out_of_range"));
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<(), ValidationError> {
    if !path.starts_with('/') {
        return Err(ValidationError::new("path_must_start_with_slash"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Database created by the first bootstrap statement
    #[validate(length(min = 1, max = 63), custom(function = "validate_identifier"))]
    pub name: String,
    /// Table created by the second bootstrap statement
    #[validate(length(min = 1, max = 63), custom(function = "validate_identifier"))]
    pub table: String,
    /// Idle seconds before the cluster pauses; 0 keeps it running
    #[validate(custom(function = "validate_auto_pause"))]
    pub auto_pause_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "apprunnerdemo".to_string(),
            table: "access".to_string(),
            auto_pause_secs: 300,
        }
    }
}

impl DatabaseConfig {
    pub fn auto_pause(&self) -> Option<Duration> {
        (self.auto_pause_secs > 0).then(|| Duration::from_secs(self.auto_pause_secs))
    }
}

fn validate_capacity(config: &AutoScalingConfig) -> Result<(), ValidationError> {
    if config.min_capacity > config.max_capacity {
        return Err(ValidationError::new("min_capacity_above_max_capacity"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
#[validate(schema(function = "validate_capacity"))]
pub struct AutoScalingConfig {
    #[validate(range(min = 1, max = 5))]
    pub min_capacity: u32,
    #[validate(range(min = 1, max = 5))]
    pub max_capacity: u32,
    #[validate(range(min = 1))]
    pub requests_per_target: u32,
    pub scale_in_cooldown_secs: u32,
    pub scale_out_cooldown_secs: u32,
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            min_capacity: 1,
            max_capacity: 5,
            requests_per_target: 100,
            scale_in_cooldown_secs: 60,
            scale_out_cooldown_secs: 60,
        }
    }
}

impl From<&AutoScalingConfig> for AutoScalingProps {
    fn from(config: &AutoScalingConfig) -> Self {
        Self {
            min_capacity: config.min_capacity,
            max_capacity: config.max_capacity,
            requests_per_target: config.requests_per_target,
            scale_in_cooldown_secs: config.scale_in_cooldown_secs,
            scale_out_cooldown_secs: config.scale_out_cooldown_secs,
        }
    }
}

fn validate_timeout(config: &HealthCheckConfig) -> Result<(), ValidationError> {
    if config.timeout_secs >= config.interval_secs {
        return Err(ValidationError::new("timeout_not_below_interval"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
#[validate(schema(function = "validate_timeout"))]
pub struct HealthCheckConfig {
    #[validate(length(min = 1), custom(function = "validate_path"))]
    pub path: String,
    #[validate(range(min = 5, max = 300))]
    pub interval_secs: u32,
    #[validate(range(min = 2, max = 120))]
    pub timeout_secs: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            interval_secs: 30,
            timeout_secs: 5,
        }
    }
}

impl From<&HealthCheckConfig> for HealthCheckProps {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            path: config.path.clone(),
            interval_secs: config.interval_secs,
            timeout_secs: config.timeout_secs,
        }
    }
}

fn validate_stack_config(config: &StackConfig) -> Result<(), ValidationError> {
    if config.edge_target == EdgeTarget::LoadBalancedService && !config.with_public_load_balancer {
        return Err(ValidationError::new("load_balanced_target_requires_load_balancer"));
    }
    if config.edge_image == EdgeImageSource::ReuseServiceImage && !config.with_public_load_balancer {
        return Err(ValidationError::new("reused_image_requires_load_balancer"));
    }
    Ok(())
}

/// Everything that varies between deployments of the stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
#[validate(schema(function = "validate_stack_config"))]
pub struct StackConfig {
    #[validate(length(min = 1, max = 100))]
    pub stack_prefix: String,
    /// Overrides `<stack_prefix>-<deploy_env>`
    pub stack_name: Option<String>,
    pub description: Option<String>,

    pub with_public_load_balancer: bool,
    pub edge_target: EdgeTarget,
    pub edge_image: EdgeImageSource,

    /// Build context of the edge application
    pub demo_app_dir: PathBuf,
    /// Build context of the internal service
    pub private_service_dir: PathBuf,

    /// Cloud Map namespace of the cluster
    #[validate(length(min = 1, max = 253))]
    pub namespace: String,
    /// Name the internal service registers under
    #[validate(length(min = 1, max = 63))]
    pub private_service_name: String,
    #[validate(range(min = 1))]
    pub container_port: u16,
    #[validate(length(min = 1, max = 40))]
    pub vpc_connector_name: String,

    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub autoscaling: AutoScalingConfig,
    #[validate(nested)]
    pub health_check: HealthCheckConfig,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::variant_a()
    }
}

impl StackConfig {
    /// Edge service in front of the internal service only
    pub fn variant_a() -> Self {
        Self {
            stack_prefix: DEFAULT_STACK_PREFIX.to_string(),
            stack_name: None,
            description: None,
            with_public_load_balancer: false,
            edge_target: EdgeTarget::InternalService,
            edge_image: EdgeImageSource::Asset,
            demo_app_dir: PathBuf::from("../demo_app"),
            private_service_dir: PathBuf::from("../private_service"),
            namespace: "apprunner.demo".to_string(),
            private_service_name: "privateservice".to_string(),
            container_port: 8080,
            vpc_connector_name: "CdkVPCConnectorDemo".to_string(),
            database: DatabaseConfig::default(),
            autoscaling: AutoScalingConfig::default(),
            health_check: HealthCheckConfig::default(),
        }
    }

    /// Adds the public load balanced service and points the edge at it
    pub fn variant_b() -> Self {
        Self {
            with_public_load_balancer: true,
            edge_target: EdgeTarget::LoadBalancedService,
            ..Self::variant_a()
        }
    }

    /// Load a JSON configuration file. Relative build directories are
    /// resolved against the file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> StackResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| StackError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&raw).map_err(|source| StackError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(base) = path.parent() {
            config.demo_app_dir = Self::rebase(base, &config.demo_app_dir);
            config.private_service_dir = Self::rebase(base, &config.private_service_dir);
        }
        config.validate()?;

        debug!(
            path = %path.display(),
            edge_target = %config.edge_target,
            with_public_load_balancer = config.with_public_load_balancer,
            "Loaded stack configuration"
        );
        Ok(config)
    }

    fn rebase(base: &Path, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            base.join(dir)
        }
    }

    /// Resolve build directories relative to `base`
    pub fn with_base_dir(mut self, base: impl AsRef<Path>) -> Self {
        self.demo_app_dir = Self::rebase(base.as_ref(), &self.demo_app_dir);
        self.private_service_dir = Self::rebase(base.as_ref(), &self.private_service_dir);
        self
    }
}
