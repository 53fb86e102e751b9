use std::path::PathBuf;

use infra_graph::GraphError;

pub type ConstructResult<T> = Result<T, ConstructError>;

#[derive(Debug, thiserror::Error)]
pub enum ConstructError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Invalid {construct} properties: {reason}")]
    InvalidProps {
        construct: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid CIDR block '{cidr}': {reason}")]
    Cidr { cidr: String, reason: String },

    #[error("Asset directory {path} unusable: {reason}")]
    Asset { path: PathBuf, reason: String },

    #[error("Failed to render {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ConstructError {
    pub(crate) fn invalid(construct: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidProps {
            construct,
            reason: reason.into(),
        }
    }

    pub(crate) fn serialize(what: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| Self::Serialize { what, source }
    }
}
