use std::path::PathBuf;

use infra_constructs::ConstructError;
use infra_graph::GraphError;

pub type StackResult<T> = Result<T, StackError>;

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid stack configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Stack configuration rejected: {0}")]
    Config(#[from] validator::ValidationErrors),

    #[error(transparent)]
    Construct(#[from] ConstructError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}
