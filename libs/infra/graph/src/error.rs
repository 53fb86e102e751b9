use crate::resource::LogicalId;

pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Invalid logical id '{0}': must be 1-255 alphanumeric characters")]
    InvalidLogicalId(String),

    #[error("Resource '{0}' is declared more than once")]
    DuplicateResource(LogicalId),

    #[error("Output '{0}' is declared more than once")]
    DuplicateOutput(String),

    #[error("Resource '{0}' not found")]
    ResourceNotFound(LogicalId),

    #[error("Resource '{resource}' depends on undeclared resource '{dependency}'")]
    UnknownDependency {
        resource: LogicalId,
        dependency: LogicalId,
    },

    #[error("'{owner}' references undeclared resource '{reference}'")]
    UnknownReference { owner: String, reference: LogicalId },

    #[error("Resource '{0}' cannot depend on itself")]
    SelfDependency(LogicalId),

    #[error("Dependency cycle detected involving '{0}'")]
    CycleDetected(LogicalId),
}
