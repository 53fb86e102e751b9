use infra_graph::{LogicalId, Resource};

use crate::error::ConstructResult;

/// Position of a construct in the tree, e.g. `AppRunnerVPCDemo/AppRunnerDemoVPC/PublicSubnet1`.
///
/// The first segment is the stack and never appears in logical ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    segments: Vec<String>,
}

fn sanitize(segment: &str) -> String {
    segment.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

impl Scope {
    pub fn root(stack: impl Into<String>) -> Self {
        Self {
            segments: vec![stack.into()],
        }
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.into());
        Self { segments }
    }

    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn path(&self) -> String {
        self.segments.join("/")
    }

    /// Logical id for a resource named `suffix` inside this scope.
    /// An empty suffix names the scope's primary resource.
    pub fn logical_id(&self, suffix: &str) -> ConstructResult<LogicalId> {
        let mut id: String = self.segments.iter().skip(1).map(|s| sanitize(s)).collect();
        id.push_str(&sanitize(suffix));
        Ok(LogicalId::new(id)?)
    }

    /// Start a resource declaration with id and path metadata filled in
    pub fn resource(&self, suffix: &str, resource_type: &str) -> ConstructResult<Resource> {
        let path = if suffix.is_empty() {
            format!("{}/Resource", self.path())
        } else {
            format!("{}/{}", self.path(), suffix)
        };
        Ok(Resource::new(self.logical_id(suffix)?, resource_type).with_path(path))
    }
}
