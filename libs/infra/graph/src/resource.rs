use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumString};

use crate::error::{GraphError, GraphResult};

/// Template-unique resource identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalId(String);

impl LogicalId {
    pub const MAX_LEN: usize = 255;

    pub fn new(id: impl Into<String>) -> GraphResult<Self> {
        let id = id.into();
        if id.is_empty()
            || id.len() > Self::MAX_LEN
            || !id.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(GraphError::InvalidLogicalId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl AsRef<str> for LogicalId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What happens to the physical resource when it leaves the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
pub enum RemovalPolicy {
    #[strum(serialize = "Delete")]
    Destroy,
    #[strum(serialize = "Retain")]
    Retain,
    #[strum(serialize = "Snapshot")]
    Snapshot,
}

/// A single declared resource
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub logical_id: LogicalId,
    pub resource_type: String,
    pub properties: Map<String, Value>,
    pub depends_on: BTreeSet<LogicalId>,
    pub removal_policy: Option<RemovalPolicy>,
    pub path: Option<String>,
}

impl Resource {
    pub fn new(logical_id: LogicalId, resource_type: impl Into<String>) -> Self {
        Self {
            logical_id,
            resource_type: resource_type.into(),
            properties: Map::new(),
            depends_on: BTreeSet::new(),
            removal_policy: None,
            path: None,
        }
    }

    /// Replace the properties with a JSON object. Non-object values are ignored.
    pub fn with_properties(mut self, properties: Value) -> Self {
        if let Value::Object(map) = properties {
            self.properties = map;
        }
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn depends_on(mut self, dependency: &LogicalId) -> Self {
        self.depends_on.insert(dependency.clone());
        self
    }

    pub fn with_removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.removal_policy = Some(policy);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Resources referenced from the properties through `Ref` / `Fn::GetAtt`
    pub fn references(&self) -> BTreeSet<LogicalId> {
        let mut found = BTreeSet::new();
        for value in self.properties.values() {
            crate::intrinsic::collect_references(value, &mut found);
        }
        found
    }

    /// CloudFormation JSON for this resource
    pub fn to_template(&self) -> Value {
        let mut body = Map::new();
        body.insert("Type".into(), Value::String(self.resource_type.clone()));
        if !self.properties.is_empty() {
            body.insert("Properties".into(), Value::Object(self.properties.clone()));
        }
        if !self.depends_on.is_empty() {
            body.insert(
                "DependsOn".into(),
                Value::Array(
                    self.depends_on
                        .iter()
                        .map(|id| Value::String(id.to_string()))
                        .collect(),
                ),
            );
        }
        if let Some(policy) = self.removal_policy {
            body.insert("DeletionPolicy".into(), Value::String(policy.to_string()));
            body.insert("UpdateReplacePolicy".into(), Value::String(policy.to_string()));
        }
        if let Some(path) = &self.path {
            let mut metadata = Map::new();
            metadata.insert("aws:cdk:path".into(), Value::String(path.clone()));
            body.insert("Metadata".into(), Value::Object(metadata));
        }
        Value::Object(body)
    }
}

/// A stack output
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub id: String,
    pub value: Value,
    pub description: Option<String>,
    pub export_name: Option<String>,
}

impl Output {
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value,
            description: None,
            export_name: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_export_name(mut self, name: impl Into<String>) -> Self {
        self.export_name = Some(name.into());
        self
    }

    pub fn to_template(&self) -> Value {
        let mut body = Map::new();
        if let Some(description) = &self.description {
            body.insert("Description".into(), Value::String(description.clone()));
        }
        body.insert("Value".into(), self.value.clone());
        if let Some(export) = &self.export_name {
            let mut export_body = Map::new();
            export_body.insert("Name".into(), Value::String(export.clone()));
            body.insert("Export".into(), Value::Object(export_body));
        }
        Value::Object(body)
    }
}
