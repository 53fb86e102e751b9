//! Template-level diff between a previously deployed template and a freshly
//! synthesized one.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceChange {
    Added {
        logical_id: String,
        resource_type: String,
    },
    Removed {
        logical_id: String,
        resource_type: String,
    },
    Modified {
        logical_id: String,
        resource_type: String,
        /// Set when the resource type itself changed (always a replacement)
        previous_type: Option<String>,
        /// Top-level keys under `Properties` that differ
        changed_properties: Vec<String>,
        /// `DependsOn`, `DeletionPolicy`, ... that differ
        changed_attributes: Vec<String>,
    },
}

impl ResourceChange {
    pub fn logical_id(&self) -> &str {
        match self {
            Self::Added { logical_id, .. }
            | Self::Removed { logical_id, .. }
            | Self::Modified { logical_id, .. } => logical_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChange {
    Added(String),
    Removed(String),
    Modified(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateDiff {
    pub resources: Vec<ResourceChange>,
    pub outputs: Vec<OutputChange>,
    pub description_changed: bool,
}

impl TemplateDiff {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.outputs.is_empty() && !self.description_changed
    }

    pub fn added(&self) -> usize {
        self.resources
            .iter()
            .filter(|c| matches!(c, ResourceChange::Added { .. }))
            .count()
    }

    pub fn removed(&self) -> usize {
        self.resources
            .iter()
            .filter(|c| matches!(c, ResourceChange::Removed { .. }))
            .count()
    }

    pub fn modified(&self) -> usize {
        self.resources
            .iter()
            .filter(|c| matches!(c, ResourceChange::Modified { .. }))
            .count()
    }
}

const RESOURCE_ATTRIBUTES: [&str; 4] = ["DependsOn", "DeletionPolicy", "UpdateReplacePolicy", "Condition"];

fn section<'a>(template: &'a Value, key: &str) -> Option<&'a Map<String, Value>> {
    template.get(key).and_then(Value::as_object)
}

fn resource_type(resource: &Value) -> String {
    resource
        .get("Type")
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
        .to_string()
}

fn changed_keys(old: Option<&Value>, new: Option<&Value>) -> Vec<String> {
    let empty = Map::new();
    let old = old.and_then(Value::as_object).unwrap_or(&empty);
    let new = new.and_then(Value::as_object).unwrap_or(&empty);

    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    keys.into_iter()
        .filter(|key| old.get(*key) != new.get(*key))
        .cloned()
        .collect()
}

/// Compare two CloudFormation templates
pub fn diff_templates(previous: &Value, current: &Value) -> TemplateDiff {
    let empty = Map::new();
    let old_resources = section(previous, "Resources").unwrap_or(&empty);
    let new_resources = section(current, "Resources").unwrap_or(&empty);

    let mut resources = Vec::new();
    let ids: BTreeSet<&String> = old_resources.keys().chain(new_resources.keys()).collect();
    for id in ids {
        match (old_resources.get(id), new_resources.get(id)) {
            (None, Some(new)) => resources.push(ResourceChange::Added {
                logical_id: id.clone(),
                resource_type: resource_type(new),
            }),
            (Some(old), None) => resources.push(ResourceChange::Removed {
                logical_id: id.clone(),
                resource_type: resource_type(old),
            }),
            (Some(old), Some(new)) if old != new => {
                let old_type = resource_type(old);
                let new_type = resource_type(new);
                let changed_attributes = RESOURCE_ATTRIBUTES
                    .iter()
                    .filter(|attr| old.get(**attr) != new.get(**attr))
                    .map(|attr| attr.to_string())
                    .collect();
                resources.push(ResourceChange::Modified {
                    logical_id: id.clone(),
                    previous_type: (old_type != new_type).then_some(old_type),
                    resource_type: new_type,
                    changed_properties: changed_keys(old.get("Properties"), new.get("Properties")),
                    changed_attributes,
                });
            }
            _ => {}
        }
    }

    let old_outputs = section(previous, "Outputs").unwrap_or(&empty);
    let new_outputs = section(current, "Outputs").unwrap_or(&empty);
    let mut outputs = Vec::new();
    let output_ids: BTreeSet<&String> = old_outputs.keys().chain(new_outputs.keys()).collect();
    for id in output_ids {
        match (old_outputs.get(id), new_outputs.get(id)) {
            (None, Some(_)) => outputs.push(OutputChange::Added(id.clone())),
            (Some(_), None) => outputs.push(OutputChange::Removed(id.clone())),
            (Some(old), Some(new)) if old != new => outputs.push(OutputChange::Modified(id.clone())),
            _ => {}
        }
    }

    TemplateDiff {
        resources,
        outputs,
        description_changed: previous.get("Description") != current.get("Description"),
    }
}

impl fmt::Display for TemplateDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "There were no differences");
        }
        if self.description_changed {
            writeln!(f, "[~] Description")?;
        }
        if !self.resources.is_empty() {
            writeln!(f, "Resources")?;
            for change in &self.resources {
                match change {
                    ResourceChange::Added {
                        logical_id,
                        resource_type,
                    } => writeln!(f, "[+] {} {}", resource_type, logical_id)?,
                    ResourceChange::Removed {
                        logical_id,
                        resource_type,
                    } => writeln!(f, "[-] {} {}", resource_type, logical_id)?,
                    ResourceChange::Modified {
                        logical_id,
                        resource_type,
                        previous_type,
                        changed_properties,
                        changed_attributes,
                    } => {
                        match previous_type {
                            Some(old) => writeln!(
                                f,
                                "[~] {} {} (type changed from {}, requires replacement)",
                                resource_type, logical_id, old
                            )?,
                            None => writeln!(f, "[~] {} {}", resource_type, logical_id)?,
                        }
                        for key in changed_attributes {
                            writeln!(f, " └─ [~] {}", key)?;
                        }
                        for key in changed_properties {
                            writeln!(f, " └─ [~] .{}", key)?;
                        }
                    }
                }
            }
        }
        if !self.outputs.is_empty() {
            writeln!(f, "Outputs")?;
            for change in &self.outputs {
                match change {
                    OutputChange::Added(id) => writeln!(f, "[+] Output {}", id)?,
                    OutputChange::Removed(id) => writeln!(f, "[-] Output {}", id)?,
                    OutputChange::Modified(id) => writeln!(f, "[~] Output {}", id)?,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn previous() -> Value {
        json!({
            "AWSTemplateFormatVersion": "2010-09-09",
            "Resources": {
                "Vpc": { "Type": "AWS::EC2::VPC", "Properties": { "CidrBlock": "10.0.0.0/16" } },
                "Db": {
                    "Type": "AWS::RDS::DBCluster",
                    "Properties": { "EngineVersion": "10.14" },
                    "DeletionPolicy": "Snapshot"
                },
                "Old": { "Type": "AWS::S3::Bucket" }
            },
            "Outputs": { "VpcId": { "Value": { "Ref": "Vpc" } } }
        })
    }

    #[test]
    fn test_identical_templates_have_no_diff() {
        let diff = diff_templates(&previous(), &previous());
        assert!(diff.is_empty());
        assert_eq!(diff.to_string(), "There were no differences\n");
    }

    #[test]
    fn test_detects_added_removed_and_modified() {
        let current = json!({
            "AWSTemplateFormatVersion": "2010-09-09",
            "Resources": {
                "Vpc": { "Type": "AWS::EC2::VPC", "Properties": { "CidrBlock": "10.0.0.0/16" } },
                "Db": {
                    "Type": "AWS::RDS::DBCluster",
                    "Properties": { "EngineVersion": "10.14", "EnableHttpEndpoint": true },
                    "DeletionPolicy": "Delete"
                },
                "New": { "Type": "AWS::AppRunner::Service" }
            },
            "Outputs": {
                "VpcId": { "Value": { "Ref": "Vpc" } },
                "Url": { "Value": "https://x" }
            }
        });

        let diff = diff_templates(&previous(), &current);
        assert_eq!(diff.added(), 1);
        assert_eq!(diff.removed(), 1);
        assert_eq!(diff.modified(), 1);
        assert_eq!(diff.outputs, vec![OutputChange::Added("Url".to_string())]);

        let modified = diff
            .resources
            .iter()
            .find(|c| c.logical_id() == "Db")
            .unwrap();
        match modified {
            ResourceChange::Modified {
                changed_properties,
                changed_attributes,
                previous_type,
                ..
            } => {
                assert_eq!(changed_properties, &vec!["EnableHttpEndpoint".to_string()]);
                assert_eq!(changed_attributes, &vec!["DeletionPolicy".to_string()]);
                assert!(previous_type.is_none());
            }
            other => panic!("unexpected change {:?}", other),
        }

        let rendered = diff.to_string();
        assert!(rendered.contains("[+] AWS::AppRunner::Service New"));
        assert!(rendered.contains("[-] AWS::S3::Bucket Old"));
        assert!(rendered.contains(" └─ [~] .EnableHttpEndpoint"));
    }

    #[test]
    fn test_type_change_is_flagged() {
        let current = json!({
            "Resources": { "Old": { "Type": "AWS::SQS::Queue" } }
        });
        let previous = json!({
            "Resources": { "Old": { "Type": "AWS::S3::Bucket" } }
        });
        let diff = diff_templates(&previous, &current);
        assert!(diff.to_string().contains("requires replacement"));
    }

    #[test]
    fn test_diff_against_empty_template() {
        let diff = diff_templates(&json!({}), &previous());
        assert_eq!(diff.added(), 3);
        assert!(!diff.description_changed);
    }
}
