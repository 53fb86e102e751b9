//! Intrinsic function helpers.
//!
//! Every helper returns plain `serde_json::Value` so it can be dropped into
//! resource properties anywhere. References to other resources made through
//! [`ref_`] and [`get_att`] become dependency edges in the manifest.

use std::collections::BTreeSet;

use serde_json::{Value, json};

use crate::resource::LogicalId;

pub const ACCOUNT_ID: &str = "AWS::AccountId";
pub const REGION: &str = "AWS::Region";
pub const STACK_NAME: &str = "AWS::StackName";
pub const URL_SUFFIX: &str = "AWS::URLSuffix";
pub const PARTITION: &str = "AWS::Partition";

/// `{ "Ref": id }`
pub fn ref_(id: &LogicalId) -> Value {
    json!({ "Ref": id.as_str() })
}

/// `{ "Ref": "AWS::..." }` for pseudo parameters
pub fn pseudo(name: &str) -> Value {
    json!({ "Ref": name })
}

/// `{ "Fn::GetAtt": [id, attribute] }`
pub fn get_att(id: &LogicalId, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [id.as_str(), attribute] })
}

/// `{ "Fn::Join": [delimiter, parts] }`
pub fn join(delimiter: &str, parts: Vec<Value>) -> Value {
    json!({ "Fn::Join": [delimiter, parts] })
}

/// `{ "Fn::Sub": template }`
pub fn sub(template: &str) -> Value {
    json!({ "Fn::Sub": template })
}

/// `{ "Fn::Select": [index, list] }`
pub fn select(index: usize, list: Value) -> Value {
    json!({ "Fn::Select": [index.to_string(), list] })
}

/// `{ "Fn::GetAZs": "" }`: availability zones of the deploy region
pub fn get_azs() -> Value {
    json!({ "Fn::GetAZs": "" })
}

fn is_pseudo(name: &str) -> bool {
    name.starts_with("AWS::")
}

/// Collect every resource referenced by `Ref` or `Fn::GetAtt` inside `value`.
/// Logical ids that fail validation are still ignored here; the builder
/// reports undeclared references separately.
pub fn collect_references(value: &Value, found: &mut BTreeSet<LogicalId>) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(target)) = map.get("Ref") {
                    if !is_pseudo(target) {
                        if let Ok(id) = LogicalId::new(target.clone()) {
                            found.insert(id);
                        }
                    }
                    return;
                }
                if let Some(Value::Array(args)) = map.get("Fn::GetAtt") {
                    if let Some(Value::String(target)) = args.first() {
                        if let Ok(id) = LogicalId::new(target.clone()) {
                            found.insert(id);
                        }
                    }
                    return;
                }
                if let Some(Value::String(template)) = map.get("Fn::Sub") {
                    collect_sub_references(template, found);
                    return;
                }
            }
            for nested in map.values() {
                collect_references(nested, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, found);
            }
        }
        _ => {}
    }
}

/// `${Name}` and `${Name.Attr}` placeholders inside a `Fn::Sub` string
fn collect_sub_references(template: &str, found: &mut BTreeSet<LogicalId>) {
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        let name = &after[..end];
        // `${!Literal}` escapes a placeholder
        if !name.starts_with('!') && !is_pseudo(name) {
            let target = name.split('.').next().unwrap_or(name);
            if let Ok(id) = LogicalId::new(target) {
                found.insert(id);
            }
        }
        rest = &after[end + 1..];
    }
}

/// Convenience wrapper returning the references of one value
pub fn references(value: &Value) -> BTreeSet<LogicalId> {
    let mut found = BTreeSet::new();
    collect_references(value, &mut found);
    found
}
