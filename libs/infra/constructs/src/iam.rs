//! IAM roles and policies.

use infra_graph::intrinsic::{PARTITION, get_att, join, pseudo, ref_};
use infra_graph::{LogicalId, StackBuilder};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Value, json};
use strum::{AsRefStr, Display};

use crate::error::{ConstructError, ConstructResult};
use crate::scope::Scope;

/// Services that assume roles declared in this stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum ServicePrincipal {
    #[strum(serialize = "build.apprunner.amazonaws.com")]
    AppRunnerBuild,
    #[strum(serialize = "tasks.apprunner.amazonaws.com")]
    AppRunnerTasks,
    #[strum(serialize = "ecs-tasks.amazonaws.com")]
    EcsTasks,
    #[strum(serialize = "lambda.amazonaws.com")]
    Lambda,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

#[allow(clippy::ptr_arg)]
fn one_or_many<T: Serialize, S: Serializer>(items: &Vec<T>, serializer: S) -> Result<S::Ok, S::Error> {
    match items.as_slice() {
        [single] => single.serialize(serializer),
        many => many.serialize(serializer),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyStatement {
    pub effect: Effect,
    #[serde(serialize_with = "one_or_many")]
    pub action: Vec<String>,
    #[serde(serialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub resource: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<Value>,
}

impl PolicyStatement {
    pub fn allow<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            effect: Effect::Allow,
            action: actions.into_iter().map(Into::into).collect(),
            resource: Vec::new(),
            principal: None,
        }
    }

    pub fn on(mut self, resource: Value) -> Self {
        self.resource.push(resource);
        self
    }

    pub fn on_any(self) -> Self {
        self.on(json!("*"))
    }

    fn assume_role(principal: ServicePrincipal) -> Self {
        Self {
            effect: Effect::Allow,
            action: vec!["sts:AssumeRole".to_string()],
            resource: Vec::new(),
            principal: Some(json!({ "Service": principal.to_string() })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: &'static str,
    pub statement: Vec<PolicyStatement>,
}

impl PolicyDocument {
    pub fn new(statement: Vec<PolicyStatement>) -> Self {
        Self {
            version: "2012-10-17",
            statement,
        }
    }

    pub fn to_value(&self) -> ConstructResult<Value> {
        serde_json::to_value(self).map_err(ConstructError::serialize("policy document"))
    }
}

/// `arn:${Partition}:iam::aws:policy/<name>`
pub fn managed_policy_arn(name: &str) -> Value {
    join(
        "",
        vec![
            json!("arn:"),
            pseudo(PARTITION),
            json!(format!(":iam::aws:policy/{}", name)),
        ],
    )
}

#[derive(Debug, Clone, Default)]
pub struct RoleProps {
    pub managed_policies: Vec<String>,
    /// Inline policies by name
    pub inline_policies: Vec<(String, PolicyDocument)>,
}

#[derive(Debug, Clone)]
pub struct Role {
    pub id: LogicalId,
    pub principal: ServicePrincipal,
    scope: Scope,
    attached: usize,
}

impl Role {
    pub fn new(
        builder: &mut StackBuilder,
        scope: &Scope,
        principal: ServicePrincipal,
        props: RoleProps,
    ) -> ConstructResult<Self> {
        let assume_role = PolicyDocument::new(vec![PolicyStatement::assume_role(principal)]).to_value()?;
        let mut properties = json!({ "AssumeRolePolicyDocument": assume_role });
        if !props.managed_policies.is_empty() {
            properties["ManagedPolicyArns"] = Value::Array(
                props
                    .managed_policies
                    .iter()
                    .map(|name| managed_policy_arn(name))
                    .collect(),
            );
        }
        if !props.inline_policies.is_empty() {
            properties["Policies"] = props
                .inline_policies
                .iter()
                .map(|(name, document)| {
                    let document = document.to_value()?;
                    Ok(json!({ "PolicyName": name, "PolicyDocument": document }))
                })
                .collect::<ConstructResult<Vec<_>>>()?
                .into();
        }

        let id = builder.add_resource(
            scope
                .resource("", "AWS::IAM::Role")?
                .with_properties(properties),
        )?;
        Ok(Self {
            id,
            principal,
            scope: scope.clone(),
            attached: 0,
        })
    }

    pub fn arn(&self) -> Value {
        get_att(&self.id, "Arn")
    }

    /// Attach a standalone `AWS::IAM::Policy`. Resources that need the grant
    /// in place before they run should depend on the returned id.
    pub fn attach_policy(
        &mut self,
        builder: &mut StackBuilder,
        statements: Vec<PolicyStatement>,
    ) -> ConstructResult<LogicalId> {
        if statements.is_empty() {
            return Err(ConstructError::invalid("Policy", "at least one statement is required"));
        }
        let suffix = if self.attached == 0 {
            "DefaultPolicy".to_string()
        } else {
            format!("Policy{}", self.attached)
        };
        let policy_scope = self.scope.child(suffix);
        let policy_name = policy_scope.logical_id("")?;
        let document = PolicyDocument::new(statements).to_value()?;
        let policy = builder.add_resource(
            policy_scope
                .resource("", "AWS::IAM::Policy")?
                .with_properties(json!({
                    "PolicyName": policy_name.as_str(),
                    "PolicyDocument": document,
                    "Roles": [ref_(&self.id)],
                })),
        )?;
        self.attached += 1;
        Ok(policy)
    }
}
