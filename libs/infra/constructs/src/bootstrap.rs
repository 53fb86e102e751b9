//! One-shot SQL statements executed through the Data API while the stack is
//! being created.

use infra_graph::intrinsic::{get_att, join, ref_};
use infra_graph::{LogicalId, StackBuilder};
use serde_json::json;
use tracing::{info, instrument};

use crate::database::ServerlessCluster;
use crate::error::{ConstructError, ConstructResult};
use crate::iam::{PolicyStatement, Role, RoleProps, ServicePrincipal};
use crate::scope::Scope;

const HANDLER_SOURCE: &str = include_str!("bootstrap_handler.py");
pub const STATEMENT_RESOURCE_TYPE: &str = "Custom::AWS";
const LOG_RETENTION_DAYS: u32 = 7;

/// Function shared by every statement in the stack
#[derive(Debug)]
pub struct StatementRunner {
    pub function: LogicalId,
    pub log_group: LogicalId,
    pub role: Role,
}

impl StatementRunner {
    pub fn new(builder: &mut StackBuilder, scope: &Scope) -> ConstructResult<Self> {
        let role = Role::new(
            builder,
            &scope.child("ServiceRole"),
            ServicePrincipal::Lambda,
            RoleProps {
                managed_policies: vec!["service-role/AWSLambdaBasicExecutionRole".into()],
                ..Default::default()
            },
        )?;

        let function = builder.add_resource(
            scope
                .resource("", "AWS::Lambda::Function")?
                .with_properties(json!({
                    "Code": { "ZipFile": HANDLER_SOURCE },
                    "Handler": "index.handler",
                    "Role": role.arn(),
                    "Runtime": "python3.12",
                    "Timeout": 120,
                })),
        )?;

        let log_group = builder.add_resource(
            scope
                .resource("LogGroup", "AWS::Logs::LogGroup")?
                .with_properties(json!({
                    "LogGroupName": join("", vec![json!("/aws/lambda/"), ref_(&function)]),
                    "RetentionInDays": LOG_RETENTION_DAYS,
                })),
        )?;

        Ok(Self {
            function,
            log_group,
            role,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqlStatementProps {
    pub sql: String,
    /// Database to run in; `None` uses the engine default
    pub database: Option<String>,
    /// Statements that must complete first
    pub after: Vec<LogicalId>,
}

impl SqlStatementProps {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            database: None,
            after: Vec::new(),
        }
    }

    pub fn in_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn after(mut self, statement: &SqlStatement) -> Self {
        self.after.push(statement.id.clone());
        self
    }
}

#[derive(Debug, Clone)]
pub struct SqlStatement {
    pub id: LogicalId,
    pub policy: LogicalId,
}

impl SqlStatement {
    /// Declare a statement run on stack creation. It waits for the cluster,
    /// its own grants, the runner's log group and every statement in
    /// `props.after`.
    #[instrument(skip(builder, runner, database, props), fields(scope = %scope.path()))]
    pub fn new(
        builder: &mut StackBuilder,
        scope: &Scope,
        runner: &mut StatementRunner,
        database: &ServerlessCluster,
        props: SqlStatementProps,
    ) -> ConstructResult<Self> {
        if props.sql.trim().is_empty() {
            return Err(ConstructError::invalid("SqlStatement", "sql must not be empty"));
        }

        let policy = runner.role.attach_policy(
            builder,
            vec![
                PolicyStatement::allow(["rds-data:ExecuteStatement"]).on_any(),
                database.secret_read_statement(),
            ],
        )?;

        let mut parameters = json!({
            "resourceArn": database.cluster_arn(),
            "secretArn": database.secret_arn(),
            "sql": props.sql,
        });
        if let Some(name) = &props.database {
            parameters["database"] = json!(name);
        }

        let mut resource = scope
            .resource("", STATEMENT_RESOURCE_TYPE)?
            .with_properties(json!({
                "ServiceToken": get_att(&runner.function, "Arn"),
                "Service": "RDSDataService",
                "Action": "executeStatement",
                "PhysicalResourceId": database.cluster_identifier(),
                "Parameters": parameters,
            }))
            .depends_on(&policy)
            .depends_on(&runner.log_group)
            .depends_on(&database.id);
        for previous in &props.after {
            resource = resource.depends_on(previous);
        }
        let id = builder.add_resource(resource)?;

        info!(statement = %id, after = props.after.len(), "Declared bootstrap statement");
        Ok(Self { id, policy })
    }
}
