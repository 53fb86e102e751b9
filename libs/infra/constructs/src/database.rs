//! Aurora Serverless PostgreSQL cluster with a generated credential secret
//! and the Data API enabled.

use std::time::Duration;

use infra_graph::intrinsic::{ACCOUNT_ID, PARTITION, REGION, get_att, join, pseudo, ref_};
use infra_graph::{LogicalId, RemovalPolicy, StackBuilder};
use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::error::{ConstructError, ConstructResult};
use crate::iam::PolicyStatement;
use crate::network::{SubnetType, Vpc};
use crate::scope::Scope;
use crate::security::{Port, SecurityGroup};

pub const POSTGRES_PORT: u16 = 5432;
pub const MASTER_USERNAME: &str = "postgres";

const MIN_AUTO_PAUSE: Duration = Duration::from_secs(300);
const MAX_AUTO_PAUSE: Duration = Duration::from_secs(86_400);
const CAPACITY_UNITS: [u32; 8] = [2, 4, 8, 16, 32, 64, 192, 384];

#[derive(Debug, Clone)]
pub struct ServerlessClusterProps {
    pub engine_version: String,
    /// Pause after this much idle time. `None` or zero keeps the cluster running.
    pub auto_pause: Option<Duration>,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub removal_policy: RemovalPolicy,
    /// Database created with the cluster; `None` leaves it to bootstrap statements
    pub default_database_name: Option<String>,
}

impl Default for ServerlessClusterProps {
    fn default() -> Self {
        Self {
            engine_version: "10.14".to_string(),
            auto_pause: Some(MIN_AUTO_PAUSE),
            min_capacity: 2,
            max_capacity: 16,
            removal_policy: RemovalPolicy::Snapshot,
            default_database_name: None,
        }
    }
}

impl ServerlessClusterProps {
    fn auto_pause(&self) -> ConstructResult<Option<Duration>> {
        match self.auto_pause {
            None => Ok(None),
            Some(pause) if pause.is_zero() => Ok(None),
            Some(pause) if (MIN_AUTO_PAUSE..=MAX_AUTO_PAUSE).contains(&pause) => Ok(Some(pause)),
            Some(pause) => Err(ConstructError::invalid(
                "ServerlessCluster",
                format!(
                    "auto-pause of {}s is outside {}..={}s",
                    pause.as_secs(),
                    MIN_AUTO_PAUSE.as_secs(),
                    MAX_AUTO_PAUSE.as_secs()
                ),
            )),
        }
    }

    fn validate(&self) -> ConstructResult<()> {
        for capacity in [self.min_capacity, self.max_capacity] {
            if !CAPACITY_UNITS.contains(&capacity) {
                return Err(ConstructError::invalid(
                    "ServerlessCluster",
                    format!("{} is not a valid Aurora capacity unit", capacity),
                ));
            }
        }
        if self.min_capacity > self.max_capacity {
            return Err(ConstructError::invalid(
                "ServerlessCluster",
                "min_capacity exceeds max_capacity",
            ));
        }
        Ok(())
    }
}

fn resolve_secret(secret: &LogicalId, key: &str) -> Value {
    join(
        "",
        vec![
            json!("{{resolve:secretsmanager:"),
            ref_(secret),
            json!(format!(":SecretString:{}::}}}}", key)),
        ],
    )
}

#[derive(Debug, Clone)]
pub struct ServerlessCluster {
    pub id: LogicalId,
    pub secret: LogicalId,
    pub secret_attachment: LogicalId,
    pub subnet_group: LogicalId,
    pub security_group: SecurityGroup,
    pub removal_policy: RemovalPolicy,
}

impl ServerlessCluster {
    #[instrument(skip(builder, vpc, props), fields(scope = %scope.path()))]
    pub fn new(
        builder: &mut StackBuilder,
        scope: &Scope,
        vpc: &Vpc,
        props: ServerlessClusterProps,
    ) -> ConstructResult<Self> {
        props.validate()?;
        let auto_pause = props.auto_pause()?;
        let subnets = vpc.subnet_ids(SubnetType::PrivateWithNat);
        if subnets.is_empty() {
            return Err(ConstructError::invalid(
                "ServerlessCluster",
                "the VPC has no private subnets",
            ));
        }
        let policy = props.removal_policy;

        let subnet_group = builder.add_resource(
            scope
                .child("Subnets")
                .resource("Default", "AWS::RDS::DBSubnetGroup")?
                .with_properties(json!({
                    "DBSubnetGroupDescription": format!("Subnets for {} database", scope.name()),
                    "SubnetIds": subnets,
                }))
                .with_removal_policy(policy),
        )?;

        let security_group = SecurityGroup::new(
            builder,
            &scope.child("SecurityGroup"),
            vpc,
            "RDS security group",
        )?;

        let secret = builder.add_resource(
            scope
                .child("Secret")
                .resource("", "AWS::SecretsManager::Secret")?
                .with_properties(json!({
                    "Description": format!("Generated by the stack for: {}", scope.path()),
                    "GenerateSecretString": {
                        "ExcludeCharacters": " %+~`#$&*()|[]{}:;<>?!'/@\"\\",
                        "GenerateStringKey": "password",
                        "PasswordLength": 30,
                        "SecretStringTemplate": json!({ "username": MASTER_USERNAME }).to_string(),
                    },
                }))
                .with_removal_policy(policy),
        )?;

        let mut scaling = json!({
            "AutoPause": auto_pause.is_some(),
            "MinCapacity": props.min_capacity,
            "MaxCapacity": props.max_capacity,
        });
        if let Some(pause) = auto_pause {
            scaling["SecondsUntilAutoPause"] = json!(pause.as_secs());
        }

        let mut cluster = scope
            .resource("", "AWS::RDS::DBCluster")?
            .with_properties(json!({
                "Engine": "aurora-postgresql",
                "EngineMode": "serverless",
                "EngineVersion": props.engine_version,
                "DBSubnetGroupName": ref_(&subnet_group),
                "VpcSecurityGroupIds": [security_group.group_id()],
                "MasterUsername": resolve_secret(&secret, "username"),
                "MasterUserPassword": resolve_secret(&secret, "password"),
                "EnableHttpEndpoint": true,
                "StorageEncrypted": true,
                "CopyTagsToSnapshot": true,
                "ScalingConfiguration": scaling,
            }))
            .with_removal_policy(policy);
        if let Some(name) = &props.default_database_name {
            cluster = cluster.with_property("DatabaseName", json!(name));
        }
        let id = builder.add_resource(cluster)?;

        let secret_attachment = builder.add_resource(
            scope
                .child("Secret")
                .resource("Attachment", "AWS::SecretsManager::SecretTargetAttachment")?
                .with_properties(json!({
                    "SecretId": ref_(&secret),
                    "TargetId": ref_(&id),
                    "TargetType": "AWS::RDS::DBCluster",
                })),
        )?;

        info!(
            cluster = %id,
            engine_version = %props.engine_version,
            auto_pause_secs = auto_pause.map(|p| p.as_secs()).unwrap_or(0),
            removal_policy = %policy,
            "Declared serverless database cluster"
        );

        Ok(Self {
            id,
            secret,
            secret_attachment,
            subnet_group,
            security_group,
            removal_policy: policy,
        })
    }

    /// Open the Postgres port to anything carrying the cluster's own security group
    pub fn allow_default_port_internally(&mut self, builder: &mut StackBuilder) -> ConstructResult<LogicalId> {
        let own = self.security_group.clone();
        self.security_group.allow_from(
            builder,
            &own,
            Port::Tcp(POSTGRES_PORT),
            "Members of the database security group",
        )
    }

    pub fn cluster_identifier(&self) -> Value {
        ref_(&self.id)
    }

    pub fn cluster_arn(&self) -> Value {
        join(
            "",
            vec![
                json!("arn:"),
                pseudo(PARTITION),
                json!(":rds:"),
                pseudo(REGION),
                json!(":"),
                pseudo(ACCOUNT_ID),
                json!(":cluster:"),
                ref_(&self.id),
            ],
        )
    }

    /// Arn of the secret once it carries the cluster's connection fields
    pub fn secret_arn(&self) -> Value {
        ref_(&self.secret_attachment)
    }

    pub fn endpoint_address(&self) -> Value {
        get_att(&self.id, "Endpoint.Address")
    }

    pub fn secret_read_statement(&self) -> PolicyStatement {
        PolicyStatement::allow(["secretsmanager:GetSecretValue", "secretsmanager:DescribeSecret"])
            .on(self.secret_arn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::VpcProps;

    fn build(props: ServerlessClusterProps) -> ConstructResult<(ServerlessCluster, StackBuilder)> {
        let mut builder = StackBuilder::new("Test");
        let root = Scope::root("Test");
        let vpc = Vpc::new(&mut builder, &root.child("Vpc"), VpcProps::default())?;
        let db = ServerlessCluster::new(&mut builder, &root.child("AppRunnerDemoDatabase"), &vpc, props)?;
        Ok((db, builder))
    }

    #[test]
    fn test_cluster_properties() {
        let (db, builder) = build(ServerlessClusterProps {
            removal_policy: RemovalPolicy::Destroy,
            ..Default::default()
        })
        .unwrap();
        let manifest = builder.build().unwrap();
        let cluster = manifest.resource(&db.id).unwrap();

        assert_eq!(cluster.property("Engine"), Some(&json!("aurora-postgresql")));
        assert_eq!(cluster.property("EngineMode"), Some(&json!("serverless")));
        assert_eq!(cluster.property("EngineVersion"), Some(&json!("10.14")));
        assert_eq!(cluster.property("EnableHttpEndpoint"), Some(&json!(true)));
        assert_eq!(cluster.removal_policy, Some(RemovalPolicy::Destroy));
        assert_eq!(cluster.to_template()["DeletionPolicy"], "Delete");

        // secret follows the cluster's removal policy
        let secret = manifest.resource(&db.secret).unwrap();
        assert_eq!(secret.removal_policy, Some(RemovalPolicy::Destroy));

        assert!(manifest.depends_on(&db.id, &db.secret).unwrap());
        assert!(manifest.depends_on(&db.id, &db.subnet_group).unwrap());
        assert!(manifest.depends_on(&db.secret_attachment, &db.id).unwrap());
    }

    #[test]
    fn test_auto_pause_configuration() {
        let (db, builder) = build(ServerlessClusterProps::default()).unwrap();
        let scaling = builder.resource(&db.id).unwrap().property("ScalingConfiguration").unwrap().clone();
        assert_eq!(scaling["AutoPause"], true);
        assert_eq!(scaling["SecondsUntilAutoPause"], 300);

        let (db, builder) = build(ServerlessClusterProps {
            auto_pause: Some(Duration::ZERO),
            ..Default::default()
        })
        .unwrap();
        let scaling = builder.resource(&db.id).unwrap().property("ScalingConfiguration").unwrap().clone();
        assert_eq!(scaling["AutoPause"], false);
        assert!(scaling.get("SecondsUntilAutoPause").is_none());
    }

    #[test]
    fn test_invalid_auto_pause_rejected() {
        let result = build(ServerlessClusterProps {
            auto_pause: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        assert!(matches!(result, Err(ConstructError::InvalidProps { .. })));
    }

    #[test]
    fn test_invalid_capacity_rejected() {
        assert!(build(ServerlessClusterProps {
            min_capacity: 3,
            ..Default::default()
        })
        .is_err());
        assert!(build(ServerlessClusterProps {
            min_capacity: 32,
            max_capacity: 4,
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_self_ingress_on_postgres_port() {
        let (mut db, mut builder) = build(ServerlessClusterProps::default()).unwrap();
        let rule = db.allow_default_port_internally(&mut builder).unwrap();
        let rule = builder.resource(&rule).unwrap();
        assert_eq!(rule.property("FromPort"), Some(&json!(5432)));
        assert_eq!(rule.property("SourceSecurityGroupId"), Some(&db.security_group.group_id()));
    }

    #[test]
    fn test_credentials_resolved_from_secret() {
        let (db, builder) = build(ServerlessClusterProps::default()).unwrap();
        let cluster = builder.resource(&db.id).unwrap();
        let username = &cluster.property("MasterUsername").unwrap()["Fn::Join"][1];
        assert_eq!(username[1], ref_(&db.secret));
        assert_eq!(username[2], ":SecretString:username::}}");
    }
}
