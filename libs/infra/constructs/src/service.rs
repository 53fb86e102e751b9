//! Fargate task definitions and services on a shared cluster.

use infra_graph::intrinsic::{get_att, ref_};
use infra_graph::{LogicalId, RemovalPolicy, StackBuilder};
use serde::Serialize;
use serde_json::{Value, json};
use strum::{AsRefStr, Display};
use tracing::{info, instrument};

use crate::asset::ContainerImage;
use crate::cluster::Cluster;
use crate::error::{ConstructError, ConstructResult};
use crate::iam::{PolicyStatement, Role, RoleProps, ServicePrincipal};
use crate::network::{SubnetType, Vpc};
use crate::scope::Scope;
use crate::security::SecurityGroup;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerHealthCheck {
    pub command: Vec<String>,
    pub interval: u32,
    pub timeout: u32,
    pub retries: u32,
}

impl ContainerHealthCheck {
    /// `curl -f http://localhost:<port><path> || exit 1`
    pub fn http(port: u16, path: &str, interval_secs: u32, timeout_secs: u32) -> Self {
        Self {
            command: vec![
                "CMD-SHELL".to_string(),
                format!("curl -f http://localhost:{}{} || exit 1", port, path),
            ],
            interval: interval_secs,
            timeout: timeout_secs,
            retries: 3,
        }
    }

    /// Path probed by an `http` check
    pub fn probed_path(command: &[String]) -> Option<String> {
        let shell = command.get(1)?;
        let url = shell.split_whitespace().find(|part| part.starts_with("http://"))?;
        let without_scheme = url.trim_start_matches("http://");
        let slash = without_scheme.find('/')?;
        Some(without_scheme[slash..].to_string())
    }
}

/// Bind an environment variable to one JSON key of a secret
#[derive(Debug, Clone, PartialEq)]
pub struct SecretEnv {
    pub name: String,
    pub secret_arn: Value,
    pub json_key: String,
}

impl SecretEnv {
    fn value_from(&self) -> Value {
        infra_graph::intrinsic::join(
            "",
            vec![self.secret_arn.clone(), json!(format!(":{}::", self.json_key))],
        )
    }
}

#[derive(Debug, Clone)]
pub struct ContainerDefinitionProps {
    pub name: String,
    pub image: ContainerImage,
    pub port: u16,
    pub environment: Vec<(String, Value)>,
    pub secrets: Vec<SecretEnv>,
    pub stream_prefix: String,
    pub log_retention_days: u32,
    pub health_check: Option<ContainerHealthCheck>,
}

impl ContainerDefinitionProps {
    pub fn new(name: impl Into<String>, image: ContainerImage, port: u16) -> Self {
        let name = name.into();
        Self {
            stream_prefix: name.clone(),
            name,
            image,
            port,
            environment: Vec::new(),
            secrets: Vec::new(),
            log_retention_days: 1,
            health_check: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskDefinitionProps {
    pub cpu: u32,
    pub memory_mib: u32,
    pub container: ContainerDefinitionProps,
}

impl TaskDefinitionProps {
    pub fn new(container: ContainerDefinitionProps) -> Self {
        Self {
            cpu: 256,
            memory_mib: 512,
            container,
        }
    }

    fn validate(&self) -> ConstructResult<()> {
        let allowed: &[u32] = match self.cpu {
            256 => &[512, 1024, 2048],
            512 => &[1024, 2048, 3072, 4096],
            1024 => &[2048, 3072, 4096, 5120, 6144, 7168, 8192],
            _ => {
                return Err(ConstructError::invalid(
                    "TaskDefinition",
                    format!("unsupported Fargate cpu {}", self.cpu),
                ));
            }
        };
        if !allowed.contains(&self.memory_mib) {
            return Err(ConstructError::invalid(
                "TaskDefinition",
                format!("{} MiB is not valid with {} cpu units", self.memory_mib, self.cpu),
            ));
        }
        if self.container.port == 0 {
            return Err(ConstructError::invalid("TaskDefinition", "container port must be set"));
        }
        Ok(())
    }
}

/// Fargate task definition with a single essential container
#[derive(Debug)]
pub struct TaskDefinition {
    pub id: LogicalId,
    pub task_role: Role,
    pub execution_role: Role,
    pub execution_policy: LogicalId,
    pub log_group: LogicalId,
    pub container_name: String,
    pub container_port: u16,
    pub image: ContainerImage,
}

impl TaskDefinition {
    #[instrument(skip(builder, props), fields(scope = %scope.path(), container = %props.container.name))]
    pub fn new(builder: &mut StackBuilder, scope: &Scope, props: TaskDefinitionProps) -> ConstructResult<Self> {
        props.validate()?;
        let container = props.container;

        let task_role = Role::new(builder, &scope.child("TaskRole"), ServicePrincipal::EcsTasks, RoleProps::default())?;
        let mut execution_role = Role::new(
            builder,
            &scope.child("ExecutionRole"),
            ServicePrincipal::EcsTasks,
            RoleProps::default(),
        )?;

        let container_scope = scope.child(&container.name);
        let log_group = builder.add_resource(
            container_scope
                .resource("LogGroup", "AWS::Logs::LogGroup")?
                .with_properties(json!({ "RetentionInDays": container.log_retention_days }))
                .with_removal_policy(RemovalPolicy::Destroy),
        )?;

        let mut statements = vec![
            PolicyStatement::allow([
                "ecr:BatchCheckLayerAvailability",
                "ecr:GetDownloadUrlForLayer",
                "ecr:BatchGetImage",
                "ecr:GetAuthorizationToken",
            ])
            .on_any(),
            PolicyStatement::allow(["logs:CreateLogStream", "logs:PutLogEvents"]).on(get_att(&log_group, "Arn")),
        ];
        if !container.secrets.is_empty() {
            let mut read = PolicyStatement::allow(["secretsmanager:GetSecretValue", "secretsmanager:DescribeSecret"]);
            for secret in &container.secrets {
                if !read.resource.contains(&secret.secret_arn) {
                    read = read.on(secret.secret_arn.clone());
                }
            }
            statements.push(read);
        }
        let execution_policy = execution_role.attach_policy(builder, statements)?;

        let mut definition = json!({
            "Name": container.name,
            "Image": container.image.image_uri(),
            "Essential": true,
            "PortMappings": [{ "ContainerPort": container.port, "Protocol": "tcp" }],
            "LogConfiguration": {
                "LogDriver": "awslogs",
                "Options": {
                    "awslogs-group": ref_(&log_group),
                    "awslogs-stream-prefix": container.stream_prefix,
                    "awslogs-region": infra_graph::intrinsic::pseudo(infra_graph::intrinsic::REGION),
                }
            },
        });
        if !container.environment.is_empty() {
            definition["Environment"] = Value::Array(
                container
                    .environment
                    .iter()
                    .map(|(name, value)| json!({ "Name": name, "Value": value }))
                    .collect(),
            );
        }
        if !container.secrets.is_empty() {
            definition["Secrets"] = Value::Array(
                container
                    .secrets
                    .iter()
                    .map(|secret| json!({ "Name": secret.name, "ValueFrom": secret.value_from() }))
                    .collect(),
            );
        }
        if let Some(check) = &container.health_check {
            definition["HealthCheck"] =
                serde_json::to_value(check).map_err(ConstructError::serialize("container health check"))?;
        }

        let id = builder.add_resource(
            scope
                .resource("", "AWS::ECS::TaskDefinition")?
                .with_properties(json!({
                    "ContainerDefinitions": [definition],
                    "Cpu": props.cpu.to_string(),
                    "Memory": props.memory_mib.to_string(),
                    "NetworkMode": "awsvpc",
                    "RequiresCompatibilities": ["FARGATE"],
                    "ExecutionRoleArn": execution_role.arn(),
                    "TaskRoleArn": task_role.arn(),
                    "Family": scope.logical_id("")?.as_str(),
                })),
        )?;

        Ok(Self {
            id,
            task_role,
            execution_role,
            execution_policy,
            log_group,
            container_name: container.name,
            container_port: container.port,
            image: container.image,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum CapacityProvider {
    #[strum(serialize = "FARGATE")]
    Fargate,
    #[strum(serialize = "FARGATE_SPOT")]
    FargateSpot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityProviderStrategy {
    pub provider: CapacityProvider,
    pub weight: u32,
}

#[derive(Debug, Clone)]
pub struct LoadBalancerTarget {
    pub target_group: LogicalId,
    /// Listener the target group is attached through; the service waits for it
    pub listener: LogicalId,
}

#[derive(Debug, Clone)]
pub struct FargateServiceProps {
    pub desired_count: u32,
    /// Cloud Map name registered in the cluster namespace
    pub cloud_map_name: Option<String>,
    /// Empty means plain `FARGATE` launch type
    pub capacity_provider_strategies: Vec<CapacityProviderStrategy>,
    pub enable_execute_command: bool,
    pub circuit_breaker_rollback: Option<bool>,
    pub load_balancer: Option<LoadBalancerTarget>,
    pub health_check_grace_period_secs: Option<u32>,
    /// Extra resources the service must wait for
    pub after: Vec<LogicalId>,
}

impl Default for FargateServiceProps {
    fn default() -> Self {
        Self {
            desired_count: 1,
            cloud_map_name: None,
            capacity_provider_strategies: Vec::new(),
            enable_execute_command: false,
            circuit_breaker_rollback: None,
            load_balancer: None,
            health_check_grace_period_secs: None,
            after: Vec::new(),
        }
    }
}

/// Long-running Fargate service in the VPC's private subnets
#[derive(Debug, Clone)]
pub struct FargateService {
    pub id: LogicalId,
    pub security_group: SecurityGroup,
    pub cloud_map_service: Option<LogicalId>,
    pub container_port: u16,
    discovery_name: Option<String>,
}

impl FargateService {
    #[instrument(skip_all, fields(scope = %scope.path()))]
    pub fn new(
        builder: &mut StackBuilder,
        scope: &Scope,
        cluster: &Cluster,
        vpc: &Vpc,
        task: &mut TaskDefinition,
        props: FargateServiceProps,
    ) -> ConstructResult<Self> {
        let subnets = vpc.subnet_ids(SubnetType::PrivateWithNat);
        if subnets.is_empty() {
            return Err(ConstructError::invalid("FargateService", "the VPC has no private subnets"));
        }
        let security_group = SecurityGroup::new(
            builder,
            &scope.child("SecurityGroup"),
            vpc,
            &format!("Security group of {}", scope.name()),
        )?;

        let cloud_map_service = match &props.cloud_map_name {
            Some(name) => Some(
                builder.add_resource(
                    scope
                        .child("CloudmapService")
                        .resource("", "AWS::ServiceDiscovery::Service")?
                        .with_properties(json!({
                            "DnsConfig": {
                                "DnsRecords": [{ "TTL": 60, "Type": "A" }],
                                "NamespaceId": cluster.namespace_ref(),
                                "RoutingPolicy": "MULTIVALUE",
                            },
                            "HealthCheckCustomConfig": { "FailureThreshold": 1 },
                            "Name": name,
                            "NamespaceId": cluster.namespace_ref(),
                        })),
                )?,
            ),
            None => None,
        };

        let mut deployment = json!({ "MaximumPercent": 200, "MinimumHealthyPercent": 50 });
        if let Some(rollback) = props.circuit_breaker_rollback {
            deployment["DeploymentCircuitBreaker"] = json!({ "Enable": true, "Rollback": rollback });
        }

        let mut properties = json!({
            "Cluster": cluster.cluster_name(),
            "TaskDefinition": ref_(&task.id),
            "DesiredCount": props.desired_count,
            "DeploymentConfiguration": deployment,
            "EnableECSManagedTags": true,
            "EnableExecuteCommand": props.enable_execute_command,
            "NetworkConfiguration": {
                "AwsvpcConfiguration": {
                    "AssignPublicIp": "DISABLED",
                    "SecurityGroups": [security_group.group_id()],
                    "Subnets": subnets,
                }
            },
        });
        if props.capacity_provider_strategies.is_empty() {
            properties["LaunchType"] = json!("FARGATE");
        } else {
            properties["CapacityProviderStrategy"] = Value::Array(
                props
                    .capacity_provider_strategies
                    .iter()
                    .map(|s| json!({ "CapacityProvider": s.provider.to_string(), "Weight": s.weight }))
                    .collect(),
            );
        }
        if let Some(registry) = &cloud_map_service {
            properties["ServiceRegistries"] = json!([{ "RegistryArn": get_att(registry, "Arn") }]);
        }
        if let Some(target) = &props.load_balancer {
            properties["LoadBalancers"] = json!([{
                "ContainerName": task.container_name,
                "ContainerPort": task.container_port,
                "TargetGroupArn": ref_(&target.target_group),
            }]);
        }
        if let Some(grace) = props.health_check_grace_period_secs {
            properties["HealthCheckGracePeriodSeconds"] = json!(grace);
        }

        let mut resource = scope
            .resource("Service", "AWS::ECS::Service")?
            .with_properties(properties)
            .depends_on(&task.execution_policy);

        if props.enable_execute_command {
            let policy = task.task_role.attach_policy(
                builder,
                vec![
                    PolicyStatement::allow([
                        "ssmmessages:CreateControlChannel",
                        "ssmmessages:CreateDataChannel",
                        "ssmmessages:OpenControlChannel",
                        "ssmmessages:OpenDataChannel",
                    ])
                    .on_any(),
                    PolicyStatement::allow(["logs:DescribeLogGroups"]).on_any(),
                ],
            )?;
            resource = resource.depends_on(&policy);
        }
        if !props.capacity_provider_strategies.is_empty() {
            if let Some(association) = &cluster.capacity_providers {
                resource = resource.depends_on(association);
            }
        }
        if let Some(target) = &props.load_balancer {
            resource = resource.depends_on(&target.listener);
        }
        for dependency in &props.after {
            resource = resource.depends_on(dependency);
        }
        let id = builder.add_resource(resource)?;

        info!(
            service = %id,
            discovery = props.cloud_map_name.as_deref().unwrap_or("-"),
            load_balanced = props.load_balancer.is_some(),
            "Declared Fargate service"
        );

        Ok(Self {
            id,
            security_group,
            cloud_map_service,
            container_port: task.container_port,
            discovery_name: props.cloud_map_name.map(|name| format!("{}.{}", name, cluster.namespace)),
        })
    }

    /// `http://<name>.<namespace>:<port>` for Cloud Map registered services
    pub fn discovery_url(&self) -> Option<String> {
        self.discovery_name
            .as_ref()
            .map(|host| format!("http://{}:{}", host, self.container_port))
    }

    pub fn service_name(&self) -> Value {
        get_att(&self.id, "Name")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterProps;
    use crate::network::VpcProps;

    struct Fixture {
        builder: StackBuilder,
        root: Scope,
        vpc: Vpc,
        cluster: Cluster,
    }

    fn fixture() -> Fixture {
        let mut builder = StackBuilder::new("Test");
        let root = Scope::root("Test");
        let vpc = Vpc::new(&mut builder, &root.child("Vpc"), VpcProps::default()).unwrap();
        let cluster = Cluster::new(
            &mut builder,
            &root.child("Cluster"),
            &vpc,
            ClusterProps {
                namespace: "apprunner.demo".into(),
                fargate_capacity_providers: true,
            },
        )
        .unwrap();
        Fixture {
            builder,
            root,
            vpc,
            cluster,
        }
    }

    fn private_task(f: &mut Fixture) -> TaskDefinition {
        let mut container = ContainerDefinitionProps::new(
            "PrivateDemoService",
            ContainerImage::Registry("public.ecr.aws/nginx/nginx:latest".into()),
            8080,
        );
        container.stream_prefix = "appRunnerDemoECSPrivateService".into();
        TaskDefinition::new(&mut f.builder, &f.root.child("PrivateTaskDef"), TaskDefinitionProps::new(container)).unwrap()
    }

    #[test]
    fn test_probed_path() {
        let check = ContainerHealthCheck::http(8080, "/health", 30, 5);
        assert_eq!(check.command[1], "curl -f http://localhost:8080/health || exit 1");
        assert_eq!(ContainerHealthCheck::probed_path(&check.command).as_deref(), Some("/health"));
        assert_eq!(ContainerHealthCheck::probed_path(&["CMD".to_string()]), None);
    }

    #[test]
    fn test_task_definition_shape() {
        let mut f = fixture();
        let task = private_task(&mut f);
        let manifest = f.builder.build().unwrap();

        let resource = manifest.resource(&task.id).unwrap();
        assert_eq!(resource.property("Cpu"), Some(&json!("256")));
        assert_eq!(resource.property("Memory"), Some(&json!("512")));
        assert_eq!(resource.property("NetworkMode"), Some(&json!("awsvpc")));
        let container = &resource.property("ContainerDefinitions").unwrap()[0];
        assert_eq!(container["PortMappings"][0]["ContainerPort"], 8080);
        assert_eq!(
            container["LogConfiguration"]["Options"]["awslogs-stream-prefix"],
            "appRunnerDemoECSPrivateService"
        );

        let log_group = manifest.resource(&task.log_group).unwrap();
        assert_eq!(log_group.removal_policy, Some(RemovalPolicy::Destroy));
        assert_eq!(log_group.property("RetentionInDays"), Some(&json!(1)));
    }

    #[test]
    fn test_invalid_task_size() {
        let mut f = fixture();
        let mut props = TaskDefinitionProps::new(ContainerDefinitionProps::new(
            "X",
            ContainerImage::Registry("nginx".into()),
            80,
        ));
        props.memory_mib = 8192;
        assert!(TaskDefinition::new(&mut f.builder, &f.root.child("Bad"), props).is_err());
    }

    #[test]
    fn test_cloud_map_service() {
        let mut f = fixture();
        let mut task = private_task(&mut f);
        let service = FargateService::new(
            &mut f.builder,
            &f.root.child("PrivateDemoService"),
            &f.cluster,
            &f.vpc,
            &mut task,
            FargateServiceProps {
                cloud_map_name: Some("privateservice".into()),
                capacity_provider_strategies: vec![CapacityProviderStrategy {
                    provider: CapacityProvider::FargateSpot,
                    weight: 1,
                }],
                enable_execute_command: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(
            service.discovery_url().as_deref(),
            Some("http://privateservice.apprunner.demo:8080")
        );

        let manifest = f.builder.build().unwrap();
        let resource = manifest.resource(&service.id).unwrap();
        assert_eq!(
            resource.property("CapacityProviderStrategy"),
            Some(&json!([{ "CapacityProvider": "FARGATE_SPOT", "Weight": 1 }]))
        );
        assert!(resource.property("LaunchType").is_none());
        assert_eq!(resource.property("EnableECSManagedTags"), Some(&json!(true)));
        assert!(manifest
            .explicit_dependencies(&service.id)
            .unwrap()
            .contains(f.cluster.capacity_providers.as_ref().unwrap()));
        assert!(manifest.depends_on(&service.id, service.cloud_map_service.as_ref().unwrap()).unwrap());
    }

    #[test]
    fn test_secrets_bound_from_json_keys() {
        let mut f = fixture();
        let mut container = ContainerDefinitionProps::new("Web", ContainerImage::Registry("nginx".into()), 80);
        container.secrets.push(SecretEnv {
            name: "DB_USER".into(),
            secret_arn: json!("arn:secret"),
            json_key: "username".into(),
        });
        container.secrets.push(SecretEnv {
            name: "DB_PASS".into(),
            secret_arn: json!("arn:secret"),
            json_key: "password".into(),
        });
        let task = TaskDefinition::new(&mut f.builder, &f.root.child("Web"), TaskDefinitionProps::new(container)).unwrap();

        let resource = f.builder.resource(&task.id).unwrap();
        let secrets = &resource.property("ContainerDefinitions").unwrap()[0]["Secrets"];
        assert_eq!(secrets[0]["Name"], "DB_USER");
        assert_eq!(secrets[1]["ValueFrom"]["Fn::Join"][1][1], ":password::");

        // secret granted once to the execution role
        let policy = f.builder.resource(&task.execution_policy).unwrap();
        let statements = policy.property("PolicyDocument").unwrap()["Statement"].as_array().unwrap().clone();
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[2]["Resource"], "arn:secret");
    }
}
