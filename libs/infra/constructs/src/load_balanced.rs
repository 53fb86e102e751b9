//! Internet-facing application load balancer in front of a Fargate service,
//! with request-count autoscaling.

use infra_graph::intrinsic::{ACCOUNT_ID, PARTITION, get_att, join, pseudo, ref_};
use infra_graph::{LogicalId, StackBuilder};
use serde_json::{Value, json};
use tracing::{info, instrument};
use validator::{Validate, ValidationError};

use crate::cluster::Cluster;
use crate::error::ConstructResult;
use crate::network::{SubnetType, Vpc};
use crate::scope::Scope;
use crate::security::{Port, SecurityGroup};
use crate::service::{
    ContainerDefinitionProps, ContainerHealthCheck, FargateService, FargateServiceProps,
    LoadBalancerTarget, TaskDefinition, TaskDefinitionProps,
};

const LISTENER_PORT: u16 = 80;

fn validate_health_check(props: &HealthCheckProps) -> Result<(), ValidationError> {
    if props.timeout_secs >= props.interval_secs {
        return Err(ValidationError::new("timeout_not_below_interval"));
    }
    Ok(())
}

fn validate_capacity(props: &AutoScalingProps) -> Result<(), ValidationError> {
    if props.min_capacity > props.max_capacity {
        return Err(ValidationError::new("min_capacity_above_max_capacity"));
    }
    Ok(())
}

/// HTTP health check shared by the container and the target group
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
#[validate(schema(function = "validate_health_check"))]
pub struct HealthCheckProps {
    #[validate(length(min = 1), custom(function = "validate_path"))]
    pub path: String,
    #[validate(range(min = 5, max = 300))]
    pub interval_secs: u32,
    #[validate(range(min = 2, max = 120))]
    pub timeout_secs: u32,
}

fn validate_path(path: &str) -> Result<(), ValidationError> {
    if !path.starts_with('/') {
        return Err(ValidationError::new("path_must_start_with_slash"));
    }
    Ok(())
}

impl Default for HealthCheckProps {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            interval_secs: 30,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Validate)]
#[validate(schema(function = "validate_capacity"))]
pub struct AutoScalingProps {
    #[validate(range(min = 1))]
    pub min_capacity: u32,
    #[validate(range(min = 1))]
    pub max_capacity: u32,
    #[validate(range(min = 1))]
    pub requests_per_target: u32,
    pub scale_in_cooldown_secs: u32,
    pub scale_out_cooldown_secs: u32,
}

#[derive(Debug, Clone)]
pub struct LoadBalancedServiceProps {
    pub container: ContainerDefinitionProps,
    pub desired_count: u32,
    pub health_check: HealthCheckProps,
    pub autoscaling: Option<AutoScalingProps>,
    pub deregistration_delay_secs: u32,
    pub circuit_breaker_rollback: bool,
    pub after: Vec<LogicalId>,
}

impl LoadBalancedServiceProps {
    pub fn new(container: ContainerDefinitionProps) -> Self {
        Self {
            container,
            desired_count: 1,
            health_check: HealthCheckProps::default(),
            autoscaling: None,
            deregistration_delay_secs: 5,
            circuit_breaker_rollback: true,
            after: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct ApplicationLoadBalancedFargateService {
    pub load_balancer: LogicalId,
    pub load_balancer_security_group: SecurityGroup,
    pub listener: LogicalId,
    pub target_group: LogicalId,
    pub task_definition: TaskDefinition,
    pub service: FargateService,
    pub scalable_target: Option<LogicalId>,
    pub scaling_policy: Option<LogicalId>,
}

impl ApplicationLoadBalancedFargateService {
    #[instrument(skip_all, fields(scope = %scope.path()))]
    pub fn new(
        builder: &mut StackBuilder,
        scope: &Scope,
        cluster: &Cluster,
        vpc: &Vpc,
        props: LoadBalancedServiceProps,
    ) -> ConstructResult<Self> {
        props.health_check.validate()?;
        if let Some(scaling) = &props.autoscaling {
            scaling.validate()?;
        }

        let lb_scope = scope.child("LB");
        let mut lb_security_group =
            SecurityGroup::new(builder, &lb_scope.child("SecurityGroup"), vpc, "Load balancer security group")?;
        lb_security_group.allow_from_any_ipv4(builder, Port::Tcp(LISTENER_PORT), "Allow from anyone on port 80")?;

        let mut lb = lb_scope
            .resource("", "AWS::ElasticLoadBalancingV2::LoadBalancer")?
            .with_properties(json!({
                "LoadBalancerAttributes": [{ "Key": "deletion_protection.enabled", "Value": "false" }],
                "Scheme": "internet-facing",
                "SecurityGroups": [lb_security_group.group_id()],
                "Subnets": vpc.subnet_ids(SubnetType::Public),
                "Type": "application",
            }));
        // reachable only once public routes exist
        for route in vpc.default_routes(SubnetType::Public) {
            lb = lb.depends_on(&route);
        }
        let load_balancer = builder.add_resource(lb)?;

        let health = &props.health_check;
        let target_group = builder.add_resource(
            lb_scope
                .child("PublicListener")
                .resource("ECSGroup", "AWS::ElasticLoadBalancingV2::TargetGroup")?
                .with_properties(json!({
                    "Port": LISTENER_PORT,
                    "Protocol": "HTTP",
                    "TargetType": "ip",
                    "VpcId": vpc.vpc_id(),
                    "HealthCheckPath": health.path,
                    "HealthCheckIntervalSeconds": health.interval_secs,
                    "HealthCheckTimeoutSeconds": health.timeout_secs,
                    "TargetGroupAttributes": [
                        {
                            "Key": "deregistration_delay.timeout_seconds",
                            "Value": props.deregistration_delay_secs.to_string(),
                        },
                        { "Key": "stickiness.enabled", "Value": "false" },
                    ],
                })),
        )?;

        let listener = builder.add_resource(
            lb_scope
                .child("PublicListener")
                .resource("", "AWS::ElasticLoadBalancingV2::Listener")?
                .with_properties(json!({
                    "DefaultActions": [{ "Type": "forward", "TargetGroupArn": ref_(&target_group) }],
                    "LoadBalancerArn": ref_(&load_balancer),
                    "Port": LISTENER_PORT,
                    "Protocol": "HTTP",
                })),
        )?;

        let mut container = props.container;
        container.health_check = Some(ContainerHealthCheck::http(
            container.port,
            &health.path,
            health.interval_secs,
            health.timeout_secs,
        ));
        let mut task_definition =
            TaskDefinition::new(builder, &scope.child("TaskDef"), TaskDefinitionProps::new(container))?;

        let mut service = FargateService::new(
            builder,
            scope,
            cluster,
            vpc,
            &mut task_definition,
            FargateServiceProps {
                desired_count: props.desired_count,
                circuit_breaker_rollback: Some(props.circuit_breaker_rollback),
                load_balancer: Some(LoadBalancerTarget {
                    target_group: target_group.clone(),
                    listener: listener.clone(),
                }),
                health_check_grace_period_secs: Some(60),
                after: props.after,
                ..Default::default()
            },
        )?;
        let container_port = service.container_port;
        service.security_group.allow_from(
            builder,
            &lb_security_group,
            Port::Tcp(container_port),
            "Load balancer to target",
        )?;

        let (scalable_target, scaling_policy) = match &props.autoscaling {
            Some(scaling) => {
                let (target, policy) =
                    Self::request_count_scaling(builder, scope, cluster, &service, &load_balancer, &target_group, scaling)?;
                (Some(target), Some(policy))
            }
            None => (None, None),
        };

        info!(
            load_balancer = %load_balancer,
            health_check_path = %health.path,
            autoscaling = scalable_target.is_some(),
            "Declared load balanced service"
        );

        Ok(Self {
            load_balancer,
            load_balancer_security_group: lb_security_group,
            listener,
            target_group,
            task_definition,
            service,
            scalable_target,
            scaling_policy,
        })
    }

    fn request_count_scaling(
        builder: &mut StackBuilder,
        scope: &Scope,
        cluster: &Cluster,
        service: &FargateService,
        load_balancer: &LogicalId,
        target_group: &LogicalId,
        scaling: &AutoScalingProps,
    ) -> ConstructResult<(LogicalId, LogicalId)> {
        let target_scope = scope.child("TaskCount").child("Target");
        let target = builder.add_resource(
            target_scope
                .resource("", "AWS::ApplicationAutoScaling::ScalableTarget")?
                .with_properties(json!({
                    "MaxCapacity": scaling.max_capacity,
                    "MinCapacity": scaling.min_capacity,
                    "ResourceId": join("", vec![
                        json!("service/"),
                        cluster.cluster_name(),
                        json!("/"),
                        service.service_name(),
                    ]),
                    "RoleARN": join("", vec![
                        json!("arn:"),
                        pseudo(PARTITION),
                        json!(":iam::"),
                        pseudo(ACCOUNT_ID),
                        json!(":role/aws-service-role/ecs.application-autoscaling.amazonaws.com/AWSServiceRoleForApplicationAutoScaling_ECSService"),
                    ]),
                    "ScalableDimension": "ecs:service:DesiredCount",
                    "ServiceNamespace": "ecs",
                })),
        )?;

        let policy_scope = target_scope.child("RequestScaling");
        let policy = builder.add_resource(
            policy_scope
                .resource("", "AWS::ApplicationAutoScaling::ScalingPolicy")?
                .with_properties(json!({
                    "PolicyName": policy_scope.logical_id("")?.as_str(),
                    "PolicyType": "TargetTrackingScaling",
                    "ScalingTargetId": ref_(&target),
                    "TargetTrackingScalingPolicyConfiguration": {
                        "PredefinedMetricSpecification": {
                            "PredefinedMetricType": "ALBRequestCountPerTarget",
                            "ResourceLabel": join("", vec![
                                get_att(load_balancer, "LoadBalancerFullName"),
                                json!("/"),
                                get_att(target_group, "TargetGroupFullName"),
                            ]),
                        },
                        "TargetValue": scaling.requests_per_target,
                        "ScaleInCooldown": scaling.scale_in_cooldown_secs,
                        "ScaleOutCooldown": scaling.scale_out_cooldown_secs,
                    },
                })),
        )?;

        Ok((target, policy))
    }

    pub fn load_balancer_dns(&self) -> Value {
        get_att(&self.load_balancer, "DNSName")
    }

    pub fn url(&self) -> Value {
        join("", vec![json!("http://"), self.load_balancer_dns()])
    }
}
