//! Policy checks over a synthesized manifest.
//!
//! These only look at the manifest plus the expected edge target, so they
//! can run against a stack built elsewhere.

use std::collections::BTreeSet;

use infra_constructs::ContainerHealthCheck;
use infra_constructs::bootstrap::STATEMENT_RESOURCE_TYPE;
use infra_graph::intrinsic::references;
use infra_graph::{LogicalId, Manifest, RemovalPolicy, Resource};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::EdgeTarget;

const APP_RUNNER_SERVICE: &str = "AWS::AppRunner::Service";
const ECS_SERVICE: &str = "AWS::ECS::Service";
const DB_CLUSTER: &str = "AWS::RDS::DBCluster";
const SCALABLE_TARGET: &str = "AWS::ApplicationAutoScaling::ScalableTarget";
const SCALING_POLICY: &str = "AWS::ApplicationAutoScaling::ScalingPolicy";
const TARGET_GROUP: &str = "AWS::ElasticLoadBalancingV2::TargetGroup";

const MIN_TASKS: i64 = 1;
const MAX_TASKS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
        }
    }
}

pub fn all_passed(results: &[CheckResult]) -> bool {
    results.iter().all(|r| r.passed)
}

/// Run every check against `manifest`. `edge_target` names the service the
/// edge is expected to wait for.
pub fn run_checks(manifest: &Manifest, edge_target: EdgeTarget) -> Vec<CheckResult> {
    let results = vec![
        bootstrap_ordering(manifest),
        edge_fronts_service(manifest, edge_target),
        database_removal_policy(manifest),
        autoscaling_bounds(manifest),
        health_check_parity(manifest),
        single_edge_chain(manifest),
    ];
    for result in &results {
        if result.passed {
            debug!(check = result.name, detail = %result.detail, "Check passed");
        } else {
            warn!(check = result.name, detail = %result.detail, "Check failed");
        }
    }
    results
}

fn statement_sql(resource: &Resource) -> Option<&str> {
    resource
        .property("Parameters")
        .and_then(|p| p.get("sql"))
        .and_then(Value::as_str)
}

fn statements_starting_with<'a>(manifest: &'a Manifest, prefix: &str) -> Vec<&'a Resource> {
    manifest
        .resources_of_type(STATEMENT_RESOURCE_TYPE)
        .into_iter()
        .filter(|r| {
            statement_sql(r).is_some_and(|sql| sql.trim_start().to_ascii_uppercase().starts_with(prefix))
        })
        .collect()
}

/// Table creation waits for database creation
fn bootstrap_ordering(manifest: &Manifest) -> CheckResult {
    const NAME: &str = "bootstrap_ordering";
    let databases = statements_starting_with(manifest, "CREATE DATABASE");
    let tables = statements_starting_with(manifest, "CREATE TABLE");
    if databases.is_empty() || tables.is_empty() {
        return CheckResult::fail(NAME, "missing CREATE DATABASE or CREATE TABLE statement");
    }

    for table in &tables {
        let waits = databases.iter().all(|db| {
            manifest
                .depends_on(&table.logical_id, &db.logical_id)
                .unwrap_or(false)
        });
        if !waits {
            return CheckResult::fail(
                NAME,
                format!("{} may run before the database exists", table.logical_id),
            );
        }
    }
    CheckResult::pass(NAME, format!("{} table statement(s) ordered after database creation", tables.len()))
}

/// Each edge service explicitly waits for the container service it fronts:
/// one behind a load balancer, or one registered for service discovery
fn edge_fronts_service(manifest: &Manifest, edge_target: EdgeTarget) -> CheckResult {
    const NAME: &str = "edge_fronts_service";
    let edges = manifest.resources_of_type(APP_RUNNER_SERVICE);
    if edges.is_empty() {
        return CheckResult::fail(NAME, "no App Runner service declared");
    }
    let attachment = match edge_target {
        EdgeTarget::LoadBalancedService => "LoadBalancers",
        EdgeTarget::InternalService => "ServiceRegistries",
    };
    let services: BTreeSet<&LogicalId> = manifest
        .resources_of_type(ECS_SERVICE)
        .into_iter()
        .filter(|r| {
            r.property(attachment)
                .and_then(Value::as_array)
                .is_some_and(|a| !a.is_empty())
        })
        .map(|r| &r.logical_id)
        .collect();
    if services.is_empty() {
        return CheckResult::fail(NAME, format!("no container service with {} to front", attachment));
    }

    for edge in edges {
        if !edge.depends_on.iter().any(|dep| services.contains(dep)) {
            return CheckResult::fail(
                NAME,
                format!("{} does not explicitly wait for the {}", edge.logical_id, edge_target),
            );
        }
    }
    CheckResult::pass(NAME, format!("edge service waits for the {}", edge_target))
}

fn database_removal_policy(manifest: &Manifest) -> CheckResult {
    const NAME: &str = "database_removal_policy";
    let clusters = manifest.resources_of_type(DB_CLUSTER);
    if clusters.is_empty() {
        return CheckResult::fail(NAME, "no database cluster declared");
    }
    match clusters
        .iter()
        .find(|c| c.removal_policy != Some(RemovalPolicy::Destroy))
    {
        Some(cluster) => CheckResult::fail(
            NAME,
            format!(
                "{} has deletion policy {}",
                cluster.logical_id,
                cluster
                    .removal_policy
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "unset".to_string())
            ),
        ),
        None => CheckResult::pass(NAME, "database clusters are deleted with the stack"),
    }
}

fn int_property(resource: &Resource, key: &str) -> Option<i64> {
    resource.property(key).and_then(Value::as_i64)
}

fn autoscaling_bounds(manifest: &Manifest) -> CheckResult {
    const NAME: &str = "autoscaling_bounds";
    let targets = manifest.resources_of_type(SCALABLE_TARGET);
    for target in &targets {
        let (Some(min), Some(max)) = (
            int_property(target, "MinCapacity"),
            int_property(target, "MaxCapacity"),
        ) else {
            return CheckResult::fail(NAME, format!("{} lacks capacity bounds", target.logical_id));
        };
        if !(MIN_TASKS <= min && min <= max && max <= MAX_TASKS) {
            return CheckResult::fail(
                NAME,
                format!(
                    "{} capacity {}..={} outside {}..={}",
                    target.logical_id, min, max, MIN_TASKS, MAX_TASKS
                ),
            );
        }
    }

    for policy in manifest.resources_of_type(SCALING_POLICY) {
        let config = policy.property("TargetTrackingScalingPolicyConfiguration");
        for key in ["ScaleInCooldown", "ScaleOutCooldown"] {
            let cooldown = config.and_then(|c| c.get(key)).and_then(Value::as_i64);
            if cooldown.is_some_and(|c| c < 0) {
                return CheckResult::fail(NAME, format!("{} has negative {}", policy.logical_id, key));
            }
        }
    }

    if targets.is_empty() {
        CheckResult::pass(NAME, "no autoscaling declared")
    } else {
        CheckResult::pass(NAME, format!("{} scalable target(s) within bounds", targets.len()))
    }
}

/// Load balancer health checks probe the same path as the container check
fn health_check_parity(manifest: &Manifest) -> CheckResult {
    const NAME: &str = "health_check_parity";
    let mut compared = 0usize;

    for service in manifest.resources_of_type(ECS_SERVICE) {
        let Some(load_balancers) = service.property("LoadBalancers").and_then(Value::as_array) else {
            continue;
        };
        let task = service
            .property("TaskDefinition")
            .map(references)
            .and_then(|refs| refs.into_iter().next())
            .and_then(|id| manifest.resource(&id).ok());
        let container_path = task
            .and_then(|t| t.property("ContainerDefinitions"))
            .and_then(|defs| defs.get(0))
            .and_then(|def| def.get("HealthCheck"))
            .and_then(|check| check.get("Command"))
            .and_then(|command| serde_json::from_value::<Vec<String>>(command.clone()).ok())
            .and_then(|command| ContainerHealthCheck::probed_path(&command));

        for lb in load_balancers {
            let Some(group) = lb
                .get("TargetGroupArn")
                .map(references)
                .and_then(|refs| refs.into_iter().next())
                .and_then(|id| manifest.resource(&id).ok())
                .filter(|r| r.resource_type == TARGET_GROUP)
            else {
                continue;
            };
            let group_path = group.property("HealthCheckPath").and_then(Value::as_str);
            if group_path != container_path.as_deref() {
                return CheckResult::fail(
                    NAME,
                    format!(
                        "{} probes {:?} but its container checks {:?}",
                        group.logical_id, group_path, container_path
                    ),
                );
            }
            compared += 1;
        }
    }

    if compared == 0 {
        CheckResult::pass(NAME, "no load balanced services declared")
    } else {
        CheckResult::pass(NAME, format!("{} target group(s) match container checks", compared))
    }
}

/// One edge service, one Cloud Map service, one database, two statements
fn single_edge_chain(manifest: &Manifest) -> CheckResult {
    const NAME: &str = "single_edge_chain";
    let edges = manifest.resources_of_type(APP_RUNNER_SERVICE).len();
    let internal = manifest
        .resources_of_type(ECS_SERVICE)
        .into_iter()
        .filter(|s| s.property("ServiceRegistries").is_some())
        .count();
    let clusters = manifest.resources_of_type(DB_CLUSTER).len();
    let statements = manifest.resources_of_type(STATEMENT_RESOURCE_TYPE).len();

    if (edges, internal, clusters, statements) == (1, 1, 1, 2) {
        CheckResult::pass(NAME, "1 edge service, 1 internal service, 1 database, 2 statements")
    } else {
        CheckResult::fail(
            NAME,
            format!(
                "found {} edge service(s), {} internal service(s), {} database(s), {} statement(s)",
                edges, internal, clusters, statements
            ),
        )
    }
}
