use infra_graph::intrinsic::{get_att, ref_};
use infra_graph::{LogicalId, StackBuilder};
use serde_json::{Value, json};
use tracing::instrument;

use crate::error::{ConstructError, ConstructResult};
use crate::network::Vpc;
use crate::scope::Scope;

#[derive(Debug, Clone)]
pub struct ClusterProps {
    /// Private DNS namespace for service discovery, e.g. `apprunner.demo`
    pub namespace: String,
    /// Register FARGATE and FARGATE_SPOT on the cluster
    pub fargate_capacity_providers: bool,
}

/// Container cluster with a private service discovery namespace
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: LogicalId,
    pub namespace_id: LogicalId,
    pub namespace: String,
    pub capacity_providers: Option<LogicalId>,
}

impl Cluster {
    #[instrument(skip(builder, vpc, props), fields(scope = %scope.path(), namespace = %props.namespace))]
    pub fn new(
        builder: &mut StackBuilder,
        scope: &Scope,
        vpc: &Vpc,
        props: ClusterProps,
    ) -> ConstructResult<Self> {
        let valid_namespace = !props.namespace.is_empty()
            && props.namespace.split('.').all(|label| {
                !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            });
        if !valid_namespace {
            return Err(ConstructError::invalid(
                "Cluster",
                format!("'{}' is not a valid DNS namespace", props.namespace),
            ));
        }

        let id = builder.add_resource(scope.resource("", "AWS::ECS::Cluster")?.with_properties(json!({
            "Configuration": {
                "ExecuteCommandConfiguration": { "Logging": "DEFAULT" }
            }
        })))?;

        let namespace_id = builder.add_resource(
            scope
                .child("DefaultServiceDiscoveryNamespace")
                .resource("", "AWS::ServiceDiscovery::PrivateDnsNamespace")?
                .with_properties(json!({
                    "Name": props.namespace,
                    "Vpc": vpc.vpc_id(),
                })),
        )?;

        let capacity_providers = if props.fargate_capacity_providers {
            Some(builder.add_resource(
                scope
                    .child("ClusterCapacityProviderAssociations")
                    .resource("", "AWS::ECS::ClusterCapacityProviderAssociations")?
                    .with_properties(json!({
                        "CapacityProviders": ["FARGATE", "FARGATE_SPOT"],
                        "Cluster": ref_(&id),
                        "DefaultCapacityProviderStrategy": [],
                    })),
            )?)
        } else {
            None
        };

        Ok(Self {
            id,
            namespace_id,
            namespace: props.namespace,
            capacity_providers,
        })
    }

    pub fn cluster_name(&self) -> Value {
        ref_(&self.id)
    }

    pub fn cluster_arn(&self) -> Value {
        get_att(&self.id, "Arn")
    }

    pub fn namespace_ref(&self) -> Value {
        get_att(&self.namespace_id, "Id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::VpcProps;

    fn setup(namespace: &str, capacity: bool) -> ConstructResult<(Cluster, StackBuilder)> {
        let mut builder = StackBuilder::new("Test");
        let root = Scope::root("Test");
        let vpc = Vpc::new(&mut builder, &root.child("Vpc"), VpcProps::default())?;
        let cluster = Cluster::new(
            &mut builder,
            &root.child("AppRunnerDemoCluster"),
            &vpc,
            ClusterProps {
                namespace: namespace.to_string(),
                fargate_capacity_providers: capacity,
            },
        )?;
        Ok((cluster, builder))
    }

    #[test]
    fn test_cluster_with_namespace() {
        let (cluster, builder) = setup("apprunner.demo", true).unwrap();
        assert_eq!(cluster.id.as_str(), "AppRunnerDemoCluster");
        assert_eq!(
            cluster.namespace_id.as_str(),
            "AppRunnerDemoClusterDefaultServiceDiscoveryNamespace"
        );

        let manifest = builder.build().unwrap();
        let resource = manifest.resource(&cluster.id).unwrap();
        assert_eq!(
            resource.property("Configuration").unwrap()["ExecuteCommandConfiguration"]["Logging"],
            "DEFAULT"
        );
        let association = cluster.capacity_providers.unwrap();
        assert!(manifest.depends_on(&association, &cluster.id).unwrap());
    }

    #[test]
    fn test_capacity_providers_optional() {
        let (cluster, _) = setup("apprunner.demo", false).unwrap();
        assert!(cluster.capacity_providers.is_none());
    }

    #[test]
    fn test_invalid_namespace() {
        assert!(setup("bad..name", false).is_err());
        assert!(setup("", false).is_err());
    }
}
