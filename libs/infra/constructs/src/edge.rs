//! Managed web service reachable from the internet, with egress into the VPC
//! through a connector.

use infra_graph::intrinsic::{get_att, join};
use infra_graph::{LogicalId, StackBuilder};
use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::asset::ContainerImage;
use crate::error::{ConstructError, ConstructResult};
use crate::iam::{PolicyDocument, PolicyStatement, Role, RoleProps, ServicePrincipal};
use crate::network::{SubnetType, Vpc};
use crate::scope::Scope;
use crate::security::SecurityGroup;

pub const ECR_ACCESS_POLICY: &str = "service-role/AWSAppRunnerServicePolicyForECRAccess";

#[derive(Debug, Clone)]
pub struct AppRunnerServiceProps {
    pub service_name: String,
    pub image: ContainerImage,
    pub port: u16,
    pub environment: Vec<(String, Value)>,
    pub auto_deployments_enabled: bool,
    pub connector_name: String,
    /// Groups attached to the connector's network interfaces
    pub connector_security_groups: Vec<SecurityGroup>,
    /// Secret the running instances may read
    pub readable_secret: Option<Value>,
    pub health_check_path: Option<String>,
    /// Resources this service fronts or talks to; it is created after them
    pub after: Vec<LogicalId>,
}

#[derive(Debug)]
pub struct AppRunnerService {
    pub id: LogicalId,
    pub vpc_connector: LogicalId,
    pub access_role: Role,
    pub instance_role: Role,
}

impl AppRunnerService {
    #[instrument(skip_all, fields(scope = %scope.path(), service = %props.service_name))]
    pub fn new(
        builder: &mut StackBuilder,
        scope: &Scope,
        vpc: &Vpc,
        props: AppRunnerServiceProps,
    ) -> ConstructResult<Self> {
        if props.image.is_public_registry() && props.auto_deployments_enabled {
            return Err(ConstructError::invalid(
                "AppRunnerService",
                "automatic deployments are not available for public registry images",
            ));
        }
        if props.connector_security_groups.is_empty() {
            return Err(ConstructError::invalid(
                "AppRunnerService",
                "the VPC connector needs at least one security group",
            ));
        }
        let subnets = vpc.subnet_ids(SubnetType::PrivateWithNat);
        if subnets.is_empty() {
            return Err(ConstructError::invalid("AppRunnerService", "the VPC has no private subnets"));
        }

        let vpc_connector = builder.add_resource(
            scope
                .child("VPCCon")
                .resource("", "AWS::AppRunner::VpcConnector")?
                .with_properties(json!({
                    "Subnets": subnets,
                    "SecurityGroups": props
                        .connector_security_groups
                        .iter()
                        .map(SecurityGroup::group_id)
                        .collect::<Vec<_>>(),
                    "VpcConnectorName": props.connector_name,
                })),
        )?;

        // pulls the image at build time
        let access_role = Role::new(
            builder,
            &scope.child("ServiceRole"),
            ServicePrincipal::AppRunnerBuild,
            RoleProps {
                managed_policies: vec![ECR_ACCESS_POLICY.to_string()],
                ..Default::default()
            },
        )?;

        // identity of the running instances
        let mut inline_policies = Vec::new();
        if let Some(secret) = &props.readable_secret {
            inline_policies.push((
                "secretsManager".to_string(),
                PolicyDocument::new(vec![
                    PolicyStatement::allow(["secretsmanager:GetSecretValue"]).on(secret.clone()),
                ]),
            ));
        }
        let instance_role = Role::new(
            builder,
            &scope.child("InstanceRole"),
            ServicePrincipal::AppRunnerTasks,
            RoleProps {
                inline_policies,
                ..Default::default()
            },
        )?;

        let repository_type = if props.image.is_public_registry() {
            "ECR_PUBLIC"
        } else {
            "ECR"
        };
        let mut image_repository = json!({
            "ImageRepositoryType": repository_type,
            "ImageIdentifier": props.image.image_uri(),
            "ImageConfiguration": {
                "Port": props.port.to_string(),
                "RuntimeEnvironmentVariables": props
                    .environment
                    .iter()
                    .map(|(name, value)| json!({ "Name": name, "Value": value }))
                    .collect::<Vec<_>>(),
            },
        });
        if props.environment.is_empty() {
            if let Some(config) = image_repository["ImageConfiguration"].as_object_mut() {
                config.remove("RuntimeEnvironmentVariables");
            }
        }

        let mut source = json!({
            "AutoDeploymentsEnabled": props.auto_deployments_enabled,
            "ImageRepository": image_repository,
        });
        if repository_type == "ECR" {
            source["AuthenticationConfiguration"] = json!({ "AccessRoleArn": access_role.arn() });
        }

        let mut service = scope
            .child("VpcCXService")
            .resource("", "AWS::AppRunner::Service")?
            .with_properties(json!({
                "SourceConfiguration": source,
                "NetworkConfiguration": {
                    "EgressConfiguration": {
                        "EgressType": "VPC",
                        "VpcConnectorArn": get_att(&vpc_connector, "VpcConnectorArn"),
                    }
                },
                "ServiceName": props.service_name,
                "InstanceConfiguration": { "InstanceRoleArn": instance_role.arn() },
            }));
        if let Some(path) = &props.health_check_path {
            service = service.with_property(
                "HealthCheckConfiguration",
                json!({ "Protocol": "HTTP", "Path": path }),
            );
        }
        for dependency in &props.after {
            service = service.depends_on(dependency);
        }
        let id = builder.add_resource(service)?;

        info!(service = %id, repository_type, fronts = props.after.len(), "Declared App Runner service");
        Ok(Self {
            id,
            vpc_connector,
            access_role,
            instance_role,
        })
    }

    pub fn service_url(&self) -> Value {
        get_att(&self.id, "ServiceUrl")
    }

    pub fn https_url(&self) -> Value {
        join("", vec![json!("https://"), self.service_url()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::VpcProps;

    struct Fixture {
        builder: StackBuilder,
        vpc: Vpc,
        sg: SecurityGroup,
        fronted: LogicalId,
    }

    fn fixture() -> Fixture {
        let mut builder = StackBuilder::new("Test");
        let root = Scope::root("Test");
        let vpc = Vpc::new(&mut builder, &root.child("Vpc"), VpcProps::default()).unwrap();
        let sg = SecurityGroup::new(&mut builder, &root.child("DbSg"), &vpc, "db").unwrap();
        let fronted = builder
            .add_resource(root.child("Backend").resource("", "AWS::ECS::Service").unwrap())
            .unwrap();
        Fixture {
            builder,
            vpc,
            sg,
            fronted,
        }
    }

    fn props(f: &Fixture, image: ContainerImage, auto_deploy: bool) -> AppRunnerServiceProps {
        AppRunnerServiceProps {
            service_name: "AppRunnerVPCDemo-test".into(),
            image,
            port: 8080,
            environment: vec![("APPRUNNERSERVICE".into(), json!("True"))],
            auto_deployments_enabled: auto_deploy,
            connector_name: "CdkVPCConnectorDemo".into(),
            connector_security_groups: vec![f.sg.clone()],
            readable_secret: Some(json!("arn:secret")),
            health_check_path: Some("/health".into()),
            after: vec![f.fronted.clone()],
        }
    }

    #[test]
    fn test_service_shape() {
        let mut f = fixture();
        let p = props(&f, ContainerImage::Registry("123456789012.dkr.ecr.us-west-2.amazonaws.com/app:1".into()), true);
        let edge = AppRunnerService::new(&mut f.builder, &Scope::root("Test").child("AppRunner"), &f.vpc, p).unwrap();

        assert_eq!(edge.id.as_str(), "AppRunnerVpcCXService");
        assert_eq!(edge.vpc_connector.as_str(), "AppRunnerVPCCon");
        assert_eq!(edge.access_role.id.as_str(), "AppRunnerServiceRole");
        assert_eq!(edge.instance_role.id.as_str(), "AppRunnerInstanceRole");

        let manifest = f.builder.build().unwrap();
        let service = manifest.resource(&edge.id).unwrap();
        let source = service.property("SourceConfiguration").unwrap();
        assert_eq!(source["ImageRepository"]["ImageRepositoryType"], "ECR");
        assert_eq!(source["ImageRepository"]["ImageConfiguration"]["Port"], "8080");
        assert_eq!(
            service.property("NetworkConfiguration").unwrap()["EgressConfiguration"]["EgressType"],
            "VPC"
        );
        assert_eq!(service.property("ServiceName"), Some(&json!("AppRunnerVPCDemo-test")));
        assert!(manifest.explicit_dependencies(&edge.id).unwrap().contains(&f.fronted));
        assert!(manifest.depends_on(&edge.id, &edge.vpc_connector).unwrap());

        let instance = manifest.resource(&edge.instance_role.id).unwrap();
        let inline = &instance.property("Policies").unwrap()[0];
        assert_eq!(inline["PolicyName"], "secretsManager");
        assert_eq!(
            inline["PolicyDocument"]["Statement"][0]["Action"],
            "secretsmanager:GetSecretValue"
        );
    }

    #[test]
    fn test_public_image_cannot_auto_deploy() {
        let mut f = fixture();
        let image = ContainerImage::Registry("public.ecr.aws/aws-containers/hello-app-runner:latest".into());
        let p = props(&f, image.clone(), true);
        assert!(AppRunnerService::new(&mut f.builder, &Scope::root("Test").child("A"), &f.vpc, p).is_err());

        let p = props(&f, image, false);
        let edge = AppRunnerService::new(&mut f.builder, &Scope::root("Test").child("B"), &f.vpc, p).unwrap();
        let source = f.builder.resource(&edge.id).unwrap().property("SourceConfiguration").unwrap().clone();
        assert_eq!(source["ImageRepository"]["ImageRepositoryType"], "ECR_PUBLIC");
        assert!(source.get("AuthenticationConfiguration").is_none());
    }

    #[test]
    fn test_https_url() {
        let mut f = fixture();
        let p = props(&f, ContainerImage::Registry("repo/app".into()), false);
        let edge = AppRunnerService::new(&mut f.builder, &Scope::root("Test").child("AppRunner"), &f.vpc, p).unwrap();
        assert_eq!(
            edge.https_url(),
            json!({ "Fn::Join": ["", ["https://", { "Fn::GetAtt": ["AppRunnerVpcCXService", "ServiceUrl"] }]] })
        );
    }
}
