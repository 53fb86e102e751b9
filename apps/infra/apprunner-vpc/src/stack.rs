//! Composition of the demo stack.

use std::fs;
use std::path::{Path, PathBuf};

use core_config::DeployTarget;
use infra_constructs::database::POSTGRES_PORT;
use infra_constructs::{
    ApplicationLoadBalancedFargateService, AppRunnerService, AppRunnerServiceProps, AssetManifest,
    CapacityProvider, CapacityProviderStrategy, Cluster, ClusterProps, ContainerDefinitionProps,
    ContainerImage, DockerImageAsset, FargateService, FargateServiceProps, LoadBalancedServiceProps,
    Port, Scope, SecretEnv, ServerlessCluster, ServerlessClusterProps, SqlStatement,
    SqlStatementProps, StatementRunner, SubnetType, TaskDefinition, TaskDefinitionProps, Vpc,
    VpcProps,
};
use infra_graph::intrinsic::join;
use infra_graph::{Manifest, Output, RemovalPolicy, StackBuilder};
use serde_json::{Value, json};
use tracing::{info, instrument};
use validator::Validate;

use crate::config::{EdgeImageSource, EdgeTarget, StackConfig};
use crate::error::{StackError, StackResult};

const PRIVATE_LOG_PREFIX: &str = "appRunnerDemoECSPrivateService";
const PUBLIC_LOG_PREFIX: &str = "appRunnerDemoECSPublicService";

/// Synthesis result: the immutable resource graph plus the images to publish
#[derive(Debug)]
pub struct SynthesizedStack {
    pub manifest: Manifest,
    pub assets: AssetManifest,
    pub target: DeployTarget,
    /// Service the edge was built to wait for
    pub edge_target: EdgeTarget,
}

impl SynthesizedStack {
    pub fn stack_name(&self) -> &str {
        self.manifest.stack_name()
    }

    pub fn template(&self) -> Value {
        self.manifest.to_template()
    }

    /// Write `<stack>.template.json` and `<stack>.assets.json` into `dir`
    pub fn write_to(&self, dir: impl AsRef<Path>) -> StackResult<(PathBuf, PathBuf)> {
        let dir = dir.as_ref();
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StackError::Io { path, source }
        };
        fs::create_dir_all(dir).map_err(io(dir))?;

        let template_path = dir.join(format!("{}.template.json", self.stack_name()));
        let assets_path = dir.join(format!("{}.assets.json", self.stack_name()));

        let template = serde_json::to_string_pretty(&self.template()).map_err(|source| StackError::Parse {
            path: template_path.clone(),
            source,
        })?;
        fs::write(&template_path, template).map_err(io(&template_path))?;

        let assets = serde_json::to_string_pretty(&self.assets).map_err(|source| StackError::Parse {
            path: assets_path.clone(),
            source,
        })?;
        fs::write(&assets_path, assets).map_err(io(&assets_path))?;

        info!(
            template = %template_path.display(),
            assets = %assets_path.display(),
            "Wrote cloud assembly"
        );
        Ok((template_path, assets_path))
    }
}

/// Build the whole stack for `target`.
///
/// Order of declaration: network, cluster and database, bootstrap
/// statements, internal service, optional public service, edge service,
/// outputs. Ordering at deploy time comes only from the edges declared here.
#[instrument(skip_all, fields(deploy_env = %target.deploy_env, region = %target.region))]
pub fn build_stack(config: &StackConfig, target: &DeployTarget) -> StackResult<SynthesizedStack> {
    config.validate()?;

    let stack_name = config
        .stack_name
        .clone()
        .unwrap_or_else(|| target.stack_name(&config.stack_prefix));
    let mut builder = StackBuilder::new(&stack_name).description(
        config
            .description
            .clone()
            .unwrap_or_else(|| format!("App Runner service with VPC egress ({})", stack_name)),
    );
    let root = Scope::root(&stack_name);
    let mut assets = AssetManifest::for_destination(target.account.clone(), &target.region);

    // network boundary
    let vpc = Vpc::new(&mut builder, &root.child("AppRunnerDemoVPC"), VpcProps::default())?;

    let cluster = Cluster::new(
        &mut builder,
        &root.child("AppRunnerDemoCluster"),
        &vpc,
        ClusterProps {
            namespace: config.namespace.clone(),
            fargate_capacity_providers: true,
        },
    )?;

    // relational store
    let mut database = ServerlessCluster::new(
        &mut builder,
        &root.child("AppRunnerDemoDatabase"),
        &vpc,
        ServerlessClusterProps {
            auto_pause: config.database.auto_pause(),
            removal_policy: RemovalPolicy::Destroy,
            ..Default::default()
        },
    )?;
    database.allow_default_port_internally(&mut builder)?;

    // bootstrap statements
    let mut runner = StatementRunner::new(&mut builder, &root.child("DataApiStatementRunner"))?;
    let create_database = SqlStatement::new(
        &mut builder,
        &root.child("RDSCreateDatabase"),
        &mut runner,
        &database,
        SqlStatementProps::new(format!(
            "CREATE DATABASE {} OWNER postgres;",
            config.database.name
        )),
    )?;
    let create_table = SqlStatement::new(
        &mut builder,
        &root.child("RDSCreateTable"),
        &mut runner,
        &database,
        SqlStatementProps::new(format!(
            "CREATE TABLE {} (last_update TIMESTAMP, user_agent VARCHAR (250));",
            config.database.table
        ))
        .in_database(&config.database.name)
        .after(&create_database),
    )?;

    // internal service
    let private_asset = DockerImageAsset::from_directory(&config.private_service_dir)?;
    assets.add(&private_asset);
    let mut private_container = ContainerDefinitionProps::new(
        "PrivateDemoService",
        ContainerImage::Asset(private_asset),
        config.container_port,
    );
    private_container.stream_prefix = PRIVATE_LOG_PREFIX.to_string();
    let mut private_task = TaskDefinition::new(
        &mut builder,
        &root.child("PrivateDemoTaskDef"),
        TaskDefinitionProps::new(private_container),
    )?;
    let mut private_service = FargateService::new(
        &mut builder,
        &root.child("PrivateDemoService"),
        &cluster,
        &vpc,
        &mut private_task,
        FargateServiceProps {
            cloud_map_name: Some(config.private_service_name.clone()),
            capacity_provider_strategies: vec![CapacityProviderStrategy {
                provider: CapacityProvider::FargateSpot,
                weight: 1,
            }],
            enable_execute_command: true,
            after: vec![create_table.id.clone()],
            ..Default::default()
        },
    )?;
    private_service.security_group.allow_from_any_ipv4(
        &mut builder,
        Port::Tcp(config.container_port),
        "Internal service port",
    )?;

    // public service
    let public_service = if config.with_public_load_balancer {
        Some(public_service(
            &mut builder,
            &root,
            config,
            &cluster,
            &vpc,
            &mut database,
            &create_table,
            &mut assets,
        )?)
    } else {
        None
    };

    // edge service
    // the edge always talks to the internal service over service discovery;
    // the edge target only decides which service it waits for
    let fronted = match (config.edge_target, &public_service) {
        (EdgeTarget::LoadBalancedService, Some(public)) => public.service.id.clone(),
        _ => private_service.id.clone(),
    };
    let edge_image = match (config.edge_image, &public_service) {
        (EdgeImageSource::ReuseServiceImage, Some(public)) => public.task_definition.image.clone(),
        _ => {
            let asset = DockerImageAsset::from_directory(&config.demo_app_dir)?;
            assets.add(&asset);
            ContainerImage::Asset(asset)
        }
    };

    let edge = AppRunnerService::new(
        &mut builder,
        &root.child("AppRunner"),
        &vpc,
        AppRunnerServiceProps {
            service_name: stack_name.clone(),
            image: edge_image,
            port: config.container_port,
            environment: vec![
                ("APPRUNNERSERVICE".to_string(), json!("True")),
                ("DBSECRETSNAME".to_string(), database.secret_arn()),
                (
                    "ECSPRIVATESERVICE".to_string(),
                    json!(private_service.discovery_url().unwrap_or_default()),
                ),
                ("DB_NAME".to_string(), json!(config.database.name)),
                ("TABLE_NAME".to_string(), json!(config.database.table)),
            ],
            auto_deployments_enabled: true,
            connector_name: config.vpc_connector_name.clone(),
            connector_security_groups: vec![database.security_group.clone()],
            readable_secret: Some(database.secret_arn()),
            health_check_path: Some(config.health_check.path.clone()),
            after: vec![fronted, database.id.clone()],
        },
    )?;

    // outputs
    builder.add_output(Output::new("AppRunnerVpcId", vpc.vpc_id()))?;
    builder.add_output(Output::new(
        "AppRunnerPrivateSubnets",
        join(",", vpc.subnet_ids(SubnetType::PrivateWithNat)),
    ))?;
    builder.add_output(Output::new("AppRunnerSecGrp", database.security_group.group_id()))?;
    builder.add_output(Output::new("AppRunnerServiceUrl", edge.https_url()))?;
    if let Some(public) = &public_service {
        builder.add_output(Output::new("LoadBalancerUrl", public.url()))?;
    }

    let manifest = builder.build()?;
    info!(
        stack = %manifest.stack_name(),
        resources = manifest.len(),
        images = assets.len(),
        edge_target = %config.edge_target,
        "Synthesized stack"
    );

    Ok(SynthesizedStack {
        manifest,
        assets,
        target: target.clone(),
        edge_target: config.edge_target,
    })
}

#[allow(clippy::too_many_arguments)]
fn public_service(
    builder: &mut StackBuilder,
    root: &Scope,
    config: &StackConfig,
    cluster: &Cluster,
    vpc: &Vpc,
    database: &mut ServerlessCluster,
    create_table: &SqlStatement,
    assets: &mut AssetManifest,
) -> StackResult<ApplicationLoadBalancedFargateService> {
    let asset = DockerImageAsset::from_directory(&config.demo_app_dir)?;
    assets.add(&asset);

    let mut container =
        ContainerDefinitionProps::new("PublicDemoService", ContainerImage::Asset(asset), config.container_port);
    container.stream_prefix = PUBLIC_LOG_PREFIX.to_string();
    container.environment = vec![
        ("DB_NAME".to_string(), json!(config.database.name)),
        ("DB_HOST".to_string(), database.endpoint_address()),
        ("TABLE_NAME".to_string(), json!(config.database.table)),
    ];
    container.secrets = ["username", "password"]
        .into_iter()
        .zip(["DB_USER", "DB_PASS"])
        .map(|(key, name)| SecretEnv {
            name: name.to_string(),
            secret_arn: database.secret_arn(),
            json_key: key.to_string(),
        })
        .collect();

    let mut props = LoadBalancedServiceProps::new(container);
    props.health_check = (&config.health_check).into();
    props.autoscaling = Some((&config.autoscaling).into());
    props.desired_count = config.autoscaling.min_capacity;
    props.after = vec![create_table.id.clone()];

    let public = ApplicationLoadBalancedFargateService::new(builder, &root.child("PublicDemoService"), cluster, vpc, props)?;

    database.security_group.allow_from(
        builder,
        &public.service.security_group,
        Port::Tcp(POSTGRES_PORT),
        "Public service to database",
    )?;
    Ok(public)
}
