use std::fs;

use infra_constructs::{
    AppRunnerService, AppRunnerServiceProps, AssetManifest, Cluster, ClusterProps,
    ContainerDefinitionProps, ContainerImage, DockerImageAsset, FargateService, FargateServiceProps,
    Port, Scope, ServerlessCluster, ServerlessClusterProps, SqlStatement, SqlStatementProps,
    StatementRunner, SubnetType, TaskDefinition, TaskDefinitionProps, Vpc, VpcProps,
};
use infra_graph::{LogicalId, Manifest, RemovalPolicy, StackBuilder};
use serde_json::json;

struct Chain {
    manifest: Manifest,
    edge: LogicalId,
    service: LogicalId,
    create_table: LogicalId,
    create_database: LogicalId,
    database: LogicalId,
}

fn chain(image: ContainerImage) -> Chain {
    let mut builder = StackBuilder::new("Chain-test");
    let root = Scope::root("Chain-test");

    let vpc = Vpc::new(&mut builder, &root.child("Vpc"), VpcProps::default().with_isolated_tier()).unwrap();
    let cluster = Cluster::new(
        &mut builder,
        &root.child("Cluster"),
        &vpc,
        ClusterProps {
            namespace: "chain.local".into(),
            fargate_capacity_providers: true,
        },
    )
    .unwrap();
    let database = ServerlessCluster::new(
        &mut builder,
        &root.child("Database"),
        &vpc,
        ServerlessClusterProps {
            removal_policy: RemovalPolicy::Destroy,
            ..Default::default()
        },
    )
    .unwrap();

    let mut runner = StatementRunner::new(&mut builder, &root.child("Runner")).unwrap();
    let create_database = SqlStatement::new(
        &mut builder,
        &root.child("CreateDatabase"),
        &mut runner,
        &database,
        SqlStatementProps::new("CREATE DATABASE chain OWNER postgres;"),
    )
    .unwrap();
    let create_table = SqlStatement::new(
        &mut builder,
        &root.child("CreateTable"),
        &mut runner,
        &database,
        SqlStatementProps::new("CREATE TABLE hits (at TIMESTAMP);")
            .in_database("chain")
            .after(&create_database),
    )
    .unwrap();

    let mut task = TaskDefinition::new(
        &mut builder,
        &root.child("TaskDef"),
        TaskDefinitionProps::new(ContainerDefinitionProps::new("Backend", image.clone(), 8080)),
    )
    .unwrap();
    let mut service = FargateService::new(
        &mut builder,
        &root.child("Backend"),
        &cluster,
        &vpc,
        &mut task,
        FargateServiceProps {
            cloud_map_name: Some("backend".into()),
            after: vec![create_table.id.clone()],
            ..Default::default()
        },
    )
    .unwrap();
    service
        .security_group
        .allow_from_any_ipv4(&mut builder, Port::Tcp(8080), "backend")
        .unwrap();

    let edge = AppRunnerService::new(
        &mut builder,
        &root.child("Edge"),
        &vpc,
        AppRunnerServiceProps {
            service_name: "Chain-test".into(),
            image,
            port: 8080,
            environment: vec![("BACKEND".into(), json!(service.discovery_url()))],
            auto_deployments_enabled: false,
            connector_name: "ChainConnector".into(),
            connector_security_groups: vec![database.security_group.clone()],
            readable_secret: Some(database.secret_arn()),
            health_check_path: None,
            after: vec![service.id.clone(), database.id.clone()],
        },
    )
    .unwrap();

    Chain {
        manifest: builder.build().unwrap(),
        edge: edge.id,
        service: service.id,
        create_table: create_table.id,
        create_database: create_database.id,
        database: database.id,
    }
}

fn registry_image() -> ContainerImage {
    ContainerImage::Registry("123456789012.dkr.ecr.us-west-2.amazonaws.com/backend:1".into())
}

fn wave_of(manifest: &Manifest, id: &LogicalId) -> usize {
    manifest
        .creation_waves()
        .iter()
        .position(|wave| wave.contains(id))
        .unwrap()
}

#[test]
fn test_chain_is_created_in_order() {
    let c = chain(registry_image());
    let m = &c.manifest;

    assert!(wave_of(m, &c.database) < wave_of(m, &c.create_database));
    assert!(wave_of(m, &c.create_database) < wave_of(m, &c.create_table));
    assert!(wave_of(m, &c.create_table) < wave_of(m, &c.service));
    assert!(wave_of(m, &c.service) < wave_of(m, &c.edge));
}

#[test]
fn test_chain_is_torn_down_in_reverse() {
    let c = chain(registry_image());
    let order = c.manifest.deletion_order();
    let position = |id: &LogicalId| order.iter().position(|x| x == id).unwrap();

    assert!(position(&c.edge) < position(&c.service));
    assert!(position(&c.create_table) < position(&c.create_database));
    assert!(position(&c.create_database) < position(&c.database));
    assert!(c.manifest.retained_on_teardown().is_empty());
}

#[test]
fn test_isolated_subnets_have_no_default_route() {
    let mut builder = StackBuilder::new("Net");
    let vpc = Vpc::new(
        &mut builder,
        &Scope::root("Net").child("Vpc"),
        VpcProps::default().with_isolated_tier(),
    )
    .unwrap();

    assert_eq!(vpc.select_subnets(SubnetType::Isolated).len(), 2);
    assert!(vpc.default_routes(SubnetType::Isolated).is_empty());
    assert_eq!(vpc.default_routes(SubnetType::PrivateWithNat).len(), 2);
}

#[test]
fn test_template_is_stable_across_builds() {
    let first = chain(registry_image()).manifest.to_template();
    let second = chain(registry_image()).manifest.to_template();
    assert_eq!(first, second);
}

#[test]
fn test_asset_images_are_listed_once() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
    let asset = DockerImageAsset::from_directory(dir.path()).unwrap();

    let mut assets = AssetManifest::new();
    assets.add(&asset);
    assets.add(&asset);
    assert_eq!(assets.len(), 1);

    let c = chain(ContainerImage::Asset(asset.clone()));
    let edge = c.manifest.resource(&c.edge).unwrap();
    assert_eq!(
        edge.property("SourceConfiguration").unwrap()["ImageRepository"]["ImageIdentifier"],
        asset.image_uri()
    );
}
