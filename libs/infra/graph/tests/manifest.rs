use infra_graph::intrinsic::{get_att, join, ref_};
use infra_graph::{
    GraphError, LogicalId, Manifest, Output, RemovalPolicy, Resource, ResourceChange, StackBuilder,
    diff_templates,
};
use serde_json::json;

fn id(s: &str) -> LogicalId {
    LogicalId::new(s).unwrap()
}

/// vpc <- subnet <- db <- statement, plus an edge service waiting on the statement
fn sample() -> Manifest {
    let mut builder = StackBuilder::new("Sample-test").description("sample");
    builder.add_resource(Resource::new(id("Vpc"), "AWS::EC2::VPC")).unwrap();
    builder
        .add_resource(
            Resource::new(id("Subnet"), "AWS::EC2::Subnet").with_property("VpcId", ref_(&id("Vpc"))),
        )
        .unwrap();
    builder
        .add_resource(
            Resource::new(id("Db"), "AWS::RDS::DBCluster")
                .with_property("DBSubnetGroupName", join(",", vec![ref_(&id("Subnet"))]))
                .with_removal_policy(RemovalPolicy::Destroy),
        )
        .unwrap();
    builder
        .add_resource(
            Resource::new(id("Statement"), "Custom::AWS")
                .with_property("ClusterArn", get_att(&id("Db"), "Arn")),
        )
        .unwrap();
    builder
        .add_resource(Resource::new(id("Edge"), "AWS::AppRunner::Service").with_removal_policy(RemovalPolicy::Retain))
        .unwrap();
    builder.add_dependency(&id("Edge"), &id("Statement")).unwrap();
    builder
        .add_output(Output::new("DbArn", get_att(&id("Db"), "Arn")))
        .unwrap();
    builder.build().unwrap()
}

#[test]
fn test_waves_follow_reference_and_explicit_edges() {
    let manifest = sample();
    let waves = manifest.creation_waves();
    assert_eq!(
        waves,
        vec![
            vec![id("Vpc")],
            vec![id("Subnet")],
            vec![id("Db")],
            vec![id("Statement")],
            vec![id("Edge")],
        ]
    );
    assert_eq!(manifest.deletion_order().first(), Some(&id("Edge")));
    assert_eq!(manifest.deletion_order().last(), Some(&id("Vpc")));
}

#[test]
fn test_transitive_queries() {
    let manifest = sample();
    assert!(manifest.depends_on(&id("Edge"), &id("Vpc")).unwrap());
    assert!(!manifest.depends_on(&id("Vpc"), &id("Edge")).unwrap());
    assert_eq!(
        manifest.explicit_dependencies(&id("Edge")).unwrap().into_iter().collect::<Vec<_>>(),
        vec![id("Statement")]
    );
    assert!(manifest.explicit_dependencies(&id("Statement")).unwrap().is_empty());
    assert!(manifest.dependents(&id("Db")).unwrap().contains(&id("Statement")));
    assert!(matches!(
        manifest.dependencies(&id("Missing")),
        Err(GraphError::ResourceNotFound(_))
    ));
}

#[test]
fn test_template_rendering() {
    let template = sample().to_template();
    assert_eq!(template["Description"], "sample");
    assert_eq!(template["Resources"]["Db"]["DeletionPolicy"], "Delete");
    assert_eq!(template["Resources"]["Edge"]["DeletionPolicy"], "Retain");
    assert_eq!(template["Resources"]["Edge"]["DependsOn"], json!(["Statement"]));
    assert_eq!(
        template["Outputs"]["DbArn"]["Value"],
        json!({ "Fn::GetAtt": ["Db", "Arn"] })
    );
}

#[test]
fn test_retained_resources() {
    let manifest = sample();
    let retained: Vec<_> = manifest
        .retained_on_teardown()
        .into_iter()
        .map(|r| r.logical_id.clone())
        .collect();
    assert_eq!(retained, vec![id("Edge")]);
}

#[test]
fn test_cycle_rejected() {
    let mut builder = StackBuilder::new("Cycle");
    builder
        .add_resource(Resource::new(id("A"), "AWS::SNS::Topic").with_property("Peer", ref_(&id("B"))))
        .unwrap();
    builder
        .add_resource(Resource::new(id("B"), "AWS::SNS::Topic").with_property("Peer", ref_(&id("A"))))
        .unwrap();
    assert!(matches!(builder.build(), Err(GraphError::CycleDetected(_))));
}

#[test]
fn test_dangling_output_rejected() {
    let mut builder = StackBuilder::new("Dangling");
    builder.add_resource(Resource::new(id("A"), "AWS::SNS::Topic")).unwrap();
    builder.add_output(Output::new("Missing", ref_(&id("B")))).unwrap();
    assert!(matches!(builder.build(), Err(GraphError::UnknownReference { .. })));
}

#[test]
fn test_diff_against_previous_template() {
    let previous = sample().to_template();

    let mut builder = StackBuilder::new("Sample-test").description("sample");
    builder.add_resource(Resource::new(id("Vpc"), "AWS::EC2::VPC")).unwrap();
    builder
        .add_resource(
            Resource::new(id("Subnet"), "AWS::EC2::Subnet")
                .with_property("VpcId", ref_(&id("Vpc")))
                .with_property("MapPublicIpOnLaunch", json!(true)),
        )
        .unwrap();
    let current = builder.build().unwrap().to_template();

    let diff = diff_templates(&previous, &current);
    assert_eq!(diff.removed(), 3);
    assert_eq!(diff.added(), 0);
    assert_eq!(diff.modified(), 1);
    let modified = diff
        .resources
        .iter()
        .find(|c| matches!(c, ResourceChange::Modified { .. }))
        .unwrap();
    assert_eq!(modified.logical_id(), "Subnet");
    assert!(diff_templates(&current, &current).is_empty());
}
