//! Reusable building blocks that declare groups of related resources on a
//! [`StackBuilder`](infra_graph::StackBuilder).
//!
//! Every construct follows the same shape: a props struct in, a handle out.
//! The handle carries the logical ids other constructs need to reference,
//! so wiring between components is plain data:
//!
//! ```text
//! Vpc ──► SecurityGroup ──► ServerlessCluster ──► SqlStatement ──► SqlStatement
//!  │                               │
//!  ├──► Cluster ──► FargateService ┤
//!  │                               ▼
//!  └──────────────────────► AppRunnerService
//! ```
//!
//! Construct ids come from a [`Scope`]: the path of the construct inside the
//! stack, flattened into a logical id.

pub mod asset;
pub mod bootstrap;
pub mod cluster;
pub mod database;
pub mod edge;
pub mod error;
pub mod iam;
pub mod load_balanced;
pub mod network;
pub mod scope;
pub mod security;
pub mod service;

pub use asset::{AssetDestination, AssetManifest, ContainerImage, DockerImageAsset};
pub use bootstrap::{SqlStatement, SqlStatementProps, StatementRunner};
pub use cluster::{Cluster, ClusterProps};
pub use database::{ServerlessCluster, ServerlessClusterProps};
pub use edge::{AppRunnerService, AppRunnerServiceProps};
pub use error::{ConstructError, ConstructResult};
pub use iam::{PolicyDocument, PolicyStatement, Role, RoleProps, ServicePrincipal};
pub use load_balanced::{
    ApplicationLoadBalancedFargateService, AutoScalingProps, HealthCheckProps,
    LoadBalancedServiceProps,
};
pub use network::{SubnetConfiguration, SubnetType, Vpc, VpcProps};
pub use scope::Scope;
pub use security::{Port, SecurityGroup};
pub use service::{
    CapacityProvider, CapacityProviderStrategy, ContainerDefinitionProps, ContainerHealthCheck,
    FargateService, FargateServiceProps, SecretEnv, TaskDefinition, TaskDefinitionProps,
};
