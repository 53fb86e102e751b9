//! Resource graph for declarative stacks.
//!
//! ```text
//! ┌──────────────┐
//! │ StackBuilder │  ← mutable, one pass, explicit edges
//! └──────┬───────┘
//!        │ build() validates references + acyclicity
//! ┌──────▼───────┐
//! │   Manifest   │  ← immutable: ordering, lookups, template rendering
//! └──────┬───────┘
//!        │
//! ┌──────▼───────┐
//! │     diff     │  ← previous template vs synthesized template
//! └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use infra_graph::{intrinsic, LogicalId, Resource, StackBuilder};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), infra_graph::GraphError> {
//! let vpc = LogicalId::new("Vpc")?;
//! let subnet = LogicalId::new("Subnet")?;
//!
//! let mut builder = StackBuilder::new("Demo");
//! builder.add_resource(Resource::new(vpc.clone(), "AWS::EC2::VPC"))?;
//! builder.add_resource(
//!     Resource::new(subnet.clone(), "AWS::EC2::Subnet")
//!         .with_properties(json!({ "VpcId": intrinsic::ref_(&vpc) })),
//! )?;
//!
//! let manifest = builder.build()?;
//! assert_eq!(manifest.creation_order(), vec![vpc, subnet]);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod diff;
pub mod error;
pub mod intrinsic;
pub mod manifest;
pub mod resource;

pub use builder::StackBuilder;
pub use diff::{OutputChange, ResourceChange, TemplateDiff, diff_templates};
pub use error::{GraphError, GraphResult};
pub use manifest::{EdgeKind, Manifest};
pub use resource::{LogicalId, Output, RemovalPolicy, Resource};
