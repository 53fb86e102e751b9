//! App Runner service with VPC egress to an internal ECS service and an
//! Aurora Serverless database.
//!
//! [`build_stack`] turns a [`StackConfig`] and a [`DeployTarget`] into a
//! [`SynthesizedStack`]; [`run_checks`] verifies the ordering and sizing
//! guarantees on the result.
//!
//! [`DeployTarget`]: core_config::DeployTarget

pub mod checks;
pub mod config;
pub mod error;
pub mod stack;

pub use checks::{CheckResult, all_passed, run_checks};
pub use config::{EdgeImageSource, EdgeTarget, StackConfig};
pub use error::{StackError, StackResult};
pub use stack::{SynthesizedStack, build_stack};
