use crate::{env_optional, env_or_default, ConfigError, FromEnv};

/// Default region the demo stack is pinned to
pub const DEFAULT_REGION: &str = "us-west-2";

/// Default deployment stage suffix for stack names
pub const DEFAULT_DEPLOY_ENV: &str = "test";

/// Account/region pair a stack is synthesized for, plus the deployment stage.
///
/// The account may be left unresolved, in which case the synthesized template
/// relies on the `AWS::AccountId` pseudo parameter at deploy time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployTarget {
    pub account: Option<String>,
    pub region: String,
    pub deploy_env: String,
}

impl DeployTarget {
    pub fn new(account: Option<String>, region: impl Into<String>, deploy_env: impl Into<String>) -> Self {
        Self {
            account,
            region: region.into(),
            deploy_env: deploy_env.into(),
        }
    }

    /// Stack name for a given stack prefix, e.g. `AppRunnerVPCDemo-test`
    pub fn stack_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.deploy_env)
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if let Some(account) = &self.account {
            if account.len() != 12 || !account.chars().all(|c| c.is_ascii_digit()) {
                return Err(ConfigError::InvalidValue {
                    key: "CDK_DEFAULT_ACCOUNT".to_string(),
                    details: format!("'{}' is not a 12-digit account id", account),
                });
            }
        }
        if self.region.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "CDK_DEFAULT_REGION".to_string(),
                details: "region must not be empty".to_string(),
            });
        }
        if !self.deploy_env.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ConfigError::InvalidValue {
                key: "DEPLOY_ENV".to_string(),
                details: format!("'{}' may only contain alphanumerics and '-'", self.deploy_env),
            });
        }
        Ok(self)
    }

    /// Build a target from explicit overrides, falling back to the environment
    pub fn resolve(
        account: Option<String>,
        region: Option<String>,
        deploy_env: Option<String>,
    ) -> Result<Self, ConfigError> {
        let from_env = Self::read_env();
        Self {
            account: account.or(from_env.account),
            region: region.unwrap_or(from_env.region),
            deploy_env: deploy_env.unwrap_or(from_env.deploy_env),
        }
        .validate()
    }

    /// Raw environment values, validated only once overrides are merged in
    fn read_env() -> Self {
        Self {
            account: env_optional("CDK_DEFAULT_ACCOUNT"),
            region: env_or_default("CDK_DEFAULT_REGION", DEFAULT_REGION),
            deploy_env: env_or_default("DEPLOY_ENV", DEFAULT_DEPLOY_ENV),
        }
    }
}

impl FromEnv for DeployTarget {
    /// Reads from environment variables:
    /// - CDK_DEFAULT_ACCOUNT: optional
    /// - CDK_DEFAULT_REGION: defaults to us-west-2
    /// - DEPLOY_ENV: defaults to "test"
    fn from_env() -> Result<Self, ConfigError> {
        Self::read_env().validate()
    }
}

impl Default for DeployTarget {
    fn default() -> Self {
        Self::new(None, DEFAULT_REGION, DEFAULT_DEPLOY_ENV)
    }
}
