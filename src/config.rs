//! Application configuration
//!
//! One YAML file holds the volume provider credentials per environment and
//! the step tunables:
//!
//! ```yaml
//! provider:
//!   timeout_secs: 60
//!   environments:
//!     dev:
//!       endpoint: https://volumes.dev.example.com
//!       project: dbaas
//! steps:
//!   skip_snapshot_wait: [prod]
//!   log_endpoint: logs.example.com:514
//! ```

use color_eyre::eyre::{Result, WrapErr};
use dbaas_steps::StepsConfig;
use dbaas_volume::{PollPolicy, ProviderConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/dbaas/config.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub steps: StepsConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).wrap_err_with(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Problems that would make runs fail, empty when none
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.provider.environments.is_empty() {
            problems.push("provider: no environments configured".to_string());
        }
        for (environment, credential) in &self.provider.environments {
            if !credential.endpoint.starts_with("http://") && !credential.endpoint.starts_with("https://") {
                problems.push(format!(
                    "provider.environments.{}: endpoint '{}' is not an http(s) URL",
                    environment, credential.endpoint
                ));
            }
            if credential.project.is_empty() {
                problems.push(format!("provider.environments.{}: project is empty", environment));
            }
        }
        if self.provider.timeout_secs == 0 {
            problems.push("provider.timeout_secs must be positive".to_string());
        }

        let polling = &self.steps.polling;
        let budgets = [
            ("snapshot_ready", polling.snapshot_ready),
            ("rsync_completion", polling.rsync_completion),
            ("replication_health", polling.replication_health),
        ];
        for (name, policy) in budgets {
            if policy.attempts == 0 {
                problems.push(format!("steps.polling.{}: attempts must be positive", name));
            }
        }
        problems
    }
}

/// `60 x 5s`
pub fn describe_policy(policy: &PollPolicy) -> String {
    format!("{} x {:?}", policy.attempts, policy.delay())
}
