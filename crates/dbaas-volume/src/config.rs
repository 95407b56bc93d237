//! Volume provider configuration

use crate::error::{ProviderError, ProviderResult};
use crate::poll::PollPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Volume provider credentials for one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Service endpoint, without trailing slash
    pub endpoint: String,
    /// Provider project the environment's volumes live in
    pub project: String,
    /// Resource-pool headers sent with every call
    #[serde(default)]
    pub pool_headers: BTreeMap<String, String>,
}

impl Credential {
    pub fn new(endpoint: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            project: project.into(),
            pool_headers: BTreeMap::new(),
        }
    }

    pub fn with_pool_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.pool_headers.insert(name.into(), value.into());
        self
    }

    /// `{endpoint}/{project}/{environment}/`
    pub fn base_uri(&self, environment: &str) -> String {
        format!(
            "{}/{}/{}/",
            self.endpoint.trim_end_matches('/'),
            self.project,
            environment
        )
    }
}

/// Volume provider client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Credentials keyed by environment name
    #[serde(default)]
    pub environments: BTreeMap<String, Credential>,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            environments: BTreeMap::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_environment(mut self, environment: impl Into<String>, credential: Credential) -> Self {
        self.environments.insert(environment.into(), credential);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn credential(&self, environment: &str) -> ProviderResult<&Credential> {
        self.environments
            .get(environment)
            .ok_or_else(|| ProviderError::UnknownEnvironment(environment.to_string()))
    }
}

/// Polling budgets for the waits the workflow performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "PollPolicy::snapshot_ready")]
    pub snapshot_ready: PollPolicy,
    #[serde(default = "PollPolicy::rsync_completion")]
    pub rsync_completion: PollPolicy,
    #[serde(default = "PollPolicy::replication_health")]
    pub replication_health: PollPolicy,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            snapshot_ready: PollPolicy::snapshot_ready(),
            rsync_completion: PollPolicy::rsync_completion(),
            replication_health: PollPolicy::replication_health(),
        }
    }
}

impl PollingConfig {
    /// Same attempt budgets, no delay between observations
    pub fn immediate() -> Self {
        let no_delay = |p: PollPolicy| PollPolicy { delay_ms: 0, ..p };
        let defaults = Self::default();
        Self {
            snapshot_ready: no_delay(defaults.snapshot_ready),
            rsync_completion: no_delay(defaults.rsync_completion),
            replication_health: no_delay(defaults.replication_health),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_uri() {
        let credential = Credential::new("http://volumes.example.com/", "dbaas");
        assert_eq!(
            credential.base_uri("dev"),
            "http://volumes.example.com/dbaas/dev/"
        );
    }

    #[test]
    fn test_unknown_environment() {
        let config = ProviderConfig::new()
            .with_environment("dev", Credential::new("http://localhost", "p"));
        assert!(config.credential("dev").is_ok());
        assert!(matches!(
            config.credential("prod"),
            Err(ProviderError::UnknownEnvironment(env)) if env == "prod"
        ));
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
environments:
  dev:
    endpoint: http://volumes.dev
    project: dbaas
    pool_headers:
      X-Pool: pool-a
timeout_secs: 10
"#;
        let config: ProviderConfig = serde_yaml::from_str(yaml).unwrap();
        let dev = config.credential("dev").unwrap();
        assert_eq!(dev.pool_headers.get("X-Pool").map(String::as_str), Some("pool-a"));
        assert_eq!(config.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_polling_defaults_from_partial_yaml() {
        let yaml = "snapshot_ready:\n  attempts: 3\n  delay_ms: 100\n";
        let config: PollingConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.snapshot_ready.attempts, 3);
        assert_eq!(config.rsync_completion, PollPolicy::rsync_completion());
        assert_eq!(PollingConfig::immediate().replication_health.delay_ms, 0);
    }
}
