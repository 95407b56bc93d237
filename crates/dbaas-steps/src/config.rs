//! Step configuration

use dbaas_volume::PollingConfig;
use serde::{Deserialize, Serialize};

/// Tunables shared by every step of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepsConfig {
    #[serde(default)]
    pub polling: PollingConfig,

    /// Environments where waiting for snapshot readiness is skipped
    #[serde(default = "default_skip_snapshot_wait")]
    pub skip_snapshot_wait: Vec<String>,

    /// Log shipping endpoint exposed to plan scripts as `LOG_ENDPOINT`
    #[serde(default)]
    pub log_endpoint: String,

    /// Directory holding infra and instance TLS files on the hosts
    #[serde(default = "default_ssl_directory")]
    pub ssl_directory: String,
}

fn default_skip_snapshot_wait() -> Vec<String> {
    vec!["prod".to_string()]
}

fn default_ssl_directory() -> String {
    "/data/ssl".to_string()
}

impl Default for StepsConfig {
    fn default() -> Self {
        Self {
            polling: PollingConfig::default(),
            skip_snapshot_wait: default_skip_snapshot_wait(),
            log_endpoint: String::new(),
            ssl_directory: default_ssl_directory(),
        }
    }
}

impl StepsConfig {
    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    pub fn with_log_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.log_endpoint = endpoint.into();
        self
    }

    pub fn with_skip_snapshot_wait(mut self, environments: Vec<String>) -> Self {
        self.skip_snapshot_wait = environments;
        self
    }

    pub fn skips_snapshot_wait(&self, environment: &str) -> bool {
        self.skip_snapshot_wait.iter().any(|e| e == environment)
    }
}
