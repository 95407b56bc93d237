//! Collaborator interfaces
//!
//! Steps reach hosts, the database engine and the VM inventory only through
//! these traits. Production wires SSH, the engine driver and the host
//! provider behind them; the `testing` module has scripted fakes.

use crate::error::{EngineError, RemoteError};
use async_trait::async_trait;
use dbaas_common::{Host, Infra, Instance};
use dbaas_volume::VmLocation;
use serde_json::Value;
use std::collections::BTreeMap;

/// Template variables and driver parameter maps
pub type Vars = BTreeMap<String, Value>;

/// One result row of an engine query, keyed by column name
pub type Row = BTreeMap<String, Value>;

/// Output of a script run on a host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutput {
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ScriptOutput {
    pub fn ok(stdout: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into_iter().map(Into::into).collect(),
            stderr: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// First stdout line, trimmed
    pub fn first_line(&self) -> Option<&str> {
        self.stdout.first().map(|l| l.trim())
    }
}

/// Runs shell scripts on hosts
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `script` on `host`
    ///
    /// A script that ran returns `Ok` whatever its exit code; only a broken
    /// channel is an `Err`.
    async fn run_script(&self, host: &Host, script: &str) -> Result<ScriptOutput, RemoteError>;
}

/// Binary log coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogPosition {
    pub file: String,
    pub position: u64,
}

impl std::fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.position)
    }
}

/// Engine-specific operations of an infra
#[async_trait]
pub trait EngineDriver: Send + Sync {
    /// Topology name exposed to plan scripts as `DRIVER_NAME`
    fn topology_name(&self) -> String;

    async fn master_instance(&self, infra: &Infra) -> Result<Instance, EngineError>;

    async fn check_instance_is_master(&self, instance: &Instance) -> Result<bool, EngineError>;

    async fn is_replication_ok(&self, instance: &Instance) -> Result<bool, EngineError>;

    async fn query(&self, sql: &str, instance: &Instance) -> Result<Vec<Row>, EngineError>;

    async fn set_configuration(&self, instance: &Instance, name: &str, value: &str) -> Result<(), EngineError>;

    /// Coordinates saved on disk by the last backup of `host`
    async fn replication_info_from_file(&self, host: &Host) -> Result<BinlogPosition, EngineError>;

    /// Current coordinates of a running master (`SHOW MASTER STATUS`)
    async fn master_status(&self, instance: &Instance) -> Result<BinlogPosition, EngineError>;

    async fn change_master_to(
        &self,
        instance: &Instance,
        master_address: &str,
        position: &BinlogPosition,
    ) -> Result<(), EngineError>;

    async fn start_slave(&self, instance: &Instance) -> Result<(), EngineError>;

    async fn save_binlog_position(&self, instance: &Instance) -> Result<(), EngineError>;

    /// Point the HA agent's write address at `instance`
    async fn set_master(&self, instance: &Instance) -> Result<(), EngineError>;

    /// Point the HA agent's read address at `instance`
    async fn set_read_ip(&self, instance: &Instance) -> Result<(), EngineError>;

    /// Engine configuration rendered into the `configuration` variable
    fn configuration(&self, infra: &Infra, memory_size_mb: u64) -> Option<Value> {
        let _ = (infra, memory_size_mb);
        None
    }

    fn configuration_parameters(&self, instance: &Instance) -> Vars {
        let _ = instance;
        Vars::new()
    }

    fn configuration_parameters_migration(&self, instance: &Instance) -> Vars {
        let _ = instance;
        Vars::new()
    }

    fn configuration_parameters_for_log_resize(&self, instance: &Instance) -> Vars {
        let _ = instance;
        Vars::new()
    }

    fn master_parameters(&self, instance: &Instance, master: &Instance) -> Vars {
        let _ = (instance, master);
        Vars::new()
    }

    fn start_replication_parameters(&self, instance: &Instance) -> Vars {
        let _ = instance;
        Vars::new()
    }
}

/// Looks up the VM backing a host
#[async_trait]
pub trait HostVmProvider: Send + Sync {
    async fn vm_for_host(&self, host: &Host) -> Result<VmLocation, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_output() {
        let output = ScriptOutput::ok([" 0 "]);
        assert!(output.is_success());
        assert_eq!(output.first_line(), Some("0"));
        assert_eq!(ScriptOutput::default().first_line(), None);
    }

    #[test]
    fn test_binlog_display() {
        let pos = BinlogPosition {
            file: "mysql-bin.000042".to_string(),
            position: 154,
        };
        assert_eq!(pos.to_string(), "mysql-bin.000042:154");
    }
}
