//! Domain records
//!
//! These mirror the rows owned by the persistence layer. Steps never hold
//! on to them across calls: anything a later step may have changed is read
//! back through the [`Store`](crate::Store).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Primary key type for every record
pub type Id = u64;

// ============================================================================
// Hosts and instances
// ============================================================================

/// Operating system family of a host, used to pick service commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostOs {
    Ol6,
    #[default]
    Ol7,
}

/// A virtual or physical machine backing one or more instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: Id,
    pub hostname: String,
    pub address: String,
    #[serde(default)]
    pub os: HostOs,
    /// Destination host paired with this one during a host migration
    #[serde(default)]
    pub future_host_id: Option<Id>,
}

impl Host {
    pub fn new(id: Id, hostname: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id,
            hostname: hostname.into(),
            address: address.into(),
            os: HostOs::default(),
            future_host_id: None,
        }
    }

    pub fn with_future_host(mut self, future_host_id: Id) -> Self {
        self.future_host_id = Some(future_host_id);
        self
    }

    pub fn with_os(mut self, os: HostOs) -> Self {
        self.os = os;
        self
    }

    /// Hostname without its domain part
    pub fn short_name(&self) -> &str {
        self.hostname.split('.').next().unwrap_or(&self.hostname)
    }

    pub fn is_ol6(&self) -> bool {
        self.os == HostOs::Ol6
    }

    pub fn is_ol7(&self) -> bool {
        self.os == HostOs::Ol7
    }
}

/// A database process endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: Id,
    pub infra_id: Id,
    pub host_id: Id,
    pub address: String,
    pub dns: String,
    pub port: u16,
    /// Serves data (as opposed to sentinel/arbiter processes)
    pub is_database: bool,
    #[serde(default)]
    pub is_sentinel: bool,
    /// Short-lived instance created for VM offering upgrades
    #[serde(default)]
    pub temporary: bool,
    #[serde(default)]
    pub read_only: bool,
    /// Destination counterpart while a cross-environment migration runs
    #[serde(default)]
    pub future_instance_id: Option<Id>,
}

impl Instance {
    pub fn database(id: Id, infra_id: Id, host_id: Id, address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            id,
            infra_id,
            host_id,
            dns: address.clone(),
            address,
            port: 3306,
            is_database: true,
            is_sentinel: false,
            temporary: false,
            read_only: false,
            future_instance_id: None,
        }
    }

    pub fn with_dns(mut self, dns: impl Into<String>) -> Self {
        self.dns = dns.into();
        self
    }

    pub fn with_future_instance(mut self, future_instance_id: Id) -> Self {
        self.future_instance_id = Some(future_instance_id);
        self
    }

    pub fn as_temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn as_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn as_sentinel(mut self) -> Self {
        self.is_database = false;
        self.is_sentinel = true;
        self
    }

    /// Source side of a cross-environment migration
    pub fn is_migration_source(&self) -> bool {
        self.future_instance_id.is_some()
    }
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dns, self.port)
    }
}

// ============================================================================
// Infra, plans and offerings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslMode {
    AllowTls,
    PreferTls,
    RequireTls,
}

/// Compute sizing class of an infra's VMs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offering {
    pub name: String,
    pub memory_size_mb: u64,
    pub cpus: u32,
    /// Same sizing in the destination environment of a migration
    #[serde(default)]
    pub equivalent: Option<Box<Offering>>,
}

impl Offering {
    pub fn new(name: impl Into<String>, memory_size_mb: u64, cpus: u32) -> Self {
        Self {
            name: name.into(),
            memory_size_mb,
            cpus,
            equivalent: None,
        }
    }
}

/// Storage sizing class of an infra's volumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskOffering {
    pub name: String,
    pub size_kb: u64,
}

impl DiskOffering {
    pub fn size_gb(&self) -> f64 {
        self.size_kb as f64 / (1024.0 * 1024.0)
    }
}

/// Disk type (SSD, HDD, ...) with its per-environment migration mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskOfferingType {
    pub type_name: String,
    /// Environment name -> disk type used there after a migration
    #[serde(default)]
    pub migrate_to: BTreeMap<String, String>,
}

impl DiskOfferingType {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            migrate_to: BTreeMap::new(),
        }
    }

    pub fn with_migration_target(mut self, environment: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.migrate_to.insert(environment.into(), type_name.into());
        self
    }

    /// Disk type to use in `environment`, falling back to this type
    pub fn type_to(&self, environment: &str) -> &str {
        self.migrate_to
            .get(environment)
            .map(String::as_str)
            .unwrap_or(&self.type_name)
    }
}

/// Script templates of a plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanScripts {
    #[serde(default)]
    pub initialization: String,
    #[serde(default)]
    pub configuration: String,
    #[serde(default)]
    pub configure_log: String,
    #[serde(default)]
    pub start_replication: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub engine_type: String,
    pub has_persistence: bool,
    #[serde(default)]
    pub scripts: PlanScripts,
    /// Plan used after an engine version upgrade
    #[serde(default)]
    pub engine_equivalent_plan: Option<Box<Plan>>,
    /// Plan used after an engine migration
    #[serde(default)]
    pub migrate_engine_equivalent_plan: Option<Box<Plan>>,
}

impl Plan {
    pub fn new(name: impl Into<String>, engine_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine_type: engine_type.into(),
            has_persistence: true,
            scripts: PlanScripts::default(),
            engine_equivalent_plan: None,
            migrate_engine_equivalent_plan: None,
        }
    }
}

/// The topology grouping every instance of one logical database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Infra {
    pub id: Id,
    pub name: String,
    pub database_name: String,
    pub team_name: String,
    /// Engine name as understood by the volume provider (e.g. `mysql_8_0`)
    pub engine: String,
    pub environment: String,
    pub plan: Plan,
    pub offering: Offering,
    pub disk_offering: DiskOffering,
    pub disk_offering_type: DiskOfferingType,
    #[serde(default)]
    pub ssl_configured: bool,
    #[serde(default)]
    pub ssl_mode: Option<SslMode>,
    /// A cross-environment database migration is running
    #[serde(default)]
    pub migration_in_progress: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

// ============================================================================
// Storage
// ============================================================================

/// A provider-managed disk attached to a host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: Id,
    pub host_id: Id,
    /// Opaque token issued by the volume provider
    pub identifier: String,
    pub total_size_kb: u64,
    pub is_active: bool,
    #[serde(default)]
    pub disk_offering_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Volume {
    /// New unsaved volume record; the store assigns the id
    pub fn new(host_id: Id, identifier: impl Into<String>, total_size_kb: u64) -> Self {
        Self {
            id: 0,
            host_id,
            identifier: identifier.into(),
            total_size_kb,
            is_active: true,
            disk_offering_type: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Pending,
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SnapshotStatus::Pending => "pending",
            SnapshotStatus::Success => "success",
            SnapshotStatus::Warning => "warning",
            SnapshotStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Backup of one volume taken through the volume provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Id,
    /// Provider token, known once the provider accepted the request
    pub snapshot_id: Option<String>,
    pub group_id: Id,
    pub instance_id: Id,
    pub volume_id: Option<Id>,
    pub environment: String,
    pub status: SnapshotStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub is_automatic: bool,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub volume_path: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub purge_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// New pending snapshot record; the store assigns the id
    pub fn pending(
        instance_id: Id,
        group_id: Id,
        volume_id: Option<Id>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            snapshot_id: None,
            group_id,
            instance_id,
            volume_id,
            environment: environment.into(),
            status: SnapshotStatus::Pending,
            error: None,
            is_automatic: true,
            size_bytes: None,
            volume_path: None,
            created_at: Utc::now(),
            end_at: None,
            purge_at: None,
        }
    }

    pub fn has_warning(&self) -> bool {
        self.status == SnapshotStatus::Warning
    }

    pub fn was_error(&self) -> bool {
        self.status == SnapshotStatus::Error
    }

    /// Logically removed; never a restore source
    pub fn is_purged(&self) -> bool {
        self.purge_at.is_some()
    }

    /// Finished and not purged
    pub fn is_restorable(&self) -> bool {
        self.end_at.is_some() && !self.is_purged()
    }

    /// Provider token, or an error naming the record
    pub fn provider_id(&self) -> crate::Result<&str> {
        self.snapshot_id
            .as_deref()
            .ok_or_else(|| crate::StoreError::Invalid {
                kind: "snapshot",
                reason: format!("snapshot {} has no provider identifier", self.id),
            })
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.snapshot_id {
            Some(token) => write!(f, "snapshot {} ({})", self.id, token),
            None => write!(f, "snapshot {}", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupGroup {
    pub id: Id,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Operation contexts
// ============================================================================

/// Move of one host to a new zone/environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMigrate {
    pub id: Id,
    /// Source host; its `future_host_id` points at the destination
    pub host_id: Id,
    pub environment: String,
    pub zone: String,
    pub zone_origin: String,
    #[serde(default)]
    pub snapshot_id: Option<Id>,
    #[serde(default)]
    pub database_migrate_id: Option<Id>,
}

/// Cross-environment migration of a whole database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseMigrate {
    pub id: Id,
    pub infra_id: Id,
    /// Destination environment
    pub environment: String,
    pub origin_environment: String,
    /// Snapshot shared by every host migration of this run
    #[serde(default)]
    pub host_migrate_snapshot_id: Option<Id>,
}

impl DatabaseMigrate {
    /// Environment an instance lives in while the migration runs
    pub fn environment_for(&self, instance: &Instance) -> &str {
        if instance.is_migration_source() {
            &self.origin_environment
        } else {
            &self.environment
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePair {
    pub master_id: Id,
    pub slave_id: Id,
}

/// Restore of a database from a backup group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Restore {
    pub id: Id,
    /// Group holding the snapshots to restore from
    pub group_id: Id,
    /// Group receiving the safety backups taken before restoring
    pub new_group_id: Id,
    pub pairs: Vec<InstancePair>,
}

impl Restore {
    pub fn is_master(&self, instance_id: Id) -> bool {
        self.pairs.iter().any(|p| p.master_id == instance_id)
    }

    pub fn is_slave(&self, instance_id: Id) -> bool {
        self.pairs.iter().any(|p| p.slave_id == instance_id)
    }

    /// Master of the pair containing `instance_id`
    pub fn master_for(&self, instance_id: Id) -> Option<Id> {
        self.pairs
            .iter()
            .find(|p| p.master_id == instance_id || p.slave_id == instance_id)
            .map(|p| p.master_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resize {
    pub source_offering: Offering,
    pub target_offering: Offering,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskTypeUpgrade {
    pub disk_offering_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePersistence {
    pub target_plan: Plan,
    pub running: bool,
}

// ============================================================================
// Maintenance
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceStatus {
    Waiting,
    Running,
    Success,
    Error,
    Rollback,
}

impl std::fmt::Display for MaintenanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MaintenanceStatus::Waiting => "Waiting",
            MaintenanceStatus::Running => "Running",
            MaintenanceStatus::Success => "Success",
            MaintenanceStatus::Error => "Error",
            MaintenanceStatus::Rollback => "Rollback",
        };
        f.write_str(s)
    }
}

/// A requested infrastructure operation and its progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Maintenance {
    pub id: Id,
    /// Operation kind name (e.g. `recreate_slave`)
    pub kind: String,
    pub infra_id: Id,
    /// Database name, known before the infra has databases
    pub name: String,
    pub status: MaintenanceStatus,
    pub can_do_retry: bool,
    /// Index of the step that was running when the operation stopped
    #[serde(default)]
    pub current_step: Option<usize>,
    /// Snapshot shared by the steps of this operation
    #[serde(default)]
    pub snapshot_id: Option<Id>,
    #[serde(default)]
    pub retry_of: Option<Id>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Maintenance {
    pub fn new(id: Id, kind: impl Into<String>, infra_id: Id, name: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
            infra_id,
            name: name.into(),
            status: MaintenanceStatus::Waiting,
            can_do_retry: true,
            current_step: None,
            snapshot_id: None,
            retry_of: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_status_error(&self) -> bool {
        self.status == MaintenanceStatus::Error
    }
}
