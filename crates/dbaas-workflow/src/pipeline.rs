//! Operation pipelines
//!
//! Each [`OperationKind`] maps to one ordered list of catalog steps. The
//! steps carry their own gates, so a table lists every step the operation
//! may need on any instance and the executor skips the ones that do not
//! apply to the instance being run.

use crate::error::WorkflowError;
use dbaas_steps::steps::{access, copy, mysql, plan, snapshot, volume};
use dbaas_steps::Step;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maintenance operations with a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Provision the data volume and configure a new database
    Create,
    /// Move an instance to a new host in the same environment
    MigrateHost,
    /// Move every instance of an infra to another environment
    MigrateDatabase,
    /// Switch the infra to its engine migration plan
    MigrateEngine,
    /// Engine version upgrade in place
    Upgrade,
    /// Reconfigure for a new compute offering
    Resize,
    /// Grow the data volume to the disk offering
    DiskResize,
    /// Restore a backup group onto the instances
    Restore,
    /// Rebuild a replica from a snapshot of its master
    RecreateSlave,
    /// Move data onto a volume of a new disk type
    DiskTypeUpgrade,
    /// Reinstall the VM and reattach the existing data volume
    AutoUpgradeVm,
    /// Toggle data persistence through a plan change
    ChangePersistence,
}

impl OperationKind {
    pub const ALL: [OperationKind; 12] = [
        OperationKind::Create,
        OperationKind::MigrateHost,
        OperationKind::MigrateDatabase,
        OperationKind::MigrateEngine,
        OperationKind::Upgrade,
        OperationKind::Resize,
        OperationKind::DiskResize,
        OperationKind::Restore,
        OperationKind::RecreateSlave,
        OperationKind::DiskTypeUpgrade,
        OperationKind::AutoUpgradeVm,
        OperationKind::ChangePersistence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::MigrateHost => "migrate_host",
            OperationKind::MigrateDatabase => "migrate_database",
            OperationKind::MigrateEngine => "migrate_engine",
            OperationKind::Upgrade => "upgrade",
            OperationKind::Resize => "resize",
            OperationKind::DiskResize => "disk_resize",
            OperationKind::Restore => "restore",
            OperationKind::RecreateSlave => "recreate_slave",
            OperationKind::DiskTypeUpgrade => "disk_type_upgrade",
            OperationKind::AutoUpgradeVm => "auto_upgrade_vm",
            OperationKind::ChangePersistence => "change_persistence",
        }
    }

    /// The ordered step table of this operation
    pub fn pipeline(self) -> Pipeline {
        let steps = match self {
            OperationKind::Create => create(),
            OperationKind::MigrateHost => migrate_host(),
            OperationKind::MigrateDatabase => migrate_database(),
            OperationKind::MigrateEngine => migrate_engine(),
            OperationKind::Upgrade => upgrade(),
            OperationKind::Resize => resize(),
            OperationKind::DiskResize => disk_resize(),
            OperationKind::Restore => restore(),
            OperationKind::RecreateSlave => recreate_slave(),
            OperationKind::DiskTypeUpgrade => disk_type_upgrade(),
            OperationKind::AutoUpgradeVm => auto_upgrade_vm(),
            OperationKind::ChangePersistence => change_persistence(),
        };
        Pipeline::new(self, steps)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_");
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| WorkflowError::UnknownOperation(s.to_string()))
    }
}

/// Ordered steps of one operation
pub struct Pipeline {
    kind: OperationKind,
    steps: Vec<Box<dyn Step>>,
}

impl Pipeline {
    pub fn new(kind: OperationKind, steps: Vec<Box<dyn Step>>) -> Self {
        Self { kind, steps }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("kind", &self.kind)
            .field("steps", &self.names())
            .finish()
    }
}

macro_rules! steps {
    ($($step:expr),* $(,)?) => {
        vec![$(Box::new($step) as Box<dyn Step>),*]
    };
}

fn create() -> Vec<Box<dyn Step>> {
    steps![
        volume::new_volume(),
        access::add_access_new_volume(),
        volume::attach_data_volume(),
        volume::mount_data_volume(),
        plan::initialization_for_new_infra(),
        plan::initialization_for_new_infra_sentinel(),
        plan::configure_for_new_infra(),
        plan::configure_for_new_infra_sentinel(),
        plan::configure_log_for_new_infra(),
        mysql::set_file_permission(),
        plan::start_replication_first_node_new_infra(),
        volume::update_team_labels_disks(),
    ]
}

fn migrate_host() -> Vec<Box<dyn Step>> {
    steps![
        snapshot::take_snapshot_migrate(),
        volume::new_volume_migrate(),
        access::add_access_migrate(),
        volume::attach_data_volume_migrate(),
        volume::mount_data_volume_migrate(),
        access::add_hosts_allow_migrate(),
        access::create_pub_key_migrate(),
        copy::scp_from_snapshot_migrate(),
        copy::copy_files_migrate(),
        plan::initialization_migrate(),
        plan::configure_migration(),
        mysql::set_file_permission(),
        mysql::set_replication_host_migrate(),
        access::remove_pub_key_migrate(),
        access::remove_hosts_allow_migrate(),
        volume::umount_data_volume_migrate(),
        snapshot::remove_snapshot_migrate(),
    ]
}

fn migrate_database() -> Vec<Box<dyn Step>> {
    steps![
        snapshot::take_snapshot_migrate_all_instances(),
        snapshot::wait_snapshot_available_migrate(),
        volume::new_volume_migrate(),
        volume::attach_data_volume_migrate(),
        volume::mount_data_volume_database_migrate(),
        access::add_hosts_allow_database_migrate(),
        copy::scp_from_snapshot_database_migrate(),
        copy::wait_rsync_from_snapshot_database_migrate(),
        plan::initialization_migration(),
        plan::configure_migration(),
        plan::configure_log_migrate_engine(),
        mysql::set_file_permission(),
        mysql::set_server_id_migrate(),
        mysql::set_replication_first_instance_migrate(),
        mysql::set_replication_last_instance_migrate(),
        mysql::check_replication_db_migrate(),
        mysql::set_read_only_migrate(),
        mysql::reconfigure_replication_db_migrate(),
        mysql::set_first_target_instance_read_write_migrate(),
        access::remove_hosts_allow_database_migrate(),
        snapshot::remove_snapshot_migrate(),
    ]
}

fn migrate_engine() -> Vec<Box<dyn Step>> {
    steps![
        plan::initialization_for_migrate_engine(),
        plan::configure_for_migrate_engine(),
        plan::configure_log_migrate_engine(),
        mysql::set_file_permission(),
        mysql::run_mysql_upgrade(),
        mysql::check_if_audit_plugin_is_installed(),
        plan::start_replication_first_node(),
    ]
}

fn upgrade() -> Vec<Box<dyn Step>> {
    steps![
        plan::initialization_for_upgrade(),
        plan::configure_for_upgrade(),
        plan::configure_log(),
        mysql::set_file_permission(),
        mysql::run_mysql_upgrade(),
        mysql::install_audit_plugin(),
        plan::start_replication_first_node(),
    ]
}

fn resize() -> Vec<Box<dyn Step>> {
    steps![plan::resize_configure(), plan::configure_for_resize_log()]
}

fn disk_resize() -> Vec<Box<dyn Step>> {
    steps![volume::resize_volume(), volume::resize2fs()]
}

fn restore() -> Vec<Box<dyn Step>> {
    steps![
        mysql::save_mysql_binlog(),
        snapshot::take_snapshot(),
        volume::restore_snapshot(),
        access::add_access_restored_volume(),
        volume::unmount_data_volume(),
        volume::attach_data_volume_restored(),
        volume::mount_data_volume_restored(),
        mysql::set_file_permission(),
        plan::configure_restore(),
        mysql::set_master_restore(),
        mysql::start_slave(),
        mysql::configure_foxha_restore(),
        volume::update_active_disk(),
    ]
}

fn recreate_slave() -> Vec<Box<dyn Step>> {
    steps![
        mysql::disable_replication_recreate_slave(),
        snapshot::take_snapshot_from_master(),
        volume::new_volume_from_master(),
        access::add_access_recreate_slave(),
        volume::attach_data_volume_recreate_slave(),
        volume::mount_data_volume_recreate_slave(),
        mysql::set_file_permission(),
        mysql::set_master_recreate_slave(),
        mysql::set_replication_recreate_slave(),
        mysql::enable_replication_recreate_slave(),
        mysql::start_slave(),
        volume::update_active_disk(),
    ]
}

fn disk_type_upgrade() -> Vec<Box<dyn Step>> {
    steps![
        snapshot::take_snapshot_upgrade_disk_type(),
        volume::create_volume_disk_type_upgrade(),
        access::add_access_upgraded_disk_type_volume(),
        volume::unmount_active_volume_upgrade_disk_type(),
        volume::attach_data_volume_upgrade_disk_type(),
        volume::mount_data_volume_upgrade_disk_type(),
        mysql::set_file_permission(),
        volume::update_active_disk_type_upgrade(),
    ]
}

fn auto_upgrade_vm() -> Vec<Box<dyn Step>> {
    steps![
        snapshot::take_snapshot_old_disk(),
        volume::unmount_data_volume(),
        volume::detach_data_volume(),
        volume::attach_data_volume(),
        volume::mount_data_volume(),
        plan::initialization_auto_upgrade(),
        plan::configure_for_upgrade(),
        plan::configure_log(),
        mysql::set_file_permission(),
        plan::start_replication_first_node(),
    ]
}

fn change_persistence() -> Vec<Box<dyn Step>> {
    steps![plan::configure_for_change_persistence(), plan::start_replication_first_node()]
}
