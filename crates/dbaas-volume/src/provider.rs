//! Volume provider abstraction
//!
//! One method per provider endpoint. Implementations are bound to a single
//! environment (credentials + namespace); callers pick the environment
//! through a [`ProviderFactory`].

use crate::error::ProviderResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// VM a volume is attached to or restored next to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmLocation {
    pub name: String,
    pub zone: String,
}

impl VmLocation {
    pub fn new(name: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zone: zone.into(),
        }
    }
}

/// Labels the provider attaches to volumes and snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLabels {
    pub engine: String,
    pub db_name: String,
    pub team_name: String,
}

/// Body of `volume/new`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub group: String,
    pub size_kb: u64,
    pub to_address: String,
    pub snapshot_id: Option<String>,
    pub zone: Option<String>,
    pub vm_name: Option<String>,
    #[serde(flatten)]
    pub labels: ResourceLabels,
    pub disk_offering_type: Option<String>,
}

/// Body of `commands/{id}/mount`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountRequest {
    pub with_fstab: bool,
    pub data_directory: String,
    pub host_vm: String,
    pub host_zone: String,
}

/// Body of `snapshot/{id}/restore` and `restore-to-rsync`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub vm_name: String,
    pub zone: String,
    #[serde(flatten)]
    pub labels: ResourceLabels,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_offering_type: Option<String>,
}

/// Body of `commands/copy_files`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyFilesRequest {
    pub snap_identifier: String,
    pub source_dir: String,
    pub dest_dir: String,
    pub snap_dir: String,
}

/// Shell commands computed by the provider from a host address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    CreatePubKey,
    RemovePubKey,
    AddHostsAllow,
    RemoveHostsAllow,
}

impl HostCommand {
    pub fn path(&self) -> &'static str {
        match self {
            HostCommand::CreatePubKey => "create_pub_key",
            HostCommand::RemovePubKey => "remove_pub_key",
            HostCommand::AddHostsAllow => "add_hosts_allow",
            HostCommand::RemoveHostsAllow => "remove_hosts_allow",
        }
    }
}

/// Ways of copying a snapshot's contents to another host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotCopy {
    Scp,
    Rsync,
}

impl SnapshotCopy {
    pub fn path(&self) -> &'static str {
        match self {
            SnapshotCopy::Scp => "scp",
            SnapshotCopy::Rsync => "rsync",
        }
    }
}

/// Body of `snapshots/{id}/commands/{scp|rsync}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCopyRequest {
    pub source_dir: String,
    pub target_ip: String,
    pub target_dir: String,
}

/// Provider answer to a snapshot request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakenSnapshot {
    pub identifier: String,
    /// Path of the snapshot on the provider side
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    /// Non-fatal problem reported while taking the snapshot
    #[serde(default)]
    pub warning: Option<String>,
}

/// Answer of the newer snapshot endpoint, which does not fail on rejection
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotReply {
    Accepted(TakenSnapshot),
    Rejected { status: u16, body: String },
}

/// Provider-side snapshot state (`snapshot/{id}/state`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub snapshot_status: String,
}

/// Provider-side volume details (`volume/{id}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDetails {
    #[serde(default)]
    pub path: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Raw volume-provider operations for one environment
///
/// Every call that receives a non-2xx answer fails with the status and raw
/// body; nothing is retried here.
#[async_trait]
pub trait VolumeProvider: Send + Sync {
    /// Environment this provider is bound to
    fn environment(&self) -> &str;

    /// `POST volume/new`, returns the new volume identifier
    async fn create_volume(&self, request: &CreateVolumeRequest) -> ProviderResult<String>;

    /// `GET volume/{id}`
    async fn get_volume(&self, identifier: &str) -> ProviderResult<VolumeDetails>;

    /// `DELETE volume/{id}`
    async fn delete_volume(&self, identifier: &str) -> ProviderResult<()>;

    /// `POST attach/{id}/`
    async fn attach_disk(&self, identifier: &str, vm: &VmLocation) -> ProviderResult<()>;

    /// `POST detach/{id}/`
    async fn detach_disk(&self, identifier: &str) -> ProviderResult<()>;

    /// `POST move/{id}`
    async fn move_disk(&self, identifier: &str, zone: &str) -> ProviderResult<()>;

    /// `POST resize/{id}`
    async fn resize(&self, identifier: &str, new_size_kb: u64) -> ProviderResult<()>;

    /// `POST commands/{id}/mount`
    async fn mount_command(&self, identifier: &str, request: &MountRequest) -> ProviderResult<String>;

    /// `POST commands/{id}/umount`
    async fn umount_command(&self, identifier: &str, data_directory: &str) -> ProviderResult<String>;

    /// `POST commands/{id}/resize2fs`
    async fn resize2fs_command(&self, identifier: &str) -> ProviderResult<String>;

    /// `GET commands/{id}/cleanup`
    async fn cleanup_command(&self, identifier: &str) -> ProviderResult<String>;

    /// `GET commands/{create_pub_key|remove_pub_key|add_hosts_allow|remove_hosts_allow}`
    async fn host_command(&self, command: HostCommand, host_ip: &str) -> ProviderResult<String>;

    /// `POST commands/copy_files`
    async fn copy_files_command(&self, request: &CopyFilesRequest) -> ProviderResult<String>;

    /// `GET snapshots/{id}/commands/{scp|rsync}`
    async fn snapshot_copy_command(
        &self,
        method: SnapshotCopy,
        snapshot_identifier: &str,
        request: &SnapshotCopyRequest,
    ) -> ProviderResult<String>;

    /// `POST snapshot/{volume}`
    async fn take_snapshot(
        &self,
        volume_identifier: &str,
        labels: &ResourceLabels,
        persist: bool,
    ) -> ProviderResult<TakenSnapshot>;

    /// `POST gcp/snapshot/{volume}`; a rejection is returned, not raised
    async fn new_take_snapshot(
        &self,
        volume_identifier: &str,
        labels: &ResourceLabels,
        persist: bool,
    ) -> ProviderResult<SnapshotReply>;

    /// `GET snapshot/{id}/state`
    async fn snapshot_state(&self, snapshot_identifier: &str) -> ProviderResult<SnapshotState>;

    /// `DELETE snapshot/{id}?force=`, returns whether the provider removed it
    async fn delete_snapshot(&self, snapshot_identifier: &str, force: bool) -> ProviderResult<bool>;

    /// `POST snapshot/{id}/restore`, returns the restored volume identifier
    async fn restore_snapshot(&self, snapshot_identifier: &str, request: &RestoreRequest) -> ProviderResult<String>;

    /// `POST snapshot/{id}/restore-to-rsync`
    async fn restore_snapshot_to_rsync(&self, snapshot_identifier: &str, request: &RestoreRequest) -> ProviderResult<()>;

    /// `POST access/{id}`
    async fn add_access(&self, identifier: &str, to_address: &str, access_type: Option<&str>) -> ProviderResult<()>;

    /// `DELETE access/{id}/{address}`
    async fn remove_access(&self, identifier: &str, address: &str) -> ProviderResult<()>;

    /// `GET new-disk-migration`
    async fn should_migrate_with_new_disk(&self) -> ProviderResult<bool>;

    /// `POST volume/update_labels`, returns whether anything was updated
    async fn update_team_labels(&self, vm_name: &str, team_name: &str, zone: &str) -> ProviderResult<bool>;

    async fn create_pub_key_command(&self, host_ip: &str) -> ProviderResult<String> {
        self.host_command(HostCommand::CreatePubKey, host_ip).await
    }

    async fn remove_pub_key_command(&self, host_ip: &str) -> ProviderResult<String> {
        self.host_command(HostCommand::RemovePubKey, host_ip).await
    }

    async fn add_hosts_allow_command(&self, host_ip: &str) -> ProviderResult<String> {
        self.host_command(HostCommand::AddHostsAllow, host_ip).await
    }

    async fn remove_hosts_allow_command(&self, host_ip: &str) -> ProviderResult<String> {
        self.host_command(HostCommand::RemoveHostsAllow, host_ip).await
    }

    async fn scp_from_snapshot_command(
        &self,
        snapshot_identifier: &str,
        request: &SnapshotCopyRequest,
    ) -> ProviderResult<String> {
        self.snapshot_copy_command(SnapshotCopy::Scp, snapshot_identifier, request)
            .await
    }

    async fn rsync_from_snapshot_command(
        &self,
        snapshot_identifier: &str,
        request: &SnapshotCopyRequest,
    ) -> ProviderResult<String> {
        self.snapshot_copy_command(SnapshotCopy::Rsync, snapshot_identifier, request)
            .await
    }
}

/// Resolves a provider bound to an environment and namespace
///
/// The namespace is the infra name; it is sent as `K8S-Namespace`.
pub trait ProviderFactory: Send + Sync {
    fn provider(&self, environment: &str, namespace: &str) -> ProviderResult<Arc<dyn VolumeProvider>>;
}
