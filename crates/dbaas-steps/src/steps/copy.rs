//! Data copy steps
//!
//! Copies between mounted directories of one host, provider-computed copies
//! out of a snapshot, scp/rsync transfers from a snapshot to the migration
//! destination, and the wait for those transfers to finish.
//!
//! ```text
//!   backup host                          destination host
//!   +----------------------+   scp/rsync   +------------------+
//!   | snapshot of /data    | ------------> | /data            |
//!   +----------------------+               +------------------+
//! ```
//!
//! None of these steps has a compensation: the data they overwrite lives on
//! volumes the surrounding volume steps create and destroy.

use super::{catalog_step, Meta};
use crate::context::StepContext;
use crate::error::{RemoteError, Result, StepError};
use crate::gating::Role;
use crate::select::{HostRef, SnapshotRef};
use crate::traits::{Doable, Undoable};
use async_trait::async_trait;
use dbaas_volume::{poll_until, CopyFilesRequest, SnapshotCopy, SnapshotCopyRequest, VolumeError};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

const RSYNC_CHECK: &str = "ps -ef | grep sync | grep dbaas | wc -l";
const RSYNC_RUNNING: &str = "RSYNC is still running. Wait rsync process finish before retry the task.";

// ============================================================================
// Copies from a snapshot directory
// ============================================================================

/// Run the provider's copy command for the maintenance snapshot
pub struct CopyFromSnapshot {
    meta: Meta,
    source_dir: &'static str,
    dest_dir: &'static str,
    snap_dir: &'static str,
}

catalog_step!(CopyFromSnapshot);

#[async_trait]
impl Doable for CopyFromSnapshot {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let snapshot = SnapshotRef::Maintenance.require(ctx).await?;
        let request = CopyFilesRequest {
            snap_identifier: snapshot.provider_id()?.to_string(),
            source_dir: self.source_dir.to_string(),
            dest_dir: self.dest_dir.to_string(),
            snap_dir: self.snap_dir.to_string(),
        };
        let script = ctx
            .provider_in(&ctx.infra.environment)?
            .copy_files_command(&request)
            .await?;
        info!(
            host = %ctx.host.address,
            snapshot = %request.snap_identifier,
            source = self.source_dir,
            dest = self.dest_dir,
            "Copying files from snapshot"
        );
        ctx.run_script(&ctx.host, &script).await?;
        Ok(())
    }
}

#[async_trait]
impl Undoable for CopyFromSnapshot {}

pub fn copy_files_migrate() -> CopyFromSnapshot {
    CopyFromSnapshot {
        meta: Meta::new("copy_files_migrate", "Copying data to /data_migrate from /data..."),
        source_dir: "/data_migrate",
        dest_dir: "/data",
        snap_dir: "",
    }
}

pub fn copy_data_from_snapshot() -> CopyFromSnapshot {
    CopyFromSnapshot {
        meta: Meta::new("copy_data_from_snapshot", "Copying data to snapshot to /data/data...").gate(Role::Database),
        source_dir: "/data_recreate_slave",
        dest_dir: "/data/data",
        snap_dir: "data/",
    }
}

pub fn copy_repl_from_snapshot() -> CopyFromSnapshot {
    CopyFromSnapshot {
        meta: Meta::new("copy_repl_from_snapshot", "Copying repl to snapshot to /data/repl...").gate(Role::Database),
        source_dir: "/data_recreate_slave",
        dest_dir: "/data/repl",
        snap_dir: "repl/",
    }
}

// ============================================================================
// Local copies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalCopyKind {
    Files,
    /// Mode and ownership of the directory itself
    Permissions,
}

/// Copy `/data` onto the new volume mounted at `/data_latest_volume`
pub struct LocalCopy {
    meta: Meta,
    kind: LocalCopyKind,
}

catalog_step!(LocalCopy);

impl LocalCopy {
    const SOURCE: &'static str = "/data";
    const DEST: &'static str = "/data_latest_volume";

    fn script(&self) -> String {
        match self.kind {
            LocalCopyKind::Files => format!("cp -rp {}/* {}", Self::SOURCE, Self::DEST),
            LocalCopyKind::Permissions => format!(
                "stat -c \"%a\" {0} | xargs -I{{}} chmod {{}} {1} && stat -c \"%U:%G\" {0} | xargs -I{{}} chown {{}} {1}",
                Self::SOURCE,
                Self::DEST
            ),
        }
    }
}

#[async_trait]
impl Doable for LocalCopy {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        ctx.run_script(&ctx.host, &self.script()).await?;
        Ok(())
    }
}

#[async_trait]
impl Undoable for LocalCopy {}

pub fn copy_files() -> LocalCopy {
    LocalCopy {
        meta: Meta::new("copy_files", "Copying data to /data_latest_volume from /data..."),
        kind: LocalCopyKind::Files,
    }
}

pub fn copy_permissions() -> LocalCopy {
    LocalCopy {
        meta: Meta::new("copy_permissions", "Copying permissions from /data to /data_latest_volume..."),
        kind: LocalCopyKind::Permissions,
    }
}

// ============================================================================
// Transfers to the migration destination
// ============================================================================

/// Where a transfer reads from inside the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceDir {
    Fixed(&'static str),
    /// `/data_latest_volume` when the environment migrates with a new disk,
    /// `/data` otherwise, followed by the suffix
    RestoreRoot(&'static str),
}

impl SourceDir {
    async fn resolve(&self, ctx: &StepContext) -> Result<String> {
        match self {
            SourceDir::Fixed(dir) => Ok(dir.to_string()),
            SourceDir::RestoreRoot(suffix) => {
                let new_disk = ctx
                    .provider_in(&ctx.infra.environment)?
                    .should_migrate_with_new_disk()
                    .await?;
                let root = if new_disk { "/data_latest_volume" } else { "/data" };
                Ok(format!("{}{}", root, suffix))
            }
        }
    }
}

/// Copy a snapshot's contents to the destination host of a host migration
///
/// The command runs on `runs_on` and pushes to the future host of the
/// migration source.
pub struct SnapshotTransfer {
    meta: Meta,
    method: SnapshotCopy,
    snapshot: SnapshotRef,
    runs_on: HostRef,
    source: SourceDir,
    dest_dir: &'static str,
}

catalog_step!(SnapshotTransfer);

#[async_trait]
impl Doable for SnapshotTransfer {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let snapshot = self.snapshot.require(ctx).await?;
        let host = self.runs_on.resolve(ctx).await?;
        let target = HostRef::MigrationTarget.resolve(ctx).await?;
        let request = SnapshotCopyRequest {
            source_dir: self.source.resolve(ctx).await?,
            target_ip: target.address.clone(),
            target_dir: self.dest_dir.to_string(),
        };

        let provider = ctx.provider_in(&ctx.infra.environment)?;
        let identifier = snapshot.provider_id()?;
        let script = match self.method {
            SnapshotCopy::Scp => provider.scp_from_snapshot_command(identifier, &request).await?,
            SnapshotCopy::Rsync => provider.rsync_from_snapshot_command(identifier, &request).await?,
        };
        info!(
            method = self.method.path(),
            snapshot = identifier,
            from = %host.address,
            to = %target.address,
            source = %request.source_dir,
            dest = self.dest_dir,
            "Transferring snapshot data"
        );
        ctx.run_script(&host, &script).await?;
        Ok(())
    }
}

#[async_trait]
impl Undoable for SnapshotTransfer {}

pub fn scp_from_snapshot_migrate() -> SnapshotTransfer {
    SnapshotTransfer {
        meta: Meta::new("scp_from_snapshot_migrate", "Copying data from snapshot to new host..."),
        method: SnapshotCopy::Scp,
        snapshot: SnapshotRef::Migration,
        runs_on: HostRef::FirstNonMaster,
        source: SourceDir::Fixed("/data"),
        dest_dir: "/data",
    }
}

pub fn scp_from_snapshot_database_migrate() -> SnapshotTransfer {
    let mut step = scp_from_snapshot_migrate();
    step.meta.name = "scp_from_snapshot_database_migrate";
    step.source = SourceDir::Fixed("/data_migrate");
    step
}

pub fn rsync_from_snapshot_migrate() -> SnapshotTransfer {
    SnapshotTransfer {
        meta: Meta::new("rsync_from_snapshot_migrate", "Copying (rsync) data from snapshot to new host..."),
        method: SnapshotCopy::Rsync,
        snapshot: SnapshotRef::Migration,
        runs_on: HostRef::Own,
        source: SourceDir::RestoreRoot(""),
        dest_dir: "/data",
    }
}

pub fn rsync_from_snapshot_migrate_backup_host() -> SnapshotTransfer {
    SnapshotTransfer {
        meta: Meta::new(
            "rsync_from_snapshot_migrate_backup_host",
            "Copying (rsync) from snapshot to new host...",
        )
        .gate(Role::Database),
        method: SnapshotCopy::Rsync,
        snapshot: SnapshotRef::SharedMigration,
        runs_on: HostRef::SnapshotOwner(SnapshotRef::SharedMigration),
        source: SourceDir::RestoreRoot(""),
        dest_dir: "/data",
    }
}

pub fn rsync_data_from_snapshot_migrate_backup_host() -> SnapshotTransfer {
    let mut step = rsync_from_snapshot_migrate_backup_host();
    step.meta.name = "rsync_data_from_snapshot_migrate_backup_host";
    step.source = SourceDir::RestoreRoot("/data");
    step.dest_dir = "/data/data";
    step
}

// ============================================================================
// Rsync wait
// ============================================================================

/// Poll the backup host until no rsync process of ours is left
///
/// One broken channel in a row is tolerated; a second consecutive one fails
/// the step.
pub struct WaitRsync {
    meta: Meta,
    on: HostRef,
}

catalog_step!(WaitRsync);

impl WaitRsync {
    async fn running(&self, ctx: &StepContext, errors: &AtomicU32, attempt: u32) -> Result<Option<()>> {
        let host = self.on.resolve(ctx).await?;
        let output = match ctx.run_script(&host, RSYNC_CHECK).await {
            Ok(output) => output,
            Err(StepError::Remote(RemoteError::Channel { reason, .. })) => {
                if errors.fetch_add(1, Ordering::SeqCst) > 0 {
                    return Err(StepError::Failed(reason));
                }
                warn!(host = %host.address, attempt, error = %reason, "Rsync check failed, checking again");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        errors.store(0, Ordering::SeqCst);

        let count = output
            .first_line()
            .and_then(|line| line.parse::<u32>().ok())
            .ok_or_else(|| StepError::Failed(format!("Unexpected rsync check output: {:?}", output.stdout)))?;
        debug!(host = %host.address, attempt, processes = count, "Rsync check");
        Ok((count == 0).then_some(()))
    }
}

#[async_trait]
impl Doable for WaitRsync {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let errors = AtomicU32::new(0);
        let policy = ctx.config().polling.rsync_completion;
        let waited = poll_until(&policy, "rsync completion", |attempt| {
            let errors = &errors;
            async move { self.running(ctx, errors, attempt).await }
        })
        .await;
        match waited {
            Err(StepError::Volume(VolumeError::Timeout(_))) => Err(StepError::Timeout(RSYNC_RUNNING.to_string())),
            other => other,
        }
    }
}

#[async_trait]
impl Undoable for WaitRsync {}

pub fn wait_rsync_from_snapshot_database_migrate() -> WaitRsync {
    WaitRsync {
        meta: Meta::new("wait_rsync_from_snapshot_database_migrate", "Waiting rsync...").gate(Role::Database),
        on: HostRef::SnapshotOwner(SnapshotRef::SharedMigration),
    }
}
