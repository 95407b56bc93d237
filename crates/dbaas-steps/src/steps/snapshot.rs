//! Snapshot steps
//!
//! Taking snapshots for restores, disk upgrades, temporary instances and
//! migrations, waiting for a migration snapshot to become usable, and
//! removing it once the migration no longer needs it.

use super::{catalog_step, Meta};
use crate::context::StepContext;
use crate::error::{Result, StepError};
use crate::gating::Role;
use crate::select::{EnvRef, SnapshotRef};
use crate::traits::{Doable, Undoable};
use async_trait::async_trait;
use dbaas_common::{Id, Instance, Snapshot};
use dbaas_volume::{SnapshotBackend, SnapshotManager};
use tracing::{debug, info};

/// Instance whose active volume is backed up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Own,
    /// The replication master
    Master,
    /// A read-only instance of the infra, else the first non-master
    SecondaryOrReadOnly,
}

impl Subject {
    async fn resolve(&self, ctx: &StepContext) -> Result<Instance> {
        match self {
            Subject::Own => Ok(ctx.instance.clone()),
            Subject::Master => ctx.master().await,
            Subject::SecondaryOrReadOnly => {
                let instances = ctx.store().instances(ctx.infra.id).await?;
                if let Some(read_only) = instances.iter().find(|i| i.read_only) {
                    return Ok(read_only.clone());
                }
                for instance in instances {
                    if !ctx.driver().check_instance_is_master(&instance).await? {
                        return Ok(instance);
                    }
                }
                Err(StepError::NotFound(format!(
                    "No secondary or read-only instance found in {}",
                    ctx.infra.name
                )))
            }
        }
    }
}

/// Backup group a new snapshot joins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    /// A freshly allocated group
    Fresh,
    /// The new group of the bound restore
    RestoreNew,
}

/// Where a migration snapshot is recorded for later steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caching {
    /// Not recorded
    None,
    /// Reuse the database migration's shared snapshot when one exists
    OnlyOnce,
    /// Always take a new one
    EveryInstance,
}

/// Back up an instance's active volume
pub struct TakeSnapshot {
    meta: Meta,
    subject: Subject,
    group: Group,
    caching: Caching,
    /// Operator-requested snapshots are not part of the automatic rotation
    manual: bool,
    /// Ask the provider to retain the snapshot
    persist: bool,
}

catalog_step!(TakeSnapshot);

impl TakeSnapshot {
    async fn group_id(&self, ctx: &StepContext) -> Result<Id> {
        match self.group {
            Group::Fresh => Ok(ctx.store().create_backup_group().await?.id),
            Group::RestoreNew => Ok(ctx.require_restore()?.new_group_id),
        }
    }

    async fn backup(&self, ctx: &StepContext, instance: &Instance) -> Result<Snapshot> {
        let store = ctx.store();
        let volume = store.active_volume(instance.host_id).await?;
        let environment = EnvRef::ResizeAware.resolve(ctx).await?;
        let group_id = self.group_id(ctx).await?;

        let mut snapshot = ctx
            .snapshots()
            .make_backup(
                &ctx.scope_in(&environment),
                instance,
                &volume,
                group_id,
                SnapshotBackend::default(),
                self.persist,
            )
            .await?;
        if self.manual {
            snapshot.is_automatic = false;
            store.put_snapshot(&snapshot).await?;
        }
        SnapshotManager::check(&snapshot)?;
        Ok(snapshot)
    }

    /// Remember the snapshot on the host migration inside a database
    /// migration, on the maintenance otherwise
    async fn record(&self, ctx: &StepContext, snapshot: &Snapshot) -> Result<()> {
        let store = ctx.store();
        match ctx.database_migrate().await? {
            Some(mut database_migrate) => {
                let mut host_migrate = ctx.require_host_migrate().await?;
                host_migrate.snapshot_id = Some(snapshot.id);
                store.put_host_migrate(&host_migrate).await?;
                if self.caching == Caching::OnlyOnce && database_migrate.host_migrate_snapshot_id.is_none() {
                    database_migrate.host_migrate_snapshot_id = Some(snapshot.id);
                    store.put_database_migrate(&database_migrate).await?;
                }
            }
            None => {
                let mut maintenance = ctx.maintenance().await?;
                maintenance.snapshot_id = Some(snapshot.id);
                store.put_maintenance(&maintenance).await?;
            }
        }
        debug!(snapshot = snapshot.id, instance = %ctx.instance, "Recorded migration snapshot");
        Ok(())
    }

    async fn cached(&self, ctx: &StepContext) -> Result<Option<Snapshot>> {
        if self.caching != Caching::OnlyOnce {
            return Ok(None);
        }
        let Some(database_migrate) = ctx.database_migrate().await? else {
            return Ok(None);
        };
        match database_migrate.host_migrate_snapshot_id {
            Some(id) => Ok(Some(ctx.store().get_snapshot(id).await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Doable for TakeSnapshot {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let snapshot = match self.cached(ctx).await? {
            Some(snapshot) => {
                info!(snapshot = %snapshot, instance = %ctx.instance, "Reusing migration snapshot");
                snapshot
            }
            None => {
                let subject = self.subject.resolve(ctx).await?;
                self.backup(ctx, &subject).await?
            }
        };
        if self.caching != Caching::None {
            self.record(ctx, &snapshot).await?;
            SnapshotManager::check(&snapshot)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Undoable for TakeSnapshot {}

/// Backup of a restore master before its disk is replaced
pub fn take_snapshot() -> TakeSnapshot {
    TakeSnapshot {
        meta: Meta::new("take_snapshot", "Doing backup of old data...").gate(Role::RestoreMaster),
        subject: Subject::Own,
        group: Group::RestoreNew,
        caching: Caching::None,
        manual: false,
        persist: false,
    }
}

pub fn take_snapshot_old_disk() -> TakeSnapshot {
    TakeSnapshot {
        meta: Meta::new("take_snapshot_old_disk", "Doing backup of old data..."),
        subject: Subject::Own,
        group: Group::Fresh,
        caching: Caching::None,
        manual: false,
        persist: false,
    }
}

pub fn take_snapshot_upgrade_disk_type() -> TakeSnapshot {
    TakeSnapshot {
        meta: Meta::new("take_snapshot_upgrade_disk_type", "Doing backup of old data to upgrade disk...")
            .gate(Role::Database),
        subject: Subject::Own,
        group: Group::Fresh,
        caching: Caching::None,
        manual: true,
        persist: true,
    }
}

pub fn take_snapshot_for_secondary_or_read_only() -> TakeSnapshot {
    TakeSnapshot {
        meta: Meta::new(
            "take_snapshot_for_secondary_or_read_only",
            "Taking Snapshot for Secondary or ReadOnly Host...",
        )
        .gate(Role::Temporary),
        subject: Subject::SecondaryOrReadOnly,
        group: Group::Fresh,
        caching: Caching::None,
        manual: true,
        persist: true,
    }
}

pub fn take_snapshot_migrate() -> TakeSnapshot {
    TakeSnapshot {
        meta: Meta::new("take_snapshot_migrate", "Doing backup for copy...").gate(Role::Database),
        subject: Subject::Own,
        group: Group::Fresh,
        caching: Caching::OnlyOnce,
        manual: true,
        persist: true,
    }
}

pub fn take_snapshot_migrate_all_instances() -> TakeSnapshot {
    TakeSnapshot {
        meta: Meta::new("take_snapshot_migrate_all_instances", "Doing backup for copy...").gate(Role::Database),
        caching: Caching::EveryInstance,
        ..take_snapshot_migrate()
    }
}

pub fn take_snapshot_from_master() -> TakeSnapshot {
    TakeSnapshot {
        meta: Meta::new("take_snapshot_from_master", "Doing backup from master...").gate(Role::Database),
        subject: Subject::Master,
        ..take_snapshot_migrate()
    }
}

// ============================================================================
// Wait and removal
// ============================================================================

/// Wait until the shared migration snapshot is `READY`
///
/// Skipped in the environments listed in `skip_snapshot_wait`.
pub struct WaitSnapshotAvailable {
    meta: Meta,
}

catalog_step!(WaitSnapshotAvailable);

#[async_trait]
impl Doable for WaitSnapshotAvailable {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let environment = &ctx.infra.environment;
        if ctx.config().skips_snapshot_wait(environment) {
            info!(environment = %environment, "Skipping snapshot wait");
            return Ok(());
        }
        let snapshot = SnapshotRef::SharedMigration.require(ctx).await?;
        ctx.snapshots()
            .wait_state(
                &ctx.scope_in(environment),
                &snapshot,
                "READY",
                &ctx.config().polling.snapshot_ready,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Undoable for WaitSnapshotAvailable {}

pub fn wait_snapshot_available_migrate() -> WaitSnapshotAvailable {
    WaitSnapshotAvailable {
        meta: Meta::new("wait_snapshot_available_migrate", "Wait snapshot available...").gate(Role::Database),
    }
}

/// Force-delete the snapshot a migration copied from
pub struct RemoveSnapshotMigrate {
    meta: Meta,
}

catalog_step!(RemoveSnapshotMigrate);

#[async_trait]
impl Doable for RemoveSnapshotMigrate {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let snapshot = SnapshotRef::Migration.resolve(ctx).await?.ok_or_else(|| {
            StepError::NotFound(format!("No snapshot found on {} instance for migration", ctx.instance))
        })?;
        ctx.snapshots()
            .remove(&ctx.scope_in(&ctx.infra.environment), &snapshot, true)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Undoable for RemoveSnapshotMigrate {}

pub fn remove_snapshot_migrate() -> RemoveSnapshotMigrate {
    RemoveSnapshotMigrate {
        meta: Meta::new("remove_snapshot_migrate", "Removing backup used on migrate...").gate(Role::Database),
    }
}
