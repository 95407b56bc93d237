//! Context selectors
//!
//! Steps do not hard-code which host, volume, snapshot or environment they
//! act on. They hold selectors and resolve them against the context at call
//! time, so the same step type serves the plain, migration, recreate-slave
//! and restore variants.

use crate::context::StepContext;
use crate::error::{Result, StepError};
use dbaas_common::{Host, Instance, Snapshot, Volume};

/// Which host a step acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRef {
    /// Host of the context instance
    Own,
    /// Source host of the bound host migration
    MigrationSource,
    /// Destination paired with the migration source
    MigrationTarget,
    /// Host of the first instance that is not the replication master
    FirstNonMaster,
    /// Host of the replication master
    Master,
    /// Host of the instance that owns the selected snapshot
    SnapshotOwner(SnapshotRef),
    /// Host of the master of the restore pair containing the instance
    RestoreMaster,
}

impl HostRef {
    pub async fn resolve(&self, ctx: &StepContext) -> Result<Host> {
        let store = ctx.store();
        match self {
            HostRef::Own => Ok(ctx.host.clone()),
            HostRef::MigrationSource => {
                let migrate = ctx.require_host_migrate().await?;
                Ok(store.get_host(migrate.host_id).await?)
            }
            HostRef::MigrationTarget => {
                let migrate = ctx.require_host_migrate().await?;
                let source = store.get_host(migrate.host_id).await?;
                let future = source.future_host_id.ok_or_else(|| {
                    StepError::NotFound(format!("Host {} has no future host", source.hostname))
                })?;
                Ok(store.get_host(future).await?)
            }
            HostRef::FirstNonMaster => {
                let instance = first_non_master(ctx).await?;
                Ok(store.get_host(instance.host_id).await?)
            }
            HostRef::Master => {
                let master = ctx.master().await?;
                Ok(store.get_host(master.host_id).await?)
            }
            HostRef::SnapshotOwner(snapshot) => {
                let snapshot = snapshot.require(ctx).await?;
                let instance = store.get_instance(snapshot.instance_id).await?;
                Ok(store.get_host(instance.host_id).await?)
            }
            HostRef::RestoreMaster => {
                let restore = ctx.require_restore()?;
                let master_id = restore.master_for(ctx.instance.id).ok_or_else(|| {
                    StepError::NotFound(format!("Instance {} is not part of the restore", ctx.instance))
                })?;
                let master = store.get_instance(master_id).await?;
                Ok(store.get_host(master.host_id).await?)
            }
        }
    }
}

/// First database instance of the infra that is not the master
pub async fn first_non_master(ctx: &StepContext) -> Result<Instance> {
    let master = ctx.master().await?;
    ctx.store()
        .database_instances(ctx.infra.id)
        .await?
        .into_iter()
        .find(|i| i.id != master.id)
        .ok_or_else(|| StepError::NotFound(format!("No slave instance found in {}", ctx.infra.name)))
}

/// Which of a host's volumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumePick {
    Active,
    /// Most recently created
    Latest,
    /// Oldest
    First,
    /// Most recently created inactive volume
    LastInactive,
}

impl std::fmt::Display for VolumePick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VolumePick::Active => "active",
            VolumePick::Latest => "latest",
            VolumePick::First => "first",
            VolumePick::LastInactive => "inactive",
        };
        f.write_str(s)
    }
}

/// A volume picked on a selected host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeRef {
    pub host: HostRef,
    pub pick: VolumePick,
}

impl VolumeRef {
    pub const ACTIVE: VolumeRef = VolumeRef::new(HostRef::Own, VolumePick::Active);
    pub const LATEST: VolumeRef = VolumeRef::new(HostRef::Own, VolumePick::Latest);
    pub const FIRST: VolumeRef = VolumeRef::new(HostRef::Own, VolumePick::First);

    pub const fn new(host: HostRef, pick: VolumePick) -> Self {
        Self { host, pick }
    }

    pub async fn resolve(&self, ctx: &StepContext) -> Result<Option<Volume>> {
        let host = self.host.resolve(ctx).await?;
        self.pick_on(ctx, &host).await
    }

    async fn pick_on(&self, ctx: &StepContext, host: &Host) -> Result<Option<Volume>> {
        let volumes = ctx.store().volumes(host.id).await?;
        Ok(match self.pick {
            VolumePick::Active => volumes.into_iter().find(|v| v.is_active),
            VolumePick::Latest => volumes.into_iter().last(),
            VolumePick::First => volumes.into_iter().next(),
            VolumePick::LastInactive => volumes.into_iter().filter(|v| !v.is_active).last(),
        })
    }

    /// Resolve the host and the volume on it, failing when there is none
    pub async fn require_with_host(&self, ctx: &StepContext) -> Result<(Host, Volume)> {
        let host = self.host.resolve(ctx).await?;
        let volume = self.pick_on(ctx, &host).await?.ok_or_else(|| {
            StepError::NotFound(format!("No {} volume found on {}", self.pick, host.hostname))
        })?;
        Ok((host, volume))
    }

    pub async fn require(&self, ctx: &StepContext) -> Result<Volume> {
        Ok(self.require_with_host(ctx).await?.1)
    }
}

/// Which snapshot a step reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotRef {
    /// The host migration's own snapshot inside a database migration, the
    /// maintenance snapshot otherwise
    Migration,
    /// The snapshot shared by every host of a database migration, the
    /// maintenance snapshot otherwise
    SharedMigration,
    Maintenance,
    /// The bound host migration's snapshot, none without a host migration
    Operation,
    /// Backup of the instance's restore master in the restore group
    RestoreMaster,
    /// First snapshot of the restore group
    RestoreGroupFirst,
    /// Newest snapshot of the context instance
    InstanceLatest,
    /// Newest finished, unpurged snapshot of any volume of the infra
    InfraLatestRestorable,
}

impl SnapshotRef {
    pub async fn resolve(&self, ctx: &StepContext) -> Result<Option<Snapshot>> {
        let store = ctx.store();
        let id = match self {
            SnapshotRef::Migration => match ctx.database_migrate().await? {
                Some(_) => ctx.require_host_migrate().await?.snapshot_id,
                None => ctx.maintenance().await?.snapshot_id,
            },
            SnapshotRef::SharedMigration => match ctx.database_migrate().await? {
                Some(migrate) => migrate.host_migrate_snapshot_id,
                None => ctx.maintenance().await?.snapshot_id,
            },
            SnapshotRef::Maintenance => ctx.maintenance().await?.snapshot_id,
            SnapshotRef::Operation => ctx.host_migrate().await?.and_then(|migrate| migrate.snapshot_id),
            SnapshotRef::RestoreMaster => {
                let restore = ctx.require_restore()?;
                let Some(master_id) = restore.master_for(ctx.instance.id) else {
                    return Ok(None);
                };
                return Ok(store
                    .group_snapshots(restore.group_id)
                    .await?
                    .into_iter()
                    .find(|s| s.instance_id == master_id && !s.is_purged()));
            }
            SnapshotRef::RestoreGroupFirst => {
                let restore = ctx.require_restore()?;
                return Ok(store.group_snapshots(restore.group_id).await?.into_iter().next());
            }
            SnapshotRef::InstanceLatest => {
                return Ok(store.instance_snapshots(ctx.instance.id).await?.into_iter().next());
            }
            SnapshotRef::InfraLatestRestorable => return latest_restorable(ctx).await,
        };
        match id {
            Some(id) => Ok(Some(store.get_snapshot(id).await?)),
            None => Ok(None),
        }
    }

    pub async fn require(&self, ctx: &StepContext) -> Result<Snapshot> {
        self.resolve(ctx)
            .await?
            .ok_or_else(|| StepError::NotFound(format!("No snapshot found for {}", ctx.instance)))
    }
}

async fn latest_restorable(ctx: &StepContext) -> Result<Option<Snapshot>> {
    let store = ctx.store();
    let mut newest: Option<Snapshot> = None;
    for instance in store.instances(ctx.infra.id).await? {
        for volume in store.volumes(instance.host_id).await? {
            for snapshot in store.volume_snapshots(volume.id).await? {
                if !snapshot.is_restorable() {
                    continue;
                }
                if newest.as_ref().map_or(true, |n| snapshot.created_at > n.created_at) {
                    newest = Some(snapshot);
                }
            }
        }
    }
    Ok(newest)
}

/// Which environment provider calls go to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvRef {
    /// The infra's environment
    #[default]
    Infra,
    /// Destination of the bound host migration, the infra's otherwise
    Migration,
    /// While a database migration runs, the side the instance lives on
    ResizeAware,
}

impl EnvRef {
    pub async fn resolve(&self, ctx: &StepContext) -> Result<String> {
        match self {
            EnvRef::Infra => Ok(ctx.infra.environment.clone()),
            EnvRef::Migration => ctx.environment().await,
            EnvRef::ResizeAware => {
                if !ctx.infra.migration_in_progress {
                    return Ok(ctx.infra.environment.clone());
                }
                Ok(match ctx.store().latest_database_migrate(ctx.infra.id).await? {
                    Some(migrate) => migrate.environment_for(&ctx.instance).to_string(),
                    None => ctx.infra.environment.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use chrono::{Duration, Utc};
    use dbaas_common::{DatabaseMigrate, Store, Volume};

    #[tokio::test]
    async fn test_volume_picks() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        let mut inactive = Volume::new(ctx.host.id, "vol-new", 1024);
        inactive.is_active = false;
        fixture.store.create_volume(inactive).await.unwrap();

        let active = VolumeRef::ACTIVE.require(&ctx).await.unwrap();
        assert_eq!(active.identifier, "vol-1");
        let latest = VolumeRef::LATEST.require(&ctx).await.unwrap();
        assert_eq!(latest.identifier, "vol-new");
        let first = VolumeRef::FIRST.require(&ctx).await.unwrap();
        assert_eq!(first.identifier, "vol-1");
        let inactive = VolumeRef::new(HostRef::Own, VolumePick::LastInactive)
            .require(&ctx)
            .await
            .unwrap();
        assert_eq!(inactive.identifier, "vol-new");
    }

    #[tokio::test]
    async fn test_missing_volume() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        let err = VolumeRef::new(HostRef::Own, VolumePick::LastInactive)
            .require(&ctx)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No inactive volume found on db-01.dev");
    }

    #[tokio::test]
    async fn test_host_refs() {
        let fixture = Fixture::new().await.with_host_migration().await;
        let ctx = fixture.context(1).await.with_host_migrate(1);

        assert_eq!(HostRef::Own.resolve(&ctx).await.unwrap().id, 1);
        assert_eq!(HostRef::MigrationSource.resolve(&ctx).await.unwrap().id, 1);
        assert_eq!(HostRef::MigrationTarget.resolve(&ctx).await.unwrap().id, 3);
        assert_eq!(HostRef::Master.resolve(&ctx).await.unwrap().id, 1);
        assert_eq!(HostRef::FirstNonMaster.resolve(&ctx).await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_restore_master_host() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(2).await.with_restore(fixture.restore());
        assert_eq!(HostRef::RestoreMaster.resolve(&ctx).await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_latest_restorable_skips_purged() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        let old = fixture.snapshot(1, 1, |s| s.created_at = Utc::now() - Duration::hours(2)).await;
        fixture
            .snapshot(1, 1, |s| s.purge_at = Some(Utc::now()))
            .await;
        fixture.snapshot(1, 1, |s| s.end_at = None).await;

        let found = SnapshotRef::InfraLatestRestorable.resolve(&ctx).await.unwrap().unwrap();
        assert_eq!(found.id, old.id);
    }

    #[tokio::test]
    async fn test_shared_migration_snapshot() {
        let fixture = Fixture::new().await.with_host_migration().await;
        let ctx = fixture.context(1).await.with_host_migrate(1);
        assert!(SnapshotRef::SharedMigration.resolve(&ctx).await.unwrap().is_none());

        let snapshot = fixture.snapshot(1, 1, |_| {}).await;
        let mut migrate = ctx.database_migrate().await.unwrap().unwrap();
        migrate.host_migrate_snapshot_id = Some(snapshot.id);
        fixture.store.put_database_migrate(&migrate).await.unwrap();
        let found = SnapshotRef::SharedMigration.require(&ctx).await.unwrap();
        assert_eq!(found.id, snapshot.id);
    }

    #[tokio::test]
    async fn test_operation_snapshot_comes_from_host_migration() {
        let fixture = Fixture::new().await.with_host_migration().await;
        let snapshot = fixture.snapshot(1, 1, |_| {}).await;
        fixture.set_maintenance_snapshot(snapshot.id).await;

        let plain = fixture.context(1).await;
        assert!(SnapshotRef::Operation.resolve(&plain).await.unwrap().is_none());

        let migrating = fixture.context(1).await.with_host_migrate(1);
        assert!(SnapshotRef::Operation.resolve(&migrating).await.unwrap().is_none());

        let mut migrate = fixture.store.get_host_migrate(1).await.unwrap();
        migrate.snapshot_id = Some(snapshot.id);
        fixture.store.put_host_migrate(&migrate).await.unwrap();
        let found = SnapshotRef::Operation.require(&migrating).await.unwrap();
        assert_eq!(found.id, snapshot.id);
    }

    #[tokio::test]
    async fn test_resize_aware_environment() {
        let fixture = Fixture::new().await;
        let mut ctx = fixture.context(1).await;
        assert_eq!(EnvRef::ResizeAware.resolve(&ctx).await.unwrap(), "dev");

        ctx.infra.migration_in_progress = true;
        fixture
            .store
            .put_database_migrate(&DatabaseMigrate {
                id: 7,
                infra_id: ctx.infra.id,
                environment: "gcp-dev".to_string(),
                origin_environment: "dev".to_string(),
                host_migrate_snapshot_id: None,
            })
            .await
            .unwrap();
        assert_eq!(EnvRef::ResizeAware.resolve(&ctx).await.unwrap(), "gcp-dev");

        ctx.instance.future_instance_id = Some(9);
        assert_eq!(EnvRef::ResizeAware.resolve(&ctx).await.unwrap(), "dev");
    }
}
