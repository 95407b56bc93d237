//! Volume steps
//!
//! Creation, destruction, attach/detach, mount/umount, zone moves, resize
//! and restore of provider volumes. Every variant is one of a few step types
//! configured with selectors; the functions at the bottom of each section
//! are the named variants pipelines use.

use super::{catalog_step, Meta};
use crate::context::StepContext;
use crate::error::{Result, StepError};
use crate::gating::{Gate, Role};
use crate::select::{EnvRef, HostRef, SnapshotRef, VolumePick, VolumeRef};
use crate::traits::{Direction, Doable, Gated, Reversibility, Symmetric, UndoMode, Undoable};
use async_trait::async_trait;
use dbaas_common::{Host, Volume};
use dbaas_volume::{MountRequest, RestoreRequest, VolumeSpec};
use tracing::info;

const DATA: &str = "/data";
const DATA_MIGRATE: &str = "/data_migrate";
const DATA_LATEST_VOLUME: &str = "/data_latest_volume";
const DATA_RECREATE_SLAVE: &str = "/data_recreate_slave";

const NO_ROLLBACK: &str = "There is no rollback for this step.";

async fn destroy(ctx: &StepContext, env: EnvRef, volume: &Volume) -> Result<()> {
    let environment = env.resolve(ctx).await?;
    ctx.volumes()
        .destroy_volume(&ctx.scope_in(&environment), volume)
        .await?;
    Ok(())
}

async fn destroy_all(ctx: &StepContext, env: EnvRef, host: &Host) -> Result<()> {
    for volume in ctx.store().volumes(host.id).await? {
        destroy(ctx, env, &volume).await?;
    }
    Ok(())
}

// ============================================================================
// Creation
// ============================================================================

/// Disk type requested for a new volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskType {
    /// The infra's disk offering type
    Infra,
    /// The infra's type mapped to the migration destination, when a
    /// database migration is bound
    MigrationTarget,
    /// The type requested by the bound disk type upgrade
    Upgrade,
}

impl DiskType {
    async fn resolve(&self, ctx: &StepContext) -> Result<String> {
        let infra_type = &ctx.infra.disk_offering_type;
        Ok(match self {
            DiskType::Infra => infra_type.type_name.clone(),
            DiskType::MigrationTarget => match ctx.database_migrate().await? {
                Some(_) => infra_type.type_to(&ctx.environment().await?).to_string(),
                None => infra_type.type_name.clone(),
            },
            DiskType::Upgrade => match &ctx.disk_upgrade {
                Some(upgrade) => upgrade.disk_offering_type.clone(),
                None => infra_type.type_name.clone(),
            },
        })
    }
}

/// Compensation of a volume creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatedUndo {
    /// Destroy every volume of the host
    DestroyAll,
    DestroyLatest,
    DestroyLatestIfInactive,
    Irreversible,
}

/// Create a provider volume on a host, optionally from a snapshot
pub struct CreateVolume {
    meta: Meta,
    host: HostRef,
    env: EnvRef,
    source: Option<SnapshotRef>,
    require_snapshot: bool,
    active: bool,
    disk_type: DiskType,
    undo: CreatedUndo,
}

catalog_step!(CreateVolume);

impl CreateVolume {
    fn new(meta: Meta) -> Self {
        Self {
            meta,
            host: HostRef::Own,
            env: EnvRef::Infra,
            source: Some(SnapshotRef::Operation),
            require_snapshot: false,
            active: true,
            disk_type: DiskType::MigrationTarget,
            undo: CreatedUndo::DestroyAll,
        }
    }

    fn on(mut self, host: HostRef) -> Self {
        self.host = host;
        self
    }

    fn from_snapshot(mut self, source: SnapshotRef) -> Self {
        self.source = Some(source);
        self
    }

    fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    fn undo(mut self, undo: CreatedUndo) -> Self {
        self.undo = undo;
        self
    }

    async fn snapshot_identifier(&self, ctx: &StepContext) -> Result<Option<String>> {
        let Some(source) = self.source else {
            return Ok(None);
        };
        match source.resolve(ctx).await? {
            Some(snapshot) => Ok(Some(snapshot.provider_id()?.to_string())),
            None if self.require_snapshot => Err(StepError::NotFound(format!(
                "No snapshot found to create a volume for {}",
                ctx.instance
            ))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Doable for CreateVolume {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let host = self.host.resolve(ctx).await?;
        let vm = ctx.vm(&host).await?;
        let environment = self.env.resolve(ctx).await?;

        let mut spec = VolumeSpec::new(ctx.infra.name.clone(), ctx.infra.disk_offering.size_kb)
            .with_address(host.address.clone())
            .with_snapshot(self.snapshot_identifier(ctx).await?)
            .with_vm(vm.name, vm.zone)
            .with_disk_offering_type(Some(self.disk_type.resolve(ctx).await?));
        if !self.active {
            spec = spec.inactive();
        }

        ctx.volumes()
            .create_volume(&ctx.scope_in(&environment), &host, spec)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Undoable for CreateVolume {
    async fn revert(&self, ctx: &StepContext) -> Result<()> {
        let host = self.host.resolve(ctx).await?;
        let latest = ctx.store().latest_volume(host.id).await?;
        match self.undo {
            CreatedUndo::DestroyAll => destroy_all(ctx, self.env, &host).await,
            CreatedUndo::DestroyLatest => match latest {
                Some(volume) => destroy(ctx, self.env, &volume).await,
                None => Ok(()),
            },
            CreatedUndo::DestroyLatestIfInactive => match latest {
                Some(volume) if !volume.is_active => destroy(ctx, self.env, &volume).await,
                _ => Ok(()),
            },
            CreatedUndo::Irreversible => Ok(()),
        }
    }

    fn reversibility(&self) -> Reversibility {
        match self.undo {
            CreatedUndo::Irreversible => Reversibility::Irreversible(NO_ROLLBACK),
            _ => Reversibility::Reversible,
        }
    }
}

pub fn new_volume() -> CreateVolume {
    CreateVolume::new(Meta::new("new_volume", "Creating Volume...").gate(Role::Database))
}

pub fn new_inactive_volume() -> CreateVolume {
    CreateVolume::new(Meta::new("new_inactive_volume", "Creating Inactive Volume...").gate(Role::Database))
        .inactive()
}

pub fn new_volume_migrate() -> CreateVolume {
    CreateVolume::new(
        Meta::new("new_volume_migrate", "Creating second volume based on snapshot for migrate...")
            .gate(Role::Database),
    )
    .on(HostRef::MigrationSource)
    .inactive()
    .undo(CreatedUndo::Irreversible)
}

pub fn new_volume_on_slave_migrate() -> CreateVolume {
    new_volume_migrate().on(HostRef::FirstNonMaster)
}

pub fn new_volume_from_master() -> CreateVolume {
    CreateVolume::new(Meta::new("new_volume_from_master", "Restore master backup in slave...").gate(Role::Database))
        .from_snapshot(SnapshotRef::Maintenance)
}

pub fn new_volume_from_snapshot() -> CreateVolume {
    let mut step = CreateVolume::new(
        Meta::new("new_volume_from_snapshot", "New Volume from last Snapshot...").gate(Role::Temporary),
    )
    .from_snapshot(SnapshotRef::InfraLatestRestorable);
    step.require_snapshot = true;
    step
}

/// Inactive volume on the migrating host from the migration snapshot, typed
/// for the origin environment; undo drops it while still inactive
pub fn new_volume_migrate_original_host() -> CreateVolume {
    let mut step = CreateVolume::new(
        Meta::new("new_volume_migrate_original_host", "Creating new volume on original host...")
            .gate(Role::Database)
            .run_if(Role::NewDiskMigration),
    )
    .on(HostRef::MigrationSource)
    .inactive()
    .undo(CreatedUndo::DestroyLatestIfInactive);
    step.disk_type = DiskType::Infra;
    step
}

pub fn create_volume_disk_type_upgrade() -> CreateVolume {
    let mut step = CreateVolume::new(
        Meta::new("create_volume_disk_type_upgrade", "Creating Volume...")
            .gate(Role::Database)
            .run_if(Role::DiskUpgradeReady),
    )
    .from_snapshot(SnapshotRef::InstanceLatest)
    .inactive()
    .undo(CreatedUndo::DestroyLatest);
    step.disk_type = DiskType::Upgrade;
    step
}

// ============================================================================
// Destruction
// ============================================================================

/// Which volumes a destroy step removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Doomed {
    All,
    First,
    Latest,
    /// Last inactive volume, which must exist
    LastInactive,
}

/// Destroy volumes of a host; never compensated
pub struct DestroyVolumes {
    meta: Meta,
    host: HostRef,
    env: EnvRef,
    doomed: Doomed,
    irreversible: bool,
}

catalog_step!(DestroyVolumes);

impl DestroyVolumes {
    fn new(meta: Meta, doomed: Doomed) -> Self {
        Self {
            meta,
            host: HostRef::Own,
            env: EnvRef::Infra,
            doomed,
            irreversible: false,
        }
    }
}

#[async_trait]
impl Doable for DestroyVolumes {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let host = self.host.resolve(ctx).await?;
        let store = ctx.store();
        let volume = match self.doomed {
            Doomed::All => return destroy_all(ctx, self.env, &host).await,
            Doomed::First => store.first_volume(host.id).await?,
            Doomed::Latest => store.latest_volume(host.id).await?,
            Doomed::LastInactive => Some(store.inactive_volume(host.id).await?.ok_or_else(|| {
                StepError::NotFound(format!("No inactive volume found on {}", host.hostname))
            })?),
        };
        match volume {
            Some(volume) => destroy(ctx, self.env, &volume).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Undoable for DestroyVolumes {
    fn reversibility(&self) -> Reversibility {
        if self.irreversible {
            Reversibility::Irreversible(NO_ROLLBACK)
        } else {
            Reversibility::Reversible
        }
    }
}

pub fn destroy_volume() -> DestroyVolumes {
    DestroyVolumes::new(Meta::new("destroy_volume", "Removing volume...").gate(Role::Database), Doomed::All)
}

pub fn destroy_volume_temporary_instance() -> DestroyVolumes {
    DestroyVolumes::new(
        Meta::new("destroy_volume_temporary_instance", "Removing volume...")
            .gate(Role::Database)
            .run_if(Role::Temporary),
        Doomed::All,
    )
}

pub fn destroy_first_volume() -> DestroyVolumes {
    DestroyVolumes::new(Meta::new("destroy_first_volume", "Removing volume...").gate(Role::Database), Doomed::First)
}

pub fn remove_volume_migrate() -> DestroyVolumes {
    let mut step = DestroyVolumes::new(
        Meta::new("remove_volume_migrate", "Removing second volume based on snapshot for migrate..."),
        Doomed::LastInactive,
    );
    step.host = HostRef::FirstNonMaster;
    step
}

pub fn delete_volume_migrate_original_host() -> DestroyVolumes {
    DestroyVolumes::new(
        Meta::new("delete_volume_migrate_original_host", "Removing new volume from original host...")
            .gate(Gate::only(Role::Database).and(Role::LatestVolumeInactive))
            .run_if(Role::NewDiskMigration),
        Doomed::Latest,
    )
}

pub fn destroy_old_environment() -> DestroyVolumes {
    let mut step = DestroyVolumes::new(
        Meta::new("destroy_old_environment", "Removing volumes from old environment...")
            .run_if(Gate::only(Role::Database).and(Role::DatabaseMigration))
            .gate(Role::NotNewDiskMigration),
        Doomed::All,
    );
    step.irreversible = true;
    step
}

// ============================================================================
// Mount / umount
// ============================================================================

/// Mount (forward) or umount (backward) a volume on a host
pub struct Mount {
    meta: Meta,
    direction: Direction,
    undo_mode: UndoMode,
    /// Host the command runs on
    on: HostRef,
    volume: VolumeRef,
    directory: &'static str,
    fstab: bool,
    /// Only act while the volume is inactive
    only_inactive: bool,
}

catalog_step!(Mount);

impl Mount {
    fn new(meta: Meta, volume: VolumeRef, directory: &'static str) -> Self {
        Self {
            meta,
            direction: Direction::Forward,
            undo_mode: UndoMode::Inverse,
            on: HostRef::Own,
            volume,
            directory,
            fstab: true,
            only_inactive: false,
        }
    }

    fn reversed(mut self) -> Self {
        self.direction = Direction::Reverse;
        self
    }

    fn without_undo(mut self) -> Self {
        self.undo_mode = UndoMode::Skip;
        self
    }

    fn on(mut self, host: HostRef) -> Self {
        self.on = host;
        self
    }

    fn without_fstab(mut self) -> Self {
        self.fstab = false;
        self
    }

    async fn target(&self, ctx: &StepContext) -> Result<Option<(Host, Volume)>> {
        let host = self.on.resolve(ctx).await?;
        let volume = self.volume.require(ctx).await?;
        if self.only_inactive && volume.is_active {
            return Ok(None);
        }
        Ok(Some((host, volume)))
    }
}

#[async_trait]
impl Symmetric for Mount {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn undo_mode(&self) -> UndoMode {
        self.undo_mode
    }

    async fn forward(&self, ctx: &StepContext) -> Result<()> {
        let Some((host, volume)) = self.target(ctx).await? else {
            return Ok(());
        };
        let vm = ctx.vm(&host).await?;
        let request = MountRequest {
            with_fstab: self.fstab,
            data_directory: self.directory.to_string(),
            host_vm: vm.name,
            host_zone: vm.zone,
        };
        let provider = ctx.provider_in(&ctx.infra.environment)?;
        let command = provider.mount_command(&volume.identifier, &request).await?;
        info!(host = %host.address, volume = %volume.identifier, directory = self.directory, "Mounting volume");
        ctx.run_command(&host, &command).await
    }

    async fn backward(&self, ctx: &StepContext) -> Result<()> {
        let Some((host, volume)) = self.target(ctx).await? else {
            return Ok(());
        };
        let provider = ctx.provider_in(&ctx.infra.environment)?;
        let command = provider.umount_command(&volume.identifier, self.directory).await?;
        info!(host = %host.address, volume = %volume.identifier, directory = self.directory, "Umounting volume");
        ctx.run_command(&host, &command).await
    }
}

pub fn mount_data_volume() -> Mount {
    Mount::new(Meta::new("mount_data_volume", "Mounting /data volume...").gate(Role::Database), VolumeRef::ACTIVE, DATA)
        .without_undo()
}

pub fn mount_data_volume_with_undo() -> Mount {
    Mount::new(
        Meta::new("mount_data_volume_with_undo", "Mounting /data volume...").gate(Role::Database),
        VolumeRef::ACTIVE,
        DATA,
    )
}

pub fn mount_data_volume_temporary_instance() -> Mount {
    Mount::new(
        Meta::new("mount_data_volume_temporary_instance", "Mounting /data volume...")
            .gate(Gate::only(Role::Database).and(Role::Temporary)),
        VolumeRef::ACTIVE,
        DATA,
    )
    .without_undo()
}

pub fn mount_data_volume_upgrade_disk_type() -> Mount {
    Mount::new(
        Meta::new("mount_data_volume_upgrade_disk_type", "Mounting /data volume...").gate(Role::Database),
        VolumeRef::LATEST,
        DATA,
    )
}

pub fn mount_data_new_volume() -> Mount {
    Mount::new(Meta::new("mount_data_new_volume", "Mounting /data volume..."), VolumeRef::LATEST, DATA).without_undo()
}

pub fn mount_data_latest_volume() -> Mount {
    Mount::new(
        Meta::new("mount_data_latest_volume", "Mounting new volume on /data_latest_volume for copy...")
            .gate(Role::Database),
        VolumeRef::LATEST,
        DATA_LATEST_VOLUME,
    )
    .without_fstab()
}

pub fn unmount_data_latest_volume() -> Mount {
    let mut step = mount_data_latest_volume().reversed();
    step.meta.name = "unmount_data_latest_volume";
    step.meta.description = "Umounting new volume on /data_latest_volume for copy...";
    step
}

pub fn mount_data_volume_migrate() -> Mount {
    Mount::new(
        Meta::new("mount_data_volume_migrate", "Mounting old volume in new instance on dir /data_migrate..."),
        VolumeRef::new(HostRef::MigrationSource, VolumePick::Active),
        DATA_MIGRATE,
    )
}

pub fn umount_data_volume_migrate() -> Mount {
    let mut step = mount_data_volume_migrate().reversed();
    step.meta.name = "umount_data_volume_migrate";
    step.meta.description = "Dismounting old volume in new instance on dir /data_migrate...";
    step
}

pub fn mount_data_volume_recreate_slave() -> Mount {
    Mount::new(
        Meta::new(
            "mount_data_volume_recreate_slave",
            "Mounting master volume in slave instance on dir /data_recreate_slave...",
        )
        .gate(Role::Database),
        VolumeRef::new(HostRef::Master, VolumePick::Active),
        DATA_RECREATE_SLAVE,
    )
}

pub fn umount_data_volume_recreate_slave() -> Mount {
    let mut step = mount_data_volume_recreate_slave().reversed();
    step.meta.name = "umount_data_volume_recreate_slave";
    step.meta.description = "Umounting master volume in slave instance on dir /data_recreate_slave...";
    step
}

pub fn mount_data_volume_database_migrate() -> Mount {
    Mount::new(
        Meta::new("mount_data_volume_database_migrate", "Mounting new volume for scp /data_migrate..."),
        VolumeRef::new(HostRef::MigrationSource, VolumePick::LastInactive),
        DATA_MIGRATE,
    )
    .on(HostRef::MigrationSource)
}

pub fn umount_data_volume_database_migrate() -> Mount {
    let mut step = mount_data_volume_database_migrate().reversed();
    step.meta.name = "umount_data_volume_database_migrate";
    step.meta.description = "Umounting new volume for scp /data_migrate...";
    step
}

pub fn mount_data_volume_on_slave_migrate() -> Mount {
    let mut step = mount_data_volume_database_migrate().on(HostRef::FirstNonMaster);
    step.volume = VolumeRef::new(HostRef::FirstNonMaster, VolumePick::LastInactive);
    step.meta.name = "mount_data_volume_on_slave_migrate";
    step
}

pub fn umount_data_volume_on_slave_migrate() -> Mount {
    let mut step = umount_data_volume_database_migrate().on(HostRef::FirstNonMaster);
    step.volume = VolumeRef::new(HostRef::FirstNonMaster, VolumePick::LastInactive);
    step.meta.name = "umount_data_volume_on_slave_migrate";
    step
}

pub fn mount_data_volume_restored() -> Mount {
    Mount::new(
        Meta::new("mount_data_volume_restored", "Mounting /data volume...")
            .gate(Gate::only(Role::Database).and(Role::RestoreMaster)),
        VolumeRef::LATEST,
        DATA,
    )
    .without_undo()
}

pub fn unmount_active_volume() -> Mount {
    Mount::new(
        Meta::new("unmount_active_volume", "Umounting /data volume...").gate(Role::RestoreMaster),
        VolumeRef::ACTIVE,
        DATA,
    )
    .reversed()
    .without_undo()
}

pub fn unmount_active_volume_upgrade_disk_type() -> Mount {
    Mount::new(
        Meta::new("unmount_active_volume_upgrade_disk_type", "Umounting /data volume...").gate(Role::Database),
        VolumeRef::ACTIVE,
        DATA,
    )
    .reversed()
}

pub fn unmount_data_volume() -> Mount {
    Mount::new(Meta::new("unmount_data_volume", "Umounting /data volume..."), VolumeRef::ACTIVE, DATA)
        .reversed()
        .without_undo()
}

pub fn mount_data_latest_volume_migrate() -> Mount {
    let mut step = Mount::new(
        Meta::new("mount_data_latest_volume_migrate", "Mounting new volume on /data_latest_volume for copy...")
            .gate(Role::NewDiskMigration),
        VolumeRef::new(HostRef::MigrationSource, VolumePick::Latest),
        DATA_LATEST_VOLUME,
    )
    .on(HostRef::MigrationSource)
    .without_fstab();
    step.only_inactive = true;
    step
}

pub fn umount_data_latest_volume_migrate() -> Mount {
    let mut step = mount_data_latest_volume_migrate().reversed();
    step.meta.name = "umount_data_latest_volume_migrate";
    step.meta.description = "Umounting new volume on /data_latest_volume...";
    step
}

// ============================================================================
// Attach / detach
// ============================================================================

/// Attach (forward) or detach (backward) one volume
pub struct Attach {
    meta: Meta,
    direction: Direction,
    undo_mode: UndoMode,
    volume: VolumeRef,
    /// Host whose VM receives the disk
    to: HostRef,
    only_inactive: bool,
}

catalog_step!(Attach);

impl Attach {
    fn new(meta: Meta, volume: VolumeRef) -> Self {
        Self {
            meta,
            direction: Direction::Forward,
            undo_mode: UndoMode::Inverse,
            volume,
            to: HostRef::Own,
            only_inactive: false,
        }
    }

    fn reversed(mut self) -> Self {
        self.direction = Direction::Reverse;
        self
    }

    fn without_undo(mut self) -> Self {
        self.undo_mode = UndoMode::Skip;
        self
    }

    fn renamed(mut self, name: &'static str, description: &'static str) -> Self {
        self.meta.name = name;
        self.meta.description = description;
        self
    }

    fn gated(mut self, gate: Gate) -> Self {
        self.meta.gate = gate;
        self
    }

    async fn target(&self, ctx: &StepContext) -> Result<Option<Volume>> {
        let volume = self.volume.require(ctx).await?;
        if self.only_inactive && volume.is_active {
            return Ok(None);
        }
        Ok(Some(volume))
    }
}

#[async_trait]
impl Symmetric for Attach {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn undo_mode(&self) -> UndoMode {
        self.undo_mode
    }

    async fn forward(&self, ctx: &StepContext) -> Result<()> {
        let Some(volume) = self.target(ctx).await? else {
            return Ok(());
        };
        let host = self.to.resolve(ctx).await?;
        let vm = ctx.vm(&host).await?;
        info!(volume = %volume.identifier, vm = %vm.name, zone = %vm.zone, "Attaching disk");
        let provider = ctx.provider_in(&ctx.infra.environment)?;
        provider.attach_disk(&volume.identifier, &vm).await?;
        Ok(())
    }

    async fn backward(&self, ctx: &StepContext) -> Result<()> {
        let Some(volume) = self.target(ctx).await? else {
            return Ok(());
        };
        info!(volume = %volume.identifier, "Detaching disk");
        let provider = ctx.provider_in(&ctx.infra.environment)?;
        provider.detach_disk(&volume.identifier).await?;
        Ok(())
    }
}

pub fn attach_data_volume() -> Attach {
    Attach::new(Meta::new("attach_data_volume", "Attach disk in VM...").gate(Role::Database), VolumeRef::ACTIVE)
}

pub fn attach_data_volume_temporary_instance() -> Attach {
    attach_data_volume()
        .renamed("attach_data_volume_temporary_instance", "Attach disk in VM...")
        .gated(Gate::only(Role::Database).and(Role::Temporary))
}

pub fn attach_data_volume_upgrade_disk_type() -> Attach {
    Attach::new(
        Meta::new("attach_data_volume_upgrade_disk_type", "Attach disk in VM...").gate(Role::Database),
        VolumeRef::LATEST,
    )
}

pub fn attach_data_volume_restored() -> Attach {
    Attach::new(
        Meta::new("attach_data_volume_restored", "Attach disk in VM...")
            .gate(Gate::only(Role::Database).and(Role::RestoreMaster)),
        VolumeRef::LATEST,
    )
}

pub fn attach_data_volume_migrate() -> Attach {
    Attach::new(
        Meta::new("attach_data_volume_migrate", "Attaching old volume to new VM..."),
        VolumeRef::new(HostRef::MigrationSource, VolumePick::Active),
    )
}

pub fn detach_data_volume_migrate() -> Attach {
    attach_data_volume_migrate()
        .reversed()
        .renamed("detach_data_volume_migrate", "Detaching old volume from new VM...")
}

pub fn attach_data_volume_recreate_slave() -> Attach {
    Attach::new(
        Meta::new("attach_data_volume_recreate_slave", "Attaching master volume to slave VM...").gate(Role::Database),
        VolumeRef::new(HostRef::Master, VolumePick::Active),
    )
}

pub fn detach_data_volume_recreate_slave() -> Attach {
    attach_data_volume_recreate_slave()
        .reversed()
        .renamed("detach_data_volume_recreate_slave", "Detaching master volume from slave VM...")
}

pub fn detach_first_volume() -> Attach {
    Attach::new(
        Meta::new("detach_first_volume", "Detaching first disk from VM...").gate(Role::Database),
        VolumeRef::FIRST,
    )
    .reversed()
}

pub fn detach_active_volume() -> Attach {
    Attach::new(
        Meta::new("detach_active_volume", "Detaching volume...")
            .gate(Gate::only(Role::Database).and(Role::RestoreMaster)),
        VolumeRef::ACTIVE,
    )
    .reversed()
    .without_undo()
}

pub fn attach_data_latest_volume_migrate() -> Attach {
    let mut step = Attach::new(
        Meta::new("attach_data_latest_volume_migrate", "Attaching new volume to original VM...")
            .gate(Role::NewDiskMigration),
        VolumeRef::new(HostRef::MigrationSource, VolumePick::Latest),
    );
    step.to = HostRef::MigrationSource;
    step.only_inactive = true;
    step
}

pub fn detach_data_latest_volume_migrate() -> Attach {
    attach_data_latest_volume_migrate()
        .reversed()
        .renamed("detach_data_latest_volume_migrate", "Detaching new volume from original VM...")
}

/// Detach every volume of the host
///
/// Undo re-attaches and re-mounts the active volume when a host migration
/// is bound.
pub struct DetachVolumes {
    meta: Meta,
}

catalog_step!(DetachVolumes);

#[async_trait]
impl Doable for DetachVolumes {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let provider = ctx.provider_in(&ctx.infra.environment)?;
        for volume in ctx.store().volumes(ctx.host.id).await? {
            info!(volume = %volume.identifier, host = %ctx.host.hostname, "Detaching disk");
            provider.detach_disk(&volume.identifier).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Undoable for DetachVolumes {
    async fn revert(&self, ctx: &StepContext) -> Result<()> {
        if ctx.host_migrate_id.is_none() {
            return Ok(());
        }
        attach_data_volume().forward(ctx).await?;
        mount_data_volume().forward(ctx).await
    }
}

pub fn detach_data_volume() -> DetachVolumes {
    DetachVolumes {
        meta: Meta::new("detach_data_volume", "Detaching disk from VM...").gate(Role::Database),
    }
}

pub fn detach_data_volume_temporary_instance() -> DetachVolumes {
    DetachVolumes {
        meta: Meta::new("detach_data_volume_temporary_instance", "Detaching disk from VM...")
            .gate(Gate::only(Role::Database).and(Role::Temporary)),
    }
}

// ============================================================================
// Zone moves
// ============================================================================

/// Destination zone of a disk move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// Destination zone of the host migration; undo moves back to its origin
    Migration,
    /// Zone of the context host's VM; not compensated
    HostVm,
}

pub struct MoveDisk {
    meta: Meta,
    volume: VolumeRef,
    zone: Zone,
}

catalog_step!(MoveDisk);

impl MoveDisk {
    async fn move_to(&self, ctx: &StepContext, zone: &str) -> Result<()> {
        let volume = self.volume.require(ctx).await?;
        info!(volume = %volume.identifier, zone, "Moving disk");
        let provider = ctx.provider_in(&ctx.infra.environment)?;
        provider.move_disk(&volume.identifier, zone).await?;
        Ok(())
    }
}

#[async_trait]
impl Doable for MoveDisk {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let zone = match self.zone {
            Zone::Migration => ctx.require_host_migrate().await?.zone,
            Zone::HostVm => ctx.vm(&ctx.host).await?.zone,
        };
        self.move_to(ctx, &zone).await
    }
}

#[async_trait]
impl Undoable for MoveDisk {
    async fn revert(&self, ctx: &StepContext) -> Result<()> {
        match self.zone {
            Zone::Migration => {
                let origin = ctx.require_host_migrate().await?.zone_origin;
                self.move_to(ctx, &origin).await
            }
            Zone::HostVm => Ok(()),
        }
    }
}

pub fn move_disk() -> MoveDisk {
    MoveDisk {
        meta: Meta::new("move_disk", "Moving disk...").gate(Role::Database),
        volume: VolumeRef::new(HostRef::MigrationSource, VolumePick::Active),
        zone: Zone::Migration,
    }
}

pub fn move_disk_restore() -> MoveDisk {
    MoveDisk {
        meta: Meta::new("move_disk_restore", "Moving disk...")
            .gate(Gate::only(Role::Database).and(Role::RestoreMaster)),
        volume: VolumeRef::LATEST,
        zone: Zone::HostVm,
    }
}

// ============================================================================
// Metadata, resize and restore
// ============================================================================

/// Make the newest volume the host's active one
pub struct UpdateActiveDisk {
    meta: Meta,
    symmetric: bool,
}

catalog_step!(UpdateActiveDisk);

#[async_trait]
impl Doable for UpdateActiveDisk {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let Some(latest) = ctx.store().latest_volume(ctx.host.id).await? else {
            return Ok(());
        };
        if latest.is_active {
            return Ok(());
        }
        info!(host = %ctx.host.hostname, volume = %latest.identifier, "Switching active volume");
        ctx.volumes().activate(&latest).await?;
        Ok(())
    }
}

#[async_trait]
impl Undoable for UpdateActiveDisk {
    async fn revert(&self, ctx: &StepContext) -> Result<()> {
        if !self.symmetric {
            return Ok(());
        }
        let volumes = ctx.store().volumes(ctx.host.id).await?;
        let [.., previous, latest] = volumes.as_slice() else {
            return Ok(());
        };
        if latest.is_active {
            info!(host = %ctx.host.hostname, volume = %previous.identifier, "Restoring previous active volume");
            ctx.volumes().activate(previous).await?;
        }
        Ok(())
    }
}

pub fn update_active_disk() -> UpdateActiveDisk {
    UpdateActiveDisk {
        meta: Meta::new("update_active_disk", "Updating meta data...").gate(Role::Database),
        symmetric: false,
    }
}

pub fn update_active_disk_type_upgrade() -> UpdateActiveDisk {
    UpdateActiveDisk {
        meta: Meta::new("update_active_disk_type_upgrade", "Updating meta data...").gate(Role::Database),
        symmetric: true,
    }
}

/// Grow the active volume to the infra's disk offering
pub struct ResizeVolume {
    meta: Meta,
}

catalog_step!(ResizeVolume);

#[async_trait]
impl Doable for ResizeVolume {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let volume = VolumeRef::ACTIVE.require(ctx).await?;
        let environment = EnvRef::ResizeAware.resolve(ctx).await?;
        ctx.volumes()
            .resize(&ctx.scope_in(&environment), &volume, ctx.infra.disk_offering.size_kb)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Undoable for ResizeVolume {}

pub fn resize_volume() -> ResizeVolume {
    ResizeVolume {
        meta: Meta::new("resize_volume", "Resizing data volume...").gate(Role::Database),
    }
}

/// Grow the file system to the resized volume
pub struct Resize2fs {
    meta: Meta,
}

catalog_step!(Resize2fs);

#[async_trait]
impl Doable for Resize2fs {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let volume = VolumeRef::ACTIVE.require(ctx).await?;
        let environment = EnvRef::ResizeAware.resolve(ctx).await?;
        let command = ctx
            .provider_in(&environment)?
            .resize2fs_command(&volume.identifier)
            .await?;
        ctx.run_command(&ctx.host, &command).await
    }
}

#[async_trait]
impl Undoable for Resize2fs {}

pub fn resize2fs() -> Resize2fs {
    Resize2fs {
        meta: Meta::new("resize2fs", "Resizing data volume to file system...").gate(Role::Database),
    }
}

/// Restore a snapshot into a new inactive volume
///
/// Without a resolvable snapshot both directions are no-ops.
pub struct RestoreSnapshot {
    meta: Meta,
    snapshot: SnapshotRef,
    /// Host receiving the restored volume record
    disk_host: HostRef,
    /// Host whose VM the provider restores next to
    vm_host: HostRef,
}

#[async_trait]
impl Gated for RestoreSnapshot {
    async fn is_valid(&self, ctx: &StepContext) -> Result<bool> {
        Ok(self.meta.gate.allows(ctx).await? && self.snapshot.resolve(ctx).await?.is_some())
    }
}

impl crate::traits::Step for RestoreSnapshot {
    fn name(&self) -> &str {
        self.meta.name
    }

    fn description(&self) -> String {
        self.meta.description.to_string()
    }
}

#[async_trait]
impl Doable for RestoreSnapshot {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let snapshot = self.snapshot.require(ctx).await?;
        let disk_host = self.disk_host.resolve(ctx).await?;
        let vm_host = self.vm_host.resolve(ctx).await?;
        let vm = ctx.vm(&vm_host).await?;
        let disk_type = ctx.infra.disk_offering_type.type_name.clone();
        let scope = ctx.scope_in(&ctx.infra.environment);

        let request = RestoreRequest {
            vm_name: vm.name,
            zone: vm.zone,
            labels: scope.labels.clone(),
            disk_offering_type: Some(disk_type.clone()),
        };
        let identifier = ctx
            .volumes()
            .provider(&scope)?
            .restore_snapshot(snapshot.provider_id()?, &request)
            .await?;

        let mut volume = Volume::new(disk_host.id, identifier, ctx.infra.disk_offering.size_kb);
        volume.is_active = false;
        volume.disk_offering_type = Some(disk_type);
        let volume = ctx.store().create_volume(volume).await?;
        info!(
            snapshot = %snapshot,
            volume = %volume.identifier,
            id = volume.id,
            host = %disk_host.hostname,
            "Restored snapshot"
        );
        Ok(())
    }
}

#[async_trait]
impl Undoable for RestoreSnapshot {
    async fn revert(&self, ctx: &StepContext) -> Result<()> {
        let disk_host = self.disk_host.resolve(ctx).await?;
        if let Some(volume) = ctx.store().latest_volume(disk_host.id).await? {
            destroy(ctx, EnvRef::Infra, &volume).await?;
        }
        Ok(())
    }
}

pub fn restore_snapshot() -> RestoreSnapshot {
    RestoreSnapshot {
        meta: Meta::new("restore_snapshot", "Restoring snapshot..."),
        snapshot: SnapshotRef::RestoreMaster,
        disk_host: HostRef::RestoreMaster,
        vm_host: HostRef::RestoreMaster,
    }
}

pub fn restore_snapshot_to_master() -> RestoreSnapshot {
    RestoreSnapshot {
        meta: Meta::new("restore_snapshot_to_master", "Restoring snapshot..."),
        snapshot: SnapshotRef::RestoreMaster,
        disk_host: HostRef::RestoreMaster,
        vm_host: HostRef::Master,
    }
}

pub fn restore_snapshot_mysql() -> RestoreSnapshot {
    RestoreSnapshot {
        meta: Meta::new("restore_snapshot_mysql", "Restoring snapshot..."),
        snapshot: SnapshotRef::RestoreGroupFirst,
        disk_host: HostRef::Own,
        vm_host: HostRef::Own,
    }
}

/// Relabel the host's disks with the infra's team
pub struct UpdateTeamLabels {
    meta: Meta,
}

catalog_step!(UpdateTeamLabels);

#[async_trait]
impl Doable for UpdateTeamLabels {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let vm = ctx.vm(&ctx.host).await?;
        let updated = ctx
            .provider_in(&ctx.infra.environment)?
            .update_team_labels(&vm.name, &ctx.infra.team_name, &vm.zone)
            .await?;
        if !updated {
            return Err(StepError::Failed("Error in update Team Labels".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Undoable for UpdateTeamLabels {}

pub fn update_team_labels_disks() -> UpdateTeamLabels {
    UpdateTeamLabels {
        meta: Meta::new("update_team_labels_disks", "Updating Team Labels in All Disks..."),
    }
}

/// Run the provider's cleanup command for the host's oldest volume
pub struct CleanUpVolume {
    meta: Meta,
    volume: VolumeRef,
}

catalog_step!(CleanUpVolume);

#[async_trait]
impl Doable for CleanUpVolume {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        let Some(volume) = self.volume.resolve(ctx).await? else {
            return Ok(());
        };
        let command = ctx
            .volumes()
            .clean_up_command(&ctx.scope_in(&ctx.infra.environment), &volume)
            .await?;
        ctx.run_command(&ctx.host, &command).await
    }
}

#[async_trait]
impl Undoable for CleanUpVolume {}

pub fn clean_up_first_volume() -> CleanUpVolume {
    CleanUpVolume {
        meta: Meta::new("clean_up_first_volume", "Cleaning up old volume...").gate(Role::Database),
        volume: VolumeRef::FIRST,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use crate::traits::{run_do, run_undo, Outcome};
    use dbaas_common::{DiskTypeUpgrade, Store};

    #[tokio::test]
    async fn test_new_volume_without_snapshot() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;

        run_do(&new_volume(), &ctx).await.unwrap();

        let created = fixture.provider.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].snapshot_id, None);
        assert_eq!(created[0].disk_offering_type.as_deref(), Some("SSD"));
        assert_eq!(created[0].to_address, "10.0.0.1");
        assert_eq!(created[0].vm_name.as_deref(), Some("db-01"));

        let volumes = fixture.volumes(1).await;
        let new = volumes.last().unwrap();
        assert!(new.is_active);
        assert_eq!(new.total_size_kb, ctx.infra.disk_offering.size_kb);
    }

    #[tokio::test]
    async fn test_new_volume_undo_destroys_all_host_volumes() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        let step = new_volume();
        run_do(&step, &ctx).await.unwrap();
        run_undo(&step, &ctx).await.unwrap();
        assert!(fixture.volumes(1).await.is_empty());
        assert_eq!(fixture.provider.count("delete_volume"), 2);
    }

    #[tokio::test]
    async fn test_new_volume_skipped_for_sentinel() {
        let fixture = Fixture::new().await;
        let mut ctx = fixture.context(1).await;
        ctx.instance = ctx.instance.clone().as_sentinel();
        assert_eq!(run_do(&new_volume(), &ctx).await.unwrap(), Outcome::NotValid);
        assert!(fixture.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_new_volume_migrate_uses_destination_type_and_is_irreversible() {
        let fixture = Fixture::new().await.with_host_migration().await;
        let snapshot = fixture.snapshot(1, 1, |_| {}).await;
        let mut migrate = fixture.store.get_host_migrate(1).await.unwrap();
        migrate.snapshot_id = Some(snapshot.id);
        fixture.store.put_host_migrate(&migrate).await.unwrap();
        let ctx = fixture.context(1).await.with_host_migrate(1);

        let step = new_volume_migrate();
        run_do(&step, &ctx).await.unwrap();
        let created = fixture.provider.created();
        assert_eq!(created[0].snapshot_id, snapshot.snapshot_id);
        assert_eq!(created[0].disk_offering_type.as_deref(), Some("pd-ssd"));
        assert!(!fixture.volumes(1).await.last().unwrap().is_active);

        let err = run_undo(&step, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Irreversible);
    }

    #[tokio::test]
    async fn test_new_volume_from_snapshot_requires_snapshot() {
        let fixture = Fixture::new().await;
        let mut ctx = fixture.context(1).await;
        ctx.instance.temporary = true;

        let err = run_do(&new_volume_from_snapshot(), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);

        let snapshot = fixture.snapshot(2, 2, |_| {}).await;
        run_do(&new_volume_from_snapshot(), &ctx).await.unwrap();
        assert_eq!(fixture.provider.created()[0].snapshot_id, snapshot.snapshot_id);
    }

    #[tokio::test]
    async fn test_disk_type_upgrade_volume() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await.with_disk_upgrade(DiskTypeUpgrade {
            disk_offering_type: "HDD".to_string(),
        });
        let step = create_volume_disk_type_upgrade();
        assert_eq!(run_do(&step, &ctx).await.unwrap(), Outcome::Skipped);

        let snapshot = fixture.snapshot(1, 1, |_| {}).await;
        run_do(&step, &ctx).await.unwrap();
        let created = fixture.provider.created();
        assert_eq!(created[0].disk_offering_type.as_deref(), Some("HDD"));
        assert_eq!(created[0].snapshot_id, snapshot.snapshot_id);

        run_undo(&step, &ctx).await.unwrap();
        assert_eq!(fixture.volumes(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_new_volume_on_slave_migrate() {
        let fixture = Fixture::new().await.with_host_migration().await;
        let ctx = fixture.context(1).await.with_host_migrate(1);

        let step = new_volume_on_slave_migrate();
        run_do(&step, &ctx).await.unwrap();
        assert_eq!(fixture.provider.created()[0].to_address, "10.0.0.2");
        let volumes = fixture.volumes(2).await;
        assert_eq!(volumes.len(), 2);
        assert!(!volumes[1].is_active);

        let err = run_undo(&step, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Irreversible);
    }

    #[tokio::test]
    async fn test_destroy_volume_removes_every_volume() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        run_do(&new_inactive_volume(), &ctx).await.unwrap();

        run_do(&destroy_volume(), &ctx).await.unwrap();
        assert!(fixture.volumes(1).await.is_empty());
        assert_eq!(fixture.provider.count("delete_volume"), 2);
        run_undo(&destroy_volume(), &ctx).await.unwrap();
        assert_eq!(fixture.provider.count("create_volume"), 1);

        let step = destroy_volume_temporary_instance();
        let mut temporary = fixture.context(2).await;
        assert_eq!(run_do(&step, &temporary).await.unwrap(), Outcome::Skipped);
        temporary.instance.temporary = true;
        assert_eq!(run_do(&step, &temporary).await.unwrap(), Outcome::Applied);
        assert!(fixture.volumes(2).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_volume_on_original_host() {
        let fixture = Fixture::new().await.with_host_migration().await;
        fixture.provider.set_new_disk_migration(true);
        let ctx = fixture.context(1).await.with_host_migrate(1);
        let step = delete_volume_migrate_original_host();

        assert_eq!(run_do(&step, &ctx).await.unwrap(), Outcome::NotValid);
        assert_eq!(fixture.provider.count("delete_volume"), 0);

        run_do(&new_volume_migrate_original_host(), &ctx).await.unwrap();
        assert_eq!(run_do(&step, &ctx).await.unwrap(), Outcome::Applied);
        let volumes = fixture.volumes(1).await;
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].identifier, "vol-1");
    }

    #[tokio::test]
    async fn test_destroy_first_volume() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        run_do(&new_inactive_volume(), &ctx).await.unwrap();
        run_do(&destroy_first_volume(), &ctx).await.unwrap();

        let volumes = fixture.volumes(1).await;
        assert_eq!(volumes.len(), 1);
        assert_ne!(volumes[0].identifier, "vol-1");
    }

    #[tokio::test]
    async fn test_remove_volume_migrate_requires_inactive_volume() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        let err = run_do(&remove_volume_migrate(), &ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "No inactive volume found on db-02.dev");
    }

    #[tokio::test]
    async fn test_destroy_old_environment_gating() {
        let fixture = Fixture::new().await;
        let step = destroy_old_environment();
        let ctx = fixture.context(1).await;
        assert_eq!(run_do(&step, &ctx).await.unwrap(), Outcome::Skipped);
        assert_eq!(step.reversibility(), Reversibility::Irreversible(NO_ROLLBACK));

        let fixture = Fixture::new().await.with_host_migration().await;
        let ctx = fixture.context(1).await.with_host_migrate(1);
        assert_eq!(run_do(&step, &ctx).await.unwrap(), Outcome::Applied);
        assert!(fixture.volumes(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_mount_and_umount_commands() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        let step = mount_data_latest_volume();

        run_do(&step, &ctx).await.unwrap();
        run_undo(&step, &ctx).await.unwrap();
        assert_eq!(
            fixture.remote.scripts(),
            vec!["mount vol-1 /data_latest_volume", "umount vol-1 /data_latest_volume"]
        );

        let reversed = unmount_data_latest_volume();
        run_do(&reversed, &ctx).await.unwrap();
        assert_eq!(fixture.remote.scripts()[2], "umount vol-1 /data_latest_volume");
    }

    #[tokio::test]
    async fn test_mount_without_undo() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        run_undo(&mount_data_volume(), &ctx).await.unwrap();
        assert!(fixture.remote.scripts().is_empty());
        assert!(fixture.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_mount_migration_volume_on_new_host() {
        let fixture = Fixture::new().await.with_host_migration().await;
        let ctx = fixture.context(2).await.with_host_migrate(1);
        run_do(&mount_data_volume_migrate(), &ctx).await.unwrap();
        assert_eq!(
            fixture.remote.runs(),
            vec![("10.0.0.2".to_string(), "mount vol-1 /data_migrate".to_string())]
        );
    }

    #[tokio::test]
    async fn test_mount_variants_on_own_host() {
        let fixture = Fixture::new().await;
        let mut ctx = fixture.context(1).await;

        let step = mount_data_volume_with_undo();
        run_do(&step, &ctx).await.unwrap();
        run_undo(&step, &ctx).await.unwrap();

        let temporary = mount_data_volume_temporary_instance();
        assert_eq!(run_do(&temporary, &ctx).await.unwrap(), Outcome::NotValid);

        run_do(&new_inactive_volume(), &ctx).await.unwrap();
        run_do(&mount_data_new_volume(), &ctx).await.unwrap();
        run_undo(&mount_data_new_volume(), &ctx).await.unwrap();

        ctx.instance.temporary = true;
        run_do(&temporary, &ctx).await.unwrap();
        run_undo(&temporary, &ctx).await.unwrap();

        assert_eq!(
            fixture.remote.scripts(),
            vec![
                "mount vol-1 /data",
                "umount vol-1 /data",
                "mount vol-new-1 /data",
                "mount vol-1 /data",
            ]
        );
    }

    #[tokio::test]
    async fn test_unmount_active_volume_for_restore_master() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        let step = unmount_active_volume();
        assert_eq!(run_do(&step, &ctx).await.unwrap(), Outcome::NotValid);

        let ctx = ctx.with_restore(fixture.restore());
        run_do(&step, &ctx).await.unwrap();
        run_undo(&step, &ctx).await.unwrap();
        assert_eq!(fixture.remote.scripts(), vec!["umount vol-1 /data"]);

        let slave = fixture.context(2).await.with_restore(fixture.restore());
        assert_eq!(run_do(&step, &slave).await.unwrap(), Outcome::NotValid);
    }

    #[tokio::test]
    async fn test_umount_master_volume_from_slave() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(2).await;
        let step = umount_data_volume_recreate_slave();
        run_do(&step, &ctx).await.unwrap();
        run_undo(&step, &ctx).await.unwrap();
        assert_eq!(
            fixture.remote.runs(),
            vec![
                ("10.0.0.2".to_string(), "umount vol-1 /data_recreate_slave".to_string()),
                ("10.0.0.2".to_string(), "mount vol-1 /data_recreate_slave".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_migration_volume_umounts_on_source_and_slave() {
        let fixture = Fixture::new().await.with_host_migration().await;
        let mut inactive = Volume::new(1, "vol-snap-1", 8 * 1024 * 1024);
        inactive.is_active = false;
        fixture.store.create_volume(inactive).await.unwrap();
        let mut inactive = Volume::new(2, "vol-snap-2", 8 * 1024 * 1024);
        inactive.is_active = false;
        fixture.store.create_volume(inactive).await.unwrap();
        let ctx = fixture.context(2).await.with_host_migrate(1);

        run_do(&umount_data_volume_database_migrate(), &ctx).await.unwrap();
        run_undo(&umount_data_volume_database_migrate(), &ctx).await.unwrap();
        run_do(&mount_data_volume_on_slave_migrate(), &ctx).await.unwrap();
        run_undo(&mount_data_volume_on_slave_migrate(), &ctx).await.unwrap();
        run_do(&umount_data_volume_on_slave_migrate(), &ctx).await.unwrap();

        assert_eq!(
            fixture.remote.runs(),
            vec![
                ("10.0.0.1".to_string(), "umount vol-snap-1 /data_migrate".to_string()),
                ("10.0.0.1".to_string(), "mount vol-snap-1 /data_migrate".to_string()),
                ("10.0.0.2".to_string(), "mount vol-snap-2 /data_migrate".to_string()),
                ("10.0.0.2".to_string(), "umount vol-snap-2 /data_migrate".to_string()),
                ("10.0.0.2".to_string(), "umount vol-snap-2 /data_migrate".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_latest_volume_mounts_only_while_inactive() {
        let fixture = Fixture::new().await.with_host_migration().await;
        let ctx = fixture.context(1).await.with_host_migrate(1);
        let mount = mount_data_latest_volume_migrate();
        assert_eq!(run_do(&mount, &ctx).await.unwrap(), Outcome::NotValid);

        fixture.provider.set_new_disk_migration(true);
        run_do(&mount, &ctx).await.unwrap();
        assert!(fixture.remote.scripts().is_empty());

        run_do(&new_volume_migrate_original_host(), &ctx).await.unwrap();
        run_do(&mount, &ctx).await.unwrap();
        run_do(&umount_data_latest_volume_migrate(), &ctx).await.unwrap();
        run_undo(&umount_data_latest_volume_migrate(), &ctx).await.unwrap();
        assert_eq!(
            fixture.remote.runs(),
            vec![
                ("10.0.0.1".to_string(), "mount vol-new-1 /data_latest_volume".to_string()),
                ("10.0.0.1".to_string(), "umount vol-new-1 /data_latest_volume".to_string()),
                ("10.0.0.1".to_string(), "mount vol-new-1 /data_latest_volume".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_attach_detach() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        let step = attach_data_volume();
        run_do(&step, &ctx).await.unwrap();
        run_undo(&step, &ctx).await.unwrap();
        assert_eq!(fixture.provider.operations(), vec!["attach_disk", "detach_disk"]);

        run_undo(&detach_active_volume(), &ctx.clone().with_restore(fixture.restore()))
            .await
            .unwrap();
        assert_eq!(fixture.provider.operations().len(), 2);
    }

    #[tokio::test]
    async fn test_attach_latest_only_when_inactive() {
        let fixture = Fixture::new().await.with_host_migration().await;
        fixture.provider.set_new_disk_migration(true);
        let ctx = fixture.context(1).await.with_host_migrate(1);

        run_do(&attach_data_latest_volume_migrate(), &ctx).await.unwrap();
        assert_eq!(fixture.provider.count("attach_disk"), 0);

        run_do(&new_volume_migrate_original_host(), &ctx).await.unwrap();
        run_do(&attach_data_latest_volume_migrate(), &ctx).await.unwrap();
        assert_eq!(fixture.provider.count("attach_disk"), 1);
    }

    #[tokio::test]
    async fn test_detach_variants_reattach_on_undo() {
        let fixture = Fixture::new().await.with_host_migration().await;
        let ctx = fixture.context(2).await.with_host_migrate(1);

        for step in [detach_data_volume_migrate(), detach_data_volume_recreate_slave()] {
            run_do(&step, &ctx).await.unwrap();
            run_undo(&step, &ctx).await.unwrap();
        }
        let step = detach_first_volume();
        run_do(&step, &ctx).await.unwrap();
        run_undo(&step, &ctx).await.unwrap();

        let calls: Vec<_> = fixture
            .provider
            .calls()
            .into_iter()
            .filter(|c| c.operation.ends_with("_disk"))
            .map(|c| format!("{} {}", c.operation, c.target))
            .collect();
        assert_eq!(
            calls,
            vec![
                "detach_disk vol-1",
                "attach_disk vol-1",
                "detach_disk vol-1",
                "attach_disk vol-1",
                "detach_disk vol-2",
                "attach_disk vol-2",
            ]
        );
    }

    #[tokio::test]
    async fn test_detach_latest_volume_only_when_inactive() {
        let fixture = Fixture::new().await.with_host_migration().await;
        fixture.provider.set_new_disk_migration(true);
        let ctx = fixture.context(1).await.with_host_migrate(1);
        let step = detach_data_latest_volume_migrate();

        run_do(&step, &ctx).await.unwrap();
        assert_eq!(fixture.provider.count("detach_disk"), 0);

        run_do(&new_volume_migrate_original_host(), &ctx).await.unwrap();
        run_do(&step, &ctx).await.unwrap();
        run_undo(&step, &ctx).await.unwrap();
        assert_eq!(fixture.provider.count("detach_disk"), 1);
        assert_eq!(fixture.provider.count("attach_disk"), 1);
    }

    #[tokio::test]
    async fn test_temporary_instance_attach_and_detach() {
        let fixture = Fixture::new().await;
        let mut ctx = fixture.context(1).await;
        let attach = attach_data_volume_temporary_instance();
        let detach = detach_data_volume_temporary_instance();
        assert_eq!(run_do(&attach, &ctx).await.unwrap(), Outcome::NotValid);
        assert_eq!(run_do(&detach, &ctx).await.unwrap(), Outcome::NotValid);

        ctx.instance.temporary = true;
        run_do(&attach, &ctx).await.unwrap();
        run_do(&detach, &ctx).await.unwrap();
        run_undo(&detach, &ctx).await.unwrap();
        assert_eq!(fixture.provider.operations(), vec!["attach_disk", "detach_disk"]);
    }

    #[tokio::test]
    async fn test_new_volume_on_original_host_follows_migration() {
        let fixture = Fixture::new().await.with_host_migration().await;
        fixture.provider.set_new_disk_migration(true);
        let snapshot = fixture.snapshot(1, 1, |_| {}).await;
        let mut migrate = fixture.store.get_host_migrate(1).await.unwrap();
        migrate.snapshot_id = Some(snapshot.id);
        fixture.store.put_host_migrate(&migrate).await.unwrap();
        let ctx = fixture.context(2).await.with_host_migrate(1);

        let step = new_volume_migrate_original_host();
        run_do(&step, &ctx).await.unwrap();
        let created = fixture.provider.created();
        assert_eq!(created[0].to_address, "10.0.0.1");
        assert_eq!(created[0].snapshot_id, snapshot.snapshot_id);
        assert_eq!(created[0].disk_offering_type.as_deref(), Some("SSD"));
        assert_eq!(fixture.volumes(1).await.len(), 2);
        assert_eq!(fixture.volumes(2).await.len(), 1);

        run_undo(&step, &ctx).await.unwrap();
        assert_eq!(fixture.volumes(1).await.len(), 1);
        assert!(fixture.volumes(1).await[0].is_active);
    }

    #[tokio::test]
    async fn test_detach_all_volumes() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        run_do(&new_inactive_volume(), &ctx).await.unwrap();
        run_do(&detach_data_volume(), &ctx).await.unwrap();
        assert_eq!(fixture.provider.count("detach_disk"), 2);

        run_undo(&detach_data_volume(), &ctx).await.unwrap();
        assert_eq!(fixture.provider.count("attach_disk"), 0);
    }

    #[tokio::test]
    async fn test_detach_undo_reattaches_during_migration() {
        let fixture = Fixture::new().await.with_host_migration().await;
        let ctx = fixture.context(1).await.with_host_migrate(1);
        run_undo(&detach_data_volume(), &ctx).await.unwrap();
        assert_eq!(fixture.provider.count("attach_disk"), 1);
        assert_eq!(fixture.remote.scripts(), vec!["mount vol-1 /data"]);
    }

    #[tokio::test]
    async fn test_move_disk_and_back() {
        let fixture = Fixture::new().await.with_host_migration().await;
        let ctx = fixture.context(1).await.with_host_migrate(1);
        let step = move_disk();
        run_do(&step, &ctx).await.unwrap();
        run_undo(&step, &ctx).await.unwrap();
        let targets: Vec<_> = fixture.provider.calls().into_iter().map(|c| c.target).collect();
        assert_eq!(targets, vec!["vol-1@zone-b", "vol-1@zone-a"]);
    }

    #[tokio::test]
    async fn test_move_restored_disk_to_vm_zone() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        let step = move_disk_restore();
        assert_eq!(run_do(&step, &ctx).await.unwrap(), Outcome::NotValid);

        let ctx = ctx.with_restore(fixture.restore());
        run_do(&step, &ctx).await.unwrap();
        run_undo(&step, &ctx).await.unwrap();
        let targets: Vec<_> = fixture.provider.calls().into_iter().map(|c| c.target).collect();
        assert_eq!(targets, vec!["vol-1@zone-a"]);
    }

    #[tokio::test]
    async fn test_update_active_disk_type_upgrade_is_symmetric() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        run_do(&new_inactive_volume(), &ctx).await.unwrap();

        let step = update_active_disk_type_upgrade();
        run_do(&step, &ctx).await.unwrap();
        let volumes = fixture.volumes(1).await;
        assert!(!volumes[0].is_active);
        assert!(volumes[1].is_active);

        run_undo(&step, &ctx).await.unwrap();
        let volumes = fixture.volumes(1).await;
        assert!(volumes[0].is_active);
        assert!(!volumes[1].is_active);
    }

    #[tokio::test]
    async fn test_resize_volume_records_new_size() {
        let fixture = Fixture::new().await;
        let mut ctx = fixture.context(1).await;
        ctx.infra.disk_offering.size_kb = 16 * 1024 * 1024;
        run_do(&resize_volume(), &ctx).await.unwrap();
        assert_eq!(fixture.volumes(1).await[0].total_size_kb, 16 * 1024 * 1024);
        assert_eq!(fixture.provider.calls()[0].environment, "dev");
    }

    #[tokio::test]
    async fn test_restore_without_snapshot_is_noop() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await.with_restore(fixture.restore());
        let step = restore_snapshot();
        assert_eq!(run_do(&step, &ctx).await.unwrap(), Outcome::NotValid);
        assert_eq!(run_undo(&step, &ctx).await.unwrap(), Outcome::NotValid);
        assert!(fixture.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_restore_creates_inactive_volume() {
        let fixture = Fixture::new().await;
        fixture.snapshot(1, 1, |_| {}).await;
        let ctx = fixture.context(2).await.with_restore(fixture.restore());

        run_do(&restore_snapshot(), &ctx).await.unwrap();
        assert_eq!(fixture.provider.operations(), vec!["restore_snapshot"]);
        assert_eq!(fixture.provider.restores()[0].vm_name, "db-01");

        let volumes = fixture.volumes(1).await;
        assert_eq!(volumes.len(), 2);
        let restored = &volumes[1];
        assert!(!restored.is_active);
        assert!(restored.id > 2);
        assert!(restored.identifier.starts_with("vol-restored"));
    }

    #[tokio::test]
    async fn test_restore_to_master_uses_master_vm() {
        let fixture = Fixture::new().await;
        fixture.snapshot(1, 1, |_| {}).await;
        fixture.driver.set_master(2);
        let ctx = fixture.context(2).await.with_restore(fixture.restore());

        let step = restore_snapshot_to_master();
        run_do(&step, &ctx).await.unwrap();
        assert_eq!(fixture.provider.restores()[0].vm_name, "db-02");
        assert_eq!(fixture.volumes(1).await.len(), 2);
        assert_eq!(fixture.volumes(2).await.len(), 1);

        run_undo(&step, &ctx).await.unwrap();
        let volumes = fixture.volumes(1).await;
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].identifier, "vol-1");
    }

    #[tokio::test]
    async fn test_restore_mysql_on_own_host() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(2).await.with_restore(fixture.restore());
        let step = restore_snapshot_mysql();
        assert_eq!(run_do(&step, &ctx).await.unwrap(), Outcome::NotValid);

        let snapshot = fixture.snapshot(1, 1, |_| {}).await;
        run_do(&step, &ctx).await.unwrap();
        assert_eq!(fixture.provider.calls()[0].target, snapshot.snapshot_id.unwrap());
        assert_eq!(fixture.provider.restores()[0].vm_name, "db-02");
        let volumes = fixture.volumes(2).await;
        assert_eq!(volumes.len(), 2);
        assert!(!volumes[1].is_active);

        run_undo(&step, &ctx).await.unwrap();
        assert_eq!(fixture.volumes(2).await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_team_labels_failure() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        run_do(&update_team_labels_disks(), &ctx).await.unwrap();

        fixture.provider.set_labels_updated(false);
        let err = run_do(&update_team_labels_disks(), &ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "Error in update Team Labels");
    }

    #[tokio::test]
    async fn test_clean_up_runs_provider_command() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        run_do(&clean_up_first_volume(), &ctx).await.unwrap();
        assert_eq!(fixture.remote.scripts(), vec!["cleanup vol-1"]);
    }
}
