//! Access steps
//!
//! Disk access grants, `hosts.allow` entries and SSH public key exchange
//! between the host a step runs on and the host whose data it reads.

use super::{catalog_step, Meta};
use crate::context::StepContext;
use crate::error::{Result, StepError};
use crate::gating::Role;
use crate::select::{HostRef, SnapshotRef, VolumePick, VolumeRef};
use crate::traits::{Direction, Symmetric, UndoMode};
use async_trait::async_trait;
use tracing::info;

// ============================================================================
// Disk access
// ============================================================================

/// Grant (forward) or revoke (backward) the context host's access to a volume
pub struct Access {
    meta: Meta,
    direction: Direction,
    undo_mode: UndoMode,
    volume: VolumeRef,
    access_type: Option<&'static str>,
}

catalog_step!(Access);

impl Access {
    fn new(meta: Meta, volume: VolumeRef) -> Self {
        Self {
            meta,
            direction: Direction::Forward,
            undo_mode: UndoMode::Inverse,
            volume,
            access_type: None,
        }
    }

    fn reversed(mut self, name: &'static str, description: &'static str) -> Self {
        self.direction = self.direction.flip();
        self.meta.name = name;
        self.meta.description = description;
        self
    }

    fn without_undo(mut self) -> Self {
        self.undo_mode = UndoMode::Skip;
        self
    }
}

#[async_trait]
impl Symmetric for Access {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn undo_mode(&self) -> UndoMode {
        self.undo_mode
    }

    async fn forward(&self, ctx: &StepContext) -> Result<()> {
        let volume = self.volume.require(ctx).await?;
        info!(
            volume = %volume.identifier,
            address = %ctx.host.address,
            access_type = ?self.access_type,
            "Granting disk access"
        );
        ctx.provider_in(&ctx.infra.environment)?
            .add_access(&volume.identifier, &ctx.host.address, self.access_type)
            .await?;
        Ok(())
    }

    async fn backward(&self, ctx: &StepContext) -> Result<()> {
        let volume = self.volume.require(ctx).await?;
        info!(volume = %volume.identifier, address = %ctx.host.address, "Revoking disk access");
        ctx.provider_in(&ctx.infra.environment)?
            .remove_access(&volume.identifier, &ctx.host.address)
            .await?;
        Ok(())
    }
}

pub fn add_access_new_volume() -> Access {
    Access::new(Meta::new("add_access_new_volume", "Adding permission to new disk ..."), VolumeRef::LATEST)
        .without_undo()
}

pub fn add_access_restored_volume() -> Access {
    Access::new(
        Meta::new("add_access_restored_volume", "Adding permission to restored disk ...").gate(Role::RestoreMaster),
        VolumeRef::LATEST,
    )
    .without_undo()
}

pub fn add_access_upgraded_disk_type_volume() -> Access {
    Access::new(
        Meta::new("add_access_upgraded_disk_type_volume", "Adding permission to restored disk ...")
            .gate(Role::Database),
        VolumeRef::LATEST,
    )
    .without_undo()
}

pub fn add_access_migrate() -> Access {
    Access::new(
        Meta::new("add_access_migrate", "Adding permission to old disk..."),
        VolumeRef::new(HostRef::MigrationSource, VolumePick::Active),
    )
}

pub fn remove_access_migrate() -> Access {
    add_access_migrate().reversed("remove_access_migrate", "Removing permission to old disk...")
}

pub fn add_access_recreate_slave() -> Access {
    let mut step = Access::new(
        Meta::new("add_access_recreate_slave", "Adding permission to old disk...").gate(Role::Database),
        VolumeRef::new(HostRef::Master, VolumePick::Active),
    );
    step.access_type = Some("read-only");
    step
}

pub fn remove_access_recreate_slave() -> Access {
    add_access_recreate_slave().reversed("remove_access_recreate_slave", "Removing permission to old master disk...")
}

// ============================================================================
// hosts.allow
// ============================================================================

/// Add (forward) or remove (backward) a peer's address in the context
/// host's `hosts.allow`
pub struct HostsAllow {
    meta: Meta,
    direction: Direction,
    peer: HostRef,
}

catalog_step!(HostsAllow);

impl HostsAllow {
    fn new(name: &'static str, peer: HostRef) -> Self {
        Self {
            meta: Meta::new(name, "Adding network on hosts_allow file...").gate(Role::Database),
            direction: Direction::Forward,
            peer,
        }
    }

    fn reversed(mut self, name: &'static str) -> Self {
        self.direction = Direction::Reverse;
        self.meta.name = name;
        self.meta.description = "Removing network from hosts_allow file...";
        self
    }

    async fn update(&self, ctx: &StepContext, add: bool) -> Result<()> {
        let peer = self.peer.resolve(ctx).await?;
        let provider = ctx.provider_in(&ctx.infra.environment)?;
        let script = if add {
            provider.add_hosts_allow_command(&peer.address).await?
        } else {
            provider.remove_hosts_allow_command(&peer.address).await?
        };
        info!(host = %ctx.host.address, peer = %peer.address, add, "Updating hosts_allow");
        ctx.run_script(&ctx.host, &script).await?;
        Ok(())
    }
}

#[async_trait]
impl Symmetric for HostsAllow {
    fn direction(&self) -> Direction {
        self.direction
    }

    async fn forward(&self, ctx: &StepContext) -> Result<()> {
        self.update(ctx, true).await
    }

    async fn backward(&self, ctx: &StepContext) -> Result<()> {
        self.update(ctx, false).await
    }
}

pub fn add_hosts_allow_migrate() -> HostsAllow {
    HostsAllow::new("add_hosts_allow_migrate", HostRef::MigrationSource)
}

pub fn remove_hosts_allow_migrate() -> HostsAllow {
    add_hosts_allow_migrate().reversed("remove_hosts_allow_migrate")
}

pub fn add_hosts_allow_database_migrate() -> HostsAllow {
    HostsAllow::new("add_hosts_allow_database_migrate", HostRef::FirstNonMaster)
}

pub fn remove_hosts_allow_database_migrate() -> HostsAllow {
    add_hosts_allow_database_migrate().reversed("remove_hosts_allow_database_migrate")
}

pub fn add_hosts_allow_migrate_backup_host() -> HostsAllow {
    HostsAllow::new(
        "add_hosts_allow_migrate_backup_host",
        HostRef::SnapshotOwner(SnapshotRef::SharedMigration),
    )
}

pub fn remove_hosts_allow_migrate_backup_host() -> HostsAllow {
    add_hosts_allow_migrate_backup_host().reversed("remove_hosts_allow_migrate_backup_host")
}

// ============================================================================
// Public keys
// ============================================================================

/// Let a peer host reach the context host over SSH
///
/// Forward asks the provider for the peer's key creation command, runs it on
/// the peer and appends the printed key to the context host's
/// `authorized_keys`. Backward runs the key removal command on the peer.
pub struct PubKey {
    meta: Meta,
    direction: Direction,
    peer: HostRef,
}

catalog_step!(PubKey);

impl PubKey {
    fn new(name: &'static str, peer: HostRef) -> Self {
        Self {
            meta: Meta::new(name, "Creating public key...").gate(Role::Database),
            direction: Direction::Forward,
            peer,
        }
    }

    fn reversed(mut self, name: &'static str) -> Self {
        self.direction = Direction::Reverse;
        self.meta.name = name;
        self.meta.description = "Removing public key...";
        self
    }
}

#[async_trait]
impl Symmetric for PubKey {
    fn direction(&self) -> Direction {
        self.direction
    }

    async fn forward(&self, ctx: &StepContext) -> Result<()> {
        let peer = self.peer.resolve(ctx).await?;
        let command = ctx
            .provider_in(&ctx.infra.environment)?
            .create_pub_key_command(&peer.address)
            .await?;
        let output = ctx.run_script(&peer, &command).await?;
        let key = output
            .first_line()
            .ok_or_else(|| StepError::Failed(format!("No public key returned by {}", peer.hostname)))?;

        info!(peer = %peer.address, host = %ctx.host.address, "Authorizing public key");
        let script = format!("echo \"{}\" >> ~/.ssh/authorized_keys", key);
        ctx.run_script(&ctx.host, &script).await?;
        Ok(())
    }

    async fn backward(&self, ctx: &StepContext) -> Result<()> {
        let peer = self.peer.resolve(ctx).await?;
        let command = ctx
            .provider_in(&ctx.infra.environment)?
            .remove_pub_key_command(&peer.address)
            .await?;
        ctx.run_script(&peer, &command).await?;
        Ok(())
    }
}

pub fn create_pub_key_migrate() -> PubKey {
    PubKey::new("create_pub_key_migrate", HostRef::MigrationSource)
}

pub fn remove_pub_key_migrate() -> PubKey {
    create_pub_key_migrate().reversed("remove_pub_key_migrate")
}

pub fn create_pub_key_migrate_backup_host() -> PubKey {
    PubKey::new(
        "create_pub_key_migrate_backup_host",
        HostRef::SnapshotOwner(SnapshotRef::SharedMigration),
    )
}

pub fn remove_pub_key_migrate_backup_host() -> PubKey {
    create_pub_key_migrate_backup_host().reversed("remove_pub_key_migrate_backup_host")
}
