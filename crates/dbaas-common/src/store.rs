//! Data-access trait
//!
//! Steps read and mutate domain records only through [`Store`]. The
//! production implementation wraps the platform database; [`MemoryStore`]
//! backs tests.
//!
//! [`MemoryStore`]: crate::MemoryStore

use crate::error::StoreError;
use crate::model::*;
use crate::Result;
use async_trait::async_trait;

/// Trait for domain record persistence
///
/// List operations return records in a stable order: instances and volumes
/// by id (topology order), snapshots newest first.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_infra(&self, id: Id) -> Result<Infra>;

    async fn put_infra(&self, infra: &Infra) -> Result<()>;

    async fn get_instance(&self, id: Id) -> Result<Instance>;

    async fn put_instance(&self, instance: &Instance) -> Result<()>;

    /// Every instance of an infra, in topology order
    async fn instances(&self, infra_id: Id) -> Result<Vec<Instance>>;

    async fn get_host(&self, id: Id) -> Result<Host>;

    async fn put_host(&self, host: &Host) -> Result<()>;

    async fn get_volume(&self, id: Id) -> Result<Volume>;

    /// Volumes owned by a host, oldest first
    async fn volumes(&self, host_id: Id) -> Result<Vec<Volume>>;

    /// Persist a new volume under a freshly assigned id
    async fn create_volume(&self, volume: Volume) -> Result<Volume>;

    /// Insert or replace a volume record
    async fn put_volume(&self, volume: &Volume) -> Result<()>;

    async fn delete_volume(&self, id: Id) -> Result<()>;

    async fn get_snapshot(&self, id: Id) -> Result<Snapshot>;

    /// Persist a new snapshot under a freshly assigned id
    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<Snapshot>;

    /// Insert or replace a snapshot record
    async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Snapshots taken from a volume, newest first
    async fn volume_snapshots(&self, volume_id: Id) -> Result<Vec<Snapshot>>;

    /// Snapshots of an instance, newest first
    async fn instance_snapshots(&self, instance_id: Id) -> Result<Vec<Snapshot>>;

    /// Snapshots belonging to a backup group
    async fn group_snapshots(&self, group_id: Id) -> Result<Vec<Snapshot>>;

    async fn create_backup_group(&self) -> Result<BackupGroup>;

    async fn get_host_migrate(&self, id: Id) -> Result<HostMigrate>;

    async fn put_host_migrate(&self, migrate: &HostMigrate) -> Result<()>;

    async fn get_database_migrate(&self, id: Id) -> Result<DatabaseMigrate>;

    async fn put_database_migrate(&self, migrate: &DatabaseMigrate) -> Result<()>;

    /// Most recent database migration of an infra, if any
    async fn latest_database_migrate(&self, infra_id: Id) -> Result<Option<DatabaseMigrate>>;

    async fn get_maintenance(&self, id: Id) -> Result<Maintenance>;

    async fn put_maintenance(&self, maintenance: &Maintenance) -> Result<()>;

    // ------------------------------------------------------------------
    // Topology queries
    // ------------------------------------------------------------------

    async fn first_instance(&self, infra_id: Id) -> Result<Instance> {
        self.instances(infra_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::not_found("instance", format!("first of infra {}", infra_id)))
    }

    async fn last_instance(&self, infra_id: Id) -> Result<Instance> {
        self.instances(infra_id)
            .await?
            .pop()
            .ok_or_else(|| StoreError::not_found("instance", format!("last of infra {}", infra_id)))
    }

    /// Data-serving instances of an infra, in topology order
    async fn database_instances(&self, infra_id: Id) -> Result<Vec<Instance>> {
        Ok(self
            .instances(infra_id)
            .await?
            .into_iter()
            .filter(|i| i.is_database)
            .collect())
    }

    /// The migration source whose `future_instance_id` points at `instance`
    async fn source_of(&self, instance: &Instance) -> Result<Option<Instance>> {
        Ok(self
            .instances(instance.infra_id)
            .await?
            .into_iter()
            .find(|i| i.future_instance_id == Some(instance.id)))
    }

    /// The host's active volume
    async fn active_volume(&self, host_id: Id) -> Result<Volume> {
        self.volumes(host_id)
            .await?
            .into_iter()
            .find(|v| v.is_active)
            .ok_or_else(|| StoreError::not_found("volume", format!("active on host {}", host_id)))
    }

    /// Most recent inactive volume of a host
    async fn inactive_volume(&self, host_id: Id) -> Result<Option<Volume>> {
        Ok(self
            .volumes(host_id)
            .await?
            .into_iter()
            .filter(|v| !v.is_active)
            .last())
    }

    async fn first_volume(&self, host_id: Id) -> Result<Option<Volume>> {
        Ok(self.volumes(host_id).await?.into_iter().next())
    }

    async fn latest_volume(&self, host_id: Id) -> Result<Option<Volume>> {
        Ok(self.volumes(host_id).await?.pop())
    }
}
