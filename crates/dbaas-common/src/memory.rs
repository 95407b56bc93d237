//! In-memory store for tests and local tooling

use crate::error::StoreError;
use crate::model::*;
use crate::store::Store;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

type Table<T> = RwLock<BTreeMap<Id, T>>;

/// In-memory [`Store`]
///
/// Tables are keyed by id, so listing by id gives topology order for free.
#[derive(Debug, Default)]
pub struct MemoryStore {
    infras: Table<Infra>,
    instances: Table<Instance>,
    hosts: Table<Host>,
    volumes: Table<Volume>,
    snapshots: Table<Snapshot>,
    groups: Table<BackupGroup>,
    host_migrates: Table<HostMigrate>,
    database_migrates: Table<DatabaseMigrate>,
    maintenances: Table<Maintenance>,
    /// Maintenance writes allowed before they start failing
    maintenance_writes_left: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every volume currently stored, oldest first
    pub fn all_volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.volumes.read().map_err(poisoned)?.values().cloned().collect())
    }

    /// Every snapshot currently stored, oldest first
    pub fn all_snapshots(&self) -> Result<Vec<Snapshot>> {
        Ok(self.snapshots.read().map_err(poisoned)?.values().cloned().collect())
    }

    /// Let `writes` more maintenance writes through, then fail each one
    /// with a backend error
    pub fn fail_maintenance_writes_after(&self, writes: usize) -> Result<()> {
        *self.maintenance_writes_left.lock().map_err(poisoned)? = Some(writes);
        Ok(())
    }
}

fn poisoned<T>(e: PoisonError<T>) -> StoreError {
    StoreError::Backend(format!("lock poisoned: {}", e))
}

fn get<T: Clone>(table: &Table<T>, kind: &'static str, id: Id) -> Result<T> {
    table
        .read()
        .map_err(poisoned)?
        .get(&id)
        .cloned()
        .ok_or_else(|| StoreError::not_found(kind, id))
}

fn put<T: Clone>(table: &Table<T>, id: Id, value: &T) -> Result<()> {
    table.write().map_err(poisoned)?.insert(id, value.clone());
    Ok(())
}

/// Insert under the next free id, letting `assign` stamp it on the record
fn insert_new<T: Clone>(table: &Table<T>, mut value: T, assign: impl FnOnce(&mut T, Id)) -> Result<T> {
    let mut rows = table.write().map_err(poisoned)?;
    let id = rows.keys().next_back().map_or(1, |last| last + 1);
    assign(&mut value, id);
    rows.insert(id, value.clone());
    Ok(value)
}

fn newest_first(mut snapshots: Vec<Snapshot>) -> Vec<Snapshot> {
    snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    snapshots
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_infra(&self, id: Id) -> Result<Infra> {
        get(&self.infras, "infra", id)
    }

    async fn put_infra(&self, infra: &Infra) -> Result<()> {
        put(&self.infras, infra.id, infra)
    }

    async fn get_instance(&self, id: Id) -> Result<Instance> {
        get(&self.instances, "instance", id)
    }

    async fn put_instance(&self, instance: &Instance) -> Result<()> {
        put(&self.instances, instance.id, instance)
    }

    async fn instances(&self, infra_id: Id) -> Result<Vec<Instance>> {
        Ok(self
            .instances
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|i| i.infra_id == infra_id)
            .cloned()
            .collect())
    }

    async fn get_host(&self, id: Id) -> Result<Host> {
        get(&self.hosts, "host", id)
    }

    async fn put_host(&self, host: &Host) -> Result<()> {
        put(&self.hosts, host.id, host)
    }

    async fn get_volume(&self, id: Id) -> Result<Volume> {
        get(&self.volumes, "volume", id)
    }

    async fn volumes(&self, host_id: Id) -> Result<Vec<Volume>> {
        Ok(self
            .volumes
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|v| v.host_id == host_id)
            .cloned()
            .collect())
    }

    async fn create_volume(&self, volume: Volume) -> Result<Volume> {
        insert_new(&self.volumes, volume, |v, id| v.id = id)
    }

    async fn put_volume(&self, volume: &Volume) -> Result<()> {
        put(&self.volumes, volume.id, volume)
    }

    async fn delete_volume(&self, id: Id) -> Result<()> {
        self.volumes
            .write()
            .map_err(poisoned)?
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("volume", id))
    }

    async fn get_snapshot(&self, id: Id) -> Result<Snapshot> {
        get(&self.snapshots, "snapshot", id)
    }

    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<Snapshot> {
        insert_new(&self.snapshots, snapshot, |s, id| s.id = id)
    }

    async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        put(&self.snapshots, snapshot.id, snapshot)
    }

    async fn volume_snapshots(&self, volume_id: Id) -> Result<Vec<Snapshot>> {
        let rows = self.snapshots.read().map_err(poisoned)?;
        Ok(newest_first(
            rows.values()
                .filter(|s| s.volume_id == Some(volume_id))
                .cloned()
                .collect(),
        ))
    }

    async fn instance_snapshots(&self, instance_id: Id) -> Result<Vec<Snapshot>> {
        let rows = self.snapshots.read().map_err(poisoned)?;
        Ok(newest_first(
            rows.values()
                .filter(|s| s.instance_id == instance_id)
                .cloned()
                .collect(),
        ))
    }

    async fn group_snapshots(&self, group_id: Id) -> Result<Vec<Snapshot>> {
        Ok(self
            .snapshots
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|s| s.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn create_backup_group(&self) -> Result<BackupGroup> {
        let group = BackupGroup {
            id: 0,
            created_at: Utc::now(),
        };
        insert_new(&self.groups, group, |g, id| g.id = id)
    }

    async fn get_host_migrate(&self, id: Id) -> Result<HostMigrate> {
        get(&self.host_migrates, "host migrate", id)
    }

    async fn put_host_migrate(&self, migrate: &HostMigrate) -> Result<()> {
        put(&self.host_migrates, migrate.id, migrate)
    }

    async fn get_database_migrate(&self, id: Id) -> Result<DatabaseMigrate> {
        get(&self.database_migrates, "database migrate", id)
    }

    async fn put_database_migrate(&self, migrate: &DatabaseMigrate) -> Result<()> {
        put(&self.database_migrates, migrate.id, migrate)
    }

    async fn latest_database_migrate(&self, infra_id: Id) -> Result<Option<DatabaseMigrate>> {
        Ok(self
            .database_migrates
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|m| m.infra_id == infra_id)
            .next_back()
            .cloned())
    }

    async fn get_maintenance(&self, id: Id) -> Result<Maintenance> {
        get(&self.maintenances, "maintenance", id)
    }

    async fn put_maintenance(&self, maintenance: &Maintenance) -> Result<()> {
        if let Some(left) = self.maintenance_writes_left.lock().map_err(poisoned)?.as_mut() {
            if *left == 0 {
                return Err(StoreError::Backend("maintenance writes unavailable".to_string()));
            }
            *left -= 1;
        }
        put(&self.maintenances, maintenance.id, maintenance)
    }
}
