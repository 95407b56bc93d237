//! Volume lifecycle with record bookkeeping
//!
//! [`VolumeManager`] pairs each provider call with the matching change to
//! the persisted [`Volume`] rows. Raw calls that leave records untouched
//! (attach, mount commands, access) go straight through
//! [`VolumeManager::provider`].

use crate::error::Result;
use crate::provider::{CreateVolumeRequest, ProviderFactory, ResourceLabels, VolumeProvider};
use crate::snapshot::SnapshotManager;
use dbaas_common::{Host, Infra, Store, Volume};
use std::sync::Arc;
use tracing::{debug, info};

/// Environment, namespace and labels every provider call of one infra uses
#[derive(Debug, Clone, PartialEq)]
pub struct InfraScope {
    pub environment: String,
    /// Sent as `K8S-Namespace`
    pub namespace: String,
    pub labels: ResourceLabels,
    /// Size recorded on new volume rows
    pub disk_size_kb: u64,
}

impl InfraScope {
    pub fn for_infra(infra: &Infra) -> Self {
        Self {
            environment: infra.environment.clone(),
            namespace: infra.name.clone(),
            labels: ResourceLabels {
                engine: infra.engine.clone(),
                db_name: infra.database_name.clone(),
                team_name: infra.team_name.clone(),
            },
            disk_size_kb: infra.disk_offering.size_kb,
        }
    }

    /// Same infra, addressed in another environment
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }
}

/// Parameters of a new volume
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSpec {
    pub group: String,
    pub size_kb: u64,
    pub to_address: String,
    pub snapshot_id: Option<String>,
    pub is_active: bool,
    pub zone: Option<String>,
    pub vm_name: Option<String>,
    pub disk_offering_type: Option<String>,
}

impl VolumeSpec {
    pub fn new(group: impl Into<String>, size_kb: u64) -> Self {
        Self {
            group: group.into(),
            size_kb,
            to_address: String::new(),
            snapshot_id: None,
            is_active: true,
            zone: None,
            vm_name: None,
            disk_offering_type: None,
        }
    }

    pub fn with_address(mut self, to_address: impl Into<String>) -> Self {
        self.to_address = to_address.into();
        self
    }

    pub fn with_snapshot(mut self, snapshot_id: Option<String>) -> Self {
        self.snapshot_id = snapshot_id;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn with_vm(mut self, vm_name: impl Into<String>, zone: impl Into<String>) -> Self {
        self.vm_name = Some(vm_name.into());
        self.zone = Some(zone.into());
        self
    }

    pub fn with_disk_offering_type(mut self, disk_offering_type: Option<String>) -> Self {
        self.disk_offering_type = disk_offering_type;
        self
    }
}

/// Provider calls plus volume record bookkeeping
#[derive(Clone)]
pub struct VolumeManager {
    store: Arc<dyn Store>,
    providers: Arc<dyn ProviderFactory>,
}

impl std::fmt::Debug for VolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeManager").finish_non_exhaustive()
    }
}

impl VolumeManager {
    pub fn new(store: Arc<dyn Store>, providers: Arc<dyn ProviderFactory>) -> Self {
        Self { store, providers }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn snapshots(&self) -> SnapshotManager {
        SnapshotManager::new(self.store.clone(), self.providers.clone())
    }

    /// Provider bound to the scope's environment and namespace
    pub fn provider(&self, scope: &InfraScope) -> Result<Arc<dyn VolumeProvider>> {
        Ok(self
            .providers
            .provider(&scope.environment, &scope.namespace)?)
    }

    /// Create a provider volume and persist its record on `host`
    pub async fn create_volume(&self, scope: &InfraScope, host: &Host, spec: VolumeSpec) -> Result<Volume> {
        let request = CreateVolumeRequest {
            group: spec.group,
            size_kb: spec.size_kb,
            to_address: spec.to_address,
            snapshot_id: spec.snapshot_id,
            zone: spec.zone,
            vm_name: spec.vm_name,
            labels: scope.labels.clone(),
            disk_offering_type: spec.disk_offering_type.clone(),
        };
        let identifier = self.provider(scope)?.create_volume(&request).await?;

        let mut volume = Volume::new(host.id, identifier, scope.disk_size_kb);
        volume.is_active = spec.is_active;
        volume.disk_offering_type = spec.disk_offering_type;
        let volume = self.store.create_volume(volume).await?;

        info!(
            host = %host.hostname,
            volume = %volume.identifier,
            id = volume.id,
            active = volume.is_active,
            environment = %scope.environment,
            snapshot = ?request.snapshot_id,
            "Created volume"
        );
        Ok(volume)
    }

    /// Delete a volume and its record
    ///
    /// Every unpurged snapshot of the volume except the newest is removed
    /// first, each in the environment it was taken in.
    pub async fn destroy_volume(&self, scope: &InfraScope, volume: &Volume) -> Result<()> {
        let snapshots = self.snapshots();
        let backups: Vec<_> = self
            .store
            .volume_snapshots(volume.id)
            .await?
            .into_iter()
            .filter(|s| !s.is_purged())
            .collect();

        for snapshot in backups.iter().skip(1) {
            snapshots.remove(scope, snapshot, false).await?;
        }

        info!(
            volume = %volume.identifier,
            id = volume.id,
            environment = %scope.environment,
            kept = ?backups.first().map(|s| s.id),
            "Destroying volume"
        );
        self.provider(scope)?.delete_volume(&volume.identifier).await?;
        self.store.delete_volume(volume.id).await?;
        Ok(())
    }

    /// Grow a volume to `new_size_kb` and record the new size
    pub async fn resize(&self, scope: &InfraScope, volume: &Volume, new_size_kb: u64) -> Result<Volume> {
        info!(
            volume = %volume.identifier,
            from = volume.total_size_kb,
            to = new_size_kb,
            "Resizing volume"
        );
        self.provider(scope)?.resize(&volume.identifier, new_size_kb).await?;

        let mut resized = volume.clone();
        resized.total_size_kb = new_size_kb;
        self.store.put_volume(&resized).await?;
        Ok(resized)
    }

    /// Make `volume` the host's only active volume
    pub async fn activate(&self, volume: &Volume) -> Result<Volume> {
        for mut other in self.store.volumes(volume.host_id).await? {
            if other.id != volume.id && other.is_active {
                other.is_active = false;
                self.store.put_volume(&other).await?;
            }
        }
        let mut active = volume.clone();
        active.is_active = true;
        self.store.put_volume(&active).await?;
        debug!(volume = %active.identifier, host = active.host_id, "Volume activated");
        Ok(active)
    }

    /// Provider-side mount path of a volume
    pub async fn get_path(&self, scope: &InfraScope, volume: &Volume) -> Result<String> {
        Ok(self.provider(scope)?.get_volume(&volume.identifier).await?.path)
    }

    /// Command that removes leftovers of a volume from its host
    pub async fn clean_up_command(&self, scope: &InfraScope, volume: &Volume) -> Result<String> {
        Ok(self.provider(scope)?.cleanup_command(&volume.identifier).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpProviderFactory;
    use crate::config::{Credential, ProviderConfig};
    use chrono::{Duration, Utc};
    use dbaas_common::{MemoryStore, Snapshot};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn scope() -> InfraScope {
        InfraScope {
            environment: "dev".to_string(),
            namespace: "orders-infra".to_string(),
            labels: ResourceLabels {
                engine: "mysql_8_0".to_string(),
                db_name: "orders".to_string(),
                team_name: "payments".to_string(),
            },
            disk_size_kb: 8 * 1024 * 1024,
        }
    }

    async fn setup() -> (MockServer, Arc<MemoryStore>, VolumeManager) {
        let server = MockServer::start().await;
        let config = ProviderConfig::new()
            .with_environment("dev", Credential::new(server.uri(), "dbaas"))
            .with_environment("prod", Credential::new(server.uri(), "dbaas"));
        let store = Arc::new(MemoryStore::new());
        let manager = VolumeManager::new(
            store.clone(),
            Arc::new(HttpProviderFactory::new(config).unwrap()),
        );
        (server, store, manager)
    }

    #[tokio::test]
    async fn test_create_volume_persists_record() {
        let (server, store, manager) = setup().await;
        Mock::given(method("POST"))
            .and(path("/dbaas/dev/volume/new"))
            .and(body_partial_json(json!({"snapshot_id": null, "disk_offering_type": "SSD", "size_kb": 1024})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"identifier": "vol-new"})))
            .expect(1)
            .mount(&server)
            .await;

        let host = Host::new(4, "db-01", "10.0.0.1");
        let spec = VolumeSpec::new("orders-infra", 1024)
            .with_address("10.0.0.1")
            .with_disk_offering_type(Some("SSD".to_string()));
        let volume = manager.create_volume(&scope(), &host, spec).await.unwrap();

        assert_eq!(volume.identifier, "vol-new");
        assert!(volume.is_active);
        assert_eq!(volume.host_id, 4);
        assert_eq!(volume.total_size_kb, 8 * 1024 * 1024);
        assert_eq!(store.active_volume(4).await.unwrap(), volume);
    }

    #[tokio::test]
    async fn test_create_volume_failure_persists_nothing() {
        let (server, store, manager) = setup().await;
        Mock::given(method("POST"))
            .and(path("/dbaas/dev/volume/new"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let host = Host::new(4, "db-01", "10.0.0.1");
        let result = manager
            .create_volume(&scope(), &host, VolumeSpec::new("g", 1))
            .await;
        assert!(result.is_err());
        assert!(store.all_volumes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_volume_keeps_newest_snapshot() {
        let (server, store, manager) = setup().await;
        let volume = store.create_volume(Volume::new(1, "vol-1", 1)).await.unwrap();

        let now = Utc::now();
        for (offset, token, env) in [(3, "snap-old", "prod"), (2, "snap-mid", "dev"), (1, "snap-new", "dev")] {
            let mut snapshot = Snapshot::pending(1, 1, Some(volume.id), env);
            snapshot.snapshot_id = Some(token.to_string());
            snapshot.created_at = now - Duration::hours(offset);
            store.create_snapshot(snapshot).await.unwrap();
        }

        Mock::given(method("DELETE"))
            .and(path("/dbaas/prod/snapshot/snap-old"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"removed": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/dbaas/dev/snapshot/snap-mid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"removed": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/dbaas/dev/snapshot/snap-new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"removed": true})))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/dbaas/dev/volume/vol-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        manager.destroy_volume(&scope(), &volume).await.unwrap();

        assert!(store.get_volume(volume.id).await.is_err());
        let purged: Vec<_> = store
            .all_snapshots()
            .unwrap()
            .into_iter()
            .filter(|s| s.is_purged())
            .filter_map(|s| s.snapshot_id)
            .collect();
        assert_eq!(purged, vec!["snap-old".to_string(), "snap-mid".to_string()]);
    }

    #[tokio::test]
    async fn test_resize_records_new_size() {
        let (server, store, manager) = setup().await;
        let volume = store.create_volume(Volume::new(1, "vol-1", 1024)).await.unwrap();

        Mock::given(method("POST"))
            .and(path("/dbaas/dev/resize/vol-1"))
            .and(body_partial_json(json!({"new_size_kb": 4096})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let resized = manager.resize(&scope(), &volume, 4096).await.unwrap();
        assert_eq!(resized.total_size_kb, 4096);
        assert_eq!(store.get_volume(volume.id).await.unwrap().total_size_kb, 4096);
    }

    #[tokio::test]
    async fn test_activate_swaps_active_flag() {
        let (_server, store, manager) = setup().await;
        let old = store.create_volume(Volume::new(1, "vol-old", 1)).await.unwrap();
        let mut new = Volume::new(1, "vol-new", 1);
        new.is_active = false;
        let new = store.create_volume(new).await.unwrap();

        manager.activate(&new).await.unwrap();

        assert_eq!(store.active_volume(1).await.unwrap().id, new.id);
        assert!(!store.get_volume(old.id).await.unwrap().is_active);
    }

    #[test]
    fn test_scope_with_environment() {
        let scope = scope().with_environment("prod");
        assert_eq!(scope.environment, "prod");
        assert_eq!(scope.namespace, "orders-infra");
    }
}
