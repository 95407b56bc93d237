//! Step execution context
//!
//! A [`StepContext`] is built once per instance and pipeline run and passed
//! to every step call. It carries the records the pipeline was started
//! with plus handles to every collaborator ([`Services`]). Anything a step
//! may have changed (volumes, snapshots, migration records) is read back
//! from the store instead of being cached here.

use crate::capability::{EngineDriver, HostVmProvider, RemoteExecutor, ScriptOutput};
use crate::config::StepsConfig;
use crate::error::{RemoteError, Result, StepError};
use dbaas_common::{
    ChangePersistence, DatabaseMigrate, DiskTypeUpgrade, Host, HostMigrate, Id, Infra, Instance,
    Maintenance, Resize, Restore, Store,
};
use dbaas_volume::{InfraScope, ProviderFactory, SnapshotManager, VmLocation, VolumeManager, VolumeProvider};
use std::sync::Arc;
use tracing::{debug, warn};

/// Collaborators shared by every step of a run
pub struct Services {
    pub store: Arc<dyn Store>,
    pub volumes: VolumeManager,
    pub remote: Arc<dyn RemoteExecutor>,
    pub driver: Arc<dyn EngineDriver>,
    pub vms: Arc<dyn HostVmProvider>,
    pub config: StepsConfig,
}

impl Services {
    pub fn new(
        store: Arc<dyn Store>,
        providers: Arc<dyn ProviderFactory>,
        remote: Arc<dyn RemoteExecutor>,
        driver: Arc<dyn EngineDriver>,
        vms: Arc<dyn HostVmProvider>,
    ) -> Self {
        Self {
            volumes: VolumeManager::new(store.clone(), providers),
            store,
            remote,
            driver,
            vms,
            config: StepsConfig::default(),
        }
    }

    pub fn with_config(mut self, config: StepsConfig) -> Self {
        self.config = config;
        self
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Everything a step needs to act on one instance
#[derive(Clone)]
pub struct StepContext {
    pub instance: Instance,
    /// Host of `instance`
    pub host: Host,
    pub infra: Infra,
    services: Arc<Services>,

    /// Maintenance record driving this run
    pub maintenance_id: Option<Id>,
    pub host_migrate_id: Option<Id>,
    pub restore: Option<Restore>,
    pub resize: Option<Resize>,
    pub disk_upgrade: Option<DiskTypeUpgrade>,
    pub change_persistence: Option<ChangePersistence>,
    /// Data must be moved by the initialization script (upgrade, VM
    /// reinstall, engine migration)
    pub need_move_data: bool,
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("instance", &self.instance.id)
            .field("host", &self.host.hostname)
            .field("infra", &self.infra.name)
            .field("maintenance_id", &self.maintenance_id)
            .field("host_migrate_id", &self.host_migrate_id)
            .finish_non_exhaustive()
    }
}

impl StepContext {
    pub fn new(services: Arc<Services>, instance: Instance, host: Host, infra: Infra) -> Self {
        Self {
            instance,
            host,
            infra,
            services,
            maintenance_id: None,
            host_migrate_id: None,
            restore: None,
            resize: None,
            disk_upgrade: None,
            change_persistence: None,
            need_move_data: false,
        }
    }

    /// Read the instance, its host and its infra from the store
    pub async fn load(services: Arc<Services>, instance_id: Id) -> Result<Self> {
        let instance = services.store.get_instance(instance_id).await?;
        let host = services.store.get_host(instance.host_id).await?;
        let infra = services.store.get_infra(instance.infra_id).await?;
        Ok(Self::new(services, instance, host, infra))
    }

    pub fn with_maintenance(mut self, maintenance_id: Id) -> Self {
        self.maintenance_id = Some(maintenance_id);
        self
    }

    pub fn with_host_migrate(mut self, host_migrate_id: Id) -> Self {
        self.host_migrate_id = Some(host_migrate_id);
        self
    }

    pub fn with_restore(mut self, restore: Restore) -> Self {
        self.restore = Some(restore);
        self
    }

    pub fn with_resize(mut self, resize: Resize) -> Self {
        self.resize = Some(resize);
        self
    }

    pub fn with_disk_upgrade(mut self, upgrade: DiskTypeUpgrade) -> Self {
        self.disk_upgrade = Some(upgrade);
        self
    }

    pub fn with_change_persistence(mut self, change: ChangePersistence) -> Self {
        self.change_persistence = Some(change);
        self
    }

    pub fn with_move_data(mut self, need_move_data: bool) -> Self {
        self.need_move_data = need_move_data;
        self
    }

    /// Same run, acting on another instance of the infra
    pub async fn for_instance(&self, instance: Instance) -> Result<Self> {
        let host = self.store().get_host(instance.host_id).await?;
        Ok(Self {
            instance,
            host,
            ..self.clone()
        })
    }

    // ------------------------------------------------------------------
    // Collaborators
    // ------------------------------------------------------------------

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn store(&self) -> &dyn Store {
        self.services.store.as_ref()
    }

    pub fn volumes(&self) -> &VolumeManager {
        &self.services.volumes
    }

    pub fn snapshots(&self) -> SnapshotManager {
        self.services.volumes.snapshots()
    }

    pub fn driver(&self) -> &dyn EngineDriver {
        self.services.driver.as_ref()
    }

    pub fn config(&self) -> &StepsConfig {
        &self.services.config
    }

    /// Provider scope of the infra in `environment`
    pub fn scope_in(&self, environment: &str) -> InfraScope {
        InfraScope::for_infra(&self.infra).with_environment(environment)
    }

    pub fn provider_in(&self, environment: &str) -> Result<Arc<dyn VolumeProvider>> {
        Ok(self.volumes().provider(&self.scope_in(environment))?)
    }

    pub async fn vm(&self, host: &Host) -> Result<VmLocation> {
        Ok(self.services.vms.vm_for_host(host).await?)
    }

    // ------------------------------------------------------------------
    // Operation records
    // ------------------------------------------------------------------

    pub async fn maintenance(&self) -> Result<Maintenance> {
        let id = self
            .maintenance_id
            .ok_or_else(|| StepError::Precondition("No maintenance bound to this run".to_string()))?;
        Ok(self.store().get_maintenance(id).await?)
    }

    pub async fn host_migrate(&self) -> Result<Option<HostMigrate>> {
        match self.host_migrate_id {
            Some(id) => Ok(Some(self.store().get_host_migrate(id).await?)),
            None => Ok(None),
        }
    }

    pub async fn require_host_migrate(&self) -> Result<HostMigrate> {
        self.host_migrate()
            .await?
            .ok_or_else(|| StepError::Precondition("No host migration bound to this run".to_string()))
    }

    /// Database migration the current host migration belongs to
    pub async fn database_migrate(&self) -> Result<Option<DatabaseMigrate>> {
        let Some(host_migrate) = self.host_migrate().await? else {
            return Ok(None);
        };
        match host_migrate.database_migrate_id {
            Some(id) => Ok(Some(self.store().get_database_migrate(id).await?)),
            None => Ok(None),
        }
    }

    pub fn require_restore(&self) -> Result<&Restore> {
        self.restore
            .as_ref()
            .ok_or_else(|| StepError::Precondition("No restore bound to this run".to_string()))
    }

    /// Environment the step acts in unless told otherwise: the migration's
    /// destination while a host migration runs, the infra's otherwise
    pub async fn environment(&self) -> Result<String> {
        Ok(match self.host_migrate().await? {
            Some(migrate) => migrate.environment,
            None => self.infra.environment.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    pub async fn is_first(&self) -> Result<bool> {
        Ok(self.store().first_instance(self.infra.id).await?.id == self.instance.id)
    }

    pub async fn is_last(&self) -> Result<bool> {
        Ok(self.store().last_instance(self.infra.id).await?.id == self.instance.id)
    }

    pub async fn master(&self) -> Result<Instance> {
        Ok(self.driver().master_instance(&self.infra).await?)
    }

    // ------------------------------------------------------------------
    // Remote execution
    // ------------------------------------------------------------------

    /// Run a script on `host`, failing on a non-zero exit
    pub async fn run_script(&self, host: &Host, script: &str) -> Result<ScriptOutput> {
        let output = self.run_script_raw(host, script).await?;
        if !output.is_success() {
            warn!(
                host = %host.address,
                exit_code = output.exit_code,
                "Script failed"
            );
            return Err(RemoteError::Failed {
                host: host.address.clone(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            }
            .into());
        }
        Ok(output)
    }

    /// Run a script on `host`, returning channel failures as errors but
    /// leaving the exit code to the caller
    pub async fn run_script_raw(&self, host: &Host, script: &str) -> std::result::Result<ScriptOutput, RemoteError> {
        debug!(host = %host.address, instance = %self.instance, script, "Running script");
        self.services.remote.run_script(host, script).await
    }

    /// Run a provider-computed command if the provider returned one
    pub async fn run_command(&self, host: &Host, command: &str) -> Result<()> {
        if command.trim().is_empty() {
            debug!(host = %host.address, "Provider returned no command");
            return Ok(());
        }
        self.run_script(host, command).await?;
        Ok(())
    }
}
