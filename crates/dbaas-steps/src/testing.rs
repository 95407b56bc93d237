//! In-memory fakes of every step collaborator
//!
//! Available to this crate's tests and, behind the `testing` feature, to
//! downstream crates. [`Fixture`] wires them to a [`MemoryStore`] holding a
//! two-instance infra.

use crate::capability::{BinlogPosition, EngineDriver, HostVmProvider, RemoteExecutor, Row, ScriptOutput, Vars};
use crate::config::StepsConfig;
use crate::context::{Services, StepContext};
use crate::error::{EngineError, RemoteError, Result, StepError};
use crate::gating::Gate;
use crate::traits::{Doable, Gated, Reversibility, Step, Undoable};
use async_trait::async_trait;
use chrono::Utc;
use dbaas_common::{
    DatabaseMigrate, DiskOffering, DiskOfferingType, Host, HostMigrate, Id, Infra, Instance, InstancePair,
    Maintenance, MemoryStore, Offering, Plan, PlanScripts, Restore, Snapshot, SnapshotStatus, Store, Volume,
};
use dbaas_volume::{
    CopyFilesRequest, CreateVolumeRequest, HostCommand, MountRequest, PollingConfig, ProviderError, ProviderFactory,
    ProviderResult, ResourceLabels, RestoreRequest, SnapshotCopy, SnapshotCopyRequest, SnapshotReply, SnapshotState,
    TakenSnapshot, VmLocation, VolumeDetails, VolumeProvider,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Volume provider
// ============================================================================

/// One provider call as seen by [`RecordingProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub environment: String,
    pub operation: &'static str,
    /// Volume/snapshot identifier or host address the call was about
    pub target: String,
}

#[derive(Debug, Default)]
struct ProviderState {
    calls: Vec<Call>,
    created: Vec<CreateVolumeRequest>,
    restores: Vec<RestoreRequest>,
    /// `persist` flag of every snapshot request
    persisted: Vec<bool>,
    counter: u32,
    failing: HashSet<&'static str>,
    snapshot_states: VecDeque<String>,
    snapshot_warning: Option<String>,
    reject_snapshots: bool,
    new_disk_migration: bool,
    labels_updated: bool,
    host_commands: BTreeMap<&'static str, String>,
}

/// Volume provider that records every call and answers from a script
///
/// Clones share state; [`RecordingProvider::factory`] hands out handles
/// bound to the requested environment.
#[derive(Debug, Clone)]
pub struct RecordingProvider {
    environment: String,
    state: Arc<Mutex<ProviderState>>,
}

impl Default for RecordingProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingProvider {
    pub fn new() -> Self {
        let state = ProviderState {
            labels_updated: true,
            ..Default::default()
        };
        Self {
            environment: String::new(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn factory(&self) -> Arc<dyn ProviderFactory> {
        Arc::new(RecordingFactory(self.clone()))
    }

    pub fn calls(&self) -> Vec<Call> {
        locked(&self.state).calls.clone()
    }

    pub fn operations(&self) -> Vec<&'static str> {
        locked(&self.state).calls.iter().map(|c| c.operation).collect()
    }

    pub fn count(&self, operation: &str) -> usize {
        locked(&self.state)
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn created(&self) -> Vec<CreateVolumeRequest> {
        locked(&self.state).created.clone()
    }

    pub fn restores(&self) -> Vec<RestoreRequest> {
        locked(&self.state).restores.clone()
    }

    pub fn persisted(&self) -> Vec<bool> {
        locked(&self.state).persisted.clone()
    }

    /// Make `operation` fail with a 500
    pub fn fail(&self, operation: &'static str) {
        locked(&self.state).failing.insert(operation);
    }

    /// States returned by successive `snapshot_state` calls; `READY` after
    pub fn script_snapshot_states(&self, states: &[&str]) {
        locked(&self.state).snapshot_states = states.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_snapshot_warning(&self, warning: &str) {
        locked(&self.state).snapshot_warning = Some(warning.to_string());
    }

    pub fn reject_snapshots(&self) {
        locked(&self.state).reject_snapshots = true;
    }

    pub fn set_new_disk_migration(&self, enabled: bool) {
        locked(&self.state).new_disk_migration = enabled;
    }

    pub fn set_labels_updated(&self, updated: bool) {
        locked(&self.state).labels_updated = updated;
    }

    /// Command returned for a host command instead of the default
    pub fn set_host_command(&self, command: HostCommand, script: &str) {
        locked(&self.state).host_commands.insert(command.path(), script.to_string());
    }

    fn record(&self, operation: &'static str, target: impl Into<String>) -> ProviderResult<()> {
        let mut state = locked(&self.state);
        state.calls.push(Call {
            environment: self.environment.clone(),
            operation,
            target: target.into(),
        });
        if state.failing.contains(operation) {
            return Err(ProviderError::Http {
                operation,
                status: 500,
                body: format!("{} failed", operation),
            });
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = locked(&self.state);
        state.counter += 1;
        format!("{}-{}", prefix, state.counter)
    }

    fn taken(&self) -> TakenSnapshot {
        let identifier = self.next_id("snap");
        TakenSnapshot {
            description: Some(format!("/snapshots/{}", identifier)),
            identifier,
            size: Some(1024),
            warning: locked(&self.state).snapshot_warning.clone(),
        }
    }
}

struct RecordingFactory(RecordingProvider);

impl ProviderFactory for RecordingFactory {
    fn provider(&self, environment: &str, _namespace: &str) -> ProviderResult<Arc<dyn VolumeProvider>> {
        Ok(Arc::new(RecordingProvider {
            environment: environment.to_string(),
            state: self.0.state.clone(),
        }))
    }
}

#[async_trait]
impl VolumeProvider for RecordingProvider {
    fn environment(&self) -> &str {
        &self.environment
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> ProviderResult<String> {
        self.record("create_volume", request.to_address.clone())?;
        locked(&self.state).created.push(request.clone());
        Ok(self.next_id("vol-new"))
    }

    async fn get_volume(&self, identifier: &str) -> ProviderResult<VolumeDetails> {
        self.record("get_volume", identifier)?;
        Ok(VolumeDetails {
            path: format!("/provider/{}", identifier),
            extra: Default::default(),
        })
    }

    async fn delete_volume(&self, identifier: &str) -> ProviderResult<()> {
        self.record("delete_volume", identifier)
    }

    async fn attach_disk(&self, identifier: &str, _vm: &VmLocation) -> ProviderResult<()> {
        self.record("attach_disk", identifier)
    }

    async fn detach_disk(&self, identifier: &str) -> ProviderResult<()> {
        self.record("detach_disk", identifier)
    }

    async fn move_disk(&self, identifier: &str, zone: &str) -> ProviderResult<()> {
        self.record("move_disk", format!("{}@{}", identifier, zone))
    }

    async fn resize(&self, identifier: &str, new_size_kb: u64) -> ProviderResult<()> {
        self.record("resize", format!("{}:{}", identifier, new_size_kb))
    }

    async fn mount_command(&self, identifier: &str, request: &MountRequest) -> ProviderResult<String> {
        self.record("mount_command", identifier)?;
        Ok(format!("mount {} {}", identifier, request.data_directory))
    }

    async fn umount_command(&self, identifier: &str, data_directory: &str) -> ProviderResult<String> {
        self.record("umount_command", identifier)?;
        Ok(format!("umount {} {}", identifier, data_directory))
    }

    async fn resize2fs_command(&self, identifier: &str) -> ProviderResult<String> {
        self.record("resize2fs_command", identifier)?;
        Ok(format!("resize2fs {}", identifier))
    }

    async fn cleanup_command(&self, identifier: &str) -> ProviderResult<String> {
        self.record("cleanup_command", identifier)?;
        Ok(format!("cleanup {}", identifier))
    }

    async fn host_command(&self, command: HostCommand, host_ip: &str) -> ProviderResult<String> {
        self.record(command.path(), host_ip)?;
        let scripted = locked(&self.state).host_commands.get(command.path()).cloned();
        Ok(scripted.unwrap_or_else(|| format!("{} {}", command.path(), host_ip)))
    }

    async fn copy_files_command(&self, request: &CopyFilesRequest) -> ProviderResult<String> {
        self.record("copy_files_command", request.snap_identifier.clone())?;
        Ok(format!(
            "copy {} {} {} {}",
            request.snap_identifier, request.source_dir, request.dest_dir, request.snap_dir
        ))
    }

    async fn snapshot_copy_command(
        &self,
        method: SnapshotCopy,
        snapshot_identifier: &str,
        request: &SnapshotCopyRequest,
    ) -> ProviderResult<String> {
        let operation = match method {
            SnapshotCopy::Scp => "scp_command",
            SnapshotCopy::Rsync => "rsync_command",
        };
        self.record(operation, snapshot_identifier)?;
        Ok(format!(
            "{} {} {} {}:{}",
            method.path(),
            snapshot_identifier,
            request.source_dir,
            request.target_ip,
            request.target_dir
        ))
    }

    async fn take_snapshot(
        &self,
        volume_identifier: &str,
        _labels: &ResourceLabels,
        persist: bool,
    ) -> ProviderResult<TakenSnapshot> {
        self.record("take_snapshot", volume_identifier)?;
        locked(&self.state).persisted.push(persist);
        Ok(self.taken())
    }

    async fn new_take_snapshot(
        &self,
        volume_identifier: &str,
        _labels: &ResourceLabels,
        persist: bool,
    ) -> ProviderResult<SnapshotReply> {
        self.record("new_take_snapshot", volume_identifier)?;
        locked(&self.state).persisted.push(persist);
        if locked(&self.state).reject_snapshots {
            return Ok(SnapshotReply::Rejected {
                status: 409,
                body: "quota exceeded".to_string(),
            });
        }
        Ok(SnapshotReply::Accepted(self.taken()))
    }

    async fn snapshot_state(&self, snapshot_identifier: &str) -> ProviderResult<SnapshotState> {
        self.record("snapshot_state", snapshot_identifier)?;
        let next = locked(&self.state).snapshot_states.pop_front();
        Ok(SnapshotState {
            snapshot_status: next.unwrap_or_else(|| "READY".to_string()),
        })
    }

    async fn delete_snapshot(&self, snapshot_identifier: &str, _force: bool) -> ProviderResult<bool> {
        self.record("delete_snapshot", snapshot_identifier)?;
        Ok(true)
    }

    async fn restore_snapshot(&self, snapshot_identifier: &str, request: &RestoreRequest) -> ProviderResult<String> {
        self.record("restore_snapshot", snapshot_identifier)?;
        locked(&self.state).restores.push(request.clone());
        Ok(self.next_id("vol-restored"))
    }

    async fn restore_snapshot_to_rsync(&self, snapshot_identifier: &str, request: &RestoreRequest) -> ProviderResult<()> {
        self.record("restore_snapshot_to_rsync", snapshot_identifier)?;
        locked(&self.state).restores.push(request.clone());
        Ok(())
    }

    async fn add_access(&self, identifier: &str, to_address: &str, _access_type: Option<&str>) -> ProviderResult<()> {
        self.record("add_access", format!("{}->{}", identifier, to_address))
    }

    async fn remove_access(&self, identifier: &str, address: &str) -> ProviderResult<()> {
        self.record("remove_access", format!("{}->{}", identifier, address))
    }

    async fn should_migrate_with_new_disk(&self) -> ProviderResult<bool> {
        Ok(locked(&self.state).new_disk_migration)
    }

    async fn update_team_labels(&self, vm_name: &str, _team_name: &str, _zone: &str) -> ProviderResult<bool> {
        self.record("update_team_labels", vm_name)?;
        Ok(locked(&self.state).labels_updated)
    }
}

// ============================================================================
// Remote execution
// ============================================================================

/// Canned answer of [`ScriptedRemote`]
#[derive(Debug, Clone)]
pub enum Reply {
    Output(ScriptOutput),
    /// The channel breaks before a result arrives
    ChannelError,
}

#[derive(Debug, Default)]
struct RemoteState {
    runs: Vec<(String, String)>,
    fixed: Vec<(String, ScriptOutput)>,
    queued: Vec<(String, VecDeque<Reply>)>,
}

/// Remote executor answering by script substring
///
/// Queued replies are consumed first, then fixed ones; anything unmatched
/// succeeds with no output.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, contains: &str, output: ScriptOutput) {
        locked(&self.state).fixed.push((contains.to_string(), output));
    }

    pub fn respond_seq(&self, contains: &str, replies: Vec<Reply>) {
        locked(&self.state)
            .queued
            .push((contains.to_string(), replies.into_iter().collect()));
    }

    /// Scripts run so far, in order
    pub fn scripts(&self) -> Vec<String> {
        locked(&self.state).runs.iter().map(|(_, s)| s.clone()).collect()
    }

    /// `(host address, script)` pairs, in order
    pub fn runs(&self) -> Vec<(String, String)> {
        locked(&self.state).runs.clone()
    }

    pub fn count(&self, contains: &str) -> usize {
        locked(&self.state)
            .runs
            .iter()
            .filter(|(_, s)| s.contains(contains))
            .count()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedRemote {
    async fn run_script(&self, host: &Host, script: &str) -> std::result::Result<ScriptOutput, RemoteError> {
        let mut state = locked(&self.state);
        state.runs.push((host.address.clone(), script.to_string()));

        let queued = state
            .queued
            .iter_mut()
            .find(|(pattern, replies)| script.contains(pattern.as_str()) && !replies.is_empty())
            .and_then(|(_, replies)| replies.pop_front());
        let reply = queued.or_else(|| {
            state
                .fixed
                .iter()
                .find(|(pattern, _)| script.contains(pattern.as_str()))
                .map(|(_, output)| Reply::Output(output.clone()))
        });

        match reply {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::ChannelError) => Err(RemoteError::Channel {
                host: host.address.clone(),
                reason: "connection reset".to_string(),
            }),
            None => Ok(ScriptOutput::default()),
        }
    }
}

// ============================================================================
// Engine driver and VM lookup
// ============================================================================

#[derive(Debug, Default)]
struct DriverState {
    master_id: Option<Id>,
    replication: VecDeque<bool>,
    query_rows: Vec<(String, Vec<Row>)>,
    calls: Vec<String>,
}

/// Engine driver over a [`MemoryStore`] with scripted answers
#[derive(Clone)]
pub struct FakeDriver {
    store: Arc<MemoryStore>,
    state: Arc<Mutex<DriverState>>,
}

impl std::fmt::Debug for FakeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeDriver").finish_non_exhaustive()
    }
}

impl FakeDriver {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            state: Arc::default(),
        }
    }

    /// Master instance; defaults to the first instance of the infra
    pub fn set_master(&self, instance_id: Id) {
        locked(&self.state).master_id = Some(instance_id);
    }

    /// Answers of successive `is_replication_ok` calls; `true` after
    pub fn script_replication(&self, answers: &[bool]) {
        locked(&self.state).replication = answers.iter().copied().collect();
    }

    pub fn respond_query(&self, contains: &str, rows: Vec<Row>) {
        locked(&self.state).query_rows.push((contains.to_string(), rows));
    }

    /// Calls made so far, as `operation(args)` strings
    pub fn calls(&self) -> Vec<String> {
        locked(&self.state).calls.clone()
    }

    fn record(&self, call: String) {
        locked(&self.state).calls.push(call);
    }
}

#[async_trait]
impl EngineDriver for FakeDriver {
    fn topology_name(&self) -> String {
        "mysql_foxha".to_string()
    }

    async fn master_instance(&self, infra: &Infra) -> std::result::Result<Instance, EngineError> {
        let master_id = locked(&self.state).master_id;
        let instances = self
            .store
            .instances(infra.id)
            .await
            .map_err(|e| EngineError::Driver(e.to_string()))?;
        let master = match master_id {
            Some(id) => instances.into_iter().find(|i| i.id == id),
            None => instances.into_iter().next(),
        };
        master.ok_or(EngineError::NoMaster(infra.id))
    }

    async fn check_instance_is_master(&self, instance: &Instance) -> std::result::Result<bool, EngineError> {
        let infra = self
            .store
            .get_infra(instance.infra_id)
            .await
            .map_err(|e| EngineError::Driver(e.to_string()))?;
        Ok(self.master_instance(&infra).await?.id == instance.id)
    }

    async fn is_replication_ok(&self, instance: &Instance) -> std::result::Result<bool, EngineError> {
        self.record(format!("is_replication_ok({})", instance.id));
        Ok(locked(&self.state).replication.pop_front().unwrap_or(true))
    }

    async fn query(&self, sql: &str, instance: &Instance) -> std::result::Result<Vec<Row>, EngineError> {
        self.record(format!("query({}, {})", instance.id, sql));
        Ok(locked(&self.state)
            .query_rows
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn set_configuration(&self, instance: &Instance, name: &str, value: &str) -> std::result::Result<(), EngineError> {
        self.record(format!("set_configuration({}, {}, {})", instance.id, name, value));
        Ok(())
    }

    async fn replication_info_from_file(&self, host: &Host) -> std::result::Result<BinlogPosition, EngineError> {
        self.record(format!("replication_info_from_file({})", host.id));
        Ok(BinlogPosition {
            file: "mysql-bin.000001".to_string(),
            position: 4,
        })
    }

    async fn master_status(&self, instance: &Instance) -> std::result::Result<BinlogPosition, EngineError> {
        self.record(format!("master_status({})", instance.id));
        Ok(BinlogPosition {
            file: "mysql-bin.000002".to_string(),
            position: 120,
        })
    }

    async fn change_master_to(
        &self,
        instance: &Instance,
        master_address: &str,
        position: &BinlogPosition,
    ) -> std::result::Result<(), EngineError> {
        self.record(format!("change_master_to({}, {}, {})", instance.id, master_address, position));
        Ok(())
    }

    async fn start_slave(&self, instance: &Instance) -> std::result::Result<(), EngineError> {
        self.record(format!("start_slave({})", instance.id));
        Ok(())
    }

    async fn save_binlog_position(&self, instance: &Instance) -> std::result::Result<(), EngineError> {
        self.record(format!("save_binlog_position({})", instance.id));
        Ok(())
    }

    async fn set_master(&self, instance: &Instance) -> std::result::Result<(), EngineError> {
        self.record(format!("set_master({})", instance.id));
        Ok(())
    }

    async fn set_read_ip(&self, instance: &Instance) -> std::result::Result<(), EngineError> {
        self.record(format!("set_read_ip({})", instance.id));
        Ok(())
    }

    fn configuration(&self, _infra: &Infra, memory_size_mb: u64) -> Option<Value> {
        Some(json!({ "innodb_buffer_pool_size": format!("{}M", memory_size_mb / 2) }))
    }

    fn configuration_parameters(&self, _instance: &Instance) -> Vars {
        Vars::from([("SERVER_ROLE".to_string(), json!("replica"))])
    }

    fn configuration_parameters_migration(&self, _instance: &Instance) -> Vars {
        Vars::from([("MIGRATION".to_string(), json!(true))])
    }

    fn configuration_parameters_for_log_resize(&self, _instance: &Instance) -> Vars {
        Vars::from([("LOG_RESIZE".to_string(), json!(true))])
    }

    fn master_parameters(&self, _instance: &Instance, master: &Instance) -> Vars {
        Vars::from([("MASTER_ADDRESS".to_string(), json!(master.address))])
    }

    fn start_replication_parameters(&self, instance: &Instance) -> Vars {
        Vars::from([("REPLICA_ADDRESS".to_string(), json!(instance.address))])
    }
}

/// VM lookup naming each VM after the host's short name
#[derive(Debug, Clone)]
pub struct StaticVms {
    zone: String,
}

impl Default for StaticVms {
    fn default() -> Self {
        Self {
            zone: "zone-a".to_string(),
        }
    }
}

#[async_trait]
impl HostVmProvider for StaticVms {
    async fn vm_for_host(&self, host: &Host) -> std::result::Result<VmLocation, EngineError> {
        Ok(VmLocation::new(host.short_name(), self.zone.clone()))
    }
}

// ============================================================================
// Steps
// ============================================================================

/// Step counting its calls, optionally failing, for executor tests
pub struct CountingStep {
    name: String,
    pub applied: Arc<AtomicU32>,
    pub reverted: Arc<AtomicU32>,
    journal: Option<Arc<Mutex<Vec<String>>>>,
    fail_apply: bool,
    fail_revert: bool,
    irreversible: bool,
    gate: Gate,
    runnable: bool,
}

impl CountingStep {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            applied: Arc::default(),
            reverted: Arc::default(),
            journal: None,
            fail_apply: false,
            fail_revert: false,
            irreversible: false,
            gate: Gate::always(),
            runnable: true,
        }
    }

    /// Append `do:{name}` / `undo:{name}` to a shared journal
    pub fn with_journal(mut self, journal: Arc<Mutex<Vec<String>>>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_apply = true;
        self
    }

    pub fn failing_revert(mut self) -> Self {
        self.fail_revert = true;
        self
    }

    pub fn irreversible(mut self) -> Self {
        self.irreversible = true;
        self
    }

    pub fn gated(mut self, gate: Gate) -> Self {
        self.gate = gate;
        self
    }

    pub fn not_runnable(mut self) -> Self {
        self.runnable = false;
        self
    }

    fn log(&self, entry: String) {
        if let Some(journal) = &self.journal {
            locked(journal).push(entry);
        }
    }
}

#[async_trait]
impl Gated for CountingStep {
    async fn can_run(&self, _ctx: &StepContext) -> Result<bool> {
        Ok(self.runnable)
    }

    async fn is_valid(&self, ctx: &StepContext) -> Result<bool> {
        self.gate.allows(ctx).await
    }
}

#[async_trait]
impl Doable for CountingStep {
    async fn apply(&self, _ctx: &StepContext) -> Result<()> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        self.log(format!("do:{}", self.name));
        if self.fail_apply {
            return Err(StepError::Failed(format!("{} failed", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl Undoable for CountingStep {
    async fn revert(&self, _ctx: &StepContext) -> Result<()> {
        self.reverted.fetch_add(1, Ordering::SeqCst);
        self.log(format!("undo:{}", self.name));
        if self.fail_revert {
            return Err(StepError::Failed(format!("{} undo failed", self.name)));
        }
        Ok(())
    }

    fn reversibility(&self) -> Reversibility {
        if self.irreversible {
            Reversibility::Irreversible("There is no rollback for this step.")
        } else {
            Reversibility::Reversible
        }
    }
}

impl Step for CountingStep {
    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Fixture
// ============================================================================

pub const RESTORE_GROUP: Id = 10;
pub const RESTORE_NEW_GROUP: Id = 11;

/// Two-instance MySQL infra in `dev` with one active volume per host
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub provider: RecordingProvider,
    pub remote: ScriptedRemote,
    pub driver: FakeDriver,
    pub services: Arc<Services>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(StepsConfig::default()).await
    }

    pub async fn with_config(config: StepsConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;

        let provider = RecordingProvider::new();
        let remote = ScriptedRemote::new();
        let driver = FakeDriver::new(store.clone());
        let config = config.with_polling(PollingConfig::immediate());
        let services = Services::new(
            store.clone(),
            provider.factory(),
            Arc::new(remote.clone()),
            Arc::new(driver.clone()),
            Arc::new(StaticVms::default()),
        )
        .with_config(config);

        Self {
            store,
            provider,
            remote,
            driver,
            services: Arc::new(services),
        }
    }

    /// Adds a destination host 3 paired with host 1, database migration 1
    /// to `gcp-dev` and host migration 1 of host 1
    pub async fn with_host_migration(self) -> Self {
        let store = &self.store;
        let seeded = async {
            store.put_host(&Host::new(3, "db-03.gcp", "10.1.0.1")).await?;
            let host = store.get_host(1).await?.with_future_host(3);
            store.put_host(&host).await?;
            store
                .put_database_migrate(&DatabaseMigrate {
                    id: 1,
                    infra_id: 1,
                    environment: "gcp-dev".to_string(),
                    origin_environment: "dev".to_string(),
                    host_migrate_snapshot_id: None,
                })
                .await?;
            store
                .put_host_migrate(&HostMigrate {
                    id: 1,
                    host_id: 1,
                    environment: "gcp-dev".to_string(),
                    zone: "zone-b".to_string(),
                    zone_origin: "zone-a".to_string(),
                    snapshot_id: None,
                    database_migrate_id: Some(1),
                })
                .await
        };
        if let Err(e) = seeded.await {
            panic!("seeding host migration failed: {}", e);
        }
        self
    }

    /// Restore pairing instance 1 (master) with instance 2
    pub fn restore(&self) -> Restore {
        Restore {
            id: 1,
            group_id: RESTORE_GROUP,
            new_group_id: RESTORE_NEW_GROUP,
            pairs: vec![InstancePair {
                master_id: 1,
                slave_id: 2,
            }],
        }
    }

    /// Context for `instance_id`, bound to maintenance 1
    pub async fn context(&self, instance_id: Id) -> StepContext {
        match StepContext::load(self.services.clone(), instance_id).await {
            Ok(ctx) => ctx.with_maintenance(1),
            Err(e) => panic!("instance {} not seeded: {}", instance_id, e),
        }
    }

    /// Persist a finished snapshot of `volume_id`, adjusted by `edit`
    pub async fn snapshot(&self, instance_id: Id, volume_id: Id, edit: impl FnOnce(&mut Snapshot)) -> Snapshot {
        let next = self.store.all_snapshots().map(|s| s.len() + 1).unwrap_or(1);
        let mut snapshot = Snapshot::pending(instance_id, RESTORE_GROUP, Some(volume_id), "dev");
        snapshot.snapshot_id = Some(format!("snap-{}", next));
        snapshot.status = SnapshotStatus::Success;
        snapshot.end_at = Some(Utc::now());
        edit(&mut snapshot);
        match self.store.create_snapshot(snapshot).await {
            Ok(snapshot) => snapshot,
            Err(e) => panic!("snapshot not stored: {}", e),
        }
    }

    /// Point maintenance 1 at `snapshot_id`
    pub async fn set_maintenance_snapshot(&self, snapshot_id: Id) {
        let stored = async {
            let mut maintenance = self.store.get_maintenance(1).await?;
            maintenance.snapshot_id = Some(snapshot_id);
            self.store.put_maintenance(&maintenance).await
        };
        if let Err(e) = stored.await {
            panic!("maintenance not updated: {}", e);
        }
    }

    pub async fn volumes(&self, host_id: Id) -> Vec<Volume> {
        self.store.volumes(host_id).await.unwrap_or_default()
    }
}

pub fn infra() -> Infra {
    let mut plan = Plan::new("mysql-ha", "mysql");
    plan.scripts = PlanScripts {
        initialization: "init {{ HOST }} {{ DATABASENAME }} move={{ MOVE_DATA }}".to_string(),
        configuration: "configure {{ HOSTADDRESS }} only={{ CONFIGFILE_ONLY }}".to_string(),
        configure_log: "log {{ LOG_ENDPOINT }}".to_string(),
        start_replication: "replicate {{ HOSTADDRESS }}".to_string(),
    };
    Infra {
        id: 1,
        name: "orders-infra".to_string(),
        database_name: "orders".to_string(),
        team_name: "payments".to_string(),
        engine: "mysql_8_0".to_string(),
        environment: "dev".to_string(),
        plan,
        offering: Offering::new("c2m4", 4096, 2),
        disk_offering: DiskOffering {
            name: "8GB".to_string(),
            size_kb: 8 * 1024 * 1024,
        },
        disk_offering_type: DiskOfferingType::new("SSD").with_migration_target("gcp-dev", "pd-ssd"),
        ssl_configured: false,
        ssl_mode: None,
        migration_in_progress: false,
        user: "dbaas".to_string(),
        password: "secret".to_string(),
    }
}

async fn seed(store: &MemoryStore) {
    let seeded = async {
        store.put_infra(&infra()).await?;
        store.put_host(&Host::new(1, "db-01.dev", "10.0.0.1")).await?;
        store.put_host(&Host::new(2, "db-02.dev", "10.0.0.2")).await?;
        store
            .put_instance(&Instance::database(1, 1, 1, "10.0.0.1").with_dns("mysql-01-orders"))
            .await?;
        store
            .put_instance(&Instance::database(2, 1, 2, "10.0.0.2").with_dns("mysql-02-orders"))
            .await?;
        store.create_volume(Volume::new(1, "vol-1", 8 * 1024 * 1024)).await?;
        store.create_volume(Volume::new(2, "vol-2", 8 * 1024 * 1024)).await?;
        store.put_maintenance(&Maintenance::new(1, "test", 1, "orders")).await
    };
    if let Err(e) = seeded.await {
        panic!("seeding store failed: {}", e);
    }
}
