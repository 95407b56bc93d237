//! MySQL steps
//!
//! Replication wiring for restores, slave rebuilds and host/database
//! migrations, plus the handful of host scripts and engine queries MySQL
//! pipelines need (server id, audit plugin, binlog, permissions).

use super::{catalog_step, Meta};
use crate::capability::{BinlogPosition, Row};
use crate::context::StepContext;
use crate::error::{Result, StepError};
use crate::gating::{Gate, Role};
use crate::traits::{Doable, Reversibility, Undoable};
use async_trait::async_trait;
use dbaas_common::{Host, Instance};
use dbaas_volume::poll_until;
use serde_json::Value;
use tracing::{info, warn};

const NO_ROLLBACK: &str = "There is no rollback for this step.";

const DISABLE_REPLICATION_SCRIPT: &str = "sed -e 's/^#skip_slave_start/skip_slave_start/' -i /etc/my.cnf";
const ENABLE_REPLICATION_SCRIPT: &str = "sed -e 's/^skip_slave_start/#skip_slave_start/' -i /etc/my.cnf";

const DIE_IF_ERROR: &str = r#"
die_if_error()
{
    local err=$?
    if [ "$err" != "0" ]; then
        echo "$1"
        exit $err
    fi
}
"#;

const AUDIT_PLUGIN_QUERY: &str = "SELECT plugin_name, plugin_status \
     FROM INFORMATION_SCHEMA.PLUGINS WHERE plugin_name = 'audit_log';";
const INSTALL_AUDIT_PLUGIN: &str = "INSTALL PLUGIN audit_log SONAME 'audit_log.so';";
const SERVER_ID_QUERY: &str = "show variables like 'server_id'";

/// Instance a `read_only` toggle applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Own,
    /// The instance, addressed through the context host
    OwnAtHost,
    /// Destination counterpart of the instance
    Future,
}

/// Effect of a [`MysqlStep`] in one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Point the instance at its restore peer, from the master's saved
    /// coordinates
    SetMasterRestore,
    /// Make the instance and the master replicate from each other
    SetMasterRecreateSlave,
    ReadOnly {
        target: Target,
        enabled: bool,
        /// Only on the first instance of the topology
        first_only: bool,
    },
    StartSlave,
    ConfigureFoxHaRestore,
    /// Uncomment (`true`) or comment out (`false`) `skip_slave_start`
    SkipSlaveStartComment(bool),
    SaveBinlog,
    SetFilePermission,
    RunMysqlUpgrade,
    InstallAuditPlugin,
    CheckAuditPlugin,
    AppendSkipSlaveStart,
    DisableLogBin,
    /// Write the server id derived from the DNS name; `avoid_collision`
    /// bumps it when the running server already uses it
    SetServerId { avoid_collision: bool },
    /// The master replicates from the context host
    ReplicationHostMigrate,
    /// The instance replicates from the master
    ReplicationRecreateSlave,
    /// The instance's destination replicates from its peer's destination,
    /// reading the peer's live coordinates
    ReplicationFirstInstanceMigrate,
    /// Same pairing, reading the peer destination's saved coordinates
    ReplicationLastInstanceMigrate,
    CheckReplication,
    /// `true` points the instance at the new environment and its future
    /// instance at the new environment's peer; `false` restores the pairing
    /// inside each environment
    ReconfigureReplication(bool),
}

/// Compensation of a [`MysqlStep`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Undo {
    Nothing,
    Run(Action),
    Irreversible,
}

pub struct MysqlStep {
    meta: Meta,
    action: Action,
    undo: Undo,
}

catalog_step!(MysqlStep);

impl MysqlStep {
    fn new(meta: Meta, action: Action) -> Self {
        Self {
            meta,
            action,
            undo: Undo::Nothing,
        }
    }

    fn undo(mut self, undo: Undo) -> Self {
        self.undo = undo;
        self
    }
}

#[async_trait]
impl Doable for MysqlStep {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        perform(self.action, ctx).await
    }
}

#[async_trait]
impl Undoable for MysqlStep {
    async fn revert(&self, ctx: &StepContext) -> Result<()> {
        match self.undo {
            Undo::Run(action) => perform(action, ctx).await,
            Undo::Nothing | Undo::Irreversible => Ok(()),
        }
    }

    fn reversibility(&self) -> Reversibility {
        match self.undo {
            Undo::Irreversible => Reversibility::Irreversible(NO_ROLLBACK),
            _ => Reversibility::Reversible,
        }
    }
}

async fn perform(action: Action, ctx: &StepContext) -> Result<()> {
    let driver = ctx.driver();
    match action {
        Action::SetMasterRestore => apply_set_master_restore(ctx).await,
        Action::SetMasterRecreateSlave => {
            let position = driver.replication_info_from_file(&ctx.host).await?;
            let master = ctx.master().await?;
            let master_host = ctx.store().get_host(master.host_id).await?;
            change_master(ctx, &ctx.instance, &master_host.address, &position).await?;
            change_master(ctx, &master, &ctx.host.address, &position).await
        }
        Action::ReadOnly {
            target,
            enabled,
            first_only,
        } => {
            if first_only && !ctx.is_first().await? {
                return Ok(());
            }
            let instance = match target {
                Target::Own => ctx.instance.clone(),
                Target::OwnAtHost => Instance {
                    address: ctx.host.address.clone(),
                    ..ctx.instance.clone()
                },
                Target::Future => future_instance(ctx, &ctx.instance).await?,
            };
            let value = if enabled { "ON" } else { "OFF" };
            info!(instance = %instance, address = %instance.address, value, "Setting read_only");
            driver.set_configuration(&instance, "read_only", value).await?;
            Ok(())
        }
        Action::StartSlave => {
            info!(instance = %ctx.instance, "Starting slave");
            driver.start_slave(&ctx.instance).await?;
            Ok(())
        }
        Action::ConfigureFoxHaRestore => {
            if ctx.require_restore()?.is_master(ctx.instance.id) {
                driver.set_master(&ctx.instance).await?;
            } else {
                driver.set_read_ip(&ctx.instance).await?;
            }
            Ok(())
        }
        Action::SkipSlaveStartComment(uncomment) => {
            let script = if uncomment {
                DISABLE_REPLICATION_SCRIPT
            } else {
                ENABLE_REPLICATION_SCRIPT
            };
            ctx.run_script(&ctx.host, script).await?;
            Ok(())
        }
        Action::SaveBinlog => {
            info!(instance = %ctx.instance, "Saving binlog position");
            driver.save_binlog_position(&ctx.instance).await?;
            Ok(())
        }
        Action::SetFilePermission => {
            let script = format!(
                "{}\nchown mysql:mysql /data\ndie_if_error \"Error executing chown mysql:mysql /data\"\n\
                 chown -R mysql:mysql /data/*\ndie_if_error \"Error executing chown -R mysql:mysql /data/*\"\n",
                DIE_IF_ERROR
            );
            ctx.run_script(&ctx.host, &script).await?;
            Ok(())
        }
        Action::RunMysqlUpgrade => {
            let script = format!("mysql_upgrade -u{} -p{}", ctx.infra.user, ctx.infra.password);
            ctx.run_script(&ctx.host, &script).await?;
            Ok(())
        }
        Action::InstallAuditPlugin => {
            if audit_plugin_active(ctx).await? {
                info!(instance = %ctx.instance, "Audit plugin already active");
                return Ok(());
            }
            driver.query(INSTALL_AUDIT_PLUGIN, &ctx.instance).await?;
            Ok(())
        }
        Action::CheckAuditPlugin => {
            if !audit_plugin_active(ctx).await? {
                return Err(StepError::Failed("The audit plugin is not installed.".to_string()));
            }
            Ok(())
        }
        Action::AppendSkipSlaveStart => {
            ctx.run_script(&ctx.host, "echo 'skip_slave_start = 1' >> /etc/my.cnf")
                .await?;
            Ok(())
        }
        Action::DisableLogBin => {
            ctx.run_script(&ctx.host, "sed -e 's/^log_bin/#log_bin/' -i /etc/my.cnf")
                .await?;
            Ok(())
        }
        Action::SetServerId { avoid_collision } => apply_set_server_id(ctx, avoid_collision).await,
        Action::ReplicationHostMigrate => {
            let position = driver.replication_info_from_file(&ctx.host).await?;
            let master = ctx.master().await?;
            change_master(ctx, &master, &ctx.host.address, &position).await
        }
        Action::ReplicationRecreateSlave => {
            let master = ctx.master().await?;
            let master_host = ctx.store().get_host(master.host_id).await?;
            let position = driver.replication_info_from_file(&master_host).await?;
            change_master(ctx, &ctx.instance, &master_host.address, &position).await
        }
        Action::ReplicationFirstInstanceMigrate | Action::ReplicationLastInstanceMigrate => {
            migration_replication(ctx, action == Action::ReplicationFirstInstanceMigrate).await
        }
        Action::CheckReplication => check_replication(ctx).await,
        Action::ReconfigureReplication(toward_new) => reconfigure_replication(ctx, toward_new).await,
    }
}

async fn change_master(
    ctx: &StepContext,
    instance: &Instance,
    master_address: &str,
    position: &BinlogPosition,
) -> Result<()> {
    info!(
        instance = %instance,
        address = %instance.address,
        master = master_address,
        position = %position,
        "Changing master"
    );
    ctx.driver()
        .change_master_to(instance, master_address, position)
        .await?;
    Ok(())
}

async fn future_instance(ctx: &StepContext, instance: &Instance) -> Result<Instance> {
    let id = instance
        .future_instance_id
        .ok_or_else(|| StepError::Precondition(format!("Instance {} has no future instance", instance)))?;
    Ok(ctx.store().get_instance(id).await?)
}

async fn future_host(ctx: &StepContext, host: &Host) -> Result<Host> {
    let id = host
        .future_host_id
        .ok_or_else(|| StepError::Precondition(format!("Host {} has no future host", host.hostname)))?;
    Ok(ctx.store().get_host(id).await?)
}

async fn apply_set_master_restore(ctx: &StepContext) -> Result<()> {
    let restore = ctx.require_restore()?;
    let id = ctx.instance.id;
    let pair = restore
        .pairs
        .iter()
        .find(|p| p.master_id == id || p.slave_id == id)
        .ok_or_else(|| StepError::Precondition(format!("Instance {} is not part of the restore", ctx.instance)))?;

    let store = ctx.store();
    let master = store.get_instance(pair.master_id).await?;
    let master_host = store.get_host(master.host_id).await?;
    let position = ctx.driver().replication_info_from_file(&master_host).await?;

    let peer_id = if id == pair.master_id { pair.slave_id } else { pair.master_id };
    let peer = store.get_instance(peer_id).await?;
    let peer_host = store.get_host(peer.host_id).await?;
    change_master(ctx, &ctx.instance, &peer_host.address, &position).await
}

/// The instance's destination replicates from the destination of the
/// topology's other instance
async fn migration_replication(ctx: &StepContext, live_coordinates: bool) -> Result<()> {
    let store = ctx.store();
    let peer = store
        .instances(ctx.infra.id)
        .await?
        .into_iter()
        .find(|i| i.id != ctx.instance.id)
        .ok_or_else(|| StepError::NotFound(format!("No peer instance of {} found", ctx.instance)))?;
    let peer_host = store.get_host(peer.host_id).await?;
    let source = future_host(ctx, &peer_host).await?;

    let host_migrate = ctx.require_host_migrate().await?;
    let migrating = store.get_host(host_migrate.host_id).await?;
    let destination = future_host(ctx, &migrating).await?;

    let position = if live_coordinates {
        let live = Instance {
            address: source.address.clone(),
            ..ctx.instance.clone()
        };
        ctx.driver().master_status(&live).await?
    } else {
        ctx.driver().replication_info_from_file(&source).await?
    };

    let replica = Instance {
        address: destination.address.clone(),
        ..ctx.instance.clone()
    };
    change_master(ctx, &replica, &source.address, &position).await
}

async fn check_replication(ctx: &StepContext) -> Result<()> {
    let future = future_instance(ctx, &ctx.instance).await?;
    let driver = ctx.driver();
    let what = format!("replication of {} and {}", ctx.instance, future);
    poll_until(&ctx.config().polling.replication_health, &what, |attempt| {
        let future = &future;
        async move {
            let healthy = driver.is_replication_ok(&ctx.instance).await?
                && driver.is_replication_ok(future).await?;
            if !healthy {
                warn!(instance = %ctx.instance, attempt, "Replication not healthy yet");
            }
            Ok::<_, StepError>(healthy.then_some(()))
        }
    })
    .await
}

/// Another instance on the same side of the migration as `instance`
async fn master_same_env(ctx: &StepContext, instance: &Instance) -> Result<Instance> {
    let source_side = instance.is_migration_source();
    ctx.store()
        .instances(ctx.infra.id)
        .await?
        .into_iter()
        .find(|i| i.id != instance.id && i.is_migration_source() == source_side)
        .ok_or_else(|| StepError::NotFound(format!("No peer of {} found in its environment", instance)))
}

/// The counterpart of `instance` on the other side of the migration
async fn master_new_env(ctx: &StepContext, instance: &Instance) -> Result<Instance> {
    if instance.is_migration_source() {
        return future_instance(ctx, instance).await;
    }
    ctx.store()
        .source_of(instance)
        .await?
        .ok_or_else(|| StepError::NotFound(format!("No migration source found for {}", instance)))
}

async fn reconfigure_replication(ctx: &StepContext, toward_new: bool) -> Result<()> {
    let future = future_instance(ctx, &ctx.instance).await?;
    let (own_master, future_master) = if toward_new {
        (master_new_env(ctx, &ctx.instance).await?, master_same_env(ctx, &future).await?)
    } else {
        (master_same_env(ctx, &ctx.instance).await?, master_new_env(ctx, &future).await?)
    };

    for (instance, master) in [(&ctx.instance, own_master), (&future, future_master)] {
        let position = ctx.driver().master_status(&master).await?;
        change_master(ctx, instance, &master.address, &position).await?;
    }
    Ok(())
}

async fn audit_plugin_active(ctx: &StepContext) -> Result<bool> {
    let rows = ctx.driver().query(AUDIT_PLUGIN_QUERY, &ctx.instance).await?;
    Ok(rows
        .first()
        .and_then(|row| row.get("plugin_status"))
        .and_then(Value::as_str)
        .is_some_and(|status| status == "ACTIVE"))
}

fn server_id_from_dns(dns: &str) -> Result<u32> {
    dns.split('-')
        .nth(1)
        .and_then(|part| part.parse().ok())
        .ok_or_else(|| StepError::Failed(format!("Could not derive a server id from {}", dns)))
}

fn value_as_u32(row: &Row, column: &str) -> Option<u32> {
    match row.get(column)? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

async fn apply_set_server_id(ctx: &StepContext, avoid_collision: bool) -> Result<()> {
    let mut server_id = server_id_from_dns(&ctx.instance.dns)?;
    if avoid_collision {
        let rows = ctx.driver().query(SERVER_ID_QUERY, &ctx.instance).await?;
        let running = rows
            .first()
            .and_then(|row| value_as_u32(row, "Value"))
            .ok_or_else(|| StepError::Failed(format!("Could not read server_id of {}", ctx.instance)))?;
        if running == server_id {
            server_id = server_id
                .checked_add(2)
                .ok_or_else(|| StepError::Failed(format!("Server id {} of {} is out of range", running, ctx.instance)))?;
        }
    }

    info!(instance = %ctx.instance, server_id, "Setting server id");
    let script = format!(
        "echo \"\"; echo $(date \"+%Y-%m-%d %T\") \"- Creating the server id db file\"\n\
         (cat <<EOF_DBAAS\n[mysqld]\nserver_id={}\nEOF_DBAAS\n) > /etc/server_id.cnf\n",
        server_id
    );
    ctx.run_script(&ctx.host, &script).await?;
    Ok(())
}

// ============================================================================
// Catalog
// ============================================================================

fn read_only(target: Target, enabled: bool, first_only: bool) -> Action {
    Action::ReadOnly {
        target,
        enabled,
        first_only,
    }
}

pub fn set_master_restore() -> MysqlStep {
    MysqlStep::new(Meta::new("set_master_restore", "Set master position..."), Action::SetMasterRestore)
}

pub fn set_master_recreate_slave() -> MysqlStep {
    MysqlStep::new(
        Meta::new("set_master_recreate_slave", "Set master position on recreate slave..."),
        Action::SetMasterRecreateSlave,
    )
}

pub fn set_read_only_migrate() -> MysqlStep {
    MysqlStep::new(
        Meta::new("set_read_only_migrate", "Change master mode to read only...").gate(Role::LastInstance),
        read_only(Target::Own, true, false),
    )
    .undo(Undo::Run(read_only(Target::Own, false, false)))
}

pub fn set_source_instances_read_only_migrate() -> MysqlStep {
    MysqlStep::new(
        Meta::new("set_source_instances_read_only_migrate", "Change master mode to read only..."),
        read_only(Target::Own, true, false),
    )
    .undo(Undo::Run(read_only(Target::Own, false, true)))
}

pub fn set_first_target_instance_read_write_migrate() -> MysqlStep {
    MysqlStep::new(
        Meta::new("set_first_target_instance_read_write_migrate", "Change master mode to read only..."),
        read_only(Target::Future, false, true),
    )
    .undo(Undo::Run(read_only(Target::Future, true, false)))
}

pub fn set_read_write_migrate() -> MysqlStep {
    MysqlStep::new(
        Meta::new("set_read_write_migrate", "Change new instance to read write...").gate(Role::LastInstance),
        read_only(Target::OwnAtHost, false, false),
    )
    .undo(Undo::Run(read_only(Target::OwnAtHost, true, false)))
}

pub fn start_slave() -> MysqlStep {
    MysqlStep::new(Meta::new("start_slave", "Start slave..."), Action::StartSlave)
}

pub fn configure_foxha_restore() -> MysqlStep {
    MysqlStep::new(Meta::new("configure_foxha_restore", "Configuring FoxHA..."), Action::ConfigureFoxHaRestore)
}

pub fn disable_replication() -> MysqlStep {
    MysqlStep::new(
        Meta::new("disable_replication", "Disable replication...").gate(Role::LastInstance),
        Action::SkipSlaveStartComment(true),
    )
    .undo(Undo::Run(Action::SkipSlaveStartComment(false)))
}

pub fn disable_replication_recreate_slave() -> MysqlStep {
    let mut step = disable_replication();
    step.meta = Meta::new("disable_replication_recreate_slave", "Disable replication...");
    step
}

pub fn enable_replication() -> MysqlStep {
    MysqlStep::new(
        Meta::new("enable_replication", "Enable replication...").gate(Role::LastInstance),
        Action::SkipSlaveStartComment(false),
    )
    .undo(Undo::Run(Action::SkipSlaveStartComment(true)))
}

pub fn enable_replication_recreate_slave() -> MysqlStep {
    let mut step = enable_replication();
    step.meta = Meta::new("enable_replication_recreate_slave", "Enable replication...");
    step
}

pub fn save_mysql_binlog() -> MysqlStep {
    MysqlStep::new(
        Meta::new("save_mysql_binlog", "Saving binlog position...").gate(Role::RestoreMaster),
        Action::SaveBinlog,
    )
}

pub fn save_mysql_binlog_to_stop_database() -> MysqlStep {
    MysqlStep::new(
        Meta::new("save_mysql_binlog_to_stop_database", "Saving binlog position to stop database..."),
        Action::SaveBinlog,
    )
}

pub fn set_file_permission() -> MysqlStep {
    MysqlStep::new(Meta::new("set_file_permission", "Setting file permition..."), Action::SetFilePermission)
}

pub fn run_mysql_upgrade() -> MysqlStep {
    MysqlStep::new(Meta::new("run_mysql_upgrade", "Executing mysql_upgrade..."), Action::RunMysqlUpgrade)
}

pub fn install_audit_plugin() -> MysqlStep {
    MysqlStep::new(Meta::new("install_audit_plugin", "Installing audit plugin..."), Action::InstallAuditPlugin)
}

pub fn check_if_audit_plugin_is_installed() -> MysqlStep {
    MysqlStep::new(
        Meta::new("check_if_audit_plugin_is_installed", "Checking if audit plugin is installed..."),
        Action::CheckAuditPlugin,
    )
}

pub fn skip_slave_start() -> MysqlStep {
    MysqlStep::new(Meta::new("skip_slave_start", "Skipping slave start parameter..."), Action::AppendSkipSlaveStart)
}

pub fn disable_log_bin() -> MysqlStep {
    MysqlStep::new(Meta::new("disable_log_bin", "Disable binary loggin..."), Action::DisableLogBin)
}

pub fn set_server_id() -> MysqlStep {
    MysqlStep::new(
        Meta::new("set_server_id", "Setting server id..."),
        Action::SetServerId { avoid_collision: false },
    )
}

pub fn set_server_id_migrate() -> MysqlStep {
    MysqlStep::new(
        Meta::new("set_server_id_migrate", "Setting server id..."),
        Action::SetServerId { avoid_collision: true },
    )
}

pub fn set_replication_host_migrate() -> MysqlStep {
    MysqlStep::new(
        Meta::new("set_replication_host_migrate", "Set replication on host migrate..."),
        Action::ReplicationHostMigrate,
    )
    .undo(Undo::Irreversible)
}

pub fn set_replication_recreate_slave() -> MysqlStep {
    MysqlStep::new(
        Meta::new("set_replication_recreate_slave", "Set replication on slave instance..."),
        Action::ReplicationRecreateSlave,
    )
    .undo(Undo::Irreversible)
}

pub fn set_replication_first_instance_migrate() -> MysqlStep {
    MysqlStep::new(
        Meta::new("set_replication_first_instance_migrate", "Set replication on host migrate...")
            .gate(Role::FirstInstance),
        Action::ReplicationFirstInstanceMigrate,
    )
    .undo(Undo::Irreversible)
}

pub fn set_replication_last_instance_migrate() -> MysqlStep {
    MysqlStep::new(
        Meta::new("set_replication_last_instance_migrate", "Set replication on host migrate...")
            .gate(Role::LastInstance),
        Action::ReplicationLastInstanceMigrate,
    )
    .undo(Undo::Irreversible)
}

pub fn check_replication_db_migrate() -> MysqlStep {
    MysqlStep::new(
        Meta::new("check_replication_db_migrate", "Checking replication...").gate(Gate::only(Role::Database)),
        Action::CheckReplication,
    )
    .undo(Undo::Run(Action::CheckReplication))
}

pub fn reconfigure_replication_db_migrate() -> MysqlStep {
    MysqlStep::new(
        Meta::new("reconfigure_replication_db_migrate", "Reconfiguring replication..."),
        Action::ReconfigureReplication(true),
    )
    .undo(Undo::Run(Action::ReconfigureReplication(false)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::Fixture;
    use crate::traits::{run_do, run_undo, Outcome};
    use dbaas_common::{HostMigrate, Store};
    use serde_json::json;

    /// Hosts 3 and 4 are the destinations of hosts 1 and 2, and instances 1
    /// and 2 point at future instances 3 and 4
    async fn migration_topology() -> Fixture {
        let fixture = Fixture::new().await.with_host_migration().await;
        let store = &fixture.store;
        store.put_host(&Host::new(4, "db-04.gcp", "10.1.0.2")).await.unwrap();
        let host = store.get_host(2).await.unwrap().with_future_host(4);
        store.put_host(&host).await.unwrap();
        store
            .put_host_migrate(&HostMigrate {
                id: 2,
                host_id: 2,
                environment: "gcp-dev".to_string(),
                zone: "zone-b".to_string(),
                zone_origin: "zone-a".to_string(),
                snapshot_id: None,
                database_migrate_id: Some(1),
            })
            .await
            .unwrap();
        for (id, future) in [(1, 3), (2, 4)] {
            let source = store.get_instance(id).await.unwrap().with_future_instance(future);
            store.put_instance(&source).await.unwrap();
        }
        fixture
    }

    /// Store future instances 3 and 4 under `infra_id`; outside infra 1 they
    /// leave its first/last topology untouched
    async fn add_targets(fixture: &Fixture, infra_id: u64) {
        for (id, address) in [(3, "10.1.0.1"), (4, "10.1.0.2")] {
            let instance = Instance::database(id, infra_id, id, address).with_dns(format!("mysql-0{}-orders", id));
            fixture.store.put_instance(&instance).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_set_master_restore_uses_peer() {
        let fixture = Fixture::new().await;
        let slave = fixture.context(2).await.with_restore(fixture.restore());
        run_do(&set_master_restore(), &slave).await.unwrap();
        let master = fixture.context(1).await.with_restore(fixture.restore());
        run_do(&set_master_restore(), &master).await.unwrap();

        assert_eq!(
            fixture.driver.calls(),
            vec![
                "replication_info_from_file(1)",
                "change_master_to(2, 10.0.0.1, mysql-bin.000001:4)",
                "replication_info_from_file(1)",
                "change_master_to(1, 10.0.0.2, mysql-bin.000001:4)",
            ]
        );
    }

    #[tokio::test]
    async fn test_set_master_recreate_slave_pairs_both_ways() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(2).await;
        run_do(&set_master_recreate_slave(), &ctx).await.unwrap();
        assert_eq!(
            fixture.driver.calls(),
            vec![
                "replication_info_from_file(2)",
                "change_master_to(2, 10.0.0.1, mysql-bin.000001:4)",
                "change_master_to(1, 10.0.0.2, mysql-bin.000001:4)",
            ]
        );
    }

    #[tokio::test]
    async fn test_read_only_toggles() {
        let fixture = migration_topology().await;
        add_targets(&fixture, 2).await;
        let first = fixture.context(1).await;
        let last = fixture.context(2).await;

        assert_eq!(run_do(&set_read_only_migrate(), &first).await.unwrap(), Outcome::NotValid);
        run_do(&set_read_only_migrate(), &last).await.unwrap();
        run_undo(&set_read_only_migrate(), &last).await.unwrap();

        run_undo(&set_source_instances_read_only_migrate(), &last).await.unwrap();
        run_do(&set_first_target_instance_read_write_migrate(), &first).await.unwrap();
        run_do(&set_first_target_instance_read_write_migrate(), &last).await.unwrap();

        assert_eq!(
            fixture.driver.calls(),
            vec![
                "set_configuration(2, read_only, ON)",
                "set_configuration(2, read_only, OFF)",
                "set_configuration(3, read_only, OFF)",
            ]
        );
    }

    #[tokio::test]
    async fn test_read_write_on_last_instance() {
        let fixture = Fixture::new().await;
        let step = set_read_write_migrate();
        let first = fixture.context(1).await;
        assert_eq!(run_do(&step, &first).await.unwrap(), Outcome::NotValid);

        let last = fixture.context(2).await;
        run_do(&step, &last).await.unwrap();
        run_undo(&step, &last).await.unwrap();
        assert_eq!(
            fixture.driver.calls(),
            vec!["set_configuration(2, read_only, OFF)", "set_configuration(2, read_only, ON)"]
        );
    }

    #[tokio::test]
    async fn test_save_binlog_variants() {
        let fixture = Fixture::new().await;
        let slave = fixture.context(2).await.with_restore(fixture.restore());
        assert_eq!(run_do(&save_mysql_binlog(), &slave).await.unwrap(), Outcome::NotValid);

        let step = save_mysql_binlog_to_stop_database();
        run_do(&step, &slave).await.unwrap();
        run_undo(&step, &slave).await.unwrap();
        assert_eq!(fixture.driver.calls(), vec!["save_binlog_position(2)"]);
    }

    #[tokio::test]
    async fn test_replication_toggle_scripts() {
        let fixture = Fixture::new().await;
        let last = fixture.context(2).await;
        run_do(&disable_replication(), &last).await.unwrap();
        run_undo(&disable_replication(), &last).await.unwrap();
        run_do(&enable_replication(), &last).await.unwrap();

        let first = fixture.context(1).await;
        assert_eq!(run_do(&enable_replication(), &first).await.unwrap(), Outcome::NotValid);
        run_do(&enable_replication_recreate_slave(), &first).await.unwrap();

        assert_eq!(
            fixture.remote.scripts(),
            vec![
                DISABLE_REPLICATION_SCRIPT,
                ENABLE_REPLICATION_SCRIPT,
                ENABLE_REPLICATION_SCRIPT,
                ENABLE_REPLICATION_SCRIPT,
            ]
        );
    }

    #[tokio::test]
    async fn test_foxha_restore() {
        let fixture = Fixture::new().await;
        for id in [1, 2] {
            let ctx = fixture.context(id).await.with_restore(fixture.restore());
            run_do(&configure_foxha_restore(), &ctx).await.unwrap();
        }
        assert_eq!(fixture.driver.calls(), vec!["set_master(1)", "set_read_ip(2)"]);

        let unbound = fixture.context(1).await;
        let err = run_do(&configure_foxha_restore(), &unbound).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn test_audit_plugin() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        let err = run_do(&check_if_audit_plugin_is_installed(), &ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "The audit plugin is not installed.");

        run_do(&install_audit_plugin(), &ctx).await.unwrap();
        assert!(fixture.driver.calls().iter().any(|c| c.contains("INSTALL PLUGIN")));

        let fixture = Fixture::new().await;
        fixture.driver.respond_query(
            "INFORMATION_SCHEMA.PLUGINS",
            vec![Row::from([
                ("plugin_name".to_string(), json!("audit_log")),
                ("plugin_status".to_string(), json!("ACTIVE")),
            ])],
        );
        let ctx = fixture.context(1).await;
        run_do(&install_audit_plugin(), &ctx).await.unwrap();
        run_do(&check_if_audit_plugin_is_installed(), &ctx).await.unwrap();
        assert!(!fixture.driver.calls().iter().any(|c| c.contains("INSTALL PLUGIN")));
    }

    #[tokio::test]
    async fn test_server_id() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(2).await;
        run_do(&set_server_id(), &ctx).await.unwrap();
        assert!(fixture.remote.scripts()[0].contains("server_id=2\n"));

        fixture.driver.respond_query(
            "server_id",
            vec![Row::from([("Value".to_string(), json!("2"))])],
        );
        run_do(&set_server_id_migrate(), &ctx).await.unwrap();
        assert!(fixture.remote.scripts()[1].contains("server_id=4\n"));

        assert!(server_id_from_dns("standalone").is_err());
    }

    #[tokio::test]
    async fn test_server_id_collision_out_of_range() {
        let fixture = Fixture::new().await;
        let mut ctx = fixture.context(2).await;
        ctx.instance.dns = "mysql-4294967295-orders".to_string();
        fixture.driver.respond_query(
            "server_id",
            vec![Row::from([("Value".to_string(), json!(4294967295u64))])],
        );

        let err = run_do(&set_server_id_migrate(), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Failed);
        assert!(err.to_string().contains("out of range"));
        assert!(fixture.remote.scripts().is_empty());
    }

    #[tokio::test]
    async fn test_host_scripts() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        run_do(&run_mysql_upgrade(), &ctx).await.unwrap();
        run_do(&set_file_permission(), &ctx).await.unwrap();
        run_do(&skip_slave_start(), &ctx).await.unwrap();
        run_do(&disable_log_bin(), &ctx).await.unwrap();

        let scripts = fixture.remote.scripts();
        assert_eq!(scripts[0], "mysql_upgrade -udbaas -psecret");
        assert!(scripts[1].contains("chown -R mysql:mysql /data/*"));
        assert_eq!(scripts[2], "echo 'skip_slave_start = 1' >> /etc/my.cnf");
        assert_eq!(scripts[3], "sed -e 's/^log_bin/#log_bin/' -i /etc/my.cnf");
    }

    #[tokio::test]
    async fn test_host_migrate_replication_is_irreversible() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(2).await;
        run_do(&set_replication_host_migrate(), &ctx).await.unwrap();
        assert_eq!(
            fixture.driver.calls(),
            vec![
                "replication_info_from_file(2)",
                "change_master_to(1, 10.0.0.2, mysql-bin.000001:4)",
            ]
        );

        let err = run_undo(&set_replication_host_migrate(), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Irreversible);
        assert_eq!(err.to_string(), NO_ROLLBACK);
    }

    #[tokio::test]
    async fn test_recreate_slave_replication() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(2).await;
        run_do(&set_replication_recreate_slave(), &ctx).await.unwrap();
        assert_eq!(
            fixture.driver.calls(),
            vec![
                "replication_info_from_file(1)",
                "change_master_to(2, 10.0.0.1, mysql-bin.000001:4)",
            ]
        );
    }

    #[tokio::test]
    async fn test_migration_replication_pairs_destinations() {
        let fixture = migration_topology().await;
        let last = fixture.context(2).await.with_host_migrate(2);
        run_do(&set_replication_last_instance_migrate(), &last).await.unwrap();
        assert_eq!(
            run_do(&set_replication_first_instance_migrate(), &last).await.unwrap(),
            Outcome::NotValid
        );

        let first = fixture.context(1).await.with_host_migrate(1);
        run_do(&set_replication_first_instance_migrate(), &first).await.unwrap();

        assert_eq!(
            fixture.driver.calls(),
            vec![
                "replication_info_from_file(3)",
                "change_master_to(2, 10.1.0.1, mysql-bin.000001:4)",
                "master_status(1)",
                "change_master_to(1, 10.1.0.2, mysql-bin.000002:120)",
            ]
        );
    }

    #[tokio::test]
    async fn test_check_replication_polls_both_sides() {
        let fixture = migration_topology().await;
        add_targets(&fixture, 2).await;
        fixture.driver.script_replication(&[false, true, true]);
        let ctx = fixture.context(1).await;
        run_do(&check_replication_db_migrate(), &ctx).await.unwrap();
        assert_eq!(
            fixture.driver.calls(),
            vec!["is_replication_ok(1)", "is_replication_ok(1)", "is_replication_ok(3)"]
        );
    }

    #[tokio::test]
    async fn test_check_replication_timeout() {
        let fixture = migration_topology().await;
        add_targets(&fixture, 2).await;
        fixture.driver.script_replication(&[false; 12]);
        let ctx = fixture.context(1).await;
        let err = run_do(&check_replication_db_migrate(), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(fixture.driver.calls().len(), 12);
    }

    #[tokio::test]
    async fn test_reconfigure_replication() {
        let fixture = migration_topology().await;
        add_targets(&fixture, 1).await;
        let ctx = fixture.context(1).await;

        run_do(&reconfigure_replication_db_migrate(), &ctx).await.unwrap();
        run_undo(&reconfigure_replication_db_migrate(), &ctx).await.unwrap();

        assert_eq!(
            fixture.driver.calls(),
            vec![
                "master_status(3)",
                "change_master_to(1, 10.1.0.1, mysql-bin.000002:120)",
                "master_status(4)",
                "change_master_to(3, 10.1.0.2, mysql-bin.000002:120)",
                "master_status(2)",
                "change_master_to(1, 10.0.0.2, mysql-bin.000002:120)",
                "master_status(1)",
                "change_master_to(3, 10.0.0.1, mysql-bin.000002:120)",
            ]
        );
    }
}
