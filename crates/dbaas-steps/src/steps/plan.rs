//! Plan script steps
//!
//! Every plan carries four script templates (initialization, configuration,
//! log configuration, replication start). A [`PlanScript`] renders one of
//! them with the standard variable set plus driver-specific parameters and
//! runs the result on the instance's host.
//!
//! Variants differ in which plan and offering feed the variables, which
//! extra parameters are merged in, and whether the script runs on `do`, on
//! `undo`, or on both.

use super::{catalog_step, Meta};
use crate::capability::Vars;
use crate::context::StepContext;
use crate::error::{Result, StepError};
use crate::gating::{first_node, Gate, Pinned, Role};
use crate::traits::{Direction, Doable, Undoable};
use async_trait::async_trait;
use dbaas_common::{Host, Instance, Offering, Plan, SslMode};
use minijinja::Environment;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Render a plan template with `vars`
///
/// Undefined variables render as empty strings and booleans as `True` /
/// `False`, the form the plan scripts test against.
pub fn render(template: &str, vars: &Vars) -> Result<String> {
    let env = Environment::new();
    Ok(env.render_str(template, vars)?)
}

/// Which plan template a step runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    Initialization,
    Configuration,
    ConfigureLog,
    StartReplication,
}

impl Template {
    fn source(self, plan: &Plan) -> &str {
        match self {
            Template::Initialization => &plan.scripts.initialization,
            Template::Configuration => &plan.scripts.configuration,
            Template::ConfigureLog => &plan.scripts.configure_log,
            Template::StartReplication => &plan.scripts.start_replication,
        }
    }
}

/// Plan whose templates and persistence flag are used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    Infra,
    /// Plan of the next engine version
    EngineUpgrade,
    /// Plan of the engine being migrated to
    EngineMigration,
    /// Target plan of a running persistence change
    ChangePersistence,
}

impl PlanSource {
    fn resolve(self, ctx: &StepContext) -> Result<Plan> {
        let plan = &ctx.infra.plan;
        let equivalent = match self {
            PlanSource::Infra => return Ok(plan.clone()),
            PlanSource::EngineUpgrade => plan.engine_equivalent_plan.as_deref(),
            PlanSource::EngineMigration => plan.migrate_engine_equivalent_plan.as_deref(),
            PlanSource::ChangePersistence => {
                return ctx
                    .change_persistence
                    .as_ref()
                    .filter(|change| change.running)
                    .map(|change| change.target_plan.clone())
                    .ok_or_else(|| {
                        StepError::Precondition(
                            "There is not any 'Change Persistence Maintenance' running.".to_string(),
                        )
                    });
            }
        };
        equivalent
            .cloned()
            .ok_or_else(|| StepError::Precondition(format!("Plan {} has no equivalent plan", plan.name)))
    }
}

/// Compute offering the configuration is sized for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferingSource {
    /// The resize target when a resize is bound, the infra's otherwise
    Infra,
    /// Resize target going forward, resize source when reverted
    Resize,
    /// The infra offering's counterpart in the migration destination
    Equivalent,
}

impl OfferingSource {
    fn resolve(self, ctx: &StepContext, direction: Direction) -> Result<Offering> {
        let infra = &ctx.infra.offering;
        match self {
            OfferingSource::Infra => Ok(ctx
                .resize
                .as_ref()
                .map_or_else(|| infra.clone(), |r| r.target_offering.clone())),
            OfferingSource::Resize => {
                let resize = ctx
                    .resize
                    .as_ref()
                    .ok_or_else(|| StepError::Precondition("No resize bound to this run".to_string()))?;
                Ok(match direction {
                    Direction::Forward => resize.target_offering.clone(),
                    Direction::Reverse => resize.source_offering.clone(),
                })
            }
            OfferingSource::Equivalent => infra
                .equivalent
                .as_deref()
                .cloned()
                .ok_or_else(|| StepError::Precondition(format!("Offering {} has no equivalent offering", infra.name))),
        }
    }
}

/// Instance the variables describe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Own,
    /// Destination counterpart of a migrating instance, on its own host
    FutureInstance,
}

/// Driver parameter builders merged over the standard variables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Params {
    Configuration,
    ConfigurationMigration,
    ConfigurationLogResize,
    StartReplication,
    /// Master parameters pointing at the restore master of the instance
    RestoreMaster,
    /// Master parameters pointing at the first instance of the infra
    FirstInstanceMaster,
    /// Log shipping endpoint and rsyslog restart command
    Log,
}

/// When the script runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runs {
    OnDo,
    /// Only as compensation of a later failure
    OnUndo,
    /// On both, with the offering picked by direction
    Both,
}

/// Render and run one plan template
pub struct PlanScript {
    meta: Meta,
    template: Template,
    plan: PlanSource,
    offering: OfferingSource,
    subject: Subject,
    params: Vec<Params>,
    extra: Vars,
    /// Overrides `MOVE_DATA`
    move_data: Option<bool>,
    without_ssl: bool,
    runs: Runs,
}

catalog_step!(PlanScript);

impl PlanScript {
    fn new(meta: Meta, template: Template) -> Self {
        Self {
            meta,
            template,
            plan: PlanSource::Infra,
            offering: OfferingSource::Infra,
            subject: Subject::Own,
            params: Vec::new(),
            extra: Vars::new(),
            move_data: None,
            without_ssl: false,
            runs: Runs::OnDo,
        }
    }

    fn plan(mut self, plan: PlanSource) -> Self {
        self.plan = plan;
        self
    }

    fn offering(mut self, offering: OfferingSource) -> Self {
        self.offering = offering;
        self
    }

    fn subject(mut self, subject: Subject) -> Self {
        self.subject = subject;
        self
    }

    fn params(mut self, params: Params) -> Self {
        self.params.push(params);
        self
    }

    fn extra(mut self, name: &str, value: Value) -> Self {
        self.extra.insert(name.to_string(), value);
        self
    }

    fn config_file_only(self) -> Self {
        self.extra("CONFIGFILE_ONLY", json!(true))
    }

    fn move_data(mut self, move_data: bool) -> Self {
        self.move_data = Some(move_data);
        self
    }

    fn without_ssl(mut self) -> Self {
        self.without_ssl = true;
        self
    }

    fn on_undo(mut self, name: &'static str, description: &'static str) -> Self {
        self.meta.name = name;
        self.meta.description = description;
        self.runs = Runs::OnUndo;
        self
    }

    fn gate(mut self, gate: impl Into<Gate>) -> Self {
        self.meta.gate = gate.into();
        self
    }

    fn renamed(mut self, name: &'static str) -> Self {
        self.meta.name = name;
        self
    }

    /// Instance and host the script is about
    async fn target(&self, ctx: &StepContext) -> Result<(Instance, Host)> {
        match self.subject {
            Subject::Own => Ok((ctx.instance.clone(), ctx.host.clone())),
            Subject::FutureInstance => {
                let id = ctx
                    .instance
                    .future_instance_id
                    .ok_or_else(|| StepError::Precondition(format!("Instance {} has no future instance", ctx.instance)))?;
                let instance = ctx.store().get_instance(id).await?;
                let host = ctx.store().get_host(instance.host_id).await?;
                Ok((instance, host))
            }
        }
    }

    /// Full variable set for `instance` on `host`
    pub async fn variables(
        &self,
        ctx: &StepContext,
        instance: &Instance,
        host: &Host,
        direction: Direction,
    ) -> Result<Vars> {
        let plan = self.plan.resolve(ctx)?;
        let offering = self.offering.resolve(ctx, direction)?;
        let infra = &ctx.infra;
        let driver = ctx.driver();

        let mut vars = Vars::new();
        let mut set = |name: &str, value: Value| {
            vars.insert(name.to_string(), value);
        };
        set("DATABASENAME", json!(infra.database_name));
        set("DBPASSWORD", json!(infra.password));
        set("HOST", json!(host.short_name()));
        set("HOSTADDRESS", json!(instance.address));
        set("ENGINE", json!(plan.engine_type));
        set("MOVE_DATA", json!(self.move_data.unwrap_or(ctx.need_move_data)));
        set("DRIVER_NAME", json!(driver.topology_name()));
        set("DISK_SIZE_IN_GB", json!(infra.disk_offering.size_gb()));
        set("ENVIRONMENT", json!(ctx.environment().await?));
        set("HAS_PERSISTENCE", json!(plan.has_persistence));
        set("IS_READ_ONLY", json!(instance.read_only));
        set("SSL_CONFIGURED", json!(infra.ssl_configured));
        set("SSL_MODE_ALLOW", json!(infra.ssl_mode == Some(SslMode::AllowTls)));
        set("SSL_MODE_PREFER", json!(infra.ssl_mode == Some(SslMode::PreferTls)));
        set("SSL_MODE_REQUIRE", json!(infra.ssl_mode == Some(SslMode::RequireTls)));
        set("IS_OL6", json!(host.is_ol6()));
        set("IS_OL7", json!(host.is_ol7()));

        if infra.ssl_configured {
            let dir = &ctx.config().ssl_directory;
            let infra_base = format!("{}/{}", dir, infra.name);
            let instance_base = format!("{}/{}", dir, host.short_name());
            set("INFRA_SSL_CA", json!(format!("{}-ca.crt", infra_base)));
            set("INFRA_SSL_CERT", json!(format!("{}-cert.crt", infra_base)));
            set("INFRA_SSL_KEY", json!(format!("{}-key.key", infra_base)));
            set("MASTER_SSL_CA", json!(format!("{}-master-ca.crt", infra_base)));
            set("INSTANCE_SSL_CA", json!(format!("{}-ca.crt", instance_base)));
            set("INSTANCE_SSL_CERT", json!(format!("{}-cert.crt", instance_base)));
            set("INSTANCE_SSL_KEY", json!(format!("{}-key.key", instance_base)));
        }

        let mut sized = infra.clone();
        sized.plan = plan;
        let configuration = driver
            .configuration(&sized, offering.memory_size_mb)
            .unwrap_or(Value::Null);
        vars.insert("configuration".to_string(), configuration);

        for params in &self.params {
            vars.extend(self.driver_params(ctx, *params, instance, host).await?);
        }
        vars.extend(self.extra.clone());

        if self.without_ssl {
            for flag in ["SSL_CONFIGURED", "SSL_MODE_ALLOW", "SSL_MODE_PREFER", "SSL_MODE_REQUIRE"] {
                vars.insert(flag.to_string(), json!(false));
            }
        }
        Ok(vars)
    }

    async fn driver_params(&self, ctx: &StepContext, params: Params, instance: &Instance, host: &Host) -> Result<Vars> {
        let driver = ctx.driver();
        Ok(match params {
            Params::Configuration => driver.configuration_parameters(instance),
            Params::ConfigurationMigration => driver.configuration_parameters_migration(instance),
            Params::ConfigurationLogResize => driver.configuration_parameters_for_log_resize(instance),
            Params::StartReplication => driver.start_replication_parameters(instance),
            Params::RestoreMaster => {
                let master_id = ctx
                    .restore
                    .as_ref()
                    .and_then(|restore| restore.master_for(instance.id));
                match master_id {
                    Some(id) => {
                        let master = ctx.store().get_instance(id).await?;
                        driver.master_parameters(instance, &master)
                    }
                    None => Vars::new(),
                }
            }
            Params::FirstInstanceMaster => {
                let first = ctx.store().first_instance(ctx.infra.id).await?;
                driver.master_parameters(instance, &first)
            }
            Params::Log => {
                let restart = if host.is_ol6() {
                    "/etc/init.d/rsyslog restart"
                } else {
                    "systemctl restart rsyslog"
                };
                Vars::from([
                    ("LOG_ENDPOINT".to_string(), json!(ctx.config().log_endpoint)),
                    ("RSYSLOG_RESTART_COMMAND".to_string(), json!(restart)),
                ])
            }
        })
    }

    async fn execute(&self, ctx: &StepContext, direction: Direction) -> Result<()> {
        let (instance, host) = self.target(ctx).await?;
        let vars = self.variables(ctx, &instance, &host, direction).await?;
        let plan = self.plan.resolve(ctx)?;
        let script = render(self.template.source(&plan), &vars)?;

        info!(
            step = self.meta.name,
            instance = %instance,
            host = %host.address,
            plan = %plan.name,
            "Running plan script"
        );
        debug!(script = %script, "Rendered plan script");
        ctx.run_command(&host, &script).await
    }
}

#[async_trait]
impl Doable for PlanScript {
    async fn apply(&self, ctx: &StepContext) -> Result<()> {
        match self.runs {
            Runs::OnDo | Runs::Both => self.execute(ctx, Direction::Forward).await,
            Runs::OnUndo => Ok(()),
        }
    }
}

#[async_trait]
impl Undoable for PlanScript {
    async fn revert(&self, ctx: &StepContext) -> Result<()> {
        match self.runs {
            Runs::OnDo => Ok(()),
            Runs::OnUndo => self.execute(ctx, Direction::Forward).await,
            Runs::Both => self.execute(ctx, Direction::Reverse).await,
        }
    }
}

// ============================================================================
// Initialization
// ============================================================================

const INITIAL_SCRIPT: &str = "Executing plan initial script...";

pub fn initialization() -> PlanScript {
    PlanScript::new(Meta::new("initialization", INITIAL_SCRIPT), Template::Initialization)
}

pub fn initialization_auto_upgrade() -> PlanScript {
    initialization().renamed("initialization_auto_upgrade").gate(Role::Temporary)
}

pub fn initialization_for_upgrade() -> PlanScript {
    initialization()
        .renamed("initialization_for_upgrade")
        .plan(PlanSource::EngineUpgrade)
}

pub fn initialization_for_migrate_engine() -> PlanScript {
    initialization()
        .renamed("initialization_for_migrate_engine")
        .plan(PlanSource::EngineMigration)
}

pub fn initialization_for_new_infra() -> PlanScript {
    initialization().renamed("initialization_for_new_infra")
}

pub fn initialization_for_new_infra_sentinel() -> PlanScript {
    initialization()
        .renamed("initialization_for_new_infra_sentinel")
        .gate(Role::Sentinel)
        .params(Params::FirstInstanceMaster)
}

pub fn initialization_migrate() -> PlanScript {
    PlanScript::new(
        Meta::new("initialization_migrate", "Executing plan initial script migrate..."),
        Template::Initialization,
    )
    .move_data(true)
}

pub fn initialization_migrate_rollback() -> PlanScript {
    initialization_migrate().on_undo(
        "initialization_migrate_rollback",
        "Executing plan initial script migrate if rollback...",
    )
}

/// Initialization of the destination instance of a migration
pub fn initialization_migration() -> PlanScript {
    initialization()
        .renamed("initialization_migration")
        .subject(Subject::FutureInstance)
        .offering(OfferingSource::Equivalent)
}

// ============================================================================
// Configuration
// ============================================================================

const CONFIGURE_SCRIPT: &str = "Executing plan configure script...";

pub fn configure() -> PlanScript {
    PlanScript::new(Meta::new("configure", CONFIGURE_SCRIPT), Template::Configuration).params(Params::Configuration)
}

pub fn configure_temporary_instance() -> PlanScript {
    configure().renamed("configure_temporary_instance").gate(Role::Temporary)
}

pub fn configure_for_new_infra() -> PlanScript {
    configure().renamed("configure_for_new_infra")
}

pub fn configure_for_new_infra_sentinel() -> PlanScript {
    configure()
        .renamed("configure_for_new_infra_sentinel")
        .gate(Role::Sentinel)
        .params(Params::FirstInstanceMaster)
}

/// Sentinel configuration written to a scratch file only
pub fn configure_sentinel_file() -> PlanScript {
    configure_for_new_infra_sentinel()
        .renamed("configure_sentinel_file")
        .extra("ONLY_SENTINEL", json!(true))
        .extra("CONFIG_FILE_PATH", json!("/tmp/sentinel_configuration_file"))
}

pub fn configure_for_upgrade() -> PlanScript {
    configure()
        .renamed("configure_for_upgrade")
        .plan(PlanSource::EngineUpgrade)
        .extra("need_master", json!(true))
}

pub fn configure_for_migrate_engine() -> PlanScript {
    configure()
        .renamed("configure_for_migrate_engine")
        .plan(PlanSource::EngineMigration)
}

pub fn configure_migration() -> PlanScript {
    PlanScript::new(Meta::new("configure_migration", CONFIGURE_SCRIPT), Template::Configuration)
        .params(Params::ConfigurationMigration)
        .subject(Subject::FutureInstance)
        .offering(OfferingSource::Equivalent)
}

pub fn configure_restore() -> PlanScript {
    configure()
        .renamed("configure_restore")
        .params(Params::RestoreMaster)
        .config_file_only()
        .extra("CREATE_SENTINEL_CONFIG", json!(true))
}

pub fn configure_only_db_config_file() -> PlanScript {
    configure().renamed("configure_only_db_config_file").config_file_only()
}

pub fn configure_for_upgrade_only_db_config_file() -> PlanScript {
    configure_only_db_config_file()
        .renamed("configure_for_upgrade_only_db_config_file")
        .plan(PlanSource::EngineUpgrade)
}

/// Configuration file for the resize target, back to the source on undo
pub fn resize_configure() -> PlanScript {
    let mut step = configure_only_db_config_file()
        .renamed("resize_configure")
        .gate(Role::NotTemporary)
        .offering(OfferingSource::Resize);
    step.runs = Runs::Both;
    step
}

pub fn configure_for_change_persistence() -> PlanScript {
    configure_only_db_config_file()
        .renamed("configure_for_change_persistence")
        .plan(PlanSource::ChangePersistence)
}

pub fn configure_without_ssl() -> PlanScript {
    configure().renamed("configure_without_ssl").without_ssl()
}

pub fn configure_for_resize_log() -> PlanScript {
    PlanScript::new(Meta::new("configure_for_resize_log", CONFIGURE_SCRIPT), Template::Configuration)
        .params(Params::ConfigurationLogResize)
        .config_file_only()
}

/// Database configuration written to a scratch file only
pub fn configure_database_file() -> PlanScript {
    configure()
        .renamed("configure_database_file")
        .config_file_only()
        .extra("CONFIG_FILE_PATH", json!("/tmp/database_configuration_file"))
}

pub fn configure_rollback() -> PlanScript {
    configure().on_undo("configure_rollback", "Executing plan configure script if rollback...")
}

// ============================================================================
// Log
// ============================================================================

pub fn configure_log() -> PlanScript {
    PlanScript::new(Meta::new("configure_log", "Configuring Log..."), Template::ConfigureLog)
        .params(Params::Configuration)
        .params(Params::Log)
        .gate(Gate::only(Role::NotTemporary).and(Role::Ol6))
}

pub fn configure_log_temporary_instance() -> PlanScript {
    configure_log()
        .renamed("configure_log_temporary_instance")
        .gate(Gate::only(Role::Temporary).and(Role::Ol6))
}

pub fn configure_log_for_new_infra() -> PlanScript {
    configure_log().renamed("configure_log_for_new_infra")
}

pub fn configure_log_migrate_engine() -> PlanScript {
    configure_log()
        .renamed("configure_log_migrate_engine")
        .plan(PlanSource::EngineMigration)
}

pub fn configure_log_rollback() -> PlanScript {
    configure_log().on_undo("configure_log_rollback", "Configuring Log if rollback...")
}

// ============================================================================
// Replication
// ============================================================================

pub fn start_replication() -> PlanScript {
    PlanScript::new(
        Meta::new("start_replication", "Executing replication start script..."),
        Template::StartReplication,
    )
    .params(Params::StartReplication)
}

pub fn start_replication_new_infra() -> PlanScript {
    start_replication().renamed("start_replication_new_infra")
}

pub fn start_replication_first_node() -> Pinned {
    first_node(start_replication())
}

pub fn start_replication_first_node_new_infra() -> Pinned {
    first_node(start_replication_new_infra())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepsConfig;
    use crate::error::ErrorKind;
    use crate::testing::Fixture;
    use crate::traits::{run_do, run_undo, Outcome};
    use dbaas_common::{ChangePersistence, HostOs, Resize, Store};

    #[test]
    fn test_render_undefined_is_empty() {
        let vars = Vars::from([("A".to_string(), json!(1))]);
        assert_eq!(render("{{ A }}-{{ B }}", &vars).unwrap(), "1-");
        let flags = Vars::from([("ON".to_string(), json!(true)), ("OFF".to_string(), json!(false))]);
        assert_eq!(render("{{ ON }} {{ OFF }}", &flags).unwrap(), "True False");
        assert_eq!(render("{{ A ", &vars).unwrap_err().kind(), ErrorKind::Template);
    }

    #[tokio::test]
    async fn test_initialization() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        run_do(&initialization(), &ctx).await.unwrap();

        let moved = ctx.clone().with_move_data(true);
        run_do(&initialization(), &moved).await.unwrap();
        run_do(&initialization_migrate(), &ctx).await.unwrap();

        assert_eq!(
            fixture.remote.runs(),
            vec![
                ("10.0.0.1".to_string(), "init db-01 orders move=False".to_string()),
                ("10.0.0.1".to_string(), "init db-01 orders move=True".to_string()),
                ("10.0.0.1".to_string(), "init db-01 orders move=True".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_standard_variables() {
        let fixture = Fixture::new().await;
        let mut ctx = fixture.context(2).await;
        ctx.infra.ssl_configured = true;
        ctx.infra.ssl_mode = Some(SslMode::RequireTls);

        let step = configure();
        let vars = step
            .variables(&ctx, &ctx.instance, &ctx.host, Direction::Forward)
            .await
            .unwrap();
        assert_eq!(vars["HOST"], json!("db-02"));
        assert_eq!(vars["ENGINE"], json!("mysql"));
        assert_eq!(vars["DRIVER_NAME"], json!("mysql_foxha"));
        assert_eq!(vars["DISK_SIZE_IN_GB"], json!(8.0));
        assert_eq!(vars["ENVIRONMENT"], json!("dev"));
        assert_eq!(vars["SSL_MODE_REQUIRE"], json!(true));
        assert_eq!(vars["SSL_MODE_ALLOW"], json!(false));
        assert_eq!(vars["INFRA_SSL_CA"], json!("/data/ssl/orders-infra-ca.crt"));
        assert_eq!(vars["INSTANCE_SSL_KEY"], json!("/data/ssl/db-02-key.key"));
        assert_eq!(vars["SERVER_ROLE"], json!("replica"));
        assert_eq!(vars["configuration"]["innodb_buffer_pool_size"], json!("2048M"));

        let plain = configure_without_ssl()
            .variables(&ctx, &ctx.instance, &ctx.host, Direction::Forward)
            .await
            .unwrap();
        assert_eq!(plain["SSL_CONFIGURED"], json!(false));
        assert_eq!(plain["SSL_MODE_REQUIRE"], json!(false));
        assert_eq!(plain["INFRA_SSL_CA"], json!("/data/ssl/orders-infra-ca.crt"));
    }

    #[tokio::test]
    async fn test_config_file_only() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        run_do(&configure(), &ctx).await.unwrap();
        run_do(&configure_only_db_config_file(), &ctx).await.unwrap();
        assert_eq!(
            fixture.remote.scripts(),
            vec!["configure 10.0.0.1 only=", "configure 10.0.0.1 only=True"]
        );
    }

    #[tokio::test]
    async fn test_resize_configure_uses_offering_by_direction() {
        let fixture = Fixture::new().await;
        let mut ctx = fixture.context(1).await.with_resize(Resize {
            source_offering: Offering::new("c2m4", 4096, 2),
            target_offering: Offering::new("c4m8", 8192, 4),
        });
        ctx.infra.plan.scripts.configuration = "buffer {{ configuration.innodb_buffer_pool_size }}".to_string();

        run_do(&resize_configure(), &ctx).await.unwrap();
        run_undo(&resize_configure(), &ctx).await.unwrap();
        assert_eq!(fixture.remote.scripts(), vec!["buffer 4096M", "buffer 2048M"]);

        ctx.instance.temporary = true;
        assert_eq!(run_do(&resize_configure(), &ctx).await.unwrap(), Outcome::NotValid);
    }

    #[tokio::test]
    async fn test_rollback_only_runs_on_undo() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        run_do(&configure_rollback(), &ctx).await.unwrap();
        assert!(fixture.remote.scripts().is_empty());

        run_undo(&configure_rollback(), &ctx).await.unwrap();
        run_undo(&configure(), &ctx).await.unwrap();
        assert_eq!(fixture.remote.scripts(), vec!["configure 10.0.0.1 only="]);
    }

    #[tokio::test]
    async fn test_rollback_variants_render_on_undo() {
        let config = StepsConfig::default().with_log_endpoint("logs.example.com:514");
        let fixture = Fixture::with_config(config).await;
        let mut ctx = fixture.context(1).await;
        ctx.host = ctx.host.clone().with_os(HostOs::Ol6);

        for step in [initialization_migrate_rollback(), configure_log_rollback()] {
            run_do(&step, &ctx).await.unwrap();
            assert!(fixture.remote.scripts().is_empty());
        }
        run_undo(&initialization_migrate_rollback(), &ctx).await.unwrap();
        run_undo(&configure_log_rollback(), &ctx).await.unwrap();
        assert_eq!(
            fixture.remote.scripts(),
            vec!["init db-01 orders move=True", "log logs.example.com:514"]
        );
    }

    #[tokio::test]
    async fn test_configure_file_variants() {
        let fixture = Fixture::new().await;
        let mut ctx = fixture.context(1).await;
        assert_eq!(
            run_do(&configure_temporary_instance(), &ctx).await.unwrap(),
            Outcome::NotValid
        );
        ctx.instance.temporary = true;
        run_do(&configure_temporary_instance(), &ctx).await.unwrap();

        ctx.infra.plan.scripts.configuration = "file {{ CONFIG_FILE_PATH }} {{ CONFIGFILE_ONLY }}".to_string();
        run_do(&configure_database_file(), &ctx).await.unwrap();

        let err = run_do(&configure_for_upgrade_only_db_config_file(), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        let mut next = ctx.infra.plan.clone();
        next.scripts.configuration = "upgrade {{ CONFIGFILE_ONLY }}".to_string();
        ctx.infra.plan.engine_equivalent_plan = Some(Box::new(next));
        run_do(&configure_for_upgrade_only_db_config_file(), &ctx).await.unwrap();

        assert_eq!(
            fixture.remote.scripts(),
            vec![
                "configure 10.0.0.1 only=",
                "file /tmp/database_configuration_file True",
                "upgrade True",
            ]
        );
    }

    #[tokio::test]
    async fn test_change_persistence_requires_running_change() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(1).await;
        let err = run_do(&configure_for_change_persistence(), &ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "There is not any 'Change Persistence Maintenance' running.");

        let mut target_plan = Plan::new("mysql-single", "mysql");
        target_plan.has_persistence = false;
        target_plan.scripts.configuration = "persist {{ HAS_PERSISTENCE }} {{ CONFIGFILE_ONLY }}".to_string();
        let ctx = ctx.with_change_persistence(ChangePersistence {
            target_plan,
            running: true,
        });
        run_do(&configure_for_change_persistence(), &ctx).await.unwrap();
        assert_eq!(fixture.remote.scripts(), vec!["persist False True"]);
    }

    #[tokio::test]
    async fn test_engine_upgrade_needs_equivalent_plan() {
        let fixture = Fixture::new().await;
        let mut ctx = fixture.context(1).await;
        let err = run_do(&initialization_for_upgrade(), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);

        let mut next = ctx.infra.plan.clone();
        next.scripts.initialization = "upgrade {{ HOST }}".to_string();
        ctx.infra.plan.engine_equivalent_plan = Some(Box::new(next));
        run_do(&initialization_for_upgrade(), &ctx).await.unwrap();
        assert_eq!(fixture.remote.scripts(), vec!["upgrade db-01"]);
    }

    #[tokio::test]
    async fn test_configure_restore_points_at_master() {
        let fixture = Fixture::new().await;
        let mut ctx = fixture.context(2).await.with_restore(fixture.restore());
        ctx.infra.plan.scripts.configuration =
            "master {{ MASTER_ADDRESS }} {{ CONFIGFILE_ONLY }} {{ CREATE_SENTINEL_CONFIG }}".to_string();
        run_do(&configure_restore(), &ctx).await.unwrap();
        assert_eq!(fixture.remote.scripts(), vec!["master 10.0.0.1 True True"]);
    }

    #[tokio::test]
    async fn test_log_only_on_ol6() {
        let config = StepsConfig::default().with_log_endpoint("logs.example.com:514");
        let fixture = Fixture::with_config(config).await;
        let mut ctx = fixture.context(1).await;
        assert_eq!(run_do(&configure_log(), &ctx).await.unwrap(), Outcome::NotValid);

        ctx.host = ctx.host.clone().with_os(HostOs::Ol6);
        run_do(&configure_log(), &ctx).await.unwrap();
        assert_eq!(run_do(&configure_log_temporary_instance(), &ctx).await.unwrap(), Outcome::NotValid);
        assert_eq!(fixture.remote.scripts(), vec!["log logs.example.com:514"]);
    }

    #[tokio::test]
    async fn test_initialization_migration_targets_future_instance() {
        let fixture = Fixture::new().await.with_host_migration().await;
        fixture
            .store
            .put_instance(&Instance::database(3, 1, 3, "10.1.0.1").with_dns("mysql-03-orders"))
            .await
            .unwrap();
        let mut ctx = fixture.context(1).await.with_host_migrate(1);
        ctx.instance = ctx.instance.clone().with_future_instance(3);

        let err = run_do(&initialization_migration(), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);

        ctx.infra.offering.equivalent = Some(Box::new(Offering::new("gcp-c2m4", 4096, 2)));
        run_do(&initialization_migration(), &ctx).await.unwrap();
        assert_eq!(
            fixture.remote.runs(),
            vec![("10.1.0.1".to_string(), "init db-03 orders move=False".to_string())]
        );
    }

    #[tokio::test]
    async fn test_start_replication_on_every_node() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(2).await;
        for step in [start_replication(), start_replication_new_infra()] {
            run_do(&step, &ctx).await.unwrap();
            run_undo(&step, &ctx).await.unwrap();
        }
        assert_eq!(fixture.remote.scripts(), vec!["replicate 10.0.0.2", "replicate 10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_start_replication_first_node() {
        let fixture = Fixture::new().await;
        let second = fixture.context(2).await;
        assert_eq!(
            run_do(&start_replication_first_node(), &second).await.unwrap(),
            Outcome::NotValid
        );

        let first = fixture.context(1).await;
        run_do(&start_replication_first_node(), &first).await.unwrap();
        assert_eq!(fixture.remote.scripts(), vec!["replicate 10.0.0.1"]);
    }

    #[tokio::test]
    async fn test_sentinel_variants_gated() {
        let fixture = Fixture::new().await;
        let ctx = fixture.context(2).await;
        assert_eq!(
            run_do(&configure_for_new_infra_sentinel(), &ctx).await.unwrap(),
            Outcome::NotValid
        );

        let sentinel = fixture.store.get_instance(2).await.unwrap().as_sentinel();
        fixture.store.put_instance(&sentinel).await.unwrap();
        let mut ctx = fixture.context(2).await;
        ctx.infra.plan.scripts.configuration = "sentinel {{ MASTER_ADDRESS }} {{ ONLY_SENTINEL }}".to_string();
        run_do(&configure_sentinel_file(), &ctx).await.unwrap();
        assert_eq!(fixture.remote.scripts(), vec!["sentinel 10.0.0.1 True"]);
    }
}
