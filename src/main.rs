// DBaaS control-plane command line
use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, Result, WrapErr};
use dbaas_volume::{poll_until, HttpProviderFactory, ProviderFactory, VolumeError};
use dbaas_workflow::OperationKind;
use std::io::stderr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

mod config;

use config::{describe_policy, AppConfig, DEFAULT_CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(author, version, about = "DBaaS maintenance workflow engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Lists the steps of an operation's pipeline, or every operation.
    Pipeline(PipelineArgs),
    /// Prints the provider-side state of a snapshot.
    SnapshotState(SnapshotArgs),
    /// Waits for a snapshot to reach a state, within the configured budget.
    WaitSnapshot(WaitSnapshotArgs),
    /// Validates the configuration file.
    CheckConfig,
}

#[derive(Parser, Debug)]
struct PipelineArgs {
    /// Operation kind, e.g. `recreate_slave`
    operation: Option<String>,
}

#[derive(Parser, Debug)]
struct SnapshotArgs {
    /// Provider-side snapshot identifier
    snapshot: String,

    /// Environment the snapshot lives in
    #[arg(short, long)]
    environment: String,

    /// Infra name, sent as the provider namespace
    #[arg(short, long)]
    namespace: String,
}

#[derive(Parser, Debug)]
struct WaitSnapshotArgs {
    #[command(flatten)]
    snapshot: SnapshotArgs,

    /// State to wait for
    #[arg(long, default_value = "READY")]
    state: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Respect RUST_LOG, fall back to verbose/info for our crates
    let level = if cli.verbose { "debug" } else { "info" };
    let default_directives = format!(
        "dbaas={level},dbaas_common={level},dbaas_volume={level},dbaas_steps={level},dbaas_workflow={level},reqwest=warn,hyper=warn",
        level = level
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();

    match cli.command {
        Commands::Pipeline(args) => show_pipeline(args),
        Commands::SnapshotState(args) => {
            let config = AppConfig::load(&cli.config)?;
            snapshot_state(&config, &args).await
        }
        Commands::WaitSnapshot(args) => {
            let config = AppConfig::load(&cli.config)?;
            wait_snapshot(&config, &args).await
        }
        Commands::CheckConfig => check_config(&cli.config),
    }
}

fn show_pipeline(args: PipelineArgs) -> Result<()> {
    let Some(operation) = args.operation else {
        for kind in OperationKind::ALL {
            println!("{} ({} steps)", kind, kind.pipeline().len());
        }
        return Ok(());
    };

    let pipeline = operation.parse::<OperationKind>()?.pipeline();
    println!("{}:", pipeline.kind());
    for (index, step) in pipeline.steps().iter().enumerate() {
        println!("{:>3}. {:<48} {}", index, step.name(), step.description());
    }
    Ok(())
}

fn factory(config: &AppConfig) -> Result<HttpProviderFactory> {
    HttpProviderFactory::new(config.provider.clone()).wrap_err("failed to build the volume provider client")
}

async fn snapshot_state(config: &AppConfig, args: &SnapshotArgs) -> Result<()> {
    let provider = factory(config)?.provider(&args.environment, &args.namespace)?;
    let state = provider.snapshot_state(&args.snapshot).await?;
    info!(
        snapshot = %args.snapshot,
        environment = %args.environment,
        state = %state.snapshot_status,
        "Snapshot state"
    );
    println!("{}", state.snapshot_status);
    Ok(())
}

async fn wait_snapshot(config: &AppConfig, args: &WaitSnapshotArgs) -> Result<()> {
    let target = &args.snapshot;
    let provider = factory(config)?.provider(&target.environment, &target.namespace)?;
    let policy = config.steps.polling.snapshot_ready;
    let what = format!("snapshot {} state {}", target.snapshot, args.state);
    debug!(budget = %describe_policy(&policy), "Waiting for snapshot");

    let provider = &provider;
    let attempts = poll_until(&policy, &what, |attempt| async move {
        let state = provider.snapshot_state(&target.snapshot).await?;
        info!(
            snapshot = %target.snapshot,
            state = %state.snapshot_status,
            expected = %args.state,
            attempt,
            "Snapshot state"
        );
        Ok::<_, VolumeError>((state.snapshot_status == args.state).then_some(attempt))
    })
    .await?;

    println!("{} after {} attempt(s)", args.state, attempts);
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = AppConfig::load(path)?;
    let problems = config.problems();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("{}", problem);
        }
        bail!("{} problem(s) in {}", problems.len(), path.display());
    }

    let environments: Vec<&str> = config.provider.environments.keys().map(String::as_str).collect();
    let polling = &config.steps.polling;
    println!("environments: {}", environments.join(", "));
    println!("snapshot_ready: {}", describe_policy(&polling.snapshot_ready));
    println!("rsync_completion: {}", describe_policy(&polling.rsync_completion));
    println!("replication_health: {}", describe_policy(&polling.replication_health));
    println!("skip_snapshot_wait: {}", config.steps.skip_snapshot_wait.join(", "));
    println!("{} is valid", path.display());
    Ok(())
}
