// pairguard - multi-machine vision fault monitor
// Watches paired parts through cameras and drives one relay per pair

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use pairguard_cns::build_device;
use pairguard_core::{ConfigStore, MachineId, SystemConfig};
use pairguard_server::logging::DEFAULT_LOG_DIR;
use pairguard_server::{
    build_bank, init_console_logging, init_logging, journal_path, plan_machines, spawn_journal,
    EventStreams, OrchestratorBuilder, StartupError,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "config/machines_config.json";

#[derive(Parser)]
#[command(name = "pairguard")]
#[command(about = "Vision fault monitor for paired parts on multiple machines", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON or TOML)
    #[arg(long, short, default_value = DEFAULT_CONFIG, global = true)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Start monitoring every valid machine until Ctrl-C
    Run {
        /// Directory for the rolling log and the diagnostics journal
        #[arg(long, default_value = DEFAULT_LOG_DIR)]
        log_dir: PathBuf,
    },

    /// Validate the configuration and zone files
    Check,

    /// Write the default configuration
    InitConfig {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Energize each relay channel in turn
    TestRelays {
        /// Only this machine
        #[arg(long, short)]
        machine: Option<u32>,
    },

    /// De-energize every configured relay channel
    ResetRelays,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("pairguard: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(startup) = err.downcast_ref::<StartupError>() {
        return startup.exit_code();
    }
    if err.downcast_ref::<pairguard_core::Error>().is_some() {
        return 2;
    }
    1
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let store = ConfigStore::new(&cli.config);
    match cli.command {
        Commands::Run { log_dir } => run(store, log_dir).await,
        Commands::Check => {
            init_console_logging();
            check(store)
        }
        Commands::InitConfig { force } => {
            init_console_logging();
            init_config(store, force)
        }
        Commands::TestRelays { machine } => {
            init_console_logging();
            test_relays(store, machine.map(MachineId)).await
        }
        Commands::ResetRelays => {
            init_console_logging();
            reset_relays(store).await
        }
    }
}

fn load_config(store: &ConfigStore) -> anyhow::Result<SystemConfig> {
    store.load().map_err(|e| StartupError::Config(e).into())
}

async fn run(store: ConfigStore, log_dir: PathBuf) -> anyhow::Result<()> {
    let _guard = init_logging(&log_dir)
        .with_context(|| format!("cannot initialize logging in {}", log_dir.display()))?;
    info!("🚀 Starting pairguard {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&store)?;

    let streams = EventStreams::new();
    let journal_stop = CancellationToken::new();
    let journal = spawn_journal(
        journal_path(&log_dir),
        streams.diagnostics.subscribe(),
        journal_stop.clone(),
    );

    let orchestrator = match OrchestratorBuilder::new(config, store)
        .event_streams(streams)
        .build()
        .await
    {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            journal_stop.cancel();
            let _ = journal.await;
            return Err(e.into());
        }
    };

    for (machine, reason) in orchestrator.rejected() {
        warn!("⚠️  M{} will not be monitored: {}", machine, reason);
    }
    orchestrator.start_all();
    info!("✅ Monitoring {} machine(s), press Ctrl-C to stop", orchestrator.machine_ids().len());

    wait_for_shutdown().await;

    orchestrator.shutdown().await;
    journal_stop.cancel();
    let _ = journal.await;
    info!("👋 pairguard stopped");
    Ok(())
}

fn check(store: ConfigStore) -> anyhow::Result<()> {
    if !store.config_path().exists() {
        bail!(StartupError::Config(pairguard_core::Error::Configuration(format!(
            "{} not found",
            store.config_path().display()
        ))));
    }
    let config = load_config(&store)?;
    let plan = plan_machines(&config, &store);

    println!("Configuration: {}", store.config_path().display());
    if config.model_path.is_file() {
        println!("Model:         {}", config.model_path.display());
    } else {
        println!("Model:         {} (missing)", config.model_path.display());
    }
    for (machine, _) in &plan.ready {
        let channels = machine.channel_range(config.pairs_per_machine);
        println!(
            "  M{} {:<16} OK        relays {}..={}  camera {}",
            machine.machine_id,
            machine.name,
            channels.start,
            channels.end - 1,
            machine.camera_source
        );
    }
    for (machine, reason) in &plan.rejected {
        println!("  M{} {:<16} REJECTED  {}", machine, "", reason);
    }
    for machine in config.machines.iter().filter(|m| !m.enabled) {
        println!("  M{} {:<16} disabled", machine.machine_id, machine.name);
    }

    if plan.ready.is_empty() {
        bail!(StartupError::NoMachines);
    }
    Ok(())
}

fn init_config(store: ConfigStore, force: bool) -> anyhow::Result<()> {
    if store.config_path().exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            store.config_path().display()
        );
    }
    store
        .save(&SystemConfig::default())
        .map_err(StartupError::Config)?;
    println!("Default configuration written to {}", store.config_path().display());
    Ok(())
}

async fn test_relays(store: ConfigStore, machine: Option<MachineId>) -> anyhow::Result<()> {
    let config = load_config(&store)?;
    let validation = config.validate_machines();
    for (id, reason) in &validation.rejected {
        warn!("M{} skipped: {}", id, reason);
    }
    let device = build_device(&config.relay_config).map_err(StartupError::Device)?;
    let (bank, unassigned) = build_bank(&config, device, &validation.accepted).await?;
    for (id, reason) in &unassigned {
        warn!("M{} skipped: {}", id, reason);
    }

    let test = async {
        match machine {
            Some(machine) => bank.test_machine(machine).await,
            None => bank.test_all().await,
        }
    };
    let result = tokio::select! {
        result = test => result,
        _ = wait_for_shutdown() => {
            bank.interrupt();
            warn!("Relay test interrupted");
            Ok(())
        }
    };

    bank.reset_all().await;
    bank.close().await?;
    result?;
    info!("Relay test finished");
    Ok(())
}

async fn reset_relays(store: ConfigStore) -> anyhow::Result<()> {
    let config = load_config(&store)?;
    let validation = config.validate_machines();
    let device = build_device(&config.relay_config).map_err(StartupError::Device)?;
    let (bank, _) = build_bank(&config, device, &validation.accepted).await?;
    let ok = bank.reset_all().await;
    bank.close().await?;
    if !ok {
        bail!("some relay channels could not be reset");
    }
    info!("All relay channels de-energized");
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("🛑 Shutdown signal received");
}
