use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use native_remoting::{ClientOperationHandlerFactory, HostServiceNames, NativeRemotingConfig};
use svckit::{ModelController, Operation, ServiceContainer};
use svckit_bootstrap::{
    module_config_or_default, wait_for_shutdown, AppConfig, AppConfigProvider, CliArgs,
};

use std::path::PathBuf;
use std::sync::Arc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Management server - boots the host services and opens the native management interface
#[derive(Parser)]
#[command(name = "mgmt-server")]
#[command(about = "Management server - two-phase management operations over a service container")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Boot in admin-only mode (overrides server.running_mode)
    #[arg(long)]
    admin_only: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        print_config: cli.print_config,
        verbose: cli.verbose,
        admin_only: cli.admin_only,
    };

    // defaults -> YAML (if provided) -> env (APP__*) -> CLI overrides
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.clone().unwrap_or_default();
    svckit_bootstrap::init_logging(&logging_config, &config.home_dir());

    tracing::info!(name = %config.server.name, "Management server starting");

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(&config),
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    let timeout = config.container.verification_timeout;
    let process = config.server.process_info();
    let provider = AppConfigProvider::new(config);
    let remoting: NativeRemotingConfig =
        module_config_or_default(&provider, native_remoting::MODULE_NAME)?;

    tracing::info!(?process, ?timeout, "Phase: container");
    let container = ServiceContainer::new();
    let controller = ModelController::with_verification_timeout(container.clone(), process, timeout);

    let host = HostServiceNames::standard()?;
    let endpoint = remoting.endpoint_name()?;
    native_remoting::start_host_services(&container, &host, controller.clone(), &endpoint, timeout)
        .await?;

    tracing::info!("Phase: register handlers");
    let address = native_remoting::register(
        &controller,
        &remoting,
        &host,
        Arc::new(ClientOperationHandlerFactory),
    )?;

    tracing::info!(%address, "Phase: management interface");
    match controller.execute_one(Operation::add(address)).await {
        Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        Err(failure) => {
            let outcome = serde_json::json!({
                "transaction": failure.transaction,
                "state": "rolled-back",
                "kind": failure.kind(),
                "step": failure.step,
                "cause": failure.cause_chain(),
                "rollback_clean": failure.rolled_back_cleanly(),
            });
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            container.shutdown().await;
            return Err(failure.into());
        }
    }

    let reason = wait_for_shutdown().await?;
    tracing::info!(?reason, "Phase: shutdown");
    container.shutdown().await;
    Ok(())
}

fn check_config(config: &AppConfig) -> Result<()> {
    tracing::info!("Checking configuration…");
    let provider = AppConfigProvider::new(config.clone());
    let remoting: NativeRemotingConfig =
        module_config_or_default(&provider, native_remoting::MODULE_NAME)?;
    native_remoting::ChannelNames::new(&remoting.endpoint_name()?, &remoting.channel)?;
    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);
    Ok(())
}
