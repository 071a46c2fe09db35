use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use gantry::{Kernel, KernelOptions};
use gantry_bootstrap::{current_env, AppConfig, CliArgs, LoggingConfig};

mod modules;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Gantry reference server: a landing module at `/` and a blog module at
/// `/blog`, assembled on the gantry kernel.
#[derive(Parser)]
#[command(name = "gantry-server")]
#[command(about = "Gantry reference server")]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port override for the HTTP server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

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
async fn main() {
    let cli = Cli::parse();
    let env = current_env();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        port: cli.port,
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    // Layered config: defaults -> YAML -> <env>/ overlay -> APP__* env
    // vars -> CLI overrides.
    let mut config = match AppConfig::load_or_default(cli.config.as_deref(), &env) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };
    config.apply_cli_overrides(&args);

    let logging = config.logging.clone().unwrap_or_else(LoggingConfig::default);
    let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    gantry_bootstrap::init_logging(&logging, &base_dir);

    if cli.print_config {
        match config.to_yaml() {
            Ok(yaml) => println!("{yaml}"),
            Err(e) => {
                eprintln!("{e:#}");
                std::process::exit(1);
            }
        }
        return;
    }

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config, env, base_dir).await,
        Commands::Check => check_config(config),
    };

    if let Err(e) = result {
        tracing::error!(error = %format!("{e:#}"), "fatal");
        std::process::exit(1);
    }
}

async fn run_server(config: AppConfig, env: String, base_dir: PathBuf) -> anyhow::Result<()> {
    tracing::info!(env = %env, "gantry server starting");

    let mut kernel = Kernel::new(KernelOptions {
        base_dir,
        env: Some(env),
        app_config: config,
        app_name: Some(env!("CARGO_PKG_NAME").to_string()),
        app_version: Some(env!("CARGO_PKG_VERSION").to_string()),
    });

    modules::register(&mut kernel);

    kernel.run().await
}

fn check_config(config: AppConfig) -> anyhow::Result<()> {
    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);
    Ok(())
}
