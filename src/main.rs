use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{ConfigCommand, LogCommand, SyncCommand, WeightCommand};
use mealsync::clock::SystemClock;
use mealsync::config::Config;
use mealsync::db::LocalStore;
use mealsync::sync::CollectionRegistry;
use mealsync::SyncContext;

#[derive(Parser)]
#[command(name = "mealsync")]
#[command(version)]
#[command(about = "Offline-first meal and weight log", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage meal logs
    Log(LogCommand),

    /// Record body weight
    Weight(WeightCommand),

    /// Sync with the server
    Sync(SyncCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mealsync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    let command = match cli.command {
        Some(Commands::Config(cmd)) => return cmd.run(&config),
        Some(command) => command,
        None => {
            println!("Use --help to see available commands");
            return Ok(());
        }
    };

    let store = LocalStore::open(&config.database_path.value).await?;
    let ctx = SyncContext::open(store, Arc::new(SystemClock), CollectionRegistry::default()).await?;

    match command {
        Commands::Log(cmd) => cmd.run(&ctx).await?,
        Commands::Weight(cmd) => cmd.run(&ctx).await?,
        Commands::Sync(cmd) => cmd.run(&ctx, &config).await?,
        Commands::Config(_) => {}
    }

    Ok(())
}
