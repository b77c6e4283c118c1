//! Sync CLI commands for synchronizing with the server.

use clap::{Args, Subcommand};

use mealsync::config::Config;
use mealsync::sync::{run_cycle, HttpTransport};
use mealsync::{SyncContext, SyncError};

/// Sync with remote server
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration and pending changes
    Status,
}

impl SyncCommand {
    pub async fn run(&self, ctx: &SyncContext, config: &Config) -> Result<(), SyncError> {
        match &self.command {
            None => self.sync(ctx, config).await,
            Some(SyncSubcommand::Status) => self.status(ctx, config).await,
        }
    }

    async fn sync(&self, ctx: &SyncContext, config: &Config) -> Result<(), SyncError> {
        let (Some(server_url), Some(api_key)) = (&config.sync.server_url, &config.sync.api_key)
        else {
            return Err(SyncError::NotConfigured);
        };
        let transport = HttpTransport::new(server_url, api_key, config.sync.timeout())?;

        println!("Syncing with server...");
        println!();

        let report = run_cycle(ctx, &transport, &config.sync.options()).await?;

        println!(
            "  ✓ pushed {} change(s) in {} round{}",
            report.push.pushed,
            report.push.rounds,
            if report.push.rounds == 1 { "" } else { "s" }
        );
        if report.push.conflicts > 0 {
            println!(
                "  ✓ resolved {} conflict(s), {} merged",
                report.push.conflicts, report.push.merged
            );
        }
        if report.push.dropped > 0 {
            println!("  ✗ {} change(s) refused by the server", report.push.dropped);
        }
        println!("  ✓ pulled {} change(s)", report.pull.applied);

        println!();
        let pending = ctx.store().queue().len().await?;
        if pending == 0 {
            println!("Sync complete.");
        } else {
            println!("Sync complete, {} change(s) still pending.", pending);
        }

        Ok(())
    }

    async fn status(&self, ctx: &SyncContext, config: &Config) -> Result<(), SyncError> {
        println!("Sync Configuration");
        println!("==================");
        println!();
        println!("Device:    {}", ctx.device_id());

        match (&config.sync.server_url, &config.sync.api_key) {
            (Some(server_url), Some(api_key)) => {
                println!("Server:    {}", server_url);
                let prefix: String = api_key.chars().take(8).collect();
                println!("API Key:   {}...", prefix);
            }
            _ => {
                println!("Status:    Not configured");
                println!();
                println!("To enable sync, add to your config file:");
                println!();
                println!("  sync:");
                println!("    server_url: \"http://localhost:8080\"");
                println!("    api_key: \"your-api-key\"");
                println!();
                println!("Or set environment variables:");
                println!("  MEALSYNC_SYNC_URL");
                println!("  MEALSYNC_SYNC_API_KEY");
            }
        }
        println!();

        println!("Pending changes: {}", ctx.store().queue().len().await?);
        for collection in ctx.registry().collections() {
            match ctx.store().checkpoint(&collection).await? {
                Some(at) => println!("  {:10} pulled through {}", collection, at.to_rfc3339()),
                None => println!("  {:10} never pulled", collection),
            }
        }

        Ok(())
    }
}
