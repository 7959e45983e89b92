use std::path::PathBuf;

use anyhow::Result;
use bbw_sync::{SyncPipeline, WatchConfig, DEFAULT_CONFIG_PATH};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bbw")]
#[command(about = "Bug bounty program watcher")]
struct Cli {
    /// Path to the YAML config.
    #[arg(long, short, env = "BBW_CONFIG", default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every monitored platform once, reconcile it against the store and notify.
    Run,
    /// Check that every monitored platform endpoint answers, without touching the store.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = WatchConfig::load(&cli.config).await?;
    info!(config = %cli.config.display(), "config loaded");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "run complete: run_id={} first_run={} platforms={} failed={}",
                summary.run_id,
                summary.first_run,
                summary.platforms.len(),
                summary.failed_platforms.len()
            );
            for (platform, stats) in &summary.platforms {
                println!(
                    "  {platform}: processed={} new={} updated={} unchanged={} removed={} skipped={} failed={} notified={}",
                    stats.processed,
                    stats.new,
                    stats.updated,
                    stats.unchanged,
                    stats.removed,
                    stats.skipped,
                    stats.failed,
                    stats.notified
                );
            }
            for platform in &summary.failed_platforms {
                println!("  {platform}: aborted");
            }
        }
        Commands::Check => {
            let pipeline = SyncPipeline::detached(config)?;
            let reports = pipeline.check_endpoints().await;
            for report in &reports {
                match (&report.bytes, &report.error) {
                    (Some(bytes), _) => println!("  {}: ok ({bytes} bytes) {}", report.platform, report.url),
                    (None, Some(error)) => println!("  {}: FAILED {} ({error})", report.platform, report.url),
                    (None, None) => println!("  {}: no response {}", report.platform, report.url),
                }
            }
            let failed = reports.iter().filter(|r| !r.is_ok()).count();
            if failed > 0 {
                anyhow::bail!("{failed} of {} platform endpoints failed", reports.len());
            }
            println!("all {} platform endpoints reachable", reports.len());
        }
    }

    Ok(())
}
