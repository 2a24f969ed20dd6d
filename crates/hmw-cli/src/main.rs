use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "hmw-cli")]
#[command(about = "Hidden market watch: inara crawler and Discord alerts")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl on a schedule and deliver alerts until Ctrl-C.
    Run,
    /// Run one crawl cycle and print its summary.
    ScanOnce,
    /// Run one dispatch pass over the current store.
    DispatchOnce,
    /// Print a per-system summary of the store.
    Show,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .and_then(|level| EnvFilter::try_new(level.trim().to_ascii_lowercase()).ok())
        })
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = hmw_sync::SyncConfig::from_env();
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested; finishing current pass");
                    let _ = shutdown_tx.send(true);
                }
            });
            hmw_sync::run_service(config, shutdown_rx).await?;
        }
        Commands::ScanOnce => {
            let report = hmw_sync::run_scan_once_from_env().await?;
            println!(
                "scan complete: cycle={} markets={} powerplay={} systems={} stations={} failed_pages={} pruned={}",
                report.cycle.number,
                report.markets_written,
                report.powerplay_written,
                report.scanned_systems,
                report.stations_checked,
                report.failed_pages,
                report.pruned.len()
            );
        }
        Commands::DispatchOnce => {
            let report = hmw_sync::run_dispatch_once_from_env().await?;
            println!(
                "dispatch complete: considered={} sent={} partial={} empty={} failed={} unreachable={} pings={} marked={}",
                report.considered,
                report.sent,
                report.partial,
                report.skipped_empty,
                report.failed,
                report.unreachable.len(),
                report.pings,
                report.marked
            );
        }
        Commands::Show => {
            let config = hmw_sync::SyncConfig::from_env();
            let store = hmw_storage::MarketStore::open(&config.market_db_path);
            let summary = hmw_sync::summarize_store(&store, config.cooldown)
                .with_context(|| format!("summarizing {}", config.market_db_path.display()))?;
            if summary.is_empty() {
                println!("{}: no systems recorded", store.describe());
            }
            for system in summary {
                println!(
                    "{} stations={} listings={} active_cooldowns={} powerplay={} last_alert={}",
                    system.system,
                    system.stations,
                    system.listings,
                    system.active_cooldowns,
                    system.powerplay.as_deref().unwrap_or("-"),
                    system
                        .last_alert
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
    }

    Ok(())
}
