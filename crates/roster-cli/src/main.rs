use anyhow::Result;
use clap::{Parser, Subcommand};
use roster_sync::{RunMode, SyncConfig, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "roster-cli")]
#[command(about = "Sync scraped profiles into the roster workbook")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile pending targets (or the online list) into Profiles.
    Sync {
        /// Take targets from the site's online list instead of the Target table.
        #[arg(long)]
        online: bool,
        /// Cap on profiles this run; 0 means no cap. Overrides MAX_PROFILES_PER_RUN.
        #[arg(long)]
        max: Option<usize>,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List pending targets without scraping or writing profiles.
    Targets,
    /// Connect, prepare the workbook and report what was loaded.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync {
        online: false,
        max: None,
        json: false,
    });

    match command {
        Commands::Sync { online, max, json } => {
            let mode = if online { RunMode::Online } else { RunMode::Queue };
            let summary = roster_sync::run_sync_once_from_env(mode, max).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for item in &summary.outcomes {
                    println!(
                        "{:<24} {:<9} {}",
                        item.nickname,
                        item.outcome.status.as_str(),
                        item.outcome.remarks()
                    );
                }
                let m = summary.metrics;
                println!(
                    "sync complete: run_id={} processed={} success={} failed={} new={} updated={} unchanged={}",
                    summary.run_id, m.processed, m.success, m.failed, m.new, m.updated, m.unchanged
                );
            }
        }
        Commands::Targets => {
            let pipeline = SyncPipeline::connect(SyncConfig::from_env()).await?;
            let targets = pipeline.pending_targets().await?;
            for target in &targets {
                let row = target.row.map(|r| r.to_string()).unwrap_or_default();
                println!("{:>5}  {:<24} {}", row, target.nickname, target.source);
            }
            println!("{} pending target(s)", targets.len());
        }
        Commands::Check => {
            let pipeline = SyncPipeline::connect(SyncConfig::from_env()).await?;
            let session = pipeline.open_session().await?;
            println!(
                "workbook ready: columns={} profiles={} tagged={}",
                session.schema().len(),
                session.index().len(),
                session.tags().len()
            );
        }
    }

    Ok(())
}
