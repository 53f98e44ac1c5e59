use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use peloton_core::Region;
use peloton_storage::SqliteStore;
use peloton_sync::{research_entry_list, CancelFlag, ResearchReport, ScrapeConfig, ScrapePipeline};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "peloton")]
#[command(about = "Cycling race results acquisition and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every enabled source serving a region, once.
    Scrape {
        #[arg(long, value_enum)]
        region: RegionArg,
        /// Limit the run to one source id from the registry.
        #[arg(long)]
        source: Option<String>,
    },
    /// Keep scraping a region on the configured cron schedule.
    Watch {
        #[arg(long, value_enum)]
        region: RegionArg,
    },
    /// Look up an entry list (file or stdin) against stored history.
    Research {
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Stats,
    Migrate,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RegionArg {
    PaysDeLaLoire,
    Bretagne,
    Normandie,
    CentreValDeLoire,
    NouvelleAquitaine,
}

impl From<RegionArg> for Region {
    fn from(arg: RegionArg) -> Self {
        match arg {
            RegionArg::PaysDeLaLoire => Region::PaysDeLaLoire,
            RegionArg::Bretagne => Region::Bretagne,
            RegionArg::Normandie => Region::Normandie,
            RegionArg::CentreValDeLoire => Region::CentreValDeLoire,
            RegionArg::NouvelleAquitaine => Region::NouvelleAquitaine,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("PELOTON_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE"))
        .unwrap_or(false);
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Ctrl-C asks the engine to stop after the race in flight.
fn cancel_on_ctrl_c() -> CancelFlag {
    let cancel = CancelFlag::default();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current race");
            flag.cancel();
        }
    });
    cancel
}

async fn open_store(config: &ScrapeConfig) -> Result<SqliteStore> {
    let store = SqliteStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    store.migrate().await.context("applying migrations")?;
    Ok(store)
}

async fn read_entry_list(file: Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display())),
        None => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("reading entry list from stdin")?;
            Ok(text)
        }
    }
}

fn print_research(report: &ResearchReport) {
    println!(
        "{:<14} {:<22} {:<16} {:<10} {:>5} {:>6}",
        "ID", "LAST NAME", "FIRST NAME", "MATCH", "BEST", "RACES"
    );
    for row in &report.rows {
        let matched = serde_json::to_value(row.matched_by)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        println!(
            "{:<14} {:<22} {:<16} {:<10} {:>5} {:>6}",
            row.entry.id,
            row.entry.last_name,
            row.entry.first_name,
            matched,
            row.best_rank.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
            row.total_races
        );
    }
    println!("found {}/{}", report.found, report.total_analyzed);
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ScrapeConfig::from_env();

    match cli.command {
        Commands::Scrape { region, source } => {
            let region = Region::from(region);
            let pipeline = ScrapePipeline::connect(config).await?;
            let cancel = cancel_on_ctrl_c();
            let summaries = pipeline.run_once(region, source.as_deref(), &cancel).await?;
            for summary in &summaries {
                println!(
                    "{} {}: status={} pages={} new={} updated={} unchanged={} failed={} run_id={}",
                    summary.source_id,
                    summary.region,
                    summary.status(),
                    summary.pages_scraped,
                    summary.races_new,
                    summary.races_updated,
                    summary.races_unchanged,
                    summary.races_failed,
                    summary.run_id
                );
            }
            pipeline.store().close().await;
        }
        Commands::Watch { region } => {
            let region = Region::from(region);
            let pipeline = Arc::new(ScrapePipeline::connect(config).await?);
            let cancel = CancelFlag::default();
            let Some(mut sched) = Arc::clone(&pipeline)
                .maybe_build_scheduler(region, cancel.clone())
                .await?
            else {
                bail!("scheduler disabled; set PELOTON_SCHEDULER_ENABLED=1 to watch");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%region, "watching; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            cancel.cancel();
            sched.shutdown().await.context("stopping scheduler")?;
            pipeline.store().close().await;
        }
        Commands::Research { file, json } => {
            let text = read_entry_list(file).await?;
            let store = open_store(&config).await?;
            let report = research_entry_list(&store, &text).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_research(&report);
            }
            store.close().await;
        }
        Commands::Stats => {
            let store = open_store(&config).await?;
            let stats = store.stats().await?;
            println!("races:    {}", stats.total_races);
            println!("cyclists: {}", stats.total_cyclists);
            println!("results:  {}", stats.total_results);
            match stats.latest_race {
                Some(latest) => println!("latest:   {} {} ({})", latest.date, latest.name, latest.id),
                None => println!("latest:   -"),
            }
            store.close().await;
        }
        Commands::Migrate => {
            let store = open_store(&config).await?;
            println!("migrations applied to {}", config.database_url);
            store.close().await;
        }
    }

    Ok(())
}
