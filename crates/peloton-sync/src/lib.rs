//! Scrape orchestration: configuration, source registry, the per-source run
//! loop, run reports and the cron scheduler.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use peloton_adapters::{adapter_for, AdapterKind, AdapterSettings, DEFAULT_MAX_PAGES};
use peloton_core::{CategoryFilter, Region, ScrapeCheckpoint};
use peloton_storage::{FetchProfile, HttpFetcher, PageArchive, ScrapeRunRecord, SqliteStore};
use serde::Deserialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod engine;
pub mod reconcile;
pub mod research;

pub use engine::{CancelFlag, EngineError, FailedRace, RunSummary, ScrapeEngine};
pub use research::{parse_entry_list, research_entry_list, ResearchReport};

pub const CRATE_NAME: &str = "peloton-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub adapter: AdapterKind,
    pub base_url: String,
    #[serde(default)]
    pub regions: Vec<Region>,
    #[serde(default)]
    pub listing_params: BTreeMap<String, String>,
    #[serde(default)]
    pub accept_unlabeled: bool,
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub fetch: FetchOverrides,
}

fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}

/// Per-source tweaks on top of the default fetch profile.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchOverrides {
    pub min_interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub base_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub max_backoff_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
}

impl FetchOverrides {
    pub fn apply(&self, base: FetchProfile) -> FetchProfile {
        FetchProfile {
            min_interval: self
                .min_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(base.min_interval),
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            base_backoff: self
                .base_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(base.base_backoff),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(base.backoff_multiplier),
            max_backoff: self
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(base.max_backoff),
            timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(base.timeout),
        }
    }
}

impl SourceConfig {
    pub fn fetch_profile(&self) -> FetchProfile {
        self.fetch.apply(FetchProfile::default())
    }

    pub fn category_filter(&self) -> CategoryFilter {
        let filter = match &self.categories {
            Some(categories) => CategoryFilter::new(categories),
            None => CategoryFilter::default(),
        };
        filter.accept_unlabeled(self.accept_unlabeled)
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            source_id: self.source_id.clone(),
            base_url: self.base_url.clone(),
            listing_params: self.listing_params.clone(),
        }
    }

    pub fn serves(&self, region: Region) -> bool {
        self.regions.contains(&region)
    }
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Enabled sources serving `region`, optionally narrowed to one id.
    pub fn sources_for(&self, region: Region, source_id: Option<&str>) -> Vec<&SourceConfig> {
        self.sources
            .iter()
            .filter(|s| s.enabled && s.serves(region))
            .filter(|s| source_id.map_or(true, |wanted| s.source_id == wanted))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub database_url: String,
    pub sources_path: PathBuf,
    pub archive_dir: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/peloton.db".to_string()),
            sources_path: std::env::var("PELOTON_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            archive_dir: std::env::var("PELOTON_ARCHIVE_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            reports_dir: std::env::var("PELOTON_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("reports")),
            user_agent: std::env::var("PELOTON_USER_AGENT")
                .unwrap_or_else(|_| format!("peloton/{}", env!("CARGO_PKG_VERSION"))),
            scheduler_enabled: std::env::var("PELOTON_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scrape_cron: std::env::var("SCRAPE_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }
}

pub struct ScrapePipeline {
    config: ScrapeConfig,
    registry: SourceRegistry,
    store: SqliteStore,
    http: HttpFetcher,
    archive: Option<PageArchive>,
    /// Held for the length of a scheduled run so overlapping ticks are skipped.
    region_locks: HashMap<Region, Mutex<()>>,
}

impl ScrapePipeline {
    /// Loads the registry, opens and migrates the store, builds the HTTP client.
    pub async fn connect(config: ScrapeConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_path).await?;
        let store = SqliteStore::connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        store.migrate().await.context("applying migrations")?;
        let http = HttpFetcher::with_reqwest(Some(&config.user_agent))?;
        Ok(Self::from_parts(config, registry, store, http))
    }

    pub fn from_parts(
        config: ScrapeConfig,
        registry: SourceRegistry,
        store: SqliteStore,
        http: HttpFetcher,
    ) -> Self {
        let archive = config.archive_dir.clone().map(PageArchive::new);
        let region_locks = Region::ALL
            .into_iter()
            .map(|region| (region, Mutex::new(())))
            .collect();
        Self {
            config,
            registry,
            store,
            http,
            archive,
            region_locks,
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub async fn run_once(
        &self,
        region: Region,
        source_id: Option<&str>,
        cancel: &CancelFlag,
    ) -> Result<Vec<RunSummary>> {
        let sources = self.registry.sources_for(region, source_id);
        if sources.is_empty() {
            bail!("no enabled source serves region {region}");
        }

        let mut summaries = Vec::with_capacity(sources.len());
        for source in sources {
            if cancel.is_cancelled() {
                break;
            }
            let summary = self.run_source(source, region, cancel).await?;
            let report_dir = self.write_reports(&summary).await?;
            info!(
                source_id = %source.source_id,
                report = %report_dir.display(),
                "run report written"
            );
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Like `run_once`, but returns `Ok(None)` without scraping while an
    /// earlier call for the same region is still running.
    pub async fn try_run_once(
        &self,
        region: Region,
        cancel: &CancelFlag,
    ) -> Result<Option<Vec<RunSummary>>> {
        let Some(lock) = self.region_locks.get(&region) else {
            bail!("no lock registered for region {region}");
        };
        let Ok(_busy) = lock.try_lock() else {
            warn!(%region, "previous scrape still running, tick skipped");
            return Ok(None);
        };
        self.run_once(region, None, cancel).await.map(Some)
    }

    async fn run_source(
        &self,
        source: &SourceConfig,
        region: Region,
        cancel: &CancelFlag,
    ) -> Result<RunSummary> {
        info!(
            source_id = %source.source_id,
            source = %source.display_name,
            %region,
            "scraping source"
        );
        let adapter = adapter_for(source.adapter, source.adapter_settings());
        let mut checkpoint = self
            .store
            .load_checkpoint(&source.source_id, region)
            .await
            .with_context(|| format!("loading checkpoint for {}", source.source_id))?
            .unwrap_or_else(|| ScrapeCheckpoint::new(&source.source_id, region));

        let summary = ScrapeEngine::new(&self.store, &self.http, adapter.as_ref())
            .with_profile(source.fetch_profile())
            .with_filter(source.category_filter())
            .with_max_pages(source.max_pages)
            .with_archive(self.archive.as_ref())
            .with_cancel(cancel.clone())
            .run(Uuid::new_v4(), region, &mut checkpoint)
            .await
            .with_context(|| format!("scraping {} for {region}", source.source_id))?;

        self.store
            .record_scrape_run(&ScrapeRunRecord {
                run_id: summary.run_id,
                source_id: summary.source_id.clone(),
                region,
                started_at: summary.started_at,
                finished_at: summary.finished_at,
                status: summary.status().to_string(),
                summary: serde_json::to_value(&summary).context("serializing run summary")?,
            })
            .await
            .context("recording scrape run")?;
        Ok(summary)
    }

    /// `reports/<run_id>/run_summary.json`.
    pub async fn write_reports(&self, summary: &RunSummary) -> Result<PathBuf> {
        let run_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;
        let path = run_dir.join("run_summary.json");
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(run_dir)
    }

    pub async fn maybe_build_scheduler(
        self: Arc<Self>,
        region: Region,
        cancel: CancelFlag,
    ) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.scrape_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            let cancel = cancel.clone();
            Box::pin(async move {
                info!(%region, "scheduled scrape triggered");
                if let Err(err) = pipeline.try_run_once(region, &cancel).await {
                    error!(error = %format!("{err:#}"), "scheduled scrape failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
