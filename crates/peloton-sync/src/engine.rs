//! The scrape loop for one (source, region): listing pages, then each race
//! through fetch, parse, normalize, filter, number, plan and commit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use peloton_adapters::{ListingError, ParseError, RacePager, RaceRef, SiteAdapter, DEFAULT_MAX_PAGES};
use peloton_core::{CategoryFilter, Race, Region, ScrapeCheckpoint};
use peloton_storage::{
    FetchError, FetchProfile, FetchedPage, HttpFetcher, PageArchive, PersistenceError, SqliteStore,
    UnparsedPage,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reconcile::{plan_race, prepare_entrants, RaceState};

/// Set from a signal handler; the engine stops between races.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] PersistenceError),
    #[error("saving checkpoint failed: {0}")]
    Checkpoint(#[source] PersistenceError),
    #[error("listing for {source_id} failed: {error}")]
    Listing {
        source_id: String,
        #[source]
        error: ListingError,
    },
}

/// Why a single race was skipped. Never aborts the run on its own.
#[derive(Debug, Error)]
pub enum RaceFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRace {
    pub url: String,
    pub race_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub region: Region,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resumed: bool,
    pub pages_scraped: usize,
    pub races_seen: usize,
    pub races_new: usize,
    pub races_updated: usize,
    pub races_unchanged: usize,
    pub races_skipped: usize,
    pub races_failed: usize,
    pub results_inserted: usize,
    pub results_updated: usize,
    pub results_retained: usize,
    pub rows_dropped: usize,
    pub rows_filtered: usize,
    pub duplicate_rows: usize,
    pub listing_complete: bool,
    pub cancelled: bool,
    pub failures: Vec<FailedRace>,
}

impl RunSummary {
    fn new(run_id: Uuid, source_id: &str, region: Region) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            source_id: source_id.to_string(),
            region,
            started_at: now,
            finished_at: now,
            resumed: false,
            pages_scraped: 0,
            races_seen: 0,
            races_new: 0,
            races_updated: 0,
            races_unchanged: 0,
            races_skipped: 0,
            races_failed: 0,
            results_inserted: 0,
            results_updated: 0,
            results_retained: 0,
            rows_dropped: 0,
            rows_filtered: 0,
            duplicate_rows: 0,
            listing_complete: false,
            cancelled: false,
            failures: Vec::new(),
        }
    }

    pub fn status(&self) -> &'static str {
        if self.cancelled {
            "cancelled"
        } else if self.listing_complete && self.races_failed == 0 {
            "completed"
        } else {
            "partial"
        }
    }

    fn absorb(&mut self, report: &RaceReport) {
        match (report.state, report.inserts + report.updates) {
            (RaceState::New, _) => self.races_new += 1,
            (RaceState::Existing, 0) => self.races_unchanged += 1,
            (RaceState::Existing, _) => self.races_updated += 1,
        }
        self.results_inserted += report.inserts;
        self.results_updated += report.updates;
        self.results_retained += report.retained;
        self.rows_dropped += report.rows_dropped;
        self.rows_filtered += report.rows_filtered;
        self.duplicate_rows += report.duplicates;
    }
}

#[derive(Debug, Clone)]
struct RaceReport {
    race_id: String,
    state: RaceState,
    inserts: usize,
    updates: usize,
    retained: usize,
    rows_dropped: usize,
    rows_filtered: usize,
    duplicates: usize,
}

pub struct ScrapeEngine<'a> {
    store: &'a SqliteStore,
    fetcher: &'a HttpFetcher,
    adapter: &'a dyn SiteAdapter,
    profile: FetchProfile,
    filter: CategoryFilter,
    max_pages: u32,
    archive: Option<&'a PageArchive>,
    cancel: CancelFlag,
}

impl<'a> ScrapeEngine<'a> {
    pub fn new(store: &'a SqliteStore, fetcher: &'a HttpFetcher, adapter: &'a dyn SiteAdapter) -> Self {
        Self {
            store,
            fetcher,
            adapter,
            profile: FetchProfile::default(),
            filter: CategoryFilter::default(),
            max_pages: DEFAULT_MAX_PAGES,
            archive: None,
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_profile(mut self, profile: FetchProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_filter(mut self, filter: CategoryFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_archive(mut self, archive: Option<&'a PageArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(
        &self,
        run_id: Uuid,
        region: Region,
        checkpoint: &mut ScrapeCheckpoint,
    ) -> Result<RunSummary, EngineError> {
        let source_id = self.adapter.source_id().to_string();
        let mut summary = RunSummary::new(run_id, &source_id, region);
        summary.resumed = checkpoint.begin_run(run_id);
        self.save(checkpoint).await?;
        info!(
            %source_id,
            %region,
            %run_id,
            resumed = summary.resumed,
            start_page = checkpoint.next_page,
            "scrape run started"
        );

        let mut pager = RacePager::new(self.adapter, self.fetcher, self.profile, region)
            .starting_at(checkpoint.next_page)
            .max_pages(self.max_pages);
        // Once a race fails the cursor stays put for the rest of the pass, so
        // a resumed run walks back over the failed race.
        let mut cursor_held = false;

        'pages: loop {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let page = match pager.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => {
                    summary.listing_complete = true;
                    break;
                }
                Err(error) if summary.pages_scraped == 0 && !error.is_retryable() => {
                    return Err(EngineError::Listing { source_id, error });
                }
                Err(error) => {
                    warn!(%source_id, page = error.page(), %error, "listing stopped early");
                    break;
                }
            };
            summary.pages_scraped += 1;

            for race_ref in &page.races {
                if self.cancel.is_cancelled() {
                    summary.cancelled = true;
                    break 'pages;
                }
                summary.races_seen += 1;
                if checkpoint.is_committed(&race_ref.url) {
                    summary.races_skipped += 1;
                    continue;
                }

                let span = info_span!("race", %source_id, url = %race_ref.url);
                match self.process_race(race_ref).instrument(span).await {
                    Ok(report) => {
                        checkpoint.record_commit(&race_ref.url, &report.race_id);
                        summary.absorb(&report);
                    }
                    Err(RaceFailure::Persistence(err)) if err.is_unavailable() => {
                        return Err(EngineError::StoreUnavailable(err));
                    }
                    Err(failure) => {
                        cursor_held = true;
                        checkpoint.record_failure();
                        warn!(
                            %source_id,
                            url = %race_ref.url,
                            race_id = race_ref.race_id.as_deref().unwrap_or("-"),
                            error = %failure,
                            "race skipped"
                        );
                        summary.races_failed += 1;
                        summary.failures.push(FailedRace {
                            url: race_ref.url.clone(),
                            race_id: race_ref.race_id.clone(),
                            reason: failure.to_string(),
                        });
                    }
                }
                self.save(checkpoint).await?;
            }

            if !cursor_held {
                checkpoint.advance_page(page.page + 1);
                self.save(checkpoint).await?;
            }
        }

        if summary.listing_complete && !summary.cancelled {
            checkpoint.finish_run();
            self.save(checkpoint).await?;
        }

        summary.finished_at = Utc::now();
        info!(
            %source_id,
            %region,
            status = summary.status(),
            pages = summary.pages_scraped,
            races_new = summary.races_new,
            races_updated = summary.races_updated,
            races_unchanged = summary.races_unchanged,
            races_failed = summary.races_failed,
            results_inserted = summary.results_inserted,
            results_updated = summary.results_updated,
            "scrape run finished"
        );
        Ok(summary)
    }

    async fn process_race(&self, race_ref: &RaceRef) -> Result<RaceReport, RaceFailure> {
        let page = self.fetcher.fetch(&race_ref.url, &self.profile).await?;
        let parsed = match self.adapter.parse_race(race_ref, &page.text()) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.archive_unparsed(race_ref, &page, &err).await;
                return Err(err.into());
            }
        };

        let prepared = prepare_entrants(&parsed, &self.filter);
        let persisted = if self.store.race_exists(&parsed.race_id).await? {
            Some(self.store.race_results(&parsed.race_id).await?)
        } else {
            None
        };

        let race = Race {
            id: parsed.race_id.clone(),
            source_id: self.adapter.source_id().to_string(),
            url: race_ref.url.clone(),
            date: parsed.date,
            name: parsed.name.clone(),
        };
        let plan = plan_race(race, &prepared.entrants, persisted.as_ref());
        let report = RaceReport {
            race_id: parsed.race_id.clone(),
            state: plan.state,
            inserts: plan.inserts(),
            updates: plan.updates(),
            retained: plan.retained,
            rows_dropped: prepared.rows_dropped + parsed.short_rows,
            rows_filtered: prepared.rows_filtered,
            duplicates: prepared.duplicates,
        };

        let outcome = self.store.commit_race(&plan.into_commit()).await?;
        info!(
            race_id = %report.race_id,
            state = ?report.state,
            inserts = report.inserts,
            updates = report.updates,
            retained = report.retained,
            participants = outcome.participant_count,
            "race committed"
        );
        Ok(report)
    }

    async fn archive_unparsed(&self, race_ref: &RaceRef, page: &FetchedPage, error: &ParseError) {
        let Some(archive) = self.archive else {
            return;
        };
        let error = error.to_string();
        let unparsed = UnparsedPage {
            source_id: self.adapter.source_id(),
            race_url: &race_ref.url,
            race_id: race_ref.race_id.as_deref(),
            fetched_at: page.fetched_at,
            error: &error,
            body: &page.body,
        };
        match archive.store_unparsed(unparsed).await {
            Ok(archived) => info!(
                path = %archived.page_path.display(),
                replaced = archived.replaced,
                "unparsed page archived"
            ),
            Err(err) => warn!(error = %format!("{err:#}"), "archiving unparsed page failed"),
        }
    }

    async fn save(&self, checkpoint: &ScrapeCheckpoint) -> Result<(), EngineError> {
        self.store.save_checkpoint(checkpoint).await.map_err(|err| {
            if err.is_unavailable() {
                EngineError::StoreUnavailable(err)
            } else {
                EngineError::Checkpoint(err)
            }
        })
    }
}
