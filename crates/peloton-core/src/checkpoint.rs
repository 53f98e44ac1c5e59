use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Region;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Idle,
    InProgress,
}

/// Resumable progress of one (source, region) scrape.
///
/// `committed` holds the race page URLs stored by the current pass; it is
/// only consulted while a pass is in progress, so a completed pass is
/// followed by a full re-walk that reconciles against stored history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeCheckpoint {
    pub source_id: String,
    pub region: Region,
    pub run_id: Option<Uuid>,
    pub status: CheckpointStatus,
    pub next_page: u32,
    pub committed: BTreeSet<String>,
    pub last_race_id: Option<String>,
    pub consecutive_failures: u32,
    pub updated_at: DateTime<Utc>,
}

impl ScrapeCheckpoint {
    pub fn new(source_id: impl Into<String>, region: Region) -> Self {
        Self {
            source_id: source_id.into(),
            region,
            run_id: None,
            status: CheckpointStatus::Idle,
            next_page: 1,
            committed: BTreeSet::new(),
            last_race_id: None,
            consecutive_failures: 0,
            updated_at: Utc::now(),
        }
    }

    /// Starts a run. Returns `true` when an interrupted pass is resumed.
    pub fn begin_run(&mut self, run_id: Uuid) -> bool {
        let resuming = self.status == CheckpointStatus::InProgress;
        if !resuming {
            self.committed.clear();
            self.next_page = 1;
            self.consecutive_failures = 0;
        }
        self.run_id = Some(run_id);
        self.status = CheckpointStatus::InProgress;
        self.touch();
        resuming
    }

    pub fn is_committed(&self, race_url: &str) -> bool {
        self.status == CheckpointStatus::InProgress && self.committed.contains(race_url)
    }

    pub fn record_commit(&mut self, race_url: &str, race_id: &str) {
        self.committed.insert(race_url.to_string());
        self.last_race_id = Some(race_id.to_string());
        self.consecutive_failures = 0;
        self.touch();
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.touch();
    }

    /// Moves the page cursor forward; never backwards.
    pub fn advance_page(&mut self, next_page: u32) {
        if next_page > self.next_page {
            self.next_page = next_page;
            self.touch();
        }
    }

    pub fn finish_run(&mut self) {
        self.status = CheckpointStatus::Idle;
        self.next_page = 1;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
