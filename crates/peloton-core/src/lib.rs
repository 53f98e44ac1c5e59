//! Core domain model for Peloton: races, cyclists, results and the scrape checkpoint.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod category;
pub mod checkpoint;
pub mod normalize;
pub mod numbering;

pub use category::CategoryFilter;
pub use checkpoint::{CheckpointStatus, ScrapeCheckpoint};
pub use normalize::{comparison_key, match_key_for, normalize, NormalizedEntrant, RowRejection};
pub use numbering::estimate_numbers;

pub const CRATE_NAME: &str = "peloton-core";

/// Prefix of identifiers synthesized for entrants without a federation id.
pub const SURROGATE_PREFIX: &str = "anon-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Region {
    PaysDeLaLoire,
    Bretagne,
    Normandie,
    CentreValDeLoire,
    NouvelleAquitaine,
}

impl Region {
    pub const ALL: [Region; 5] = [
        Region::PaysDeLaLoire,
        Region::Bretagne,
        Region::Normandie,
        Region::CentreValDeLoire,
        Region::NouvelleAquitaine,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Region::PaysDeLaLoire => "pays-de-la-loire",
            Region::Bretagne => "bretagne",
            Region::Normandie => "normandie",
            Region::CentreValDeLoire => "centre-val-de-loire",
            Region::NouvelleAquitaine => "nouvelle-aquitaine",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown region `{0}`")]
pub struct UnknownRegion(pub String);

impl FromStr for Region {
    type Err = UnknownRegion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Region::ALL
            .into_iter()
            .find(|region| region.slug() == wanted)
            .ok_or_else(|| UnknownRegion(s.to_string()))
    }
}

/// Stable cyclist identity: the federation licence id when the source
/// publishes one, a deterministic surrogate otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CyclistId {
    Federation(String),
    Surrogate(String),
}

impl CyclistId {
    pub fn as_str(&self) -> &str {
        match self {
            CyclistId::Federation(id) | CyclistId::Surrogate(id) => id,
        }
    }

    pub fn is_surrogate(&self) -> bool {
        matches!(self, CyclistId::Surrogate(_))
    }

    /// Rebuilds an id read back from storage, where only the text is kept.
    pub fn from_stored(id: &str) -> Self {
        if id.starts_with(SURROGATE_PREFIX) {
            CyclistId::Surrogate(id.to_string())
        } else {
            CyclistId::Federation(id.to_string())
        }
    }
}

impl fmt::Display for CyclistId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A race as identified on its source. The participant count is derived by
/// the store and is not part of this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Race {
    pub id: String,
    pub source_id: String,
    pub url: String,
    pub date: NaiveDate,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cyclist {
    pub id: CyclistId,
    pub first_name: String,
    pub last_name: String,
    pub region: Option<String>,
    pub club: Option<String>,
    pub club_raw: Option<String>,
    pub match_key: String,
}

/// One entrant's line in one race. `rank` holds the finishing position, or
/// the estimated entry number when `rank_estimated` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceResult {
    pub race_id: String,
    pub cyclist_id: CyclistId,
    pub rank: u32,
    pub rank_estimated: bool,
    pub raw_data: Vec<String>,
}

/// Participant row as pulled out of a results table, before any cleaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub position: String,
    pub id: String,
    pub last_name: String,
    pub first_name: String,
    pub region: String,
    pub club: String,
    pub category: String,
    pub cells: Vec<String>,
}
