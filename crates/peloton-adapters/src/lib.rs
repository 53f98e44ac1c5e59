//! Site adapters: turn listing and race pages into race references and raw
//! participant rows. Adapters never fetch; the pager and the engine do.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use peloton_core::normalize::collapse_whitespace;
use peloton_core::{RawRow, Region};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod card_result;
pub mod classement;
pub mod dates;
pub mod pager;
pub mod table;

pub use card_result::CardResultAdapter;
pub use classement::ClassementAdapter;
pub use dates::parse_race_date;
pub use pager::{ListingError, ListingPage, RacePager, DEFAULT_MAX_PAGES};

pub const CRATE_NAME: &str = "peloton-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    CardResult,
    Classement,
}

/// A race discovered on a listing page, not fetched yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceRef {
    pub url: String,
    /// Id derived from the URL when the URL carries one.
    pub race_id: Option<String>,
    pub listing_page: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRace {
    pub race_id: String,
    pub date: NaiveDate,
    pub name: String,
    pub organizer_club: Option<String>,
    pub rows: Vec<RawRow>,
    /// Data rows dropped for having too few cells to be a participant.
    pub short_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("page body is empty")]
    EmptyBody,
    #[error("no results table on the page")]
    MissingResultsTable,
    #[error("race date not found")]
    MissingDate,
    #[error("unparseable race date `{0}`")]
    UnparseableDate(String),
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

impl ParseError {
    /// Errors that usually mean a truncated or not yet published page.
    pub fn is_transient(&self) -> bool {
        matches!(self, ParseError::EmptyBody | ParseError::MissingResultsTable)
    }
}

pub trait SiteAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn listing_url(&self, region: Region, page: u32) -> String;
    fn parse_listing(&self, html: &str, page: u32) -> Result<Vec<RaceRef>, ParseError>;
    fn parse_race(&self, race: &RaceRef, html: &str) -> Result<ParsedRace, ParseError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSettings {
    pub source_id: String,
    pub base_url: String,
    pub listing_params: BTreeMap<String, String>,
}

pub fn adapter_for(kind: AdapterKind, settings: AdapterSettings) -> Box<dyn SiteAdapter> {
    match kind {
        AdapterKind::CardResult => Box::new(CardResultAdapter::new(settings)),
        AdapterKind::Classement => Box::new(ClassementAdapter::new(settings)),
    }
}

/// `race_<last path segment>`, plus `_<fragment>` for stage anchors, when the
/// URL has a segment after `marker`.
pub fn race_id_from_url(url: &str, marker: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .collect();
    let marker_at = segments.iter().position(|segment| *segment == marker)?;
    let last = segments.get(marker_at + 1..)?.last()?;
    match parsed.fragment().filter(|fragment| !fragment.is_empty()) {
        Some(fragment) => Some(format!("race_{last}_{fragment}")),
        None => Some(format!("race_{last}")),
    }
}

/// Fallback id for race URLs without a usable path segment.
pub fn synthesize_race_id(name: &str, date: NaiveDate, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{name}|{}|{url}", date.format("%Y-%m-%d")).as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("race_{}", &digest[..8])
}

pub(crate) fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let collapsed = collapse_whitespace(value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, ParseError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .find_map(|node| text_or_none(&node.text().collect::<String>())))
}

pub(crate) fn select_first_attr(
    document: &Html,
    css: &str,
    attr: &str,
) -> Result<Option<String>, ParseError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .find_map(|node| node.value().attr(attr).and_then(text_or_none)))
}

pub(crate) fn absolute_url(base_url: &str, href: &str) -> Option<String> {
    let base = reqwest::Url::parse(base_url).ok()?;
    base.join(href.trim()).ok().map(String::from)
}

/// Links matching `css` whose href contains `must_contain`, made absolute and
/// de-duplicated in page order.
pub(crate) fn collect_race_links(
    html: &str,
    base_url: &str,
    css: &str,
    must_contain: &str,
    marker: &str,
    page: u32,
) -> Result<Vec<RaceRef>, ParseError> {
    let document = Html::parse_document(html);
    let sel = selector(css)?;
    let mut refs: Vec<RaceRef> = Vec::new();
    for link in document.select(&sel) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if !href.contains(must_contain) {
            continue;
        }
        let Some(url) = absolute_url(base_url, href) else {
            continue;
        };
        if refs.iter().any(|known| known.url == url) {
            continue;
        }
        refs.push(RaceRef {
            race_id: race_id_from_url(&url, marker),
            url,
            listing_page: page,
        });
    }
    Ok(refs)
}
