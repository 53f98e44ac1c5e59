use std::collections::HashSet;

use peloton_core::Region;
use peloton_storage::{FetchError, FetchErrorKind, FetchProfile, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info};

use crate::{ParseError, RaceRef, SiteAdapter};

/// Safety limit on listing depth.
pub const DEFAULT_MAX_PAGES: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub page: u32,
    pub races: Vec<RaceRef>,
}

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("listing page {page}: {source}")]
    Fetch {
        page: u32,
        #[source]
        source: FetchError,
    },
    #[error("listing page {page}: {source}")]
    Parse {
        page: u32,
        #[source]
        source: ParseError,
    },
}

impl ListingError {
    pub fn page(&self) -> u32 {
        match self {
            ListingError::Fetch { page, .. } | ListingError::Parse { page, .. } => *page,
        }
    }

    /// Whether another run could plausibly get past this page.
    pub fn is_retryable(&self) -> bool {
        match self {
            ListingError::Fetch { source, .. } => source.is_retryable(),
            ListingError::Parse { source, .. } => source.is_transient(),
        }
    }
}

/// Walks listing pages lazily, one fetch per `next_page` call.
pub struct RacePager<'a> {
    adapter: &'a dyn SiteAdapter,
    fetcher: &'a HttpFetcher,
    profile: FetchProfile,
    region: Region,
    next_page: u32,
    max_pages: u32,
    seen: HashSet<String>,
    exhausted: bool,
}

impl<'a> RacePager<'a> {
    pub fn new(
        adapter: &'a dyn SiteAdapter,
        fetcher: &'a HttpFetcher,
        profile: FetchProfile,
        region: Region,
    ) -> Self {
        Self {
            adapter,
            fetcher,
            profile,
            region,
            next_page: 1,
            max_pages: DEFAULT_MAX_PAGES,
            seen: HashSet::new(),
            exhausted: false,
        }
    }

    pub fn starting_at(mut self, page: u32) -> Self {
        self.next_page = page.max(1);
        self
    }

    pub fn max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// `Ok(None)` once a page comes back empty, a page past the first is
    /// missing, or the page limit is reached.
    pub async fn next_page(&mut self) -> Result<Option<ListingPage>, ListingError> {
        if self.exhausted {
            return Ok(None);
        }
        if self.next_page > self.max_pages {
            info!(max_pages = self.max_pages, "listing page limit reached");
            self.exhausted = true;
            return Ok(None);
        }

        let page = self.next_page;
        let url = self.adapter.listing_url(self.region, page);
        let fetched = match self.fetcher.fetch(&url, &self.profile).await {
            Ok(fetched) => fetched,
            Err(err) if page > 1 && err.kind == FetchErrorKind::HttpStatus(404) => {
                debug!(page, "listing ended with 404");
                self.exhausted = true;
                return Ok(None);
            }
            Err(source) => return Err(ListingError::Fetch { page, source }),
        };

        let refs = self
            .adapter
            .parse_listing(&fetched.text(), page)
            .map_err(|source| ListingError::Parse { page, source })?;
        self.next_page += 1;

        if refs.is_empty() {
            debug!(page, "empty listing page");
            self.exhausted = true;
            return Ok(None);
        }

        let found = refs.len();
        let races: Vec<RaceRef> = refs
            .into_iter()
            .filter(|race| self.seen.insert(race.url.clone()))
            .collect();
        debug!(page, found, new = races.len(), "listing page parsed");
        Ok(Some(ListingPage { page, races }))
    }
}
