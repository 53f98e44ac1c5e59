//! Committee sites publishing a calendar table of `/classement/` pages, with
//! the race region in the page header instead of a table column.

use chrono::NaiveDate;
use peloton_core::Region;
use scraper::Html;
use tracing::debug;

use crate::table::{extract_rows, find_results_table};
use crate::{
    collect_race_links, parse_race_date, select_first_attr, select_first_text,
    synthesize_race_id, AdapterSettings, ParseError, ParsedRace, RaceRef, SiteAdapter,
};

const RACE_PATH_MARKER: &str = "classement";

#[derive(Debug, Clone)]
pub struct ClassementAdapter {
    settings: AdapterSettings,
}

impl ClassementAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }

    fn race_date(document: &Html) -> Result<NaiveDate, ParseError> {
        if let Some(stamp) = select_first_attr(document, "time[datetime]", "datetime")? {
            let day = stamp.get(..10).unwrap_or(&stamp);
            if let Ok(date) = NaiveDate::parse_from_str(day, "%Y-%m-%d") {
                return Ok(date);
            }
        }
        let text = select_first_text(document, "time")?.ok_or(ParseError::MissingDate)?;
        match parse_race_date(&text) {
            Some(date) => Ok(date),
            None => Err(ParseError::UnparseableDate(text)),
        }
    }
}

impl SiteAdapter for ClassementAdapter {
    fn source_id(&self) -> &str {
        &self.settings.source_id
    }

    fn listing_url(&self, region: Region, page: u32) -> String {
        let mut url = format!(
            "{}/classements/?region={}",
            self.settings.base_url.trim_end_matches('/'),
            region.slug()
        );
        for (key, value) in &self.settings.listing_params {
            url.push_str(&format!("&{key}={value}"));
        }
        url.push_str(&format!("&page={page}"));
        url
    }

    fn parse_listing(&self, html: &str, page: u32) -> Result<Vec<RaceRef>, ParseError> {
        collect_race_links(
            html,
            &self.settings.base_url,
            r#"table.calendar a[href*="/classement/"]"#,
            "/classement/",
            RACE_PATH_MARKER,
            page,
        )
    }

    fn parse_race(&self, race: &RaceRef, html: &str) -> Result<ParsedRace, ParseError> {
        if html.trim().is_empty() {
            return Err(ParseError::EmptyBody);
        }
        let document = Html::parse_document(html);

        let name = match select_first_text(&document, "h2.race-title")? {
            Some(name) => name,
            None => select_first_text(&document, "h1")?.unwrap_or_else(|| race.url.clone()),
        };
        let date = Self::race_date(&document)?;
        let region = select_first_text(&document, ".race-meta .region")?;
        let organizer_club = select_first_text(&document, ".race-meta .organizer")?;

        let table = find_results_table(&document)?.ok_or(ParseError::MissingResultsTable)?;
        let mut table_rows = extract_rows(table)?;
        if let Some(region) = &region {
            for row in table_rows.rows.iter_mut().filter(|row| row.region.trim().is_empty()) {
                row.region = region.clone();
            }
        }

        let race_id = race
            .race_id
            .clone()
            .unwrap_or_else(|| synthesize_race_id(&name, date, &race.url));
        debug!(%race_id, rows = table_rows.rows.len(), "parsed classement page");

        Ok(ParsedRace {
            race_id,
            date,
            name,
            organizer_club,
            rows: table_rows.rows,
            short_rows: table_rows.short_rows,
        })
    }
}
