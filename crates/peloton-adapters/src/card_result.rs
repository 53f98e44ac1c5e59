//! Regional federation sites built on a FacetWP results listing
//! (`/resultats/?_region=...&_pagination=N`, one `card-result` link per race).

use peloton_core::Region;
use scraper::Html;
use tracing::debug;

use crate::table::{extract_rows, find_results_table};
use crate::{
    collect_race_links, parse_race_date, select_first_text, synthesize_race_id, AdapterSettings,
    ParseError, ParsedRace, RaceRef, SiteAdapter,
};

const RACE_PATH_MARKER: &str = "resultats";
const UNKNOWN_RACE_NAME: &str = "Unknown race";

#[derive(Debug, Clone)]
pub struct CardResultAdapter {
    settings: AdapterSettings,
}

impl CardResultAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }
}

impl SiteAdapter for CardResultAdapter {
    fn source_id(&self) -> &str {
        &self.settings.source_id
    }

    fn listing_url(&self, region: Region, page: u32) -> String {
        let mut url = format!(
            "{}/resultats/?_region={}",
            self.settings.base_url.trim_end_matches('/'),
            region.slug()
        );
        for (key, value) in &self.settings.listing_params {
            url.push_str(&format!("&{key}={value}"));
        }
        url.push_str(&format!("&_pagination={page}"));
        url
    }

    fn parse_listing(&self, html: &str, page: u32) -> Result<Vec<RaceRef>, ParseError> {
        collect_race_links(
            html,
            &self.settings.base_url,
            r#"a[class*="card-result"]"#,
            "/resultats/",
            RACE_PATH_MARKER,
            page,
        )
    }

    fn parse_race(&self, race: &RaceRef, html: &str) -> Result<ParsedRace, ParseError> {
        if html.trim().is_empty() {
            return Err(ParseError::EmptyBody);
        }
        let document = Html::parse_document(html);

        let name = select_first_text(&document, "h1")?
            .unwrap_or_else(|| UNKNOWN_RACE_NAME.to_string());
        let date_text =
            select_first_text(&document, ".header-race__date")?.ok_or(ParseError::MissingDate)?;
        let date = parse_race_date(&date_text).ok_or(ParseError::UnparseableDate(date_text))?;
        let organizer_club = select_first_text(&document, ".header-race__organizer")?;

        let table = find_results_table(&document)?.ok_or(ParseError::MissingResultsTable)?;
        let table_rows = extract_rows(table)?;

        let race_id = race
            .race_id
            .clone()
            .unwrap_or_else(|| synthesize_race_id(&name, date, &race.url));
        debug!(
            %race_id,
            rows = table_rows.rows.len(),
            short_rows = table_rows.short_rows,
            "parsed race page"
        );

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
