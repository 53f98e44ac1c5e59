//! Results table discovery and column mapping shared by every adapter.

use peloton_core::{comparison_key, RawRow};
use scraper::{ElementRef, Html};

use crate::{selector, text_or_none, ParseError};

/// Tried in order; the bare `table` is the last resort.
pub const RESULTS_TABLE_SELECTORS: &[&str] = &[
    "table.results",
    "table.leaderboard",
    "table[class*=\"result\"]",
    "table[class*=\"classement\"]",
    ".results-table table",
    "table",
];

/// Fewer cells than this cannot hold a position, an id and both names.
pub const MIN_PARTICIPANT_CELLS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Position,
    Id,
    LastName,
    FirstName,
    Region,
    Club,
    Category,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColumnLayout {
    position: Option<usize>,
    id: Option<usize>,
    last_name: Option<usize>,
    first_name: Option<usize>,
    region: Option<usize>,
    club: Option<usize>,
    category: Option<usize>,
}

impl ColumnLayout {
    /// `[position, id, last, first, region, club, category]`.
    pub fn positional() -> Self {
        Self {
            position: Some(0),
            id: Some(1),
            last_name: Some(2),
            first_name: Some(3),
            region: Some(4),
            club: Some(5),
            category: Some(6),
        }
    }

    /// Maps header cells to columns; `None` unless a last-name column is found.
    pub fn from_headers(headers: &[String]) -> Option<Self> {
        let mut layout = Self::default();
        for (index, header) in headers.iter().enumerate() {
            let slot = match header_column(header) {
                Some(Column::Position) => &mut layout.position,
                Some(Column::Id) => &mut layout.id,
                Some(Column::LastName) => &mut layout.last_name,
                Some(Column::FirstName) => &mut layout.first_name,
                Some(Column::Region) => &mut layout.region,
                Some(Column::Club) => &mut layout.club,
                Some(Column::Category) => &mut layout.category,
                None => continue,
            };
            slot.get_or_insert(index);
        }
        layout.last_name.map(|_| layout)
    }

    pub fn extract(&self, cells: Vec<String>) -> RawRow {
        let cell = |index: Option<usize>| {
            index
                .and_then(|i| cells.get(i))
                .cloned()
                .unwrap_or_default()
        };
        RawRow {
            position: cell(self.position),
            id: cell(self.id),
            last_name: cell(self.last_name),
            first_name: cell(self.first_name),
            region: cell(self.region),
            club: cell(self.club),
            category: cell(self.category),
            cells,
        }
    }
}

fn header_column(text: &str) -> Option<Column> {
    let key = comparison_key(text);
    let key = key.trim_end_matches('.');
    if key.contains("prenom") || key.contains("first") {
        Some(Column::FirstName)
    } else if key == "nom" || key.starts_with("nom ") || key.contains("last") || key == "name" {
        Some(Column::LastName)
    } else if key.contains("licence") || key.contains("uci") || key == "id" {
        Some(Column::Id)
    } else if key.starts_with("place")
        || key == "pl"
        || key.starts_with("class")
        || key.starts_with("rang")
        || key.starts_with("pos")
        || key == "clt"
        || key == "#"
    {
        Some(Column::Position)
    } else if key.contains("region") || key.contains("comite") {
        Some(Column::Region)
    } else if key.contains("club") || key.contains("equipe") {
        Some(Column::Club)
    } else if key.starts_with("cat") {
        Some(Column::Category)
    } else {
        None
    }
}

pub fn find_results_table(document: &Html) -> Result<Option<ElementRef<'_>>, ParseError> {
    for css in RESULTS_TABLE_SELECTORS {
        let sel = selector(css)?;
        if let Some(table) = document.select(&sel).next() {
            return Ok(Some(table));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableRows {
    pub rows: Vec<RawRow>,
    pub short_rows: usize,
}

/// Reads every data row; `th`-only rows are treated as headers.
pub fn extract_rows(table: ElementRef<'_>) -> Result<TableRows, ParseError> {
    let tr = selector("tr")?;
    let th = selector("th")?;
    let td = selector("td")?;
    let any_cell = selector("th, td")?;

    let mut header_layout = None;
    let mut rows = Vec::new();
    let mut short_rows = 0;

    for row in table.select(&tr) {
        let cells: Vec<String> = row
            .select(&any_cell)
            .map(|cell| text_or_none(&cell.text().collect::<String>()).unwrap_or_default())
            .collect();

        let is_header = row.select(&th).next().is_some() && row.select(&td).next().is_none();
        if is_header {
            if header_layout.is_none() {
                header_layout = ColumnLayout::from_headers(&cells);
            }
            continue;
        }

        if cells.len() < MIN_PARTICIPANT_CELLS {
            short_rows += 1;
            continue;
        }
        let layout = header_layout.unwrap_or_else(ColumnLayout::positional);
        rows.push(layout.extract(cells));
    }

    Ok(TableRows { rows, short_rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows_of(html: &str) -> TableRows {
        let document = Html::parse_document(html);
        let table = find_results_table(&document)
            .expect("selectors")
            .expect("table present");
        extract_rows(table).expect("rows")
    }

    #[test]
    fn header_keywords_reorder_columns() {
        let parsed = rows_of(
            r#"<table class="results">
                <tr><th>Nom</th><th>Prénom</th><th>Pl.</th><th>Club</th><th>Licence</th><th>Catégorie</th></tr>
                <tr><td>MARTIN</td><td>Luc</td><td>2</td><td>VC Angers</td><td>100</td><td>Open 2</td></tr>
            </table>"#,
        );
        assert_eq!(parsed.rows.len(), 1);
        let row = &parsed.rows[0];
        assert_eq!(row.last_name, "MARTIN");
        assert_eq!(row.first_name, "Luc");
        assert_eq!(row.position, "2");
        assert_eq!(row.id, "100");
        assert_eq!(row.category, "Open 2");
        assert_eq!(row.region, "");
    }

    #[test]
    fn positional_layout_without_header() {
        let parsed = rows_of(
            r#"<div class="results-table"><table>
                <tr><td>1</td><td>200</td><td>DURAND</td><td>Theo</td><td>Pays de la Loire</td><td>AC Laval</td></tr>
                <tr><td>Abandons</td></tr>
            </table></div>"#,
        );
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.short_rows, 1);
        assert_eq!(parsed.rows[0].club, "AC Laval");
        assert_eq!(parsed.rows[0].region, "Pays de la Loire");
        assert_eq!(parsed.rows[0].category, "");
    }

    #[test]
    fn specific_table_wins_over_first_table() {
        let document = Html::parse_document(
            r#"<table id="menu"><tr><td>x</td></tr></table>
               <table class="leaderboard"><tr><td>1</td></tr></table>"#,
        );
        let table = find_results_table(&document).expect("ok").expect("table");
        assert_eq!(table.value().attr("class"), Some("leaderboard"));
    }
}
