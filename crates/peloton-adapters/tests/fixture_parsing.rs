use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::NaiveDate;
use peloton_adapters::{
    adapter_for, AdapterKind, AdapterSettings, ParseError, RaceRef, SiteAdapter,
};

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fixture(path: &str) -> String {
    let path = workspace_root().join("fixtures").join(path);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn adapter(kind: AdapterKind, base_url: &str) -> Box<dyn SiteAdapter> {
    adapter_for(
        kind,
        AdapterSettings {
            source_id: "fixture".into(),
            base_url: base_url.into(),
            listing_params: BTreeMap::new(),
        },
    )
}

#[test]
fn card_result_listing_keeps_unique_result_links() {
    let adapter = adapter(AdapterKind::CardResult, "https://paysdelaloirecyclisme.fr");
    let refs = adapter
        .parse_listing(&fixture("card-result/listing-page-1.html"), 1)
        .expect("listing parses");

    let urls: Vec<_> = refs.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "https://paysdelaloirecyclisme.fr/resultats/grand-prix-de-saint-sebastien/",
            "https://paysdelaloirecyclisme.fr/resultats/prix-de-clisson/",
        ]
    );
    assert_eq!(
        refs[0].race_id.as_deref(),
        Some("race_grand-prix-de-saint-sebastien")
    );
    assert!(refs.iter().all(|r| r.listing_page == 1));

    let empty = adapter
        .parse_listing(&fixture("card-result/listing-empty.html"), 2)
        .expect("empty listing parses");
    assert!(empty.is_empty());
}

#[test]
fn card_result_race_page_yields_header_mapped_rows() {
    let adapter = adapter(AdapterKind::CardResult, "https://paysdelaloirecyclisme.fr");
    let race = RaceRef {
        url: "https://paysdelaloirecyclisme.fr/resultats/grand-prix-de-saint-sebastien/".into(),
        race_id: Some("race_grand-prix-de-saint-sebastien".into()),
        listing_page: 1,
    };
    let parsed = adapter
        .parse_race(&race, &fixture("card-result/race-grand-prix-de-saint-sebastien.html"))
        .expect("race parses");

    assert_eq!(parsed.race_id, "race_grand-prix-de-saint-sebastien");
    assert_eq!(parsed.name, "Grand Prix de Saint-Sébastien");
    assert_eq!(parsed.date, NaiveDate::from_ymd_opt(2024, 5, 25).expect("date"));
    assert_eq!(parsed.organizer_club.as_deref(), Some("5244197 VC ST SEBASTIEN"));
    assert_eq!(parsed.rows.len(), 6);
    assert_eq!(parsed.short_rows, 1);

    let first = &parsed.rows[0];
    assert_eq!(first.position, "1");
    assert_eq!(first.id, "10044123456");
    assert_eq!(first.last_name, "LE GALL");
    assert_eq!(first.region, "Pays de la Loire");
    assert_eq!(first.category, "Access 1");
    assert_eq!(first.cells.len(), 7);
}

#[test]
fn classement_pages_apply_header_region_and_iso_date() {
    let adapter = adapter(AdapterKind::Classement, "https://comite.example");
    let refs = adapter
        .parse_listing(&fixture("classement/listing-page-1.html"), 1)
        .expect("listing parses");
    let ids: Vec<_> = refs.iter().filter_map(|r| r.race_id.as_deref()).collect();
    assert_eq!(
        ids,
        vec![
            "race_2024-criterium-de-landerneau",
            "race_2024-boucles-du-leon_etape-2",
        ]
    );

    let parsed = adapter
        .parse_race(&refs[0], &fixture("classement/race-criterium-de-landerneau.html"))
        .expect("race parses");
    assert_eq!(parsed.name, "Critérium de Landerneau");
    assert_eq!(parsed.date, NaiveDate::from_ymd_opt(2024, 5, 12).expect("date"));
    assert_eq!(parsed.organizer_club.as_deref(), Some("Landerneau Bike Club"));
    assert_eq!(parsed.rows.len(), 4);
    assert!(parsed.rows.iter().all(|row| row.region == "Bretagne"));
    assert_eq!(parsed.rows[2].position, "");
    assert_eq!(parsed.rows[2].category, "Open 3");
}

#[test]
fn race_page_without_table_is_transient_failure() {
    let adapter = adapter(AdapterKind::CardResult, "https://paysdelaloirecyclisme.fr");
    let race = RaceRef {
        url: "https://paysdelaloirecyclisme.fr/resultats/prix-de-clisson/".into(),
        race_id: None,
        listing_page: 1,
    };
    let html = r#"<h1>Prix de Clisson</h1><p class="header-race__date">1er juin 2024</p><p>Résultats à venir</p>"#;
    let err = adapter.parse_race(&race, html).expect_err("no table");
    assert_eq!(err, ParseError::MissingResultsTable);
    assert!(err.is_transient());
}
