//! Race pages that failed to parse, kept with the parse error so the markup
//! change can be inspected and the adapter fixed.
//!
//! Layout: `<yyyymmdd>/<source_id>/<race key>.html` plus a `.json` record next
//! to it. The race key is the race id when the listing gave one, otherwise a
//! hash of the race URL, so a race that keeps failing occupies one slot per day.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

/// What the engine knows about a race page it could not parse.
#[derive(Debug, Clone, Copy)]
pub struct UnparsedPage<'a> {
    pub source_id: &'a str,
    pub race_url: &'a str,
    pub race_id: Option<&'a str>,
    pub fetched_at: DateTime<Utc>,
    pub error: &'a str,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnparsedRecord {
    pub source_id: String,
    pub race_url: String,
    pub race_id: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub error: String,
    pub body_sha256: String,
    pub byte_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedPage {
    pub page_path: PathBuf,
    pub record_path: PathBuf,
    /// An earlier failure of the same race on the same day was overwritten.
    pub replaced: bool,
}

#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn race_key(race_url: &str, race_id: Option<&str>) -> String {
        match race_id.filter(|id| is_path_safe(id)) {
            Some(id) => id.to_string(),
            None => {
                let digest = Sha256::digest(race_url.as_bytes());
                format!("url_{}", &hex::encode(digest)[..16])
            }
        }
    }

    fn day_dir(&self, fetched_at: DateTime<Utc>, source_id: &str) -> PathBuf {
        self.root
            .join(fetched_at.format("%Y%m%d").to_string())
            .join(source_id)
    }

    pub async fn store_unparsed(&self, page: UnparsedPage<'_>) -> anyhow::Result<ArchivedPage> {
        let dir = self.day_dir(page.fetched_at, page.source_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let key = Self::race_key(page.race_url, page.race_id);
        let page_path = dir.join(format!("{key}.html"));
        let record_path = dir.join(format!("{key}.json"));
        let replaced = fs::try_exists(&record_path)
            .await
            .with_context(|| format!("checking {}", record_path.display()))?;

        let record = UnparsedRecord {
            source_id: page.source_id.to_string(),
            race_url: page.race_url.to_string(),
            race_id: page.race_id.map(str::to_string),
            fetched_at: page.fetched_at,
            error: page.error.to_string(),
            body_sha256: hex::encode(Sha256::digest(page.body)),
            byte_size: page.body.len(),
        };

        write_file(&page_path, page.body).await?;
        let json = serde_json::to_vec_pretty(&record).context("serializing unparsed record")?;
        write_file(&record_path, &json).await?;

        Ok(ArchivedPage {
            page_path,
            record_path,
            replaced,
        })
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

fn is_path_safe(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
        && !id.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts)
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn race_key_prefers_safe_race_ids() {
        assert_eq!(
            PageArchive::race_key("https://x.test/resultats/a/", Some("race_a")),
            "race_a"
        );
        let hashed = PageArchive::race_key("https://x.test/resultats/a/", Some("../etc"));
        assert!(hashed.starts_with("url_"));
        assert_eq!(hashed.len(), 20);
        assert_eq!(hashed, PageArchive::race_key("https://x.test/resultats/a/", None));
    }

    #[tokio::test]
    async fn failure_is_stored_with_its_record_and_replaced_same_day() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let page = UnparsedPage {
            source_id: "pdl",
            race_url: "https://x.test/resultats/gp/",
            race_id: Some("race_gp"),
            fetched_at: at("2026-05-25T12:00:00Z"),
            error: "no results table found",
            body: b"<html><h1>Grand Prix</h1></html>",
        };

        let first = archive.store_unparsed(page).await.expect("first store");
        let second = archive
            .store_unparsed(UnparsedPage {
                error: "race date missing",
                ..page
            })
            .await
            .expect("second store");

        assert!(!first.replaced);
        assert!(second.replaced);
        assert_eq!(first.page_path, dir.path().join("20260525/pdl/race_gp.html"));

        let record: UnparsedRecord = serde_json::from_slice(
            &std::fs::read(&second.record_path).expect("record written"),
        )
        .expect("record parses");
        assert_eq!(record.error, "race date missing");
        assert_eq!(record.race_url, "https://x.test/resultats/gp/");
        assert_eq!(record.byte_size, page.body.len());
    }
}
