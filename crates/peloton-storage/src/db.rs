//! SQLite persistence gateway. Every race is written in one transaction.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use peloton_core::{Cyclist, CyclistId, Race, RaceResult, Region, ScrapeCheckpoint};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("store query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

impl PersistenceError {
    /// Whether the store itself is gone, as opposed to one statement failing.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PersistenceError::Unavailable(_))
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => PersistenceError::Unavailable(err),
            other => PersistenceError::Query(other),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Corrupt(err.to_string())
    }
}

/// Everything the engine writes for one race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceCommit {
    pub race: Race,
    pub cyclists: Vec<Cyclist>,
    pub results: Vec<RaceResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub race_created: bool,
    pub results_written: usize,
    pub participant_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedResult {
    pub rank: u32,
    pub rank_estimated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CyclistSummary {
    pub cyclist: Cyclist,
    pub total_races: u32,
    /// Lowest published finishing position; estimated numbers are not ranks.
    pub best_rank: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatestRace {
    pub id: String,
    pub name: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_races: u64,
    pub total_cyclists: u64,
    pub total_results: u64,
    pub latest_race: Option<LatestRace>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrapeRunRecord {
    pub run_id: Uuid,
    pub source_id: String,
    pub region: Region,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub summary: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database behind `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(PersistenceError::Unavailable)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        if !database_url.contains(":memory:") {
            if let Some(parent) = options.get_filename().parent() {
                ensure_dir(parent)?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(PersistenceError::Unavailable)?;
        debug!(database_url, "store connected");
        Ok(Self { pool })
    }

    /// Private in-memory database with the schema applied.
    pub async fn connect_in_memory() -> Result<Self, PersistenceError> {
        let store = Self::connect("sqlite::memory:").await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn race_exists(&self, race_id: &str) -> Result<bool, PersistenceError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM races WHERE id = ?")
            .bind(race_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn race_results(
        &self,
        race_id: &str,
    ) -> Result<BTreeMap<String, PersistedResult>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT cyclist_id, rank, rank_estimated FROM race_results WHERE race_id = ?",
        )
        .bind(race_id)
        .fetch_all(&self.pool)
        .await?;

        let mut results = BTreeMap::new();
        for row in rows {
            let cyclist_id: String = row.try_get("cyclist_id")?;
            let rank = to_u32(row.try_get::<i64, _>("rank")?, "rank")?;
            let rank_estimated: bool = row.try_get("rank_estimated")?;
            results.insert(
                cyclist_id,
                PersistedResult {
                    rank,
                    rank_estimated,
                },
            );
        }
        Ok(results)
    }

    pub async fn race_participant_count(&self, race_id: &str) -> Result<Option<u32>, PersistenceError> {
        let count: Option<i64> =
            sqlx::query_scalar("SELECT participant_count FROM races WHERE id = ?")
                .bind(race_id)
                .fetch_optional(&self.pool)
                .await?;
        count.map(|c| to_u32(c, "participant_count")).transpose()
    }

    /// Writes one race atomically: race row, cyclists, results, then the
    /// participant count recomputed from what is stored.
    pub async fn commit_race(&self, commit: &RaceCommit) -> Result<CommitOutcome, PersistenceError> {
        let now = Utc::now().to_rfc3339();
        let race = &commit.race;
        let mut tx = self.pool.begin().await?;

        let existed: Option<i64> = sqlx::query_scalar("SELECT 1 FROM races WHERE id = ?")
            .bind(&race.id)
            .fetch_optional(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO races (id, source_id, url, date, name, participant_count, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT(id) DO UPDATE SET
                source_id = excluded.source_id,
                url = excluded.url,
                date = excluded.date,
                name = excluded.name
            "#,
        )
        .bind(&race.id)
        .bind(&race.source_id)
        .bind(&race.url)
        .bind(race.date.format(DATE_FORMAT).to_string())
        .bind(&race.name)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        for cyclist in &commit.cyclists {
            sqlx::query(
                r#"
                INSERT INTO cyclists (id, first_name, last_name, region, club, club_raw, match_key, created_at)
                VALUES (?, ?, ?, NULLIF(?, ''), NULLIF(?, ''), NULLIF(?, ''), ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    first_name = CASE WHEN excluded.first_name <> '' THEN excluded.first_name ELSE cyclists.first_name END,
                    last_name = CASE WHEN excluded.last_name <> '' THEN excluded.last_name ELSE cyclists.last_name END,
                    match_key = CASE
                        WHEN excluded.first_name <> '' AND excluded.last_name <> '' THEN excluded.match_key
                        ELSE cyclists.match_key
                    END,
                    region = COALESCE(excluded.region, cyclists.region),
                    club = COALESCE(excluded.club, cyclists.club),
                    club_raw = COALESCE(excluded.club_raw, cyclists.club_raw)
                "#,
            )
            .bind(cyclist.id.as_str())
            .bind(&cyclist.first_name)
            .bind(&cyclist.last_name)
            .bind(cyclist.region.as_deref().unwrap_or(""))
            .bind(cyclist.club.as_deref().unwrap_or(""))
            .bind(cyclist.club_raw.as_deref().unwrap_or(""))
            .bind(&cyclist.match_key)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        for result in &commit.results {
            sqlx::query(
                r#"
                INSERT INTO race_results (race_id, cyclist_id, rank, rank_estimated, raw_data_json)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(race_id, cyclist_id) DO UPDATE SET
                    rank = excluded.rank,
                    rank_estimated = excluded.rank_estimated,
                    raw_data_json = excluded.raw_data_json
                "#,
            )
            .bind(&result.race_id)
            .bind(result.cyclist_id.as_str())
            .bind(i64::from(result.rank))
            .bind(result.rank_estimated)
            .bind(serde_json::to_string(&result.raw_data)?)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE races SET participant_count = (SELECT COUNT(*) FROM race_results WHERE race_id = ?) WHERE id = ?",
        )
        .bind(&race.id)
        .bind(&race.id)
        .execute(&mut *tx)
        .await?;

        let participant_count: i64 =
            sqlx::query_scalar("SELECT participant_count FROM races WHERE id = ?")
                .bind(&race.id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        let outcome = CommitOutcome {
            race_created: existed.is_none(),
            results_written: commit.results.len(),
            participant_count: to_u32(participant_count, "participant_count")?,
        };
        debug!(race_id = %race.id, ?outcome, "race committed");
        Ok(outcome)
    }

    pub async fn load_checkpoint(
        &self,
        source_id: &str,
        region: Region,
    ) -> Result<Option<ScrapeCheckpoint>, PersistenceError> {
        let state: Option<String> = sqlx::query_scalar(
            "SELECT state_json FROM scrape_checkpoints WHERE source_id = ? AND region = ?",
        )
        .bind(source_id)
        .bind(region.slug())
        .fetch_optional(&self.pool)
        .await?;

        state
            .map(|json| serde_json::from_str(&json).map_err(PersistenceError::from))
            .transpose()
    }

    pub async fn save_checkpoint(&self, checkpoint: &ScrapeCheckpoint) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO scrape_checkpoints (source_id, region, state_json, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source_id, region) DO UPDATE SET
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&checkpoint.source_id)
        .bind(checkpoint.region.slug())
        .bind(serde_json::to_string(checkpoint)?)
        .bind(checkpoint.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_scrape_run(&self, record: &ScrapeRunRecord) -> Result<(), PersistenceError> {
        let stats = self.stats().await?;
        sqlx::query(
            r#"
            INSERT INTO scrape_runs
                (run_id, source_id, region, started_at, finished_at, status, total_races, total_cyclists, summary_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                finished_at = excluded.finished_at,
                status = excluded.status,
                total_races = excluded.total_races,
                total_cyclists = excluded.total_cyclists,
                summary_json = excluded.summary_json
            "#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.source_id)
        .bind(record.region.slug())
        .bind(record.started_at.to_rfc3339())
        .bind(record.finished_at.to_rfc3339())
        .bind(&record.status)
        .bind(stats.total_races as i64)
        .bind(stats.total_cyclists as i64)
        .bind(serde_json::to_string(&record.summary)?)
        .execute(&self.pool)
        .await?;
        info!(
            run_id = %record.run_id,
            total_races = stats.total_races,
            total_cyclists = stats.total_cyclists,
            "scrape run recorded"
        );
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats, PersistenceError> {
        let total_races: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM races")
            .fetch_one(&self.pool)
            .await?;
        let total_cyclists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cyclists")
            .fetch_one(&self.pool)
            .await?;
        let total_results: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM race_results")
            .fetch_one(&self.pool)
            .await?;

        let latest = sqlx::query("SELECT id, name, date FROM races ORDER BY date DESC, id LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        let latest_race = match latest {
            Some(row) => Some(LatestRace {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                date: parse_date(&row.try_get::<String, _>("date")?)?,
            }),
            None => None,
        };

        Ok(StoreStats {
            total_races: total_races.max(0) as u64,
            total_cyclists: total_cyclists.max(0) as u64,
            total_results: total_results.max(0) as u64,
            latest_race,
        })
    }

    pub async fn cyclist_summary(&self, id: &str) -> Result<Option<CyclistSummary>, PersistenceError> {
        let sql = summary_query("c.id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(summary_from_row).transpose()
    }

    /// The most raced cyclist whose names match; ties go to the lowest id.
    pub async fn best_cyclist_by_match_key(
        &self,
        match_key: &str,
    ) -> Result<Option<CyclistSummary>, PersistenceError> {
        let sql = summary_query("c.match_key = ?");
        let row = sqlx::query(&sql)
            .bind(match_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(summary_from_row).transpose()
    }
}

fn summary_query(predicate: &str) -> String {
    format!(
        r#"
        SELECT c.id, c.first_name, c.last_name, c.region, c.club, c.club_raw, c.match_key,
               COUNT(rr.race_id) AS total_races,
               MIN(CASE WHEN rr.rank_estimated = 0 THEN rr.rank END) AS best_rank
          FROM cyclists c
          LEFT JOIN race_results rr ON rr.cyclist_id = c.id
         WHERE {predicate}
         GROUP BY c.id
         ORDER BY total_races DESC, c.id
         LIMIT 1
        "#
    )
}

fn summary_from_row(row: &SqliteRow) -> Result<CyclistSummary, PersistenceError> {
    let id: String = row.try_get("id")?;
    let best_rank: Option<i64> = row.try_get("best_rank")?;
    Ok(CyclistSummary {
        cyclist: Cyclist {
            id: CyclistId::from_stored(&id),
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            region: row.try_get("region")?,
            club: row.try_get("club")?,
            club_raw: row.try_get("club_raw")?,
            match_key: row.try_get("match_key")?,
        },
        total_races: to_u32(row.try_get::<i64, _>("total_races")?, "total_races")?,
        best_rank: best_rank.map(|rank| to_u32(rank, "best_rank")).transpose()?,
    })
}

fn to_u32(value: i64, column: &str) -> Result<u32, PersistenceError> {
    u32::try_from(value).map_err(|_| PersistenceError::Corrupt(format!("{column} out of range: {value}")))
}

fn parse_date(text: &str) -> Result<NaiveDate, PersistenceError> {
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .map_err(|err| PersistenceError::Corrupt(format!("race date `{text}`: {err}")))
}

fn ensure_dir(dir: &Path) -> Result<(), PersistenceError> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|err| PersistenceError::Unavailable(sqlx::Error::Io(err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn race(id: &str) -> Race {
        Race {
            id: id.into(),
            source_id: "pdl".into(),
            url: format!("https://example.test/resultats/{id}/"),
            date: NaiveDate::from_ymd_opt(2024, 5, 25).expect("date"),
            name: "Grand Prix de Cholet".into(),
        }
    }

    fn cyclist(id: &str, club: Option<&str>, region: Option<&str>) -> Cyclist {
        Cyclist {
            id: CyclistId::Federation(id.into()),
            first_name: "Paul".into(),
            last_name: "BERNARD".into(),
            region: region.map(str::to_string),
            club: club.map(str::to_string),
            club_raw: club.map(str::to_string),
            match_key: "bernard|paul".into(),
        }
    }

    fn result(race_id: &str, cyclist_id: &str, rank: u32) -> RaceResult {
        RaceResult {
            race_id: race_id.into(),
            cyclist_id: CyclistId::Federation(cyclist_id.into()),
            rank,
            rank_estimated: false,
            raw_data: vec![rank.to_string(), cyclist_id.into()],
        }
    }

    #[tokio::test]
    async fn commit_counts_participants_and_upserts_results() {
        let store = SqliteStore::connect_in_memory().await.expect("store");
        let first = RaceCommit {
            race: race("race_a"),
            cyclists: vec![cyclist("1", Some("UC Cholet"), None), cyclist("2", None, None)],
            results: vec![result("race_a", "1", 1), result("race_a", "2", 2)],
        };

        let outcome = store.commit_race(&first).await.expect("first commit");
        assert!(outcome.race_created);
        assert_eq!(outcome.participant_count, 2);

        let second = RaceCommit {
            race: race("race_a"),
            cyclists: vec![cyclist("1", None, None)],
            results: vec![result("race_a", "1", 3)],
        };
        let outcome = store.commit_race(&second).await.expect("second commit");
        assert!(!outcome.race_created);
        assert_eq!(outcome.participant_count, 2);

        let results = store.race_results("race_a").await.expect("results");
        assert_eq!(results.len(), 2);
        assert_eq!(results["1"].rank, 3);
        assert_eq!(results["2"].rank, 2);
    }

    #[tokio::test]
    async fn blank_club_never_overwrites_known_club() {
        let store = SqliteStore::connect_in_memory().await.expect("store");
        for (race_id, club, region) in [
            ("race_a", None, Some("Bretagne")),
            ("race_b", Some("VC Rennes"), None),
            ("race_c", None, None),
        ] {
            store
                .commit_race(&RaceCommit {
                    race: race(race_id),
                    cyclists: vec![cyclist("7", club, region)],
                    results: vec![result(race_id, "7", 4)],
                })
                .await
                .expect("commit");
        }

        let summary = store
            .cyclist_summary("7")
            .await
            .expect("query")
            .expect("cyclist stored");
        assert_eq!(summary.cyclist.club.as_deref(), Some("VC Rennes"));
        assert_eq!(summary.cyclist.region.as_deref(), Some("Bretagne"));
        assert_eq!(summary.total_races, 3);
        assert_eq!(summary.best_rank, Some(4));
    }

    #[tokio::test]
    async fn checkpoint_round_trips() {
        let store = SqliteStore::connect_in_memory().await.expect("store");
        assert!(store
            .load_checkpoint("pdl", Region::PaysDeLaLoire)
            .await
            .expect("load")
            .is_none());

        let mut checkpoint = ScrapeCheckpoint::new("pdl", Region::PaysDeLaLoire);
        checkpoint.begin_run(Uuid::new_v4());
        checkpoint.record_commit("https://example.test/resultats/a/", "race_a");
        checkpoint.advance_page(2);
        store.save_checkpoint(&checkpoint).await.expect("save");

        let loaded = store
            .load_checkpoint("pdl", Region::PaysDeLaLoire)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded, checkpoint);
    }

    #[tokio::test]
    async fn name_lookup_prefers_most_raced_cyclist() {
        let store = SqliteStore::connect_in_memory().await.expect("store");
        store
            .commit_race(&RaceCommit {
                race: race("race_a"),
                cyclists: vec![cyclist("1", None, None), cyclist("2", None, None)],
                results: vec![result("race_a", "1", 5), result("race_a", "2", 9)],
            })
            .await
            .expect("commit a");
        store
            .commit_race(&RaceCommit {
                race: race("race_b"),
                cyclists: vec![cyclist("2", None, None)],
                results: vec![result("race_b", "2", 2)],
            })
            .await
            .expect("commit b");

        let best = store
            .best_cyclist_by_match_key("bernard|paul")
            .await
            .expect("query")
            .expect("match");
        assert_eq!(best.cyclist.id.as_str(), "2");
        assert_eq!(best.total_races, 2);
        assert_eq!(best.best_rank, Some(2));

        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.total_races, 2);
        assert_eq!(stats.total_cyclists, 2);
        assert_eq!(stats.total_results, 3);
    }
}
