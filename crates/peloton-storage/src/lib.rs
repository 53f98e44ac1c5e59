//! HTTP fetching, raw page archive and the SQLite gateway for Peloton.

pub mod archive;
pub mod db;
pub mod http;

pub use archive::{ArchivedPage, PageArchive, UnparsedPage, UnparsedRecord};
pub use db::{
    CommitOutcome, CyclistSummary, LatestRace, PersistedResult, PersistenceError, RaceCommit,
    ScrapeRunRecord, SqliteStore, StoreStats,
};
pub use http::{
    charset_from_content_type, classify_status, decode_body, FetchError, FetchErrorKind,
    FetchProfile, FetchedPage, HttpFetcher, ReqwestTransport, RetryDisposition, Transport,
    TransportFailure, TransportResponse,
};

pub const CRATE_NAME: &str = "peloton-storage";
