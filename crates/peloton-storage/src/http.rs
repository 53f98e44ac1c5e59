//! Polite HTTP fetching with bounded, classified retries.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx and 429 are worth another attempt; every other non-success status is final.
pub fn classify_status(status: u16) -> RetryDisposition {
    if (500..600).contains(&status) || status == 429 {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FetchErrorKind {
    #[error("request timed out")]
    Timeout,
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("connection refused")]
    ConnectionRefused,
}

impl FetchErrorKind {
    pub fn disposition(self) -> RetryDisposition {
        match self {
            FetchErrorKind::Timeout | FetchErrorKind::ConnectionRefused => {
                RetryDisposition::Retryable
            }
            FetchErrorKind::HttpStatus(status) => classify_status(status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fetching {url} failed after {attempts} attempt(s): {kind}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub attempts: u32,
    pub url: String,
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        self.kind.disposition() == RetryDisposition::Retryable
    }
}

/// Per-source request pacing and retry budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchProfile {
    pub min_interval: Duration,
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    pub timeout: Duration,
}

impl Default for FetchProfile {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

impl FetchProfile {
    /// Delay after the `attempt`-th failed attempt (1-based).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.base_backoff.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub final_url: String,
    /// `charset` parameter of the `Content-Type` header, if any.
    pub charset: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    Timeout,
    Connection,
}

/// One HTTP GET, no retries. Implemented over reqwest in production.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration)
        -> Result<TransportResponse, TransportFailure>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> TransportFailure {
    if err.is_timeout() {
        TransportFailure::Timeout
    } else {
        TransportFailure::Connection
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportFailure> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err))?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let charset = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(charset_from_content_type);
        let body = resp
            .bytes()
            .await
            .map_err(|err| classify_reqwest_error(&err))?
            .to_vec();
        Ok(TransportResponse {
            status,
            final_url,
            charset,
            body,
        })
    }
}

pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .find_map(|param| {
            let (name, value) = param.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| value.trim().trim_matches('"').to_string())
        })
        .filter(|charset| !charset.is_empty())
}

/// Decodes with the declared charset. Undeclared bodies that are not valid
/// UTF-8 are read as windows-1252, the superset browsers use for ISO-8859-1.
pub fn decode_body(body: &[u8], charset: Option<&str>) -> String {
    let declared = charset.and_then(|label| Encoding::for_label(label.trim().as_bytes()));
    let encoding = match declared {
        Some(encoding) => encoding,
        None if std::str::from_utf8(body).is_ok() => UTF_8,
        None => WINDOWS_1252,
    };
    let (text, _, _) = encoding.decode(body);
    text.into_owned()
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub charset: Option<String>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub attempts: u32,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        decode_body(&self.body, self.charset.as_deref())
    }
}

pub struct HttpFetcher {
    transport: Box<dyn Transport>,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl HttpFetcher {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            last_request: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_reqwest(user_agent: Option<&str>) -> anyhow::Result<Self> {
        Ok(Self::new(ReqwestTransport::new(user_agent)?))
    }

    /// Holds the host slot until `min_interval` has passed since its last request.
    async fn wait_for_turn(&self, host: &str, min_interval: Duration) {
        let mut last_request = self.last_request.lock().await;
        if let Some(previous) = last_request.get(host) {
            let elapsed = previous.elapsed();
            if elapsed < min_interval {
                tokio::time::sleep(min_interval - elapsed).await;
            }
        }
        last_request.insert(host.to_string(), Instant::now());
    }

    pub async fn fetch(&self, url: &str, profile: &FetchProfile) -> Result<FetchedPage, FetchError> {
        let host = host_of(url);
        let span = info_span!("http_fetch", url, host = %host);

        async move {
            let max_attempts = profile.max_attempts.max(1);
            let mut attempt = 0;
            loop {
                attempt += 1;
                self.wait_for_turn(&host, profile.min_interval).await;

                let kind = match self.transport.get(url, profile.timeout).await {
                    Ok(resp) if (200..300).contains(&resp.status) => {
                        debug!(attempt, status = resp.status, bytes = resp.body.len(), "fetched");
                        return Ok(FetchedPage {
                            url: url.to_string(),
                            final_url: resp.final_url,
                            status: resp.status,
                            charset: resp.charset,
                            body: resp.body,
                            fetched_at: Utc::now(),
                            attempts: attempt,
                        });
                    }
                    Ok(resp) => FetchErrorKind::HttpStatus(resp.status),
                    Err(TransportFailure::Timeout) => FetchErrorKind::Timeout,
                    Err(TransportFailure::Connection) => FetchErrorKind::ConnectionRefused,
                };

                if kind.disposition() == RetryDisposition::NonRetryable || attempt >= max_attempts {
                    warn!(attempt, error = %kind, "giving up");
                    return Err(FetchError {
                        kind,
                        attempts: attempt,
                        url: url.to_string(),
                    });
                }

                let delay = profile.backoff_for_attempt(attempt);
                debug!(attempt, error = %kind, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
        .instrument(span)
        .await
    }
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}
