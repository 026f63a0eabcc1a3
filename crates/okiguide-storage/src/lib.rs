//! Guide data sources (HTTP API, JSON file) and bookmark persistence.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use okiguide_core::GuideSnapshot;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "okiguide-storage";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuideEnvelope {
    pub success: bool,
    #[serde(default)]
    pub guides: Vec<JsonValue>,
}

/// `Unavailable` means keep the current lists; `Loaded` with zero guides is an empty directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Loaded(GuideSnapshot),
    Unavailable(String),
}

impl FetchOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("guide payload is not valid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("guide source reported success=false")]
    Rejected,
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub fn decode_guide_payload(bytes: &[u8]) -> Result<GuideSnapshot, SourceError> {
    let value: JsonValue = serde_json::from_slice(bytes)?;
    if let JsonValue::Array(records) = &value {
        return Ok(GuideSnapshot::from_json_records(records));
    }
    let envelope: GuideEnvelope = serde_json::from_value(value)?;
    if !envelope.success {
        return Err(SourceError::Rejected);
    }
    Ok(GuideSnapshot::from_json_records(&envelope.guides))
}

#[async_trait]
pub trait GuideSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch_guides(&self) -> Result<GuideSnapshot, SourceError>;

    /// Fetch and fold every failure into [`FetchOutcome::Unavailable`].
    async fn fetch_outcome(&self) -> FetchOutcome {
        match self.fetch_guides().await {
            Ok(snapshot) => {
                info!(source = %self.describe(), guides = snapshot.len(), "guide fetch complete");
                FetchOutcome::Loaded(snapshot)
            }
            Err(err) => {
                warn!(source = %self.describe(), error = %err, "guide fetch failed; keeping current data");
                FetchOutcome::Unavailable(err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Guide API client. Timeouts are not retried: the list engine treats them as a
/// failed refresh and waits for the next poll.
#[derive(Debug, Clone)]
pub struct HttpGuideSource {
    client: reqwest::Client,
    url: String,
    backoff: BackoffPolicy,
}

impl HttpGuideSource {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            url: url.into(),
            backoff: config.backoff,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_bytes(&self) -> Result<Vec<u8>, SourceError> {
        let mut attempt = 0;
        loop {
            match self.client.get(&self.url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if !err.is_timeout()
                        && classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl GuideSource for HttpGuideSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch_guides(&self) -> Result<GuideSnapshot, SourceError> {
        let span = info_span!("guide_fetch", url = %self.url);
        async {
            let body = self.fetch_bytes().await?;
            decode_guide_payload(&body)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct JsonFileGuideSource {
    path: PathBuf,
}

impl JsonFileGuideSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl GuideSource for JsonFileGuideSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch_guides(&self) -> Result<GuideSnapshot, SourceError> {
        let bytes = fs::read(&self.path).await.map_err(|source| SourceError::Io {
            path: self.path.clone(),
            source,
        })?;
        decode_guide_payload(&bytes)
    }
}

#[derive(Debug, Error)]
pub enum BookmarkError {
    #[error("bookmark file io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bookmark file {path} is not valid json: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct BookmarkStore {
    path: PathBuf,
}

impl BookmarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<BTreeSet<String>, BookmarkError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(source) => {
                return Err(BookmarkError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| BookmarkError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    pub async fn save(&self, ids: &BTreeSet<String>) -> Result<(), BookmarkError> {
        let io_err = |source| BookmarkError::Io {
            path: self.path.clone(),
            source,
        };
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await.map_err(io_err)?;

        let bytes = serde_json::to_vec_pretty(ids).map_err(|source| BookmarkError::Decode {
            path: self.path.clone(),
            source,
        })?;
        let temp_path = parent.join(format!(".{}.bookmarks.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path).await.map_err(io_err)?;
        file.write_all(&bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(source));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAYLOAD: &str = r#"{
        "success": true,
        "guides": [
            {"id": "a", "name": "Aiko", "location": "Naha", "sessionRate": 8000, "status": "approved", "registeredAt": "2026-01-01T00:00:00Z"},
            {"id": "b", "guideName": "Ben", "location": "Nago", "price": "12000", "status": "approved", "registeredAt": "2026-02-01T00:00:00Z"},
            {"id": "c", "name": "Chika", "location": "Naha", "sessionRate": 9000, "status": "pending"}
        ]
    }"#;

    #[test]
    fn envelope_is_normalized_and_ordered() {
        let snapshot = decode_guide_payload(PAYLOAD.as_bytes()).expect("decode");
        let ids = snapshot.guides().iter().map(|g| g.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn success_false_is_rejected_not_empty() {
        let err = decode_guide_payload(br#"{"success": false, "guides": []}"#).unwrap_err();
        assert!(matches!(err, SourceError::Rejected));

        let empty = decode_guide_payload(br#"{"success": true, "guides": []}"#).expect("decode");
        assert!(empty.is_empty());
    }

    #[test]
    fn bare_array_payload_is_accepted() {
        let snapshot = decode_guide_payload(
            br#"[{"id": "x", "name": "X", "sessionRate": 7000, "status": "approved"}]"#,
        )
        .expect("decode");
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let err = decode_guide_payload(b"<html>502</html>").unwrap_err();
        assert!(matches!(err, SourceError::Decode(_)));
    }

    #[tokio::test]
    async fn json_file_source_reads_and_reports_missing_file_as_unavailable() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("guides.json");
        tokio::fs::write(&path, PAYLOAD).await.expect("write");

        let source = JsonFileGuideSource::new(&path);
        match source.fetch_outcome().await {
            FetchOutcome::Loaded(snapshot) => assert_eq!(snapshot.len(), 2),
            other => panic!("unexpected outcome {other:?}"),
        }

        let missing = JsonFileGuideSource::new(dir.path().join("nope.json"));
        assert!(matches!(
            missing.fetch_outcome().await,
            FetchOutcome::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn bookmarks_round_trip_through_atomic_write() {
        let dir = tempdir().expect("tempdir");
        let store = BookmarkStore::new(dir.path().join("nested/bookmarks.json"));
        assert!(store.load().await.expect("load empty").is_empty());

        let ids = BTreeSet::from(["g1".to_string(), "g7".to_string()]);
        store.save(&ids).await.expect("save");
        assert_eq!(store.load().await.expect("load"), ids);

        let leftovers = std::fs::read_dir(dir.path().join("nested"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn default_backoff_retries_once_within_a_second() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_retries, 1);

        let delays: Vec<_> = (0..4).map(|i| policy.delay_for_attempt(i)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
            ]
        );
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(1));
    }
}
