//! Catalog seam, immutable payload archive and bounded HTTP fetch for REFE.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use refe_core::FeedFormat;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod catalog;

pub use catalog::{write_atomic, write_snapshot, Catalog, CatalogError, ListingStore, MemoryCatalog};

pub const CRATE_NAME: &str = "refe-storage";

/// One archived feed payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedPayload {
    pub feed_id: String,
    pub format: FeedFormat,
    pub content_hash: String,
    pub received_at: DateTime<Utc>,
    pub byte_size: usize,
    /// Path under the archive root.
    pub path: PathBuf,
    /// The same bytes were already archived for this feed.
    pub reused: bool,
}

/// Content-addressed store of raw feed payloads, one directory per feed.
///
/// Identical payloads are written once; every arrival is still appended to
/// the feed's `received.jsonl` so the download history survives dedupe.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub const RECEIPTS_FILE: &'static str = "received.jsonl";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<feed>/<first two hash chars>/<hash>.<format extension>`
    pub fn payload_path(feed_id: &str, format: FeedFormat, content_hash: &str) -> PathBuf {
        let shard = content_hash.get(..2).unwrap_or("00");
        PathBuf::from(feed_id)
            .join(shard)
            .join(format!("{content_hash}.{}", format.extension()))
    }

    pub async fn archive(
        &self,
        feed_id: &str,
        format: FeedFormat,
        received_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::content_hash(bytes);
        let path = Self::payload_path(feed_id, format, &content_hash);
        let absolute = self.root.join(&path);

        let reused = fs::try_exists(&absolute)
            .await
            .with_context(|| format!("checking archived payload {}", absolute.display()))?;
        if !reused {
            write_atomic(&absolute, bytes).await?;
        }

        let payload = ArchivedPayload {
            feed_id: feed_id.to_string(),
            format,
            content_hash,
            received_at,
            byte_size: bytes.len(),
            path,
            reused,
        };
        self.append_receipt(&payload).await?;
        Ok(payload)
    }

    async fn append_receipt(&self, payload: &ArchivedPayload) -> anyhow::Result<()> {
        let receipts = self.root.join(&payload.feed_id).join(Self::RECEIPTS_FILE);
        let mut line = serde_json::to_vec(payload).context("encoding payload receipt")?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&receipts)
            .await
            .with_context(|| format!("opening {}", receipts.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("appending to {}", receipts.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
        }
    }
}

/// Feed downloader. Every request is bounded by the client timeout; there is
/// no retry loop here because the next scheduler tick is the retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_feed: Mutex<HashMap<String, Arc<Semaphore>>>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_feed: Mutex::new(HashMap::new()),
        })
    }

    async fn per_feed_semaphore(&self, feed_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_feed.lock().await;
        map.entry(feed_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Downloads one feed. A feed never has two downloads in flight.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        feed_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_feed = self.per_feed_semaphore(feed_id).await;
        let _feed = per_feed.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, feed_id, url);
        async {
            let resp = self.client.get(url).send().await.map_err(|err| classify(err, url))?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await.map_err(|err| classify(err, url))?.to_vec();
            debug!(bytes = body.len(), %status, "feed downloaded");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

fn classify(err: reqwest::Error, url: &str) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Request(err)
    }
}
