//! Ingestion orchestration: parse a feed payload, reconcile it against the
//! catalog, and record the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use refe_adapters::{detect_format, parse_feed};
use refe_core::{
    as_opt_text, fields, resolve_field, EntityKind, Feed, FeedFormat, FeedMode, IngestionRun, RawRow, RowError, RunStatus,
};
use refe_storage::{write_snapshot, Catalog, HttpClientConfig, HttpFetcher, MemoryCatalog, PayloadArchive};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod aggregate;
pub mod ledger;
pub mod reconcile;
pub mod scheduler;

pub use aggregate::{aggregate_complexes, ComplexCandidate};
pub use ledger::report_recent_runs;
pub use reconcile::{reconcile_batch, BatchOutcome, UpsertOutcome};
pub use scheduler::RefreshScheduler;

pub const CRATE_NAME: &str = "refe-sync";

/// Feed definitions declared in `feeds.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedRegistry {
    #[serde(default)]
    pub feeds: Vec<Feed>,
}

impl FeedRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Loads the registry if the file exists; an absent file declares no feeds.
    pub async fn load_optional(path: &Path) -> Result<Self> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(Self::default());
        }
        Self::load(path).await
    }
}

/// Upserts registry feeds into the catalog. The scheduler's bookkeeping
/// (`last_auto_refresh`) is kept from the stored copy.
pub fn seed_feeds<C: Catalog + ?Sized>(catalog: &mut C, registry: &FeedRegistry) -> usize {
    for feed in &registry.feeds {
        let mut feed = feed.clone();
        if let Some(stored) = catalog.feed(&feed.id) {
            feed.last_auto_refresh = stored.last_auto_refresh;
        }
        catalog.put_feed(feed);
    }
    registry.feeds.len()
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub catalog_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub archive_payloads: bool,
    pub scheduler_enabled: bool,
    pub tick_secs: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

fn env_number(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("REFE_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            catalog_path: std::env::var("REFE_CATALOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("catalog.json")),
            artifacts_dir: std::env::var("REFE_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("artifacts")),
            archive_payloads: env_flag("REFE_ARCHIVE_PAYLOADS", false),
            scheduler_enabled: env_flag("REFE_SCHEDULER_ENABLED", false),
            tick_secs: env_number("REFE_TICK_SECS", 60).max(1),
            user_agent: std::env::var("REFE_USER_AGENT").unwrap_or_else(|_| "refe-bot/0.1".to_string()),
            http_timeout_secs: env_number("REFE_HTTP_TIMEOUT_SECS", 30),
            workspace_root,
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("feeds.yaml")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}

/// Where the rows of one ingestion come from.
#[derive(Debug, Clone)]
pub enum IngestInput {
    /// A raw payload; `hint` is a filename or URL used for format detection.
    Bytes { bytes: Vec<u8>, hint: Option<String> },
    /// Rows that were already parsed elsewhere.
    Rows(Vec<RawRow>),
    /// Download the payload first.
    Remote { url: String },
}

/// What `ingest` hands back to its caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub run_id: Uuid,
    pub inserted: usize,
    pub updated: usize,
    pub hidden: usize,
    pub errors: Vec<RowError>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_complexes: Option<UpsertOutcome>,
}

/// Dry-run view of a payload: nothing is written anywhere.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPreview {
    pub format: FeedFormat,
    pub row_count: usize,
    pub columns: Vec<String>,
    pub sample_rows: Vec<RawRow>,
    pub rows_with_building_ref: usize,
    pub complexes: Vec<ComplexCandidate>,
}

/// Builds a preview from parsed rows.
pub fn preview_rows(feed: &Feed, format: FeedFormat, rows: &[RawRow], limit: usize) -> FeedPreview {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.to_string());
            }
        }
    }
    let rows_with_building_ref = rows
        .iter()
        .filter(|row| as_opt_text(resolve_field(row, fields::COMPLEX_EXTERNAL_ID, &feed.mapping)).is_some())
        .count();
    FeedPreview {
        format,
        row_count: rows.len(),
        columns,
        sample_rows: rows.iter().take(limit).cloned().collect(),
        rows_with_building_ref,
        complexes: aggregate_complexes(rows, &feed.id, &feed.mapping),
    }
}

/// Drives ingestion passes against one shared catalog.
pub struct IngestionEngine<C: Catalog> {
    catalog: Arc<Mutex<C>>,
    http: HttpFetcher,
    archive: Option<PayloadArchive>,
    reports_dir: Option<PathBuf>,
    snapshot_path: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl<C: Catalog> IngestionEngine<C> {
    pub fn new(catalog: Arc<Mutex<C>>, http: HttpFetcher) -> Self {
        Self {
            catalog,
            http,
            archive: None,
            reports_dir: None,
            snapshot_path: None,
            persist_lock: Mutex::new(()),
        }
    }

    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn catalog(&self) -> &Arc<Mutex<C>> {
        &self.catalog
    }

    /// Runs one full pass for `feed` and records it.
    ///
    /// Loading and parsing happen before the catalog lock is taken; a failure
    /// there records a failed run with zero stats and leaves the catalog's
    /// records untouched. Row-level problems never fail the call.
    pub async fn ingest(&self, feed: &Feed, entity: EntityKind, input: IngestInput) -> Result<IngestReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest", %run_id, feed_id = %feed.id, entity = entity.as_str());
        self.run_pass(run_id, feed, entity, input).instrument(span).await
    }

    async fn run_pass(&self, run_id: Uuid, feed: &Feed, entity: EntityKind, input: IngestInput) -> Result<IngestReport> {
        let started_at = Utc::now();
        let rows = match self.load_rows(run_id, feed, input).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "ingestion aborted before reconciliation");
                let run = ledger::failed_run(run_id, &feed.id, entity, started_at, format!("{err:#}"));
                self.catalog.lock().await.append_run(run.clone())?;
                self.after_run(&run, &[]).await;
                return Err(err);
            }
        };

        let (batch, run) = {
            let mut catalog = self.catalog.lock().await;
            let batch = reconcile_batch(&mut *catalog, &feed.id, entity, &rows, &feed.mapping, Utc::now());
            let run = ledger::completed_run(run_id, &feed.id, entity, started_at, &batch.outcome);
            catalog.append_run(run.clone())?;
            (batch, run)
        };
        info!(
            rows = rows.len(),
            inserted = run.stats.inserted,
            updated = run.stats.updated,
            hidden = run.stats.hidden,
            errors = batch.outcome.errors.len(),
            status = run.status.as_str(),
            "ingestion finished"
        );
        self.after_run(&run, &batch.outcome.errors).await;

        let BatchOutcome {
            outcome,
            linked_complexes,
        } = batch;
        Ok(IngestReport {
            run_id,
            inserted: outcome.inserted,
            updated: outcome.updated,
            hidden: outcome.hidden,
            errors: outcome.errors,
            status: run.status,
            linked_complexes,
        })
    }

    /// Downloads and ingests a URL-mode feed using its declared entity kind.
    pub async fn refresh_feed(&self, feed: &Feed) -> Result<IngestReport> {
        let url = match (feed.mode, feed.url.as_deref()) {
            (FeedMode::Url, Some(url)) => url.trim().to_string(),
            _ => String::new(),
        };
        self.ingest(feed, feed.entity, IngestInput::Remote { url }).await
    }

    /// Parses a payload and summarizes it without touching the catalog.
    pub async fn preview(&self, feed: &Feed, bytes: Vec<u8>, hint: Option<String>, limit: usize) -> Result<FeedPreview> {
        let declared = feed.format;
        let parsed = tokio::task::spawn_blocking(move || parse_feed(declared, hint.as_deref(), &bytes))
            .await
            .context("parser task panicked")?;
        let (format, rows) = parsed.with_context(|| format!("parsing payload for feed {}", feed.id))?;
        Ok(preview_rows(feed, format, &rows, limit))
    }

    /// Writes the catalog snapshot, if the backend exports one.
    pub async fn persist(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let _serial = self.persist_lock.lock().await;
        let bytes = self.catalog.lock().await.export_snapshot()?;
        if let Some(bytes) = bytes {
            write_snapshot(path, &bytes).await?;
        }
        Ok(())
    }

    async fn after_run(&self, run: &IngestionRun, errors: &[RowError]) {
        if let Some(dir) = &self.reports_dir {
            if let Err(err) = ledger::write_run_report(dir, run, errors).await {
                warn!(error = %format!("{err:#}"), "failed to write run report");
            }
        }
        if let Err(err) = self.persist().await {
            warn!(error = %format!("{err:#}"), "failed to persist catalog snapshot");
        }
    }

    async fn load_rows(&self, run_id: Uuid, feed: &Feed, input: IngestInput) -> Result<Vec<RawRow>> {
        match input {
            IngestInput::Rows(rows) => Ok(rows),
            IngestInput::Bytes { bytes, hint } => self.parse_payload(feed, bytes, hint).await,
            IngestInput::Remote { url } => {
                if url.trim().is_empty() {
                    bail!("feed {} has no download URL", feed.id);
                }
                let response = self
                    .http
                    .fetch_bytes(run_id, &feed.id, &url)
                    .await
                    .with_context(|| format!("downloading feed {}", feed.id))?;
                self.parse_payload(feed, response.body, Some(response.final_url)).await
            }
        }
    }

    async fn parse_payload(&self, feed: &Feed, bytes: Vec<u8>, hint: Option<String>) -> Result<Vec<RawRow>> {
        if let Some(archive) = &self.archive {
            let format = detect_format(feed.format, hint.as_deref(), &bytes).unwrap_or(FeedFormat::Auto);
            match archive.archive(&feed.id, format, Utc::now(), &bytes).await {
                Ok(payload) => info!(
                    content_hash = %payload.content_hash,
                    path = %payload.path.display(),
                    bytes = payload.byte_size,
                    reused = payload.reused,
                    "payload archived"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "failed to archive payload"),
            }
        }

        let declared = feed.format;
        let parsed = tokio::task::spawn_blocking(move || parse_feed(declared, hint.as_deref(), &bytes))
            .await
            .context("parser task panicked")?;
        let (format, rows) = parsed.with_context(|| format!("parsing payload for feed {}", feed.id))?;
        info!(format = format.extension(), rows = rows.len(), "payload parsed");
        Ok(rows)
    }
}

/// Opens the catalog snapshot, seeds it from `feeds.yaml` and wires up an
/// engine the way the CLI and the scheduler use it.
pub async fn open_engine(config: &SyncConfig) -> Result<Arc<IngestionEngine<MemoryCatalog>>> {
    let mut catalog = MemoryCatalog::load_snapshot(&config.catalog_path).await?;
    let registry = FeedRegistry::load_optional(&config.registry_path()).await?;
    let seeded = seed_feeds(&mut catalog, &registry);
    info!(seeded, catalog = %config.catalog_path.display(), "catalog opened");

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    let mut engine = IngestionEngine::new(Arc::new(Mutex::new(catalog)), http)
        .with_reports_dir(config.reports_dir())
        .with_snapshot_path(config.catalog_path.clone());
    if config.archive_payloads {
        engine = engine.with_archive(PayloadArchive::new(config.artifacts_dir.clone()));
    }
    Ok(Arc::new(engine))
}

/// One scheduler tick from the environment, waiting for every refresh it
/// started.
pub async fn refresh_due_feeds_once_from_env() -> Result<usize> {
    let config = SyncConfig::from_env();
    let engine = open_engine(&config).await?;
    let scheduler = RefreshScheduler::new(engine.clone());
    let handles = scheduler.refresh_due_feeds().await;
    let started = handles.len();
    for handle in handles {
        if let Err(err) = handle.await {
            warn!(error = %err, "refresh task panicked");
        }
    }
    engine.persist().await?;
    Ok(started)
}

#[cfg(test)]
mod tests {
    use super::*;
    use refe_core::RowValue;
    use tempfile::tempdir;

    fn feed(id: &str) -> Feed {
        Feed {
            id: id.to_string(),
            name: id.to_string(),
            mode: FeedMode::Manual,
            format: FeedFormat::Auto,
            url: None,
            active: true,
            entity: EntityKind::Properties,
            mapping: Default::default(),
            auto_refresh_minutes: None,
            last_auto_refresh: None,
        }
    }

    fn engine() -> IngestionEngine<MemoryCatalog> {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("http client");
        IngestionEngine::new(Arc::new(Mutex::new(MemoryCatalog::new())), http)
    }

    #[tokio::test]
    async fn mixed_batch_reports_partial_with_row_diagnostic() {
        let engine = engine();
        let mut p1 = RawRow::new();
        p1.insert("external_id", "p1");
        p1.insert("price", "10 000 000");
        p1.insert("bedrooms", RowValue::Number(2.0));
        p1.insert("area_total", RowValue::Number(60.0));
        let mut p2 = RawRow::new();
        p2.insert("external_id", "p2");
        p2.insert("price", "bad");
        p2.insert("bedrooms", RowValue::Number(1.0));
        p2.insert("area_total", RowValue::Number(40.0));

        let report = engine
            .ingest(&feed("acme"), EntityKind::Properties, IngestInput::Rows(vec![p1, p2]))
            .await
            .expect("ingest");
        assert_eq!((report.inserted, report.updated, report.hidden), (1, 0, 0));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].row_index, 2);
        assert_eq!(report.errors[0].external_id.as_deref(), Some("p2"));
        assert_eq!(report.status, RunStatus::Partial);

        let runs = engine.catalog().lock().await.runs(Some("acme"));
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Partial);
        assert!(runs[0].error_log.as_deref().unwrap_or_default().contains("p2"));
    }

    #[tokio::test]
    async fn csv_payload_is_parsed_and_ingested() {
        let engine = engine();
        let csv = "external_id;price;rooms;area\nu1;5 000 000;1;33,5\nu2;6 500 000;2;48\n";
        let report = engine
            .ingest(
                &feed("acme"),
                EntityKind::Properties,
                IngestInput::Bytes {
                    bytes: csv.as_bytes().to_vec(),
                    hint: Some("units.csv".into()),
                },
            )
            .await
            .expect("ingest");
        assert_eq!(report.inserted, 2);
        assert_eq!(report.status, RunStatus::Success);

        let catalog = engine.catalog().lock().await;
        let units = catalog.properties_for_source("acme");
        let u1 = units.iter().find(|u| u.external_id == "u1").unwrap();
        assert_eq!(u1.fields.area_total, 33.5);
    }

    #[tokio::test]
    async fn malformed_payload_fails_the_run_without_touching_records() {
        let engine = engine();
        engine
            .ingest(
                &feed("acme"),
                EntityKind::Properties,
                IngestInput::Rows(vec![[("external_id", "a"), ("price", "1"), ("bedrooms", "1"), ("area", "10")]
                    .into_iter()
                    .collect()]),
            )
            .await
            .expect("seed");

        let err = engine
            .ingest(
                &feed("acme"),
                EntityKind::Properties,
                IngestInput::Bytes {
                    bytes: b"<feed><offer></feed>".to_vec(),
                    hint: Some("feed.xml".into()),
                },
            )
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("acme"));

        let catalog = engine.catalog().lock().await;
        let units = catalog.properties_for_source("acme");
        assert_eq!(units[0].status, refe_core::Liveness::Active);
        let runs = catalog.runs(Some("acme"));
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].status, RunStatus::Failed);
        assert_eq!(runs[1].stats, refe_core::RunStats::default());
        assert!(runs[1].error_log.is_some());
    }

    #[tokio::test]
    async fn reports_and_snapshot_are_written_after_a_run() {
        let dir = tempdir().expect("tempdir");
        let snapshot = dir.path().join("state").join("catalog.json");
        let engine = engine()
            .with_reports_dir(dir.path().join("reports"))
            .with_snapshot_path(&snapshot)
            .with_archive(PayloadArchive::new(dir.path().join("artifacts")));

        let report = engine
            .ingest(
                &feed("acme"),
                EntityKind::Complexes,
                IngestInput::Bytes {
                    bytes: br#"[{"id":"b1","name":"Harbour","price":"100"}]"#.to_vec(),
                    hint: None,
                },
            )
            .await
            .expect("ingest");
        assert_eq!(report.inserted, 1);

        let run_dir = dir.path().join("reports").join(report.run_id.to_string());
        assert!(run_dir.join("run.json").exists());
        assert!(run_dir.join("summary.md").exists());
        assert!(dir.path().join("artifacts").join("acme").join(PayloadArchive::RECEIPTS_FILE).exists());

        let reloaded = MemoryCatalog::load_snapshot(&snapshot).await.expect("snapshot");
        assert_eq!(reloaded.complexes_for_source("acme")[0].fields.title, "Harbour");
        assert_eq!(reloaded.runs(None).len(), 1);
    }

    #[tokio::test]
    async fn preview_does_not_touch_the_catalog() {
        let engine = engine();
        let csv = "id,complex_id,price,rooms,area\na,c1,100,1,30\nb,c1,90,2,45\nc,,80,1,20\n";
        let preview = engine
            .preview(&feed("acme"), csv.as_bytes().to_vec(), Some("x.csv".into()), 2)
            .await
            .expect("preview");
        assert_eq!(preview.format, FeedFormat::Csv);
        assert_eq!(preview.row_count, 3);
        assert_eq!(preview.sample_rows.len(), 2);
        assert_eq!(preview.columns, vec!["id", "complex_id", "price", "rooms", "area"]);
        assert_eq!(preview.rows_with_building_ref, 2);
        assert_eq!(preview.complexes[0].external_id, "c1");
        assert_eq!(preview.complexes[0].fields.price_from, Some(90.0));

        let catalog = engine.catalog().lock().await;
        assert!(catalog.properties_for_source("acme").is_empty());
        assert!(catalog.runs(None).is_empty());
    }

    #[tokio::test]
    async fn seeding_keeps_scheduler_bookkeeping() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("feeds.yaml");
        std::fs::write(
            &path,
            "feeds:\n  - id: acme\n    name: Acme Homes\n    mode: url\n    format: xml\n    url: https://feeds.example/acme.xml\n    auto_refresh_minutes: 60\n    mapping:\n      price: cost\n",
        )
        .unwrap();
        let registry = FeedRegistry::load(&path).await.expect("registry");
        assert_eq!(registry.feeds[0].mapping.get("price").map(String::as_str), Some("cost"));

        let mut catalog = MemoryCatalog::new();
        assert_eq!(seed_feeds(&mut catalog, &registry), 1);
        let stamped = Utc::now();
        catalog.stamp_auto_refresh("acme", stamped).unwrap();

        seed_feeds(&mut catalog, &registry);
        let feed = catalog.feed("acme").unwrap();
        assert_eq!(feed.last_auto_refresh, Some(stamped));
        assert_eq!(feed.name, "Acme Homes");

        let missing = FeedRegistry::load_optional(&dir.path().join("nope.yaml")).await.unwrap();
        assert!(missing.feeds.is_empty());
    }
}
