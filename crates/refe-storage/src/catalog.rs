//! Key-indexed catalog the ingestion engine reconciles against.
//!
//! The engine only sees the [`Catalog`] trait. Every method is synchronous on
//! purpose: a reconciliation pass runs while holding the catalog lock, and a
//! sync interface makes it impossible to suspend in the middle of it.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use refe_core::{Complex, Feed, IngestionRun, Listing, Liveness, Property};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("a record with key ({source_id}, {external_id}) already exists")]
    DuplicateKey {
        source_id: String,
        external_id: String,
    },
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("feed {0} not found")]
    UnknownFeed(String),
    #[error("catalog snapshot: {0}")]
    Snapshot(String),
}

/// Per-entity-kind record operations.
pub trait ListingStore<T: Listing> {
    /// Every record owned by `source_id`, whatever its status.
    fn list_for_source(&self, source_id: &str) -> Vec<T>;
    fn insert(&mut self, record: T) -> Result<(), CatalogError>;
    fn merge(&mut self, id: Uuid, fields: T::Fields, at: DateTime<Utc>) -> Result<(), CatalogError>;
    fn set_status(&mut self, id: Uuid, status: Liveness, at: DateTime<Utc>) -> Result<(), CatalogError>;
}

pub trait Catalog: ListingStore<Property> + ListingStore<Complex> + Send + 'static {
    fn feeds(&self) -> Vec<Feed>;
    fn feed(&self, id: &str) -> Option<Feed>;

    /// Inserts or replaces a feed definition.
    fn put_feed(&mut self, feed: Feed);

    fn stamp_auto_refresh(&mut self, feed_id: &str, at: DateTime<Utc>) -> Result<(), CatalogError>;

    fn append_run(&mut self, run: IngestionRun) -> Result<(), CatalogError>;

    /// Runs in append order, optionally restricted to one feed.
    fn runs(&self, feed_id: Option<&str>) -> Vec<IngestionRun>;

    fn feeds_due_for_refresh(&self, now: DateTime<Utc>) -> Vec<Feed> {
        self.feeds().into_iter().filter(|f| f.is_due(now)).collect()
    }

    fn properties_for_source(&self, source_id: &str) -> Vec<Property> {
        ListingStore::<Property>::list_for_source(self, source_id)
    }

    fn complexes_for_source(&self, source_id: &str) -> Vec<Complex> {
        ListingStore::<Complex>::list_for_source(self, source_id)
    }

    /// Serialized state for durable backends to persist; `None` when the
    /// backend persists on its own.
    fn export_snapshot(&self) -> Result<Option<Vec<u8>>, CatalogError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Table<T> {
    records: BTreeMap<Uuid, T>,
    /// `(source_id, external_id)` to record id; rebuilt after loading.
    #[serde(skip)]
    keys: HashMap<(String, String), Uuid>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            keys: HashMap::new(),
        }
    }
}

impl<T: Listing> Table<T> {
    fn reindex(&mut self) {
        self.keys = self
            .records
            .values()
            .map(|r| ((r.source_id().to_string(), r.external_id().to_string()), r.id()))
            .collect();
    }
}

impl<T: Listing> ListingStore<T> for Table<T> {
    fn list_for_source(&self, source_id: &str) -> Vec<T> {
        self.records
            .values()
            .filter(|r| r.source_id() == source_id)
            .cloned()
            .collect()
    }

    fn insert(&mut self, record: T) -> Result<(), CatalogError> {
        let key = (record.source_id().to_string(), record.external_id().to_string());
        if self.keys.contains_key(&key) {
            let (source_id, external_id) = key;
            return Err(CatalogError::DuplicateKey { source_id, external_id });
        }
        self.keys.insert(key, record.id());
        self.records.insert(record.id(), record);
        Ok(())
    }

    fn merge(&mut self, id: Uuid, fields: T::Fields, at: DateTime<Utc>) -> Result<(), CatalogError> {
        let record = self.records.get_mut(&id).ok_or(CatalogError::NotFound(id))?;
        record.merge(fields, at);
        Ok(())
    }

    fn set_status(&mut self, id: Uuid, status: Liveness, at: DateTime<Utc>) -> Result<(), CatalogError> {
        let record = self.records.get_mut(&id).ok_or(CatalogError::NotFound(id))?;
        record.set_status(status, at);
        Ok(())
    }
}

/// In-process catalog with an optional JSON snapshot on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryCatalog {
    #[serde(default)]
    feeds: BTreeMap<String, Feed>,
    #[serde(default)]
    properties: Table<Property>,
    #[serde(default)]
    complexes: Table<Complex>,
    #[serde(default)]
    runs: Vec<IngestionRun>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a snapshot; a missing file yields an empty catalog.
    pub async fn load_snapshot(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking catalog snapshot {}", path.display()))?
        {
            return Ok(Self::default());
        }
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading catalog snapshot {}", path.display()))?;
        let mut catalog: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing catalog snapshot {}", path.display()))?;
        catalog.properties.reindex();
        catalog.complexes.reindex();
        Ok(catalog)
    }
}

/// Writes a catalog snapshot; see [`write_atomic`].
pub async fn write_snapshot(path: impl AsRef<Path>, bytes: &[u8]) -> anyhow::Result<()> {
    write_atomic(path.as_ref(), bytes).await
}

/// Writes through a temp file and rename so readers never see a
/// half-written file. Missing parent directories are created.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::File::create(&temp_path)
        .await
        .with_context(|| format!("creating temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("renaming into {}", path.display()));
    }
    Ok(())
}

macro_rules! delegate_listing_store {
    ($ty:ty, $field:ident) => {
        impl ListingStore<$ty> for MemoryCatalog {
            fn list_for_source(&self, source_id: &str) -> Vec<$ty> {
                self.$field.list_for_source(source_id)
            }

            fn insert(&mut self, record: $ty) -> Result<(), CatalogError> {
                self.$field.insert(record)
            }

            fn merge(
                &mut self,
                id: Uuid,
                fields: <$ty as Listing>::Fields,
                at: DateTime<Utc>,
            ) -> Result<(), CatalogError> {
                self.$field.merge(id, fields, at)
            }

            fn set_status(&mut self, id: Uuid, status: Liveness, at: DateTime<Utc>) -> Result<(), CatalogError> {
                self.$field.set_status(id, status, at)
            }
        }
    };
}

delegate_listing_store!(Property, properties);
delegate_listing_store!(Complex, complexes);

impl Catalog for MemoryCatalog {
    fn feeds(&self) -> Vec<Feed> {
        self.feeds.values().cloned().collect()
    }

    fn feed(&self, id: &str) -> Option<Feed> {
        self.feeds.get(id).cloned()
    }

    fn put_feed(&mut self, feed: Feed) {
        self.feeds.insert(feed.id.clone(), feed);
    }

    fn stamp_auto_refresh(&mut self, feed_id: &str, at: DateTime<Utc>) -> Result<(), CatalogError> {
        let feed = self
            .feeds
            .get_mut(feed_id)
            .ok_or_else(|| CatalogError::UnknownFeed(feed_id.to_string()))?;
        feed.last_auto_refresh = Some(at);
        Ok(())
    }

    fn append_run(&mut self, run: IngestionRun) -> Result<(), CatalogError> {
        self.runs.push(run);
        Ok(())
    }

    fn runs(&self, feed_id: Option<&str>) -> Vec<IngestionRun> {
        self.runs
            .iter()
            .filter(|r| feed_id.map_or(true, |id| r.source_id == id))
            .cloned()
            .collect()
    }

    fn export_snapshot(&self) -> Result<Option<Vec<u8>>, CatalogError> {
        serde_json::to_vec_pretty(self)
            .map(Some)
            .map_err(|e| CatalogError::Snapshot(e.to_string()))
    }
}
