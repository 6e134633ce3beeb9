//! Core domain model for REFE: feeds, catalog records, ingestion runs and the
//! loosely-typed rows that flow between the format adapters and the engine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod resolve;
pub mod value;

pub use resolve::{default_aliases, fields, resolve, resolve_field, ColumnMapping};
pub use value::{as_number, as_opt_text, as_text, as_text_list, RawRow, RowValue};

pub const CRATE_NAME: &str = "refe-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    #[default]
    Manual,
    Url,
}

/// Declared payload format. `Auto` defers to the filename/URL hint and the
/// payload itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    #[default]
    Auto,
    Csv,
    Xlsx,
    Xml,
    Json,
}

impl FeedFormat {
    pub fn extension(self) -> &'static str {
        match self {
            FeedFormat::Auto => "bin",
            FeedFormat::Csv => "csv",
            FeedFormat::Xlsx => "xlsx",
            FeedFormat::Xml => "xml",
            FeedFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    #[default]
    Properties,
    Complexes,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Properties => "properties",
            EntityKind::Complexes => "complexes",
        }
    }
}

/// A configured external listing provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mode: FeedMode,
    #[serde(default)]
    pub format: FeedFormat,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub entity: EntityKind,
    #[serde(default)]
    pub mapping: ColumnMapping,
    /// Auto-refresh interval in minutes; `None` or zero disables it.
    #[serde(default)]
    pub auto_refresh_minutes: Option<u32>,
    #[serde(default)]
    pub last_auto_refresh: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl Feed {
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.auto_refresh_minutes
            .filter(|m| *m > 0)
            .map(|m| Duration::minutes(i64::from(m)))
    }

    /// Active URL-mode feeds with an interval are eligible for the scheduler.
    pub fn auto_refresh_enabled(&self) -> bool {
        self.active
            && self.mode == FeedMode::Url
            && self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
            && self.refresh_interval().is_some()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let Some(interval) = self.refresh_interval() else {
            return false;
        };
        if !self.auto_refresh_enabled() {
            return false;
        }
        match self.last_auto_refresh {
            Some(last) => now - last >= interval,
            None => true,
        }
    }
}

/// Lifecycle status shared by units and buildings. The liveness sweep only moves
/// `Active → Hidden`; reappearing in a feed moves `Hidden → Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    #[default]
    Active,
    Hidden,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DealType {
    #[default]
    Sale,
    Rent,
}

impl DealType {
    /// Accepts the English and Russian vendor spellings; anything else is a sale.
    pub fn parse(text: &str) -> Self {
        let lower = text.trim().to_lowercase();
        if lower == "rent" || lower.starts_with("аренд") || lower == "lease" {
            DealType::Rent
        } else {
            DealType::Sale
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Newbuild,
    Secondary,
    Rent,
}

impl Category {
    /// Rent deals are always `Rent`; otherwise an explicit hint decides and
    /// the default is `Secondary`.
    pub fn infer(deal_type: DealType, hint: &str) -> Self {
        if deal_type == DealType::Rent {
            return Category::Rent;
        }
        let lower = hint.trim().to_lowercase();
        if lower == "newbuild"
            || lower == "new"
            || lower.contains("primary")
            || lower.contains("новостро")
            || lower.contains("первичн")
        {
            Category::Newbuild
        } else if lower == "rent" {
            Category::Rent
        } else {
            Category::Secondary
        }
    }
}

/// "`<n>-room` in `<building>`", or just the room descriptor.
pub fn synthesize_title(bedrooms: Option<f64>, building_name: Option<&str>) -> String {
    let rooms = match bedrooms {
        Some(n) if n >= 1.0 => format!("{}-room", n.round()),
        Some(_) => "Studio".to_string(),
        None => "Apartment".to_string(),
    };
    match building_name.map(str::trim).filter(|b| !b.is_empty()) {
        Some(building) => format!("{rooms} in {building}"),
        None => rooms,
    }
}

/// Mutable attributes of a unit, as resolved from one feed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyFields {
    pub title: String,
    pub description: Option<String>,
    pub deal_type: DealType,
    pub category: Category,
    pub price: f64,
    pub old_price: Option<f64>,
    pub area_total: f64,
    pub area_living: Option<f64>,
    pub area_kitchen: Option<f64>,
    pub bedrooms: u32,
    pub floor: Option<i32>,
    pub floors_total: Option<i32>,
    pub address: Option<String>,
    pub district: Option<String>,
    pub metro: Vec<String>,
    pub images: Vec<String>,
    pub complex_external_id: Option<String>,
    pub complex_id: Option<Uuid>,
}

/// An individually sellable or rentable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: Uuid,
    pub source_id: String,
    pub external_id: String,
    pub status: Liveness,
    #[serde(flatten)]
    pub fields: PropertyFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Aggregate attributes of a building, recomputed from scratch every pass.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ComplexFields {
    pub title: String,
    pub price_from: Option<f64>,
    pub area_from: Option<f64>,
    pub developer: Option<String>,
    pub district: Option<String>,
    pub address: Option<String>,
    pub handover_date: Option<String>,
    pub building_class: Option<String>,
    pub finish_type: Option<String>,
    pub description: Option<String>,
    pub images: Vec<String>,
    pub metro: Vec<String>,
}

/// A building aggregated from one or more feed rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Complex {
    pub id: Uuid,
    pub source_id: String,
    pub external_id: String,
    pub status: Liveness,
    #[serde(flatten)]
    pub fields: ComplexFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Common surface the reconciler needs from either record kind.
pub trait Listing: Clone {
    type Fields;

    fn new_record(source_id: &str, external_id: &str, fields: Self::Fields, at: DateTime<Utc>) -> Self;
    fn id(&self) -> Uuid;
    fn source_id(&self) -> &str;
    fn external_id(&self) -> &str;
    fn status(&self) -> Liveness;
    fn set_status(&mut self, status: Liveness, at: DateTime<Utc>);

    /// Overwrites every candidate field in place and stamps the record as
    /// seen. A hidden record that reappears in its feed becomes active again;
    /// archived records stay archived.
    fn merge(&mut self, fields: Self::Fields, at: DateTime<Utc>);
}

macro_rules! impl_listing {
    ($ty:ty, $fields:ty) => {
        impl Listing for $ty {
            type Fields = $fields;

            fn new_record(source_id: &str, external_id: &str, fields: $fields, at: DateTime<Utc>) -> Self {
                Self {
                    id: Uuid::new_v4(),
                    source_id: source_id.to_string(),
                    external_id: external_id.to_string(),
                    status: Liveness::Active,
                    fields,
                    created_at: at,
                    updated_at: at,
                    last_seen_at: at,
                }
            }

            fn id(&self) -> Uuid {
                self.id
            }

            fn source_id(&self) -> &str {
                &self.source_id
            }

            fn external_id(&self) -> &str {
                &self.external_id
            }

            fn status(&self) -> Liveness {
                self.status
            }

            fn set_status(&mut self, status: Liveness, at: DateTime<Utc>) {
                self.status = status;
                self.updated_at = at;
            }

            fn merge(&mut self, fields: $fields, at: DateTime<Utc>) {
                self.fields = fields;
                if self.status == Liveness::Hidden {
                    self.status = Liveness::Active;
                }
                self.updated_at = at;
                self.last_seen_at = at;
            }
        }
    };
}

impl_listing!(Property, PropertyFields);
impl_listing!(Complex, ComplexFields);

/// Per-row diagnostic. `row_index` is the 1-based position in the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub row_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunStats {
    pub inserted: usize,
    pub updated: usize,
    pub hidden: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    /// No errors is a success, every row failing is a failure, anything in
    /// between is partial.
    pub fn classify(error_count: usize, total_rows: usize) -> Self {
        if error_count == 0 {
            RunStatus::Success
        } else if error_count >= total_rows {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

/// One finished execution of the pipeline against one feed and entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionRun {
    pub id: Uuid,
    pub source_id: String,
    pub entity: EntityKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub stats: RunStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log: Option<String>,
}
