//! Upsert reconciliation of candidate records against the catalog.
//!
//! Everything in here is synchronous and runs while the caller holds the
//! catalog lock, so a pass is never interleaved with another pass over the
//! same catalog.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use refe_core::{
    as_number, as_opt_text, as_text, as_text_list, fields, resolve_field, synthesize_title, Category,
    ColumnMapping, Complex, DealType, EntityKind, Listing, Liveness, Property,
    PropertyFields, RawRow, RowError, RunStats, RunStatus,
};
use refe_storage::{Catalog, ListingStore};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::aggregate::{aggregate_complexes, ComplexCandidate};

/// Counters and diagnostics from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub hidden: usize,
    pub errors: Vec<RowError>,
    /// Candidates considered, including the ones that failed validation.
    #[serde(skip)]
    pub rows: usize,
}

impl UpsertOutcome {
    pub fn stats(&self) -> RunStats {
        RunStats {
            inserted: self.inserted,
            updated: self.updated,
            hidden: self.hidden,
        }
    }

    pub fn status(&self) -> RunStatus {
        RunStatus::classify(self.errors.len(), self.rows)
    }
}

/// A validated candidate ready to be merged or inserted.
#[derive(Debug, Clone)]
pub struct Candidate<F> {
    pub row_index: usize,
    pub external_id: String,
    pub fields: F,
}

/// Result of ingesting one batch: the requested entity's outcome plus the
/// building pass that ran first, when there was one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub outcome: UpsertOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_complexes: Option<UpsertOutcome>,
}

fn row_error(row_index: usize, external_id: Option<&str>, error: impl Into<String>) -> RowError {
    RowError {
        row_index,
        external_id: external_id.map(str::to_string),
        error: error.into(),
    }
}

/// Reconciles one source's records of kind `T` against `candidates`.
///
/// Existing records are merged in place, unknown keys are inserted, and once
/// every candidate has been handled each active record that was not seen in
/// this pass is hidden. The sweep runs exactly once per pass whatever the
/// number of row errors.
pub fn reconcile_listings<T, S>(
    store: &mut S,
    source_id: &str,
    candidates: Vec<Result<Candidate<T::Fields>, RowError>>,
    now: DateTime<Utc>,
) -> UpsertOutcome
where
    T: Listing,
    S: ListingStore<T> + ?Sized,
{
    let existing = store.list_for_source(source_id);
    let mut index: HashMap<String, Uuid> = existing
        .iter()
        .map(|record| (record.external_id().to_string(), record.id()))
        .collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut outcome = UpsertOutcome {
        rows: candidates.len(),
        ..UpsertOutcome::default()
    };

    for candidate in candidates {
        let candidate = match candidate {
            Ok(candidate) => candidate,
            Err(err) => {
                outcome.errors.push(err);
                continue;
            }
        };
        let Candidate {
            row_index,
            external_id,
            fields,
        } = candidate;
        seen.insert(external_id.clone());

        match index.get(&external_id) {
            Some(&id) => match store.merge(id, fields, now) {
                Ok(()) => outcome.updated += 1,
                Err(err) => outcome
                    .errors
                    .push(row_error(row_index, Some(&external_id), err.to_string())),
            },
            None => {
                let record = T::new_record(source_id, &external_id, fields, now);
                let id = record.id();
                match store.insert(record) {
                    Ok(()) => {
                        index.insert(external_id, id);
                        outcome.inserted += 1;
                    }
                    Err(err) => outcome
                        .errors
                        .push(row_error(row_index, Some(&external_id), err.to_string())),
                }
            }
        }
    }

    for record in &existing {
        if record.status() != Liveness::Active || seen.contains(record.external_id()) {
            continue;
        }
        match store.set_status(record.id(), Liveness::Hidden, now) {
            Ok(()) => outcome.hidden += 1,
            Err(err) => warn!(source_id, external_id = record.external_id(), error = %err, "failed to hide stale record"),
        }
    }

    outcome
}

/// Building candidates never fail validation.
pub fn reconcile_complexes<S>(
    store: &mut S,
    source_id: &str,
    candidates: Vec<ComplexCandidate>,
    now: DateTime<Utc>,
) -> UpsertOutcome
where
    S: ListingStore<Complex> + ?Sized,
{
    let candidates = candidates
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            Ok(Candidate {
                row_index: i + 1,
                external_id: c.external_id,
                fields: c.fields,
            })
        })
        .collect();
    reconcile_listings::<Complex, S>(store, source_id, candidates, now)
}

/// Validates and reconciles unit rows. `complex_ids` maps building external
/// ids to catalog ids so units can be linked to their parent.
pub fn reconcile_properties<S>(
    store: &mut S,
    source_id: &str,
    rows: &[RawRow],
    mapping: &ColumnMapping,
    complex_ids: &HashMap<String, Uuid>,
    now: DateTime<Utc>,
) -> UpsertOutcome
where
    S: ListingStore<Property> + ?Sized,
{
    let candidates = rows
        .iter()
        .enumerate()
        .map(|(i, row)| property_candidate(row, i + 1, mapping, complex_ids))
        .collect();
    reconcile_listings::<Property, S>(store, source_id, candidates, now)
}

fn whole(value: Option<f64>) -> Option<i32> {
    value.filter(|v| v.is_finite()).map(|v| v.round() as i32)
}

/// Resolves and validates one unit row.
pub fn property_candidate(
    row: &RawRow,
    row_index: usize,
    mapping: &ColumnMapping,
    complex_ids: &HashMap<String, Uuid>,
) -> Result<Candidate<PropertyFields>, RowError> {
    let get = |field: &'static str| resolve_field(row, field, mapping);

    let Some(external_id) = as_opt_text(get(fields::EXTERNAL_ID)) else {
        return Err(row_error(row_index, None, "missing external id"));
    };

    let bedrooms = as_number(get(fields::BEDROOMS)).filter(|b| *b >= 0.0);
    let price = as_number(get(fields::PRICE));
    let area_total = as_number(get(fields::AREA_TOTAL));
    let (Some(bedrooms), Some(price), Some(area_total)) = (bedrooms, price, area_total) else {
        let invalid: Vec<&str> = [
            (fields::BEDROOMS, bedrooms.is_none()),
            (fields::PRICE, price.is_none()),
            (fields::AREA_TOTAL, area_total.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, bad)| bad.then_some(name))
        .collect();
        return Err(row_error(
            row_index,
            Some(&external_id),
            format!("missing or non-numeric {}", invalid.join(", ")),
        ));
    };

    let complex_external_id = as_opt_text(get(fields::COMPLEX_EXTERNAL_ID));
    let complex_id = complex_external_id
        .as_ref()
        .and_then(|key| complex_ids.get(key).copied());
    if complex_external_id.is_some() && complex_id.is_none() {
        debug!(external_id, complex = ?complex_external_id, "unit references an unknown building");
    }

    let deal_type = DealType::parse(&as_text(get(fields::DEAL_TYPE)));
    let category = Category::infer(deal_type, &as_text(get(fields::CATEGORY)));
    let complex_title = as_opt_text(get(fields::COMPLEX_TITLE));
    let title = as_opt_text(get(fields::TITLE))
        .unwrap_or_else(|| synthesize_title(Some(bedrooms), complex_title.as_deref()));

    Ok(Candidate {
        row_index,
        external_id,
        fields: PropertyFields {
            title,
            description: as_opt_text(get(fields::DESCRIPTION)),
            deal_type,
            category,
            price,
            old_price: as_number(get(fields::OLD_PRICE)),
            area_total,
            area_living: as_number(get(fields::AREA_LIVING)),
            area_kitchen: as_number(get(fields::AREA_KITCHEN)),
            bedrooms: bedrooms.round() as u32,
            floor: whole(as_number(get(fields::FLOOR))),
            floors_total: whole(as_number(get(fields::FLOORS_TOTAL))),
            address: as_opt_text(get(fields::ADDRESS)),
            district: as_opt_text(get(fields::DISTRICT)),
            metro: as_text_list(get(fields::METRO)),
            images: as_text_list(get(fields::IMAGES)),
            complex_external_id,
            complex_id,
        },
    })
}

/// Runs both reconciliation phases for one batch of rows.
///
/// In unit mode the rows that carry a building reference are first folded
/// into buildings and reconciled, then units are linked to the resulting
/// building ids. The building pass runs even when no row references a
/// building, so buildings the feed no longer mentions are hidden. In
/// building mode every row contributes to the aggregation and no unit pass
/// runs.
pub fn reconcile_batch<C: Catalog + ?Sized>(
    catalog: &mut C,
    source_id: &str,
    entity: EntityKind,
    rows: &[RawRow],
    mapping: &ColumnMapping,
    now: DateTime<Utc>,
) -> BatchOutcome {
    match entity {
        EntityKind::Complexes => {
            let candidates = aggregate_complexes(rows, source_id, mapping);
            BatchOutcome {
                outcome: reconcile_complexes::<C>(catalog, source_id, candidates, now),
                linked_complexes: None,
            }
        }
        EntityKind::Properties => {
            let child_rows: Vec<RawRow> = rows
                .iter()
                .filter(|row| as_opt_text(resolve_field(row, fields::COMPLEX_EXTERNAL_ID, mapping)).is_some())
                .cloned()
                .collect();

            let candidates = aggregate_complexes(&child_rows, source_id, mapping);
            let linked_complexes = Some(reconcile_complexes::<C>(catalog, source_id, candidates, now));

            let complex_ids: HashMap<String, Uuid> = catalog
                .complexes_for_source(source_id)
                .into_iter()
                .map(|c| (c.external_id, c.id))
                .collect();
            let outcome = reconcile_properties::<C>(catalog, source_id, rows, mapping, &complex_ids, now);

            BatchOutcome {
                outcome,
                linked_complexes,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refe_storage::MemoryCatalog;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn unit(id: &str, price: &str) -> RawRow {
        row(&[("external_id", id), ("price", price), ("bedrooms", "2"), ("area_total", "60")])
    }

    fn ingest(catalog: &mut MemoryCatalog, rows: &[RawRow]) -> UpsertOutcome {
        reconcile_batch(catalog, "acme", EntityKind::Properties, rows, &ColumnMapping::new(), Utc::now()).outcome
    }

    #[test]
    fn second_identical_pass_only_updates() {
        let mut catalog = MemoryCatalog::new();
        let rows = vec![unit("a", "100"), unit("b", "200"), unit("c", "300")];

        let first = ingest(&mut catalog, &rows);
        assert_eq!((first.inserted, first.updated, first.hidden), (3, 0, 0));

        let ids_before: Vec<Uuid> = catalog.properties_for_source("acme").iter().map(|p| p.id).collect();
        let second = ingest(&mut catalog, &rows);
        assert_eq!((second.inserted, second.updated, second.hidden), (0, 3, 0));

        let after = catalog.properties_for_source("acme");
        assert_eq!(after.len(), 3);
        assert!(after.iter().all(|p| ids_before.contains(&p.id)));
    }

    #[test]
    fn absent_records_are_hidden_without_touching_their_fields() {
        let mut catalog = MemoryCatalog::new();
        ingest(&mut catalog, &[unit("a", "100"), unit("b", "200")]);
        let before = catalog
            .properties_for_source("acme")
            .into_iter()
            .find(|p| p.external_id == "b")
            .unwrap();

        let outcome = ingest(&mut catalog, &[unit("a", "150")]);
        assert_eq!((outcome.updated, outcome.hidden), (1, 1));

        let after = catalog
            .properties_for_source("acme")
            .into_iter()
            .find(|p| p.external_id == "b")
            .unwrap();
        assert_eq!(after.status, Liveness::Hidden);
        assert_eq!(after.fields, before.fields);
        assert_eq!(after.last_seen_at, before.last_seen_at);
    }

    #[test]
    fn hidden_records_come_back_when_they_reappear() {
        let mut catalog = MemoryCatalog::new();
        ingest(&mut catalog, &[unit("a", "100"), unit("b", "200")]);
        ingest(&mut catalog, &[unit("a", "100")]);
        let outcome = ingest(&mut catalog, &[unit("a", "100"), unit("b", "210")]);
        assert_eq!((outcome.inserted, outcome.updated, outcome.hidden), (0, 2, 0));
        assert!(catalog
            .properties_for_source("acme")
            .iter()
            .all(|p| p.status == Liveness::Active));
    }

    #[test]
    fn archived_records_are_left_alone_by_the_sweep() {
        let mut catalog = MemoryCatalog::new();
        ingest(&mut catalog, &[unit("a", "100")]);
        let id = catalog.properties_for_source("acme")[0].id;
        ListingStore::<Property>::set_status(&mut catalog, id, Liveness::Archived, Utc::now()).unwrap();

        let outcome = ingest(&mut catalog, &[unit("z", "1")]);
        assert_eq!(outcome.hidden, 0);
        let archived = catalog.properties_for_source("acme").into_iter().find(|p| p.id == id).unwrap();
        assert_eq!(archived.status, Liveness::Archived);
    }

    #[test]
    fn bad_rows_are_skipped_and_the_batch_continues() {
        let mut catalog = MemoryCatalog::new();
        let rows = vec![
            unit("a", "100"),
            row(&[("external_id", "b"), ("bedrooms", "1"), ("area_total", "40")]),
            unit("c", "300"),
        ];
        let outcome = ingest(&mut catalog, &rows);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].row_index, 2);
        assert_eq!(outcome.errors[0].external_id.as_deref(), Some("b"));
        assert!(outcome.errors[0].error.contains("price"));
        assert_eq!(outcome.status(), RunStatus::Partial);
    }

    #[test]
    fn invalid_rows_do_not_keep_existing_records_alive() {
        let mut catalog = MemoryCatalog::new();
        ingest(&mut catalog, &[unit("a", "100"), unit("b", "200")]);

        let outcome = ingest(&mut catalog, &[unit("a", "100"), unit("b", "not a price")]);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.hidden, 1);
    }

    #[test]
    fn sweep_runs_when_every_row_fails() {
        let mut catalog = MemoryCatalog::new();
        ingest(&mut catalog, &[unit("a", "100")]);
        let outcome = ingest(&mut catalog, &[row(&[("price", "1")])]);
        assert_eq!(outcome.errors[0].external_id, None);
        assert_eq!(outcome.hidden, 1);
        assert_eq!(outcome.status(), RunStatus::Failed);
    }

    #[test]
    fn units_are_linked_to_buildings_from_the_same_batch() {
        let mut catalog = MemoryCatalog::new();
        let mut a = unit("a", "9 000 000");
        a.insert("complex_id", "river");
        a.insert("complex_name", "River Park");
        let mut b = unit("b", "8 000 000");
        b.insert("complex_id", "river");
        let c = unit("c", "5 000 000");

        let batch = reconcile_batch(
            &mut catalog,
            "acme",
            EntityKind::Properties,
            &[a, b, c],
            &ColumnMapping::new(),
            Utc::now(),
        );
        let complexes = batch.linked_complexes.expect("building phase ran");
        assert_eq!(complexes.inserted, 1);
        assert_eq!(batch.outcome.inserted, 3);

        let building = &catalog.complexes_for_source("acme")[0];
        assert_eq!(building.fields.title, "River Park");
        assert_eq!(building.fields.price_from, Some(8_000_000.0));

        let units = catalog.properties_for_source("acme");
        let linked: Vec<_> = units.iter().filter(|u| u.fields.complex_id == Some(building.id)).collect();
        assert_eq!(linked.len(), 2);
        let lone = units.iter().find(|u| u.external_id == "c").unwrap();
        assert_eq!(lone.fields.complex_id, None);
        assert_eq!(lone.fields.title, "2-room");
    }

    #[test]
    fn unit_feed_without_building_references_creates_no_buildings() {
        let mut catalog = MemoryCatalog::new();
        let batch = reconcile_batch(
            &mut catalog,
            "acme",
            EntityKind::Properties,
            &[unit("a", "1")],
            &ColumnMapping::new(),
            Utc::now(),
        );
        let complexes = batch.linked_complexes.expect("building phase ran");
        assert_eq!(complexes.stats(), RunStats::default());
        assert!(catalog.complexes_for_source("acme").is_empty());
    }

    #[test]
    fn buildings_are_hidden_once_no_unit_references_them() {
        let mut catalog = MemoryCatalog::new();
        let mut a = unit("a", "100");
        a.insert("complex_id", "c1");
        ingest(&mut catalog, &[a]);

        let batch = reconcile_batch(&mut catalog, "acme", EntityKind::Properties, &[], &ColumnMapping::new(), Utc::now());
        assert_eq!(batch.outcome.hidden, 1);
        assert_eq!(batch.linked_complexes.map(|c| c.hidden), Some(1));
        assert_eq!(catalog.properties_for_source("acme")[0].status, Liveness::Hidden);
        assert_eq!(catalog.complexes_for_source("acme")[0].status, Liveness::Hidden);

        ingest(&mut catalog, &[unit("b", "200")]);
        assert_eq!(catalog.complexes_for_source("acme")[0].status, Liveness::Hidden);
    }

    #[test]
    fn building_mode_aggregates_every_row() {
        let mut catalog = MemoryCatalog::new();
        let rows = vec![
            row(&[("external_id", "b1"), ("title", "Harbour"), ("price", "100")]),
            row(&[("external_id", "b2"), ("title", "Hill")]),
        ];
        let batch = reconcile_batch(&mut catalog, "acme", EntityKind::Complexes, &rows, &ColumnMapping::new(), Utc::now());
        assert_eq!(batch.outcome.inserted, 2);
        assert!(catalog.properties_for_source("acme").is_empty());

        let again = reconcile_batch(&mut catalog, "acme", EntityKind::Complexes, &rows[..1], &ColumnMapping::new(), Utc::now());
        assert_eq!((again.outcome.updated, again.outcome.hidden), (1, 1));
    }

    #[test]
    fn explicit_mapping_selects_source_columns() {
        let mut catalog = MemoryCatalog::new();
        let mapping: ColumnMapping = [
            ("external_id".to_string(), "Lot".to_string()),
            ("price".to_string(), "Cost RUB".to_string()),
        ]
        .into_iter()
        .collect();
        let rows = vec![row(&[("Lot", "L-7"), ("Cost RUB", "4 500 000"), ("rooms", "0"), ("area", "25,4")])];
        let outcome = reconcile_batch(&mut catalog, "acme", EntityKind::Properties, &rows, &mapping, Utc::now()).outcome;
        assert_eq!(outcome.inserted, 1);

        let unit = &catalog.properties_for_source("acme")[0];
        assert_eq!(unit.external_id, "L-7");
        assert_eq!(unit.fields.price, 4_500_000.0);
        assert_eq!(unit.fields.area_total, 25.4);
        assert_eq!(unit.fields.title, "Studio");
    }

    #[test]
    fn sources_are_reconciled_independently() {
        let mut catalog = MemoryCatalog::new();
        ingest(&mut catalog, &[unit("a", "1")]);
        let other = reconcile_batch(&mut catalog, "other", EntityKind::Properties, &[unit("x", "1")], &ColumnMapping::new(), Utc::now());
        assert_eq!(other.outcome.hidden, 0);
        assert_eq!(catalog.properties_for_source("acme")[0].status, Liveness::Active);
    }
}
