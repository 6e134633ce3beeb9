//! Folds per-unit rows into building-level candidates.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use refe_core::{
    as_number, as_opt_text, as_text_list, fields, resolve_field, ColumnMapping, ComplexFields, RawRow,
};
use serde::Serialize;
use tracing::debug;

/// A building as seen in the current pass, before reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplexCandidate {
    pub external_id: String,
    pub fields: ComplexFields,
}

/// Where a building title came from; higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TitleSource {
    Key,
    OwnRowTitle,
    BuildingTitle,
}

#[derive(Debug, Default)]
struct Fold {
    title: Option<(TitleSource, String)>,
    fields: ComplexFields,
}

fn min_of(current: Option<f64>, next: Option<f64>) -> Option<f64> {
    match (current, next) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn fill(slot: &mut Option<String>, value: Option<String>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn union(into: &mut Vec<String>, values: Vec<String>) {
    for value in values {
        if !into.contains(&value) {
            into.push(value);
        }
    }
}

impl Fold {
    fn absorb(&mut self, row: &RawRow, mapping: &ColumnMapping, key: &str, is_child: bool) {
        let get = |field: &'static str| resolve_field(row, field, mapping);
        let f = &mut self.fields;

        f.price_from = min_of(f.price_from, as_number(get(fields::PRICE)));
        f.area_from = min_of(f.area_from, as_number(get(fields::AREA_TOTAL)));

        let title = match as_opt_text(get(fields::COMPLEX_TITLE)) {
            Some(t) => (TitleSource::BuildingTitle, t),
            None => match as_opt_text(get(fields::TITLE)).filter(|_| !is_child) {
                Some(t) => (TitleSource::OwnRowTitle, t),
                None => (TitleSource::Key, key.to_string()),
            },
        };
        if self.title.as_ref().map_or(true, |(source, _)| title.0 > *source) {
            self.title = Some(title);
        }

        union(&mut f.images, as_text_list(get(fields::IMAGES)));
        union(&mut f.metro, as_text_list(get(fields::METRO)));

        fill(&mut f.developer, as_opt_text(get(fields::DEVELOPER)));
        fill(&mut f.district, as_opt_text(get(fields::DISTRICT)));
        fill(&mut f.address, as_opt_text(get(fields::ADDRESS)));
        fill(&mut f.handover_date, as_opt_text(get(fields::HANDOVER_DATE)));
        fill(&mut f.building_class, as_opt_text(get(fields::BUILDING_CLASS)));
        fill(&mut f.finish_type, as_opt_text(get(fields::FINISH_TYPE)));
        if !is_child {
            fill(&mut f.description, as_opt_text(get(fields::DESCRIPTION)));
        }
    }

    fn finish(self, external_id: String) -> ComplexCandidate {
        let mut fields = self.fields;
        fields.title = self.title.map(|(_, t)| t).unwrap_or_else(|| external_id.clone());
        ComplexCandidate { external_id, fields }
    }
}

/// Groups rows by building key and folds each group.
///
/// The key is the row's building reference, or its own external id when the
/// row describes a building itself. Numeric aggregates are minimums, so the
/// result does not depend on row order. Rows with neither id cannot be
/// grouped and are skipped without a diagnostic.
pub fn aggregate_complexes(
    rows: &[RawRow],
    source_id: &str,
    mapping: &ColumnMapping,
) -> Vec<ComplexCandidate> {
    let mut order = Vec::new();
    let mut folds: HashMap<String, Fold> = HashMap::new();
    let mut ungrouped = 0usize;

    for row in rows {
        let building_ref = as_opt_text(resolve_field(row, fields::COMPLEX_EXTERNAL_ID, mapping));
        let is_child = building_ref.is_some();
        let Some(key) = building_ref.or_else(|| as_opt_text(resolve_field(row, fields::EXTERNAL_ID, mapping))) else {
            ungrouped += 1;
            continue;
        };

        let fold = match folds.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                order.push(key.clone());
                entry.insert(Fold::default())
            }
        };
        fold.absorb(row, mapping, &key, is_child);
    }

    if ungrouped > 0 {
        debug!(source_id, ungrouped, "rows without a building key left out of aggregation");
    }

    order
        .into_iter()
        .filter_map(|key| folds.remove(&key).map(|fold| fold.finish(key)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use refe_core::RowValue;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn units() -> Vec<RawRow> {
        vec![
            row(&[("external_id", "u1"), ("complex_id", "c1"), ("price", "9 000 000"), ("area", "40"), ("metro", "Arbat")]),
            row(&[("external_id", "u2"), ("complex_id", "c1"), ("price", "7 500 000"), ("area", "55,5"), ("metro", "Arbat; Kievskaya")]),
            row(&[("external_id", "u3"), ("complex_id", "c1"), ("price", ""), ("area", "31"), ("developer", "Acme Dev")]),
            row(&[("external_id", "u4"), ("complex_id", "c2"), ("price", "12 000 000"), ("area", "70"), ("complex_name", "Harbour")]),
        ]
    }

    #[test]
    fn numeric_aggregates_are_minimums_ignoring_absent_values() {
        let out = aggregate_complexes(&units(), "acme", &ColumnMapping::new());
        assert_eq!(out.len(), 2);
        let c1 = &out[0];
        assert_eq!(c1.external_id, "c1");
        assert_eq!(c1.fields.price_from, Some(7_500_000.0));
        assert_eq!(c1.fields.area_from, Some(31.0));
        assert_eq!(c1.fields.metro, vec!["Arbat", "Kievskaya"]);
        assert_eq!(c1.fields.developer.as_deref(), Some("Acme Dev"));
    }

    #[test]
    fn aggregation_is_order_independent() {
        let rows = units();
        let forward = aggregate_complexes(&rows, "acme", &ColumnMapping::new());
        let mut reversed_rows = rows.clone();
        reversed_rows.reverse();
        let reversed = aggregate_complexes(&reversed_rows, "acme", &ColumnMapping::new());
        let mut rotated_rows = rows;
        rotated_rows.rotate_left(2);
        let rotated = aggregate_complexes(&rotated_rows, "acme", &ColumnMapping::new());

        for other in [&reversed, &rotated] {
            for candidate in &forward {
                let twin = other.iter().find(|c| c.external_id == candidate.external_id).unwrap();
                assert_eq!(twin.fields.price_from, candidate.fields.price_from);
                assert_eq!(twin.fields.area_from, candidate.fields.area_from);
            }
        }
    }

    #[test]
    fn title_precedence() {
        let out = aggregate_complexes(&units(), "acme", &ColumnMapping::new());
        // child rows never lend their own title
        assert_eq!(out[0].fields.title, "c1");
        assert_eq!(out[1].fields.title, "Harbour");

        let rows = vec![
            row(&[("external_id", "b1"), ("title", "Own building row")]),
            row(&[("external_id", "u9"), ("complex_id", "b1"), ("title", "Unit title")]),
        ];
        let out = aggregate_complexes(&rows, "acme", &ColumnMapping::new());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fields.title, "Own building row");

        let rows = vec![
            row(&[("external_id", "b1"), ("title", "Own building row")]),
            row(&[("external_id", "u9"), ("complex_id", "b1"), ("complex_name", "Explicit")]),
        ];
        let out = aggregate_complexes(&rows, "acme", &ColumnMapping::new());
        assert_eq!(out[0].fields.title, "Explicit");
    }

    #[test]
    fn first_non_empty_scalar_wins() {
        let rows = vec![
            row(&[("external_id", "u1"), ("complex_id", "c"), ("developer", "")]),
            row(&[("external_id", "u2"), ("complex_id", "c"), ("developer", "First")]),
            row(&[("external_id", "u3"), ("complex_id", "c"), ("developer", "Second")]),
        ];
        let out = aggregate_complexes(&rows, "acme", &ColumnMapping::new());
        assert_eq!(out[0].fields.developer.as_deref(), Some("First"));
    }

    #[test]
    fn keyless_rows_are_dropped_silently() {
        let rows = vec![row(&[("price", "100")]), row(&[("external_id", "solo"), ("price", "5")])];
        let out = aggregate_complexes(&rows, "acme", &ColumnMapping::new());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].external_id, "solo");
        assert_eq!(out[0].fields.price_from, Some(5.0));
    }

    #[test]
    fn images_union_keeps_first_occurrence_order() {
        let mut a = RawRow::new();
        a.insert("external_id", "u1");
        a.insert("complex_id", "c");
        a.insert("images", RowValue::List(vec!["p1.jpg".into(), "plan.png".into()]));
        let mut b = RawRow::new();
        b.insert("external_id", "u2");
        b.insert("complex_id", "c");
        b.insert("images", "p1.jpg|p2.jpg");
        let out = aggregate_complexes(&[a, b], "acme", &ColumnMapping::new());
        assert_eq!(out[0].fields.images, vec!["p1.jpg", "plan.png", "p2.jpg"]);
    }
}
