//! Logical field names and the column resolver shared by the aggregator and
//! the reconciler.

use std::collections::BTreeMap;

use crate::value::{RawRow, RowValue};

/// Per-feed override: logical field name → source column name.
pub type ColumnMapping = BTreeMap<String, String>;

pub mod fields {
    pub const EXTERNAL_ID: &str = "external_id";
    pub const TITLE: &str = "title";
    pub const DESCRIPTION: &str = "description";
    pub const DEAL_TYPE: &str = "deal_type";
    pub const CATEGORY: &str = "category";
    pub const PRICE: &str = "price";
    pub const OLD_PRICE: &str = "old_price";
    pub const AREA_TOTAL: &str = "area_total";
    pub const AREA_LIVING: &str = "area_living";
    pub const AREA_KITCHEN: &str = "area_kitchen";
    pub const BEDROOMS: &str = "bedrooms";
    pub const FLOOR: &str = "floor";
    pub const FLOORS_TOTAL: &str = "floors_total";
    pub const ADDRESS: &str = "address";
    pub const DISTRICT: &str = "district";
    pub const METRO: &str = "metro";
    pub const IMAGES: &str = "images";
    pub const COMPLEX_EXTERNAL_ID: &str = "complex_external_id";
    pub const COMPLEX_TITLE: &str = "complex_title";
    pub const DEVELOPER: &str = "developer";
    pub const HANDOVER_DATE: &str = "handover_date";
    pub const BUILDING_CLASS: &str = "building_class";
    pub const FINISH_TYPE: &str = "finish_type";
}

/// Well-known column spellings tried after the logical name itself.
pub fn default_aliases(field: &str) -> &'static [&'static str] {
    match field {
        fields::EXTERNAL_ID => &["id", "external-id", "internal_id", "internal-id", "offer_id", "lot_id"],
        fields::TITLE => &["name", "heading", "header"],
        fields::DESCRIPTION => &["desc", "text", "comment"],
        fields::DEAL_TYPE => &["type", "deal", "operation"],
        fields::CATEGORY => &["segment", "market", "property_category"],
        fields::PRICE => &["cost", "price_total", "price_rub", "amount"],
        fields::OLD_PRICE => &["oldprice", "price_old", "previous_price"],
        fields::AREA_TOTAL => &["area", "total_area", "square", "space", "area_m2"],
        fields::AREA_LIVING => &["living_area", "living-space", "living_space"],
        fields::AREA_KITCHEN => &["kitchen_area", "kitchen-space", "kitchen_space"],
        fields::BEDROOMS => &["rooms", "room_count", "rooms_count", "bedroom_count"],
        fields::FLOOR => &["storey", "level"],
        fields::FLOORS_TOTAL => &["floors", "floors-total", "total_floors"],
        fields::ADDRESS => &["location", "full_address"],
        fields::DISTRICT => &["area_name", "sub_locality", "neighbourhood", "neighborhood"],
        fields::METRO => &["metro_stations", "subway", "station", "stations"],
        fields::IMAGES => &["photos", "image", "photo", "pictures", "gallery"],
        fields::COMPLEX_EXTERNAL_ID => &["complex_id", "building_id", "building-id", "jk_id", "project_id"],
        fields::COMPLEX_TITLE => &["complex_name", "building_name", "building-name", "jk_name", "project_name"],
        fields::DEVELOPER => &["builder", "developer_name"],
        fields::HANDOVER_DATE => &["handover", "deadline", "completion_date", "ready_date"],
        fields::BUILDING_CLASS => &["class", "housing_class", "complex_class"],
        fields::FINISH_TYPE => &["finish", "finishing", "renovation", "decoration"],
        _ => &[],
    }
}

/// Resolves a logical field against a row.
///
/// An explicit mapping entry wins unconditionally, even when that column is
/// missing from the row. Otherwise the logical name and then each alias are
/// tried in order, skipping columns that are present but blank.
pub fn resolve<'a>(
    row: &'a RawRow,
    field: &str,
    mapping: &ColumnMapping,
    aliases: &[&str],
) -> Option<&'a RowValue> {
    if let Some(column) = mapping.get(field).map(|c| c.trim()).filter(|c| !c.is_empty()) {
        return row.lookup(column);
    }
    std::iter::once(field)
        .chain(aliases.iter().copied())
        .filter_map(|column| row.lookup(column))
        .find(|value| !value.is_blank())
}

/// [`resolve`] with the built-in alias table.
pub fn resolve_field<'a>(
    row: &'a RawRow,
    field: &str,
    mapping: &ColumnMapping,
) -> Option<&'a RowValue> {
    resolve(row, field, mapping, default_aliases(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn explicit_mapping_is_used_unconditionally() {
        let r = row(&[("price", "100"), ("Стоимость", "200")]);
        let mut mapping = ColumnMapping::new();
        mapping.insert("price".into(), "Стоимость".into());
        assert_eq!(resolve_field(&r, "price", &mapping), Some(&RowValue::text("200")));

        mapping.insert("price".into(), "missing".into());
        assert_eq!(resolve_field(&r, "price", &mapping), None);
    }

    #[test]
    fn logical_name_beats_aliases_and_aliases_keep_order() {
        let mapping = ColumnMapping::new();
        let r = row(&[("cost", "1"), ("price", "2")]);
        assert_eq!(resolve_field(&r, "price", &mapping), Some(&RowValue::text("2")));

        let r = row(&[("amount", "1"), ("cost", "2")]);
        assert_eq!(resolve_field(&r, "price", &mapping), Some(&RowValue::text("2")));
    }

    #[test]
    fn blank_columns_fall_through_to_the_next_alias() {
        let mapping = ColumnMapping::new();
        let r = row(&[("area_total", ""), ("area", "54,5")]);
        assert_eq!(resolve_field(&r, "area_total", &mapping), Some(&RowValue::text("54,5")));
        assert_eq!(resolve_field(&r, "floor", &mapping), None);
    }
}
