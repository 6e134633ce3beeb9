use std::path::Path;

use refe_adapters::{parse_feed, FormatAdapter, SpreadsheetAdapter};
use refe_core::{as_number, as_text, as_text_list, FeedFormat, RowValue};

fn fixture(name: &str) -> Vec<u8> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
    std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[test]
fn first_sheet_rows_are_keyed_by_header() {
    let rows = SpreadsheetAdapter.parse(&fixture("units.xlsx")).expect("xlsx parses");
    assert_eq!(rows.len(), 2);

    let first = &rows[0];
    assert_eq!(as_text(first.get("external_id")), "u1");
    assert_eq!(as_number(first.get("price")), Some(5_000_000.0));
    assert_eq!(as_number(first.get("area_total")), Some(54.5));
    assert_eq!(as_text_list(first.get("metro")), vec!["Arbat", "Kievskaya"]);

    let second = &rows[1];
    assert_eq!(as_number(second.get("price")), Some(7_100_000.0));
    assert_eq!(as_text(second.get("complex_id")), "c1");
}

#[test]
fn empty_cells_default_to_empty_text() {
    let rows = SpreadsheetAdapter.parse(&fixture("units.xlsx")).expect("xlsx parses");
    assert_eq!(rows[0].get("complex_id"), Some(&RowValue::text("")));
    assert_eq!(rows[1].get("metro"), Some(&RowValue::text("")));
}

#[test]
fn spreadsheet_is_detected_from_zip_magic() {
    let (format, rows) = parse_feed(FeedFormat::Auto, None, &fixture("units.xlsx")).expect("parses");
    assert_eq!(format, FeedFormat::Xlsx);
    assert_eq!(rows.len(), 2);
}
