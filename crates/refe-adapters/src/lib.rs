//! Format adapters: turn a raw feed payload into an ordered list of raw rows.
//!
//! Four formats are supported (delimited text, spreadsheet, structured JSON
//! and tagged markup). Every adapter failure is format-level and aborts the
//! ingestion run before a single row reaches the catalog.

use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use refe_core::{FeedFormat, RawRow, RowValue};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub mod markup;
pub mod normalize;

pub use normalize::normalize_offer;

pub const CRATE_NAME: &str = "refe-adapters";

/// Recursion bound for searches over nested feed documents.
pub const MAX_SEARCH_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("cannot detect feed format (hint: {hint:?})")]
    UnknownFormat { hint: Option<String> },
    #[error("malformed {format:?} payload: {message}")]
    Malformed { format: FeedFormat, message: String },
    #[error("no row collection found in {0:?} payload")]
    NoRows(FeedFormat),
}

impl AdapterError {
    fn malformed(format: FeedFormat, err: impl std::fmt::Display) -> Self {
        AdapterError::Malformed {
            format,
            message: err.to_string(),
        }
    }
}

pub trait FormatAdapter: Send + Sync {
    fn format(&self) -> FeedFormat;
    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawRow>, AdapterError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DelimitedTextAdapter;

#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadsheetAdapter;

#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredObjectAdapter;

#[derive(Debug, Clone, Copy, Default)]
pub struct TaggedMarkupAdapter;

pub fn adapter_for_format(format: FeedFormat) -> Option<Box<dyn FormatAdapter>> {
    match format {
        FeedFormat::Csv => Some(Box::new(DelimitedTextAdapter)),
        FeedFormat::Xlsx => Some(Box::new(SpreadsheetAdapter)),
        FeedFormat::Json => Some(Box::new(StructuredObjectAdapter)),
        FeedFormat::Xml => Some(Box::new(TaggedMarkupAdapter)),
        FeedFormat::Auto => None,
    }
}

/// Resolves the concrete format of a payload. A declared format wins;
/// `Auto` looks at the filename/URL extension and then sniffs the bytes.
pub fn detect_format(
    declared: FeedFormat,
    hint: Option<&str>,
    bytes: &[u8],
) -> Result<FeedFormat, AdapterError> {
    if declared != FeedFormat::Auto {
        return Ok(declared);
    }
    if let Some(format) = hint.and_then(format_from_hint) {
        return Ok(format);
    }
    sniff_format(bytes).ok_or_else(|| AdapterError::UnknownFormat {
        hint: hint.map(str::to_string),
    })
}

fn format_from_hint(hint: &str) -> Option<FeedFormat> {
    let path = hint.split(['?', '#']).next().unwrap_or(hint);
    let file = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = file.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "csv" | "tsv" | "txt" => Some(FeedFormat::Csv),
        "xlsx" | "xlsm" | "xls" | "ods" => Some(FeedFormat::Xlsx),
        "xml" => Some(FeedFormat::Xml),
        "json" => Some(FeedFormat::Json),
        _ => None,
    }
}

fn sniff_format(bytes: &[u8]) -> Option<FeedFormat> {
    if bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
        return Some(FeedFormat::Xlsx);
    }
    let first = strip_bom(bytes)
        .iter()
        .copied()
        .find(|b| !b.is_ascii_whitespace())?;
    Some(match first {
        b'<' => FeedFormat::Xml,
        b'{' | b'[' => FeedFormat::Json,
        _ => FeedFormat::Csv,
    })
}

/// Detects the format and parses the payload in one step.
pub fn parse_feed(
    declared: FeedFormat,
    hint: Option<&str>,
    bytes: &[u8],
) -> Result<(FeedFormat, Vec<RawRow>), AdapterError> {
    let format = detect_format(declared, hint, bytes)?;
    let adapter = adapter_for_format(format).ok_or(AdapterError::UnknownFormat {
        hint: hint.map(str::to_string),
    })?;
    let rows = adapter.parse(bytes)?;
    debug!(?format, rows = rows.len(), "feed payload parsed");
    Ok((format, rows))
}

fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes)
}

/// Picks the most frequent of `,` `;` tab `|` in the header line; comma on tie.
fn sniff_delimiter(header_line: &[u8]) -> u8 {
    let mut best = (b',', 0usize);
    for candidate in [b',', b';', b'\t', b'|'] {
        let count = header_line.iter().filter(|b| **b == candidate).count();
        if count > best.1 {
            best = (candidate, count);
        }
    }
    best.0
}

impl FormatAdapter for DelimitedTextAdapter {
    fn format(&self) -> FeedFormat {
        FeedFormat::Csv
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawRow>, AdapterError> {
        let text = strip_bom(bytes);
        let header_line = text.split(|b| *b == b'\n').next().unwrap_or_default();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(sniff_delimiter(header_line))
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text);

        let headers = reader
            .headers()
            .map_err(|e| AdapterError::malformed(FeedFormat::Csv, e))?
            .clone();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| AdapterError::malformed(FeedFormat::Csv, e))?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            let row: RawRow = headers
                .iter()
                .enumerate()
                .filter(|(_, header)| !header.is_empty())
                .map(|(idx, header)| (header, RowValue::text(record.get(idx).unwrap_or_default())))
                .collect();
            rows.push(row);
        }
        Ok(rows)
    }
}

fn cell_value(cell: &Data) -> RowValue {
    match cell {
        Data::Empty => RowValue::text(""),
        Data::String(s) => RowValue::text(s.trim()),
        Data::Float(f) => RowValue::Number(*f),
        Data::Int(i) => RowValue::Number(*i as f64),
        Data::Bool(b) => RowValue::Bool(*b),
        other => RowValue::text(other.to_string()),
    }
}

impl FormatAdapter for SpreadsheetAdapter {
    fn format(&self) -> FeedFormat {
        FeedFormat::Xlsx
    }

    /// First sheet only; empty cells become empty text.
    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawRow>, AdapterError> {
        let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
            .map_err(|e| AdapterError::malformed(FeedFormat::Xlsx, e))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or(AdapterError::NoRows(FeedFormat::Xlsx))?
            .map_err(|e| AdapterError::malformed(FeedFormat::Xlsx, e))?;

        let mut sheet_rows = range.rows();
        let Some(header) = sheet_rows.next() else {
            return Ok(Vec::new());
        };
        let headers: Vec<String> = header.iter().map(|c| c.to_string().trim().to_string()).collect();

        let rows = sheet_rows
            .filter(|cells| cells.iter().any(|c| !matches!(c, Data::Empty)))
            .map(|cells| {
                headers
                    .iter()
                    .enumerate()
                    .filter(|(_, header)| !header.is_empty())
                    .map(|(idx, header)| {
                        let value = cells.get(idx).map(cell_value).unwrap_or_else(|| RowValue::text(""));
                        (header.clone(), value)
                    })
                    .collect::<RawRow>()
            })
            .collect();
        Ok(rows)
    }
}

pub fn json_to_row_value(value: JsonValue) -> RowValue {
    match value {
        JsonValue::Null => RowValue::Null,
        JsonValue::Bool(b) => RowValue::Bool(b),
        JsonValue::Number(n) => n.as_f64().map(RowValue::Number).unwrap_or(RowValue::Null),
        JsonValue::String(s) => RowValue::Text(s),
        JsonValue::Array(items) => RowValue::List(items.into_iter().map(json_to_row_value).collect()),
        JsonValue::Object(map) => RowValue::Map(
            map.into_iter()
                .map(|(k, v)| (k, json_to_row_value(v)))
                .collect(),
        ),
    }
}

/// Depth-first search for the first list anywhere in the tree. Feeds wrap
/// their row array in an arbitrary number of container objects.
pub fn find_first_list(value: &RowValue, max_depth: usize) -> Option<&[RowValue]> {
    match value {
        RowValue::List(items) => Some(items),
        RowValue::Map(map) if max_depth > 0 => map
            .iter()
            .find_map(|(_, child)| find_first_list(child, max_depth - 1)),
        _ => None,
    }
}

/// Depth-first search for the first entry whose key is one of `keys`.
pub fn find_keyed<'a>(value: &'a RowValue, keys: &[&str], max_depth: usize) -> Option<&'a RowValue> {
    let map = value.as_map()?;
    if let Some(found) = map.iter().find(|(k, _)| keys.contains(k)).map(|(_, v)| v) {
        return Some(found);
    }
    if max_depth == 0 {
        return None;
    }
    map.iter()
        .find_map(|(_, child)| find_keyed(child, keys, max_depth - 1))
}

fn rows_from_nodes(nodes: &[RowValue]) -> Vec<RawRow> {
    let rows: Vec<RawRow> = nodes.iter().filter_map(|n| n.as_map().cloned()).collect();
    if rows.len() != nodes.len() {
        debug!(skipped = nodes.len() - rows.len(), "non-object entries skipped");
    }
    rows
}

impl FormatAdapter for StructuredObjectAdapter {
    fn format(&self) -> FeedFormat {
        FeedFormat::Json
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawRow>, AdapterError> {
        let json: JsonValue = serde_json::from_slice(strip_bom(bytes))
            .map_err(|e| AdapterError::malformed(FeedFormat::Json, e))?;
        let tree = json_to_row_value(json);
        let nodes = find_first_list(&tree, MAX_SEARCH_DEPTH).ok_or(AdapterError::NoRows(FeedFormat::Json))?;
        Ok(rows_from_nodes(nodes))
    }
}

/// Element names vendors use for one listing.
const MARKUP_ROW_TAGS: &[&str] = &["offer", "object", "flat", "lot"];

impl FormatAdapter for TaggedMarkupAdapter {
    fn format(&self) -> FeedFormat {
        FeedFormat::Xml
    }

    /// Known row elements are preferred so that a single-offer feed is not
    /// mistaken for its first repeated child (e.g. a list of images); other
    /// documents fall back to the first list in document order.
    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawRow>, AdapterError> {
        let tree = markup::parse_markup(strip_bom(bytes))
            .map_err(|message| AdapterError::Malformed {
                format: FeedFormat::Xml,
                message,
            })?;

        let rows = match find_keyed(&tree, MARKUP_ROW_TAGS, MAX_SEARCH_DEPTH) {
            Some(RowValue::List(nodes)) => rows_from_nodes(nodes),
            Some(RowValue::Map(node)) => vec![node.clone()],
            _ => {
                let nodes = find_first_list(&tree, MAX_SEARCH_DEPTH).ok_or(AdapterError::NoRows(FeedFormat::Xml))?;
                rows_from_nodes(nodes)
            }
        };
        Ok(rows.iter().map(normalize_offer).collect())
    }
}
