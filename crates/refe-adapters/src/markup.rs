//! Tagged-markup (XML) reader producing a `RowValue` tree.
//!
//! Attributes are kept as `@name` entries, text next to child elements is
//! kept under `#text`, and repeated sibling elements collapse into a list.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use refe_core::{RawRow, RowValue};

pub const ATTRIBUTE_PREFIX: &str = "@";
pub const TEXT_KEY: &str = "#text";
/// Deepest element nesting accepted before a document is rejected.
pub const MAX_MARKUP_DEPTH: usize = 256;

struct Frame {
    name: String,
    node: RawRow,
    text: String,
}

impl Frame {
    fn document() -> Self {
        Self {
            name: "#document".to_string(),
            node: RawRow::new(),
            text: String::new(),
        }
    }

    fn open(start: &BytesStart<'_>) -> Result<Self, String> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut node = RawRow::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| format!("bad attribute on <{name}>: {e}"))?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| format!("bad attribute value on <{name}>: {e}"))?;
            node.insert(format!("{ATTRIBUTE_PREFIX}{key}"), value.trim());
        }
        Ok(Self {
            name,
            node,
            text: String::new(),
        })
    }

    fn close(self) -> (String, RowValue) {
        let text = self.text.trim().to_string();
        if self.node.is_empty() {
            return (self.name, RowValue::Text(text));
        }
        let mut node = self.node;
        if !text.is_empty() {
            node.insert(TEXT_KEY, text);
        }
        (self.name, RowValue::Map(node))
    }
}

fn attach(parent: &mut RawRow, name: String, value: RowValue) {
    match parent.get_mut(&name) {
        Some(RowValue::List(items)) => items.push(value),
        Some(existing) => {
            let first = std::mem::replace(existing, RowValue::Null);
            *existing = RowValue::List(vec![first, value]);
        }
        None => parent.insert(name, value),
    }
}

/// Parses a markup document into a map keyed by its root element name.
pub fn parse_markup(bytes: &[u8]) -> Result<RowValue, String> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut stack = vec![Frame::document()];
    let mut buf = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| format!("at byte {}: {e}", reader.buffer_position()))?;
        match event {
            Event::Start(start) => {
                if stack.len() > MAX_MARKUP_DEPTH {
                    return Err(format!("elements nested deeper than {MAX_MARKUP_DEPTH} levels"));
                }
                stack.push(Frame::open(&start)?);
            }
            Event::Empty(start) => {
                let (name, value) = Frame::open(&start)?.close();
                if let Some(parent) = stack.last_mut() {
                    attach(&mut parent.node, name, value);
                }
            }
            Event::End(_) => {
                if stack.len() < 2 {
                    return Err("closing tag without a matching opening tag".to_string());
                }
                if let Some(frame) = stack.pop() {
                    let (name, value) = frame.close();
                    if let Some(parent) = stack.last_mut() {
                        attach(&mut parent.node, name, value);
                    }
                }
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| format!("bad text content: {e}"))?;
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if stack.len() != 1 {
        let open = stack.last().map(|f| f.name.clone()).unwrap_or_default();
        return Err(format!("unexpected end of document inside <{open}>"));
    }
    let document = stack.pop().map(|f| f.node).unwrap_or_default();
    if document.is_empty() {
        return Err("document has no root element".to_string());
    }
    Ok(RowValue::Map(document))
}
