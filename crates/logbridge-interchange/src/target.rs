use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use quick_xml::escape::escape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use serde::{Deserialize, Serialize};

use crate::staging::{StagingRow, StagingTable, UNKNOWN_CONTACT};

/// Which backup document is being produced.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Calls,
    Messages,
}

impl TargetKind {
    #[must_use]
    pub fn root(self) -> &'static str {
        match self {
            Self::Calls => "calls",
            Self::Messages => "smses",
        }
    }

    #[must_use]
    pub fn child(self) -> &'static str {
        match self {
            Self::Calls => "call",
            Self::Messages => "sms",
        }
    }
}

/// (attribute, staging column, value used when the column is missing)
const CALL_ATTRIBUTES: [(&str, &str, &str); 10] = [
    ("number", "phone_number", ""),
    ("date", "date", "0"),
    ("duration", "duration", "0"),
    ("type", "type", "0"),
    ("presentation", "presentation", "1"),
    ("subscription_id", "subscription_id", "null"),
    ("post_dial_digits", "post_dial_digits", ""),
    ("subscription_component_name", "subscription_component_name", "null"),
    ("readable_date", "readable_date", ""),
    ("contact_name", "contact_name", UNKNOWN_CONTACT),
];

/// One child element of the target document, attributes in output order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetElement {
    pub attributes: Vec<(&'static str, String)>,
}

impl TargetElement {
    fn push(&mut self, name: &'static str, value: impl Into<String>) {
        self.attributes.push((name, value.into()));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(attribute, _)| *attribute == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub path: PathBuf,
    pub kind: TargetKind,
    pub elements: usize,
}

/// Map staged call rows to `<call>` elements. Values are copied verbatim; only
/// missing columns fall back to defaults.
#[must_use]
pub fn call_elements(table: &StagingTable) -> Vec<TargetElement> {
    table
        .rows()
        .map(|row| {
            let mut element = TargetElement::default();
            for (attribute, column, default) in CALL_ATTRIBUTES {
                element.push(attribute, row.get(column).unwrap_or(default));
            }
            element
        })
        .collect()
}

/// Map staged message rows to `<sms>` elements.
#[must_use]
pub fn message_elements(table: &StagingTable) -> Vec<TargetElement> {
    table.rows().map(|row| message_element(&row)).collect()
}

fn message_element(row: &StagingRow<'_>) -> TargetElement {
    let received = row.get("is_from_me") == Some("0");
    let mut element = TargetElement::default();

    element.push("address", row.get("phone_number").unwrap_or_default());
    element.push("date", row.get("date").unwrap_or_default());
    element.push("body", row.get("body").unwrap_or_default());
    element.push("type", if received { "1" } else { "2" });
    element.push("read", if received { "1" } else { "0" });
    element.push("status", "-1");
    element.push("protocol", "0");
    element.push("subject", "null");
    element.push("toa", "null");
    element.push("sc_toa", "null");
    element.push("service_center", "null");
    element.push("locked", "0");
    element.push("readable_date", row.get("readable_date").unwrap_or("null"));
    element.push("contact_name", UNKNOWN_CONTACT);
    element.push("date_sent", "0");
    element.push("sub_id", "-1");
    element
}

/// Write a pretty-printed backup document: declaration, counted root, one self-closing
/// child per element.
///
/// # Errors
/// Returns an error when the file cannot be created or written.
pub fn write_target_document(
    path: &Path,
    kind: TargetKind,
    elements: &[TargetElement],
) -> Result<TargetSummary> {
    let file = File::create(path)
        .with_context(|| format!("failed to create XML file {}", path.display()))?;
    let mut writer = Writer::new_with_indent(BufWriter::new(file), b' ', 2);
    let write_failed = || format!("failed to write XML file {}", path.display());

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .with_context(write_failed)?;

    let count = elements.len().to_string();
    let mut root = BytesStart::new(kind.root());
    root.push_attribute(("count", count.as_str()));
    writer.write_event(Event::Start(root)).with_context(write_failed)?;

    for element in elements {
        let mut child = BytesStart::new(kind.child());
        for (name, value) in &element.attributes {
            let escaped = escape_attribute(value);
            // Already escaped; the byte-tuple form is written as is.
            child.push_attribute((name.as_bytes(), escaped.as_bytes()));
        }
        writer.write_event(Event::Empty(child)).with_context(write_failed)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new(kind.root())))
        .with_context(write_failed)?;

    let mut inner = writer.into_inner();
    inner.write_all(b"\n").with_context(write_failed)?;
    inner.flush().with_context(write_failed)?;

    Ok(TargetSummary { path: path.to_path_buf(), kind, elements: elements.len() })
}

/// XML-escape an attribute value and encode whitespace control characters as
/// character references so parsers do not normalize them to spaces.
fn escape_attribute(value: &str) -> String {
    let escaped = escape(value);
    let mut out = String::with_capacity(escaped.len());
    for ch in escaped.chars() {
        match ch {
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            '\t' => out.push_str("&#9;"),
            _ => out.push(ch),
        }
    }
    out
}
