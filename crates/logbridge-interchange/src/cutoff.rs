use std::path::Path;

use anyhow::{bail, Context, Result};
use logbridge_core::{render_unix_millis, Cutoff, DisplayZone, NO_CUTOFF};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Outcome of reading a previously produced messages document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorBackup {
    /// Latest `sms` date in the document, with its readable form.
    Latest { date_ms: i64, display: String },
    /// The document parsed but holds no dated `sms` element.
    NoDatedMessages,
    /// The document is missing or could not be parsed.
    Unreadable(String),
}

impl PriorBackup {
    /// Cutoff for the export: the latest date rounded to the second, otherwise unbounded.
    #[must_use]
    pub fn cutoff(&self) -> Cutoff {
        match self {
            Self::Latest { date_ms, .. } => Cutoff::After(*date_ms).rounded_to_second(),
            Self::NoDatedMessages | Self::Unreadable(_) => Cutoff::Unbounded,
        }
    }
}

/// Find the largest `date` of any `sms` element in a prior messages document.
#[must_use]
pub fn extract_cutoff(path: &Path, zone: DisplayZone) -> PriorBackup {
    if !path.exists() {
        return PriorBackup::Unreadable(format!("XML file {} not found", path.display()));
    }

    match latest_sms_date(path) {
        Err(err) => PriorBackup::Unreadable(format!("could not parse XML file {}: {err:#}", path.display())),
        Ok(NO_CUTOFF) => PriorBackup::NoDatedMessages,
        Ok(date_ms) => {
            let display = render_unix_millis(date_ms, zone).unwrap_or_else(|err| err.to_string());
            PriorBackup::Latest { date_ms, display }
        }
    }
}

fn latest_sms_date(path: &Path) -> Result<i64> {
    let mut reader = Reader::from_file(path)
        .with_context(|| format!("failed to open XML file {}", path.display()))?;
    let mut buf = Vec::new();
    let mut depth = 0_usize;
    let mut latest = NO_CUTOFF;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .with_context(|| format!("malformed XML at byte {}", reader.buffer_position()))?;
        match event {
            Event::Start(element) => {
                depth += 1;
                latest = latest.max(sms_date(&element)?.unwrap_or(NO_CUTOFF));
            }
            Event::Empty(element) => {
                latest = latest.max(sms_date(&element)?.unwrap_or(NO_CUTOFF));
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if depth != 0 {
        bail!("document ended with {depth} unclosed element(s)");
    }
    Ok(latest)
}

/// `date` of an `sms` element. Non-numeric values are skipped with a warning.
fn sms_date(element: &BytesStart<'_>) -> Result<Option<i64>> {
    if element.name().as_ref() != b"sms" {
        return Ok(None);
    }

    for attr in element.attributes() {
        let attr = attr.context("malformed attribute on sms element")?;
        if attr.key.as_ref() != b"date" {
            continue;
        }
        let value = attr.unescape_value().context("malformed date attribute")?;
        if value.is_empty() {
            return Ok(None);
        }
        return match value.trim().parse::<i64>() {
            Ok(date) => Ok(Some(date)),
            Err(_) => {
                tracing::warn!("invalid date attribute found in XML: {value}");
                Ok(None)
            }
        };
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::unique_temp_dir;

    fn xml_file(prefix: &str, contents: &str) -> std::path::PathBuf {
        let path = unique_temp_dir(prefix).join("prior.xml");
        fs::write(&path, contents).unwrap_or_else(|err| panic!("write fixture: {err}"));
        path
    }

    #[test]
    fn latest_sms_date_wins_and_is_rounded() {
        let path = xml_file(
            "logbridge-cutoff-latest",
            r#"<?xml version="1.0" encoding="utf-8"?>
<smses count="3">
  <sms address="a" date="1704121445000"/>
  <sms address="b" date="1704121446600"/>
  <group><sms address="c" date="1704121440000"></sms></group>
</smses>
"#,
        );
        let prior = extract_cutoff(&path, DisplayZone::utc());
        assert_eq!(
            prior,
            PriorBackup::Latest { date_ms: 1_704_121_446_600, display: "01 Jan 2024 3:04:06 pm".to_string() }
        );
        assert_eq!(prior.cutoff(), Cutoff::After(1_704_121_447_000));
    }

    #[test]
    fn invalid_dates_are_skipped() {
        let path = xml_file(
            "logbridge-cutoff-invalid",
            r#"<smses><sms date="soon"/><sms date=""/><sms date="5000"/><call date="9000000"/></smses>"#,
        );
        assert_eq!(extract_cutoff(&path, DisplayZone::utc()).cutoff(), Cutoff::After(5_000));
    }

    #[test]
    fn missing_or_malformed_sources_are_unreadable() {
        let dir = unique_temp_dir("logbridge-cutoff-none");
        let truncated = xml_file("logbridge-cutoff-truncated", r#"<smses><sms date="5000"/>"#);
        let mismatched = xml_file("logbridge-cutoff-mismatched", r#"<smses><sms date="5000"></call></smses>"#);

        for path in [dir.join("absent.xml"), truncated, mismatched] {
            let prior = extract_cutoff(&path, DisplayZone::utc());
            assert!(matches!(prior, PriorBackup::Unreadable(_)), "{}: {prior:?}", path.display());
            assert_eq!(prior.cutoff(), Cutoff::Unbounded);
        }
    }

    #[test]
    fn document_without_dated_messages_is_not_an_error() {
        let undated = xml_file("logbridge-cutoff-undated", r#"<smses count="0"></smses>"#);
        let prior = extract_cutoff(&undated, DisplayZone::utc());
        assert_eq!(prior, PriorBackup::NoDatedMessages);
        assert_eq!(prior.cutoff(), Cutoff::Unbounded);
    }
}
