use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use csv::{QuoteStyle, ReaderBuilder, StringRecord, Terminator, WriterBuilder};
use logbridge_core::{CallRecord, MessageRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CALL_STAGING_HEADER: [&str; 13] = [
    "rowid",
    "phone_number",
    "duration",
    "date",
    "type",
    "type_of_call",
    "presentation",
    "subscription_id",
    "post_dial_digits",
    "subscription_component_name",
    "readable_date",
    "contact_name",
    "service_provider",
];

pub const MESSAGE_STAGING_HEADER: [&str; 8] = [
    "rowid",
    "date",
    "readable_date",
    "body",
    "phone_number",
    "is_from_me",
    "cache_roomname",
    "service",
];

pub const UNKNOWN_CONTACT: &str = "(Unknown)";

/// Written staging file and the digest of its exact bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingSummary {
    pub path: PathBuf,
    pub rows: usize,
    pub sha256: String,
}

#[derive(Serialize)]
struct CallStagingRow<'a> {
    rowid: i64,
    phone_number: &'a str,
    duration: i64,
    date: i64,
    call_type: u8,
    type_of_call: &'static str,
    presentation: i64,
    subscription_id: &'a str,
    post_dial_digits: &'static str,
    subscription_component_name: &'a str,
    readable_date: &'a str,
    contact_name: &'static str,
    service_provider: &'a str,
}

impl<'a> From<&'a CallRecord> for CallStagingRow<'a> {
    fn from(record: &'a CallRecord) -> Self {
        Self {
            rowid: record.id,
            phone_number: &record.counterparty_id,
            duration: record.duration_seconds,
            date: record.timestamp_ms,
            call_type: record.call_type.code(),
            type_of_call: record.direction.as_str(),
            presentation: record.presentation,
            subscription_id: &record.subscription_id,
            post_dial_digits: "",
            subscription_component_name: &record.subscription_component,
            readable_date: &record.timestamp_display,
            contact_name: UNKNOWN_CONTACT,
            service_provider: &record.service_provider,
        }
    }
}

#[derive(Serialize)]
struct MessageStagingRow<'a> {
    rowid: i64,
    date: i64,
    readable_date: &'a str,
    body: &'a str,
    phone_number: &'a str,
    is_from_me: u8,
    cache_roomname: &'a str,
    service: &'a str,
}

impl<'a> From<&'a MessageRecord> for MessageStagingRow<'a> {
    fn from(record: &'a MessageRecord) -> Self {
        Self {
            rowid: record.id,
            date: record.timestamp_ms,
            readable_date: &record.timestamp_display,
            body: &record.body,
            phone_number: &record.counterparty_id,
            is_from_me: u8::from(record.is_from_self),
            cache_roomname: &record.room_name,
            service: &record.service,
        }
    }
}

/// Write call records with every field quoted.
///
/// # Errors
/// Returns an error when a row cannot be serialized or the file cannot be written.
pub fn write_call_staging(path: &Path, records: &[CallRecord]) -> Result<StagingSummary> {
    let rows = records.iter().map(CallStagingRow::from);
    write_staging(path, QuoteStyle::Always, &CALL_STAGING_HEADER, rows)
}

/// Write message records, quoting only where a field requires it.
///
/// # Errors
/// Returns an error when a row cannot be serialized or the file cannot be written.
pub fn write_message_staging(path: &Path, records: &[MessageRecord]) -> Result<StagingSummary> {
    let rows = records.iter().map(MessageStagingRow::from);
    write_staging(path, QuoteStyle::Necessary, &MESSAGE_STAGING_HEADER, rows)
}

fn write_staging<T: Serialize>(
    path: &Path,
    quote_style: QuoteStyle,
    header: &[&str],
    rows: impl Iterator<Item = T>,
) -> Result<StagingSummary> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .quote_style(quote_style)
        .terminator(Terminator::CRLF)
        .from_writer(Vec::new());

    writer.write_record(header).context("failed to write staging header")?;
    let mut count = 0_usize;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("failed to serialize staging row {}", count + 1))?;
        count += 1;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| anyhow!("failed to flush staging rows: {}", err.error()))?;
    fs::write(path, &bytes)
        .with_context(|| format!("failed to write staging file {}", path.display()))?;

    Ok(StagingSummary {
        path: path.to_path_buf(),
        rows: count,
        sha256: format!("{:x}", Sha256::digest(&bytes)),
    })
}

/// Staging CSV read back by header name.
#[derive(Debug, Clone, Default)]
pub struct StagingTable {
    headers: StringRecord,
    rows: Vec<StringRecord>,
}

impl StagingTable {
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column_index(&self, column: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == column)
    }

    /// Iterate rows as lookups by column name.
    pub fn rows(&self) -> impl Iterator<Item = StagingRow<'_>> {
        self.rows.iter().map(move |record| StagingRow { table: self, record })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StagingRow<'a> {
    table: &'a StagingTable,
    record: &'a StringRecord,
}

impl<'a> StagingRow<'a> {
    /// Field value, or `None` when the column is absent from the header or the row is short.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&'a str> {
        self.table.column_index(column).and_then(|index| self.record.get(index))
    }
}

/// Read a staging CSV produced by this tool or edited by hand.
///
/// # Errors
/// Returns an error when the file cannot be opened or is not valid UTF-8 CSV.
pub fn read_staging(path: &Path) -> Result<StagingTable> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open staging file {}", path.display()))?;

    let headers = reader
        .headers()
        .with_context(|| format!("failed to read staging header from {}", path.display()))?
        .clone();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| {
            format!("failed to read staging row {} from {}", index + 1, path.display())
        })?;
        rows.push(record);
    }

    Ok(StagingTable { headers, rows })
}

#[cfg(test)]
mod tests {
    use logbridge_core::{CallDirection, CallType};

    use super::*;
    use crate::test_support::unique_temp_dir;

    fn call(id: i64) -> CallRecord {
        CallRecord {
            id,
            counterparty_id: "+15550003333".to_string(),
            duration_seconds: 62,
            timestamp_ms: 1_704_121_445_000,
            timestamp_display: "01 Jan 2024 3:04:05 pm".to_string(),
            call_type: CallType::Rejected,
            direction: CallDirection::Incoming,
            presentation: 1,
            subscription_id: "1".to_string(),
            subscription_component: logbridge_core::TELEPHONY_COMPONENT.to_string(),
            service_provider: String::new(),
        }
    }

    fn message(id: i64, body: &str, is_from_self: bool) -> MessageRecord {
        MessageRecord {
            id,
            timestamp_ms: 1_704_121_445_000,
            timestamp_display: "01 Jan 2024 3:04:05 pm".to_string(),
            body: body.to_string(),
            counterparty_id: "+15550002222".to_string(),
            is_from_self,
            room_name: String::new(),
            service: "SMS".to_string(),
        }
    }

    #[test]
    fn call_staging_quotes_every_field() -> Result<()> {
        let path = unique_temp_dir("logbridge-staging-calls").join("call_logs.csv");
        let summary = write_call_staging(&path, &[call(1)])?;
        let text = fs::read_to_string(&path)?;

        assert_eq!(summary.rows, 1);
        let mut lines = text.split("\r\n");
        assert_eq!(
            lines.next(),
            Some(
                "\"rowid\",\"phone_number\",\"duration\",\"date\",\"type\",\"type_of_call\",\"presentation\",\"subscription_id\",\"post_dial_digits\",\"subscription_component_name\",\"readable_date\",\"contact_name\",\"service_provider\""
            )
        );
        let row = lines.next().unwrap_or_else(|| panic!("missing data row"));
        assert!(row.starts_with("\"1\",\"+15550003333\",\"62\",\"1704121445000\",\"5\",\"Incoming\",\"1\",\"1\",\"\","));
        assert!(row.ends_with(",\"01 Jan 2024 3:04:05 pm\",\"(Unknown)\",\"\""));
        Ok(())
    }

    #[test]
    fn message_staging_quotes_only_when_needed_and_reads_back() -> Result<()> {
        let path = unique_temp_dir("logbridge-staging-messages").join("messages.csv");
        let records = vec![message(1, "plain", false), message(2, "comma, \"quoted\"\nnewline", true)];
        let summary = write_message_staging(&path, &records)?;
        assert_eq!(summary.rows, 2);

        let text = fs::read_to_string(&path)?;
        assert!(text.starts_with("rowid,date,readable_date,body,phone_number,is_from_me,cache_roomname,service\r\n"));
        assert!(text.contains("1,1704121445000,01 Jan 2024 3:04:05 pm,plain,+15550002222,0,,SMS\r\n"));

        let table = read_staging(&path)?;
        assert_eq!(table.len(), 2);
        let rows = table.rows().collect::<Vec<_>>();
        assert_eq!(rows[1].get("body"), Some("comma, \"quoted\"\nnewline"));
        assert_eq!(rows[1].get("is_from_me"), Some("1"));
        assert_eq!(rows[0].get("missing_column"), None);
        Ok(())
    }

    #[test]
    fn identical_input_yields_identical_digest() -> Result<()> {
        let dir = unique_temp_dir("logbridge-staging-digest");
        let records = vec![message(1, "same", false), message(2, "bytes", true)];

        let first = write_message_staging(&dir.join("a.csv"), &records)?;
        let second = write_message_staging(&dir.join("b.csv"), &records)?;
        assert_eq!(first.sha256, second.sha256);
        assert_eq!(first.sha256.len(), 64);

        let changed = write_message_staging(&dir.join("c.csv"), &records[..1])?;
        assert_ne!(first.sha256, changed.sha256);
        Ok(())
    }

    #[test]
    fn header_only_staging_is_empty() -> Result<()> {
        let path = unique_temp_dir("logbridge-staging-empty").join("empty.csv");
        fs::write(&path, "rowid,date,body\n")?;
        let table = read_staging(&path)?;
        assert!(table.is_empty());
        assert_eq!(table.rows().count(), 0);
        Ok(())
    }
}
