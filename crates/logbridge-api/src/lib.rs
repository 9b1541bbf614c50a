use std::path::{Path, PathBuf};

use anyhow::{Error, Result};
use logbridge_core::{
    normalize_call, reconcile_calls, reconcile_messages, BridgeError, Cutoff, MessageNormalizer,
    RawCallRow, RawMessageRow, ReconcileStats, RunConfig, TypedStreamDecoder,
};
use logbridge_interchange::{
    call_elements, extract_cutoff, message_elements, read_staging, write_call_staging,
    write_message_staging, write_target_document, StagingSummary, TargetKind, TargetSummary,
};
pub use logbridge_interchange::PriorBackup;
use logbridge_store_sqlite::{CallHistoryStore, ChatStore};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallExportResult {
    pub source: PathBuf,
    pub extracted: usize,
    /// `None` when the source held no calls; no file is written in that case.
    pub staging: Option<StagingSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageExportResult {
    pub source: PathBuf,
    pub extracted: usize,
    pub normalized: usize,
    pub cutoff: Cutoff,
    pub stats: ReconcileStats,
    pub staging: Option<StagingSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct XmlConvertResult {
    pub source: PathBuf,
    pub staged_rows: usize,
    /// `None` when the staging file had no data rows.
    pub target: Option<TargetSummary>,
}

/// Runs whole migration stages: source database to staging CSV, staging CSV to backup XML.
#[derive(Debug, Clone)]
pub struct LogBridgeApi {
    config: RunConfig,
}

impl LogBridgeApi {
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    /// Extract, normalize and stage every call in a call history database.
    ///
    /// # Errors
    /// Returns [`BridgeError::MissingInput`] when the database does not exist and
    /// [`BridgeError::OutputWrite`] when the staging file cannot be written. An unreadable
    /// database is logged and treated as empty.
    pub fn export_calls(&self, db_path: &Path, out_path: &Path) -> Result<CallExportResult> {
        let rows = read_source(db_path, |path| CallHistoryStore::open(path)?.read_call_rows())?;
        let extracted = rows.len();

        if rows.is_empty() {
            return Ok(CallExportResult { source: db_path.to_path_buf(), extracted, staging: None });
        }

        let records = rows
            .into_iter()
            .map(|row: RawCallRow| normalize_call(row, &self.config))
            .collect::<Vec<_>>();
        let ordered = reconcile_calls(records);
        let staging = write_call_staging(out_path, &ordered).map_err(|err| output_error(out_path, &err))?;
        tracing::info!(rows = staging.rows, sha256 = %staging.sha256, "call staging written");

        Ok(CallExportResult { source: db_path.to_path_buf(), extracted, staging: Some(staging) })
    }

    /// Extract, normalize, deduplicate and stage messages newer than the cutoff.
    ///
    /// `resolve_cutoff` is only consulted when at least one message survives normalization.
    ///
    /// # Errors
    /// Returns [`BridgeError::MissingInput`] when the database does not exist,
    /// [`BridgeError::OutputWrite`] when the staging file cannot be written, or whatever
    /// `resolve_cutoff` returns. An unreadable database is logged and treated as empty.
    pub fn export_messages<F>(
        &self,
        db_path: &Path,
        out_path: &Path,
        resolve_cutoff: F,
    ) -> Result<MessageExportResult>
    where
        F: FnOnce() -> Result<Cutoff>,
    {
        let decoder = TypedStreamDecoder;
        let normalizer = MessageNormalizer::new(&self.config, &decoder)?;
        let mut extracted = 0;

        let records = read_source(db_path, |path| {
            let store = ChatStore::open(path)?;
            let rows = store.read_message_rows()?;
            extracted = rows.len();
            Ok(rows
                .into_iter()
                .filter_map(|row: RawMessageRow| normalizer.normalize(row, &store))
                .collect::<Vec<_>>())
        })?;
        let normalized = records.len();

        if records.is_empty() {
            return Ok(MessageExportResult {
                source: db_path.to_path_buf(),
                extracted,
                normalized,
                cutoff: Cutoff::Unbounded,
                stats: ReconcileStats::default(),
                staging: None,
            });
        }

        let cutoff = resolve_cutoff()?;
        let (ordered, stats) = reconcile_messages(records, cutoff);
        let staging =
            write_message_staging(out_path, &ordered).map_err(|err| output_error(out_path, &err))?;
        tracing::info!(
            total = stats.total,
            written = stats.written,
            skipped = stats.skipped,
            %cutoff,
            "message staging written"
        );

        Ok(MessageExportResult {
            source: db_path.to_path_buf(),
            extracted,
            normalized,
            cutoff,
            stats,
            staging: Some(staging),
        })
    }

    /// Latest message date of a previously produced messages document.
    #[must_use]
    pub fn cutoff_from_backup(&self, xml_path: &Path) -> PriorBackup {
        extract_cutoff(xml_path, self.config.display_zone)
    }

    /// Convert a call staging CSV into a `<calls>` backup document.
    ///
    /// # Errors
    /// Returns an error when the CSV is missing or unreadable, or the XML cannot be written.
    pub fn calls_to_xml(&self, csv_path: &Path, out_path: &Path) -> Result<XmlConvertResult> {
        convert_staging(csv_path, out_path, TargetKind::Calls)
    }

    /// Convert a message staging CSV into an `<smses>` backup document.
    ///
    /// # Errors
    /// Returns an error when the CSV is missing or unreadable, or the XML cannot be written.
    pub fn messages_to_xml(&self, csv_path: &Path, out_path: &Path) -> Result<XmlConvertResult> {
        convert_staging(csv_path, out_path, TargetKind::Messages)
    }
}

/// Run a source read. Missing files abort; any other failure is logged and yields no rows.
fn read_source<T, F>(db_path: &Path, read: F) -> Result<Vec<T>>
where
    F: FnOnce(&Path) -> Result<Vec<T>>,
{
    match read(db_path) {
        Ok(rows) => Ok(rows),
        Err(err) if is_missing_input(&err) => Err(err),
        Err(err) => {
            let err = BridgeError::SourceRead(format!("{err:#}"));
            tracing::error!("{err}");
            Ok(Vec::new())
        }
    }
}

fn convert_staging(csv_path: &Path, out_path: &Path, kind: TargetKind) -> Result<XmlConvertResult> {
    if !csv_path.exists() {
        return Err(BridgeError::MissingInput(csv_path.to_path_buf()).into());
    }

    let table = read_staging(csv_path)?;
    if table.is_empty() {
        return Ok(XmlConvertResult { source: csv_path.to_path_buf(), staged_rows: 0, target: None });
    }

    let elements = match kind {
        TargetKind::Calls => call_elements(&table),
        TargetKind::Messages => message_elements(&table),
    };
    let target = write_target_document(out_path, kind, &elements)
        .map_err(|err| output_error(out_path, &err))?;
    tracing::info!(elements = target.elements, "{} document written", kind.root());

    Ok(XmlConvertResult {
        source: csv_path.to_path_buf(),
        staged_rows: table.len(),
        target: Some(target),
    })
}

#[must_use]
pub fn is_missing_input(err: &Error) -> bool {
    matches!(err.downcast_ref::<BridgeError>(), Some(BridgeError::MissingInput(_)))
}

fn output_error(path: &Path, err: &Error) -> Error {
    BridgeError::OutputWrite { path: path.to_path_buf(), reason: format!("{err:#}") }.into()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    use logbridge_core::{CounterpartyRules, DisplayZone};
    use rusqlite::{params, Connection};

    use super::*;

    const CHAT_SCHEMA_SQL: &str = r"
    CREATE TABLE handle (ROWID INTEGER PRIMARY KEY, id TEXT NOT NULL);
    CREATE TABLE message (
      ROWID INTEGER PRIMARY KEY,
      date INTEGER,
      text TEXT,
      attributedBody BLOB,
      handle_id INTEGER DEFAULT 0,
      is_from_me INTEGER DEFAULT 0,
      cache_roomnames TEXT,
      service TEXT
    );
    CREATE TABLE chat (ROWID INTEGER PRIMARY KEY, chat_identifier TEXT);
    CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER);
    ";

    const CALL_SCHEMA_SQL: &str = r"
    CREATE TABLE ZCALLRECORD (
      Z_PK INTEGER PRIMARY KEY, ZADDRESS VARCHAR, ZDURATION FLOAT, ZDATE TIMESTAMP,
      ZORIGINATED INTEGER, ZANSWERED INTEGER, ZDISCONNECTED_CAUSE INTEGER, ZSERVICE_PROVIDER VARCHAR
    );
    ";

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_nanos());
        let dir = std::env::temp_dir().join(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&dir).unwrap_or_else(|err| panic!("create temp dir: {err}"));
        dir
    }

    fn api() -> LogBridgeApi {
        LogBridgeApi::new(RunConfig {
            self_number: "15550001111".to_string(),
            display_zone: DisplayZone::utc(),
            counterparty: CounterpartyRules::default(),
        })
    }

    fn seconds_to_message_date(unix_seconds: i64) -> i64 {
        (unix_seconds - logbridge_core::REFERENCE_UNIX_SECONDS) * 1_000_000_000
    }

    fn chat_fixture(dir: &Path) -> Result<PathBuf> {
        let path = dir.join("chat.db");
        let conn = Connection::open(&path)?;
        conn.execute_batch(CHAT_SCHEMA_SQL)?;
        conn.execute("INSERT INTO handle VALUES (1, '+15550002222')", [])?;
        conn.execute("INSERT INTO chat VALUES (1, '+9198765')", [])?;
        conn.execute("INSERT INTO chat_message_join VALUES (1, 4)", [])?;

        let rows: [(i64, i64, Option<&str>, i64, i64, &str); 5] = [
            (1, 1_704_121_445, Some("hello"), 1, 0, "iMessage"),
            (2, 1_704_121_445, Some("hello"), 1, 0, "SMS"),
            (3, 1_704_121_446, None, 1, 0, "iMessage"),
            (4, 1_704_121_447, Some("sent"), 0, 1, "SMS"),
            (5, 1_704_121_448, Some("later"), 1, 0, "SMS"),
        ];
        for (rowid, unix_seconds, text, handle_id, is_from_me, service) in rows {
            conn.execute(
                "INSERT INTO message(ROWID, date, text, handle_id, is_from_me, service)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![rowid, seconds_to_message_date(unix_seconds), text, handle_id, is_from_me, service],
            )?;
        }
        Ok(path)
    }

    #[test]
    fn message_export_dedups_resolves_and_filters() -> Result<()> {
        let dir = unique_temp_dir("logbridge-api-messages");
        let db = chat_fixture(&dir)?;
        let out = dir.join("messages.csv");

        let result = api().export_messages(&db, &out, || Ok(Cutoff::After(1_704_121_445_000)))?;
        assert_eq!(result.extracted, 5);
        assert_eq!(result.normalized, 4);
        assert_eq!(result.stats, ReconcileStats { total: 3, written: 2, skipped: 1 });

        let csv = fs::read_to_string(&out)?;
        assert!(!csv.contains("hello"));
        assert!(csv.contains("4,1704121447000,01 Jan 2024 3:04:07 pm,sent,98765,1,,SMS"));
        assert!(csv.contains("5,1704121448000,01 Jan 2024 3:04:08 pm,later,+15550002222,0,,SMS"));
        Ok(())
    }

    #[test]
    fn repeated_message_exports_are_byte_identical() -> Result<()> {
        let dir = unique_temp_dir("logbridge-api-idempotent");
        let db = chat_fixture(&dir)?;

        let first = api().export_messages(&db, &dir.join("a.csv"), || Ok(Cutoff::Unbounded))?;
        let second = api().export_messages(&db, &dir.join("b.csv"), || Ok(Cutoff::Unbounded))?;
        let first = first.staging.unwrap_or_else(|| panic!("first run should write"));
        let second = second.staging.unwrap_or_else(|| panic!("second run should write"));

        assert_eq!(first.sha256, second.sha256);
        assert_eq!(first.rows, 3);
        Ok(())
    }

    #[test]
    fn missing_database_aborts_the_stage() {
        let dir = unique_temp_dir("logbridge-api-missing");
        let err = match api().export_calls(&dir.join("absent.db"), &dir.join("calls.csv")) {
            Ok(result) => panic!("missing input should abort, got {result:?}"),
            Err(err) => err,
        };
        assert!(is_missing_input(&err));
        assert!(!dir.join("calls.csv").exists());
    }

    #[test]
    fn unreadable_database_is_treated_as_empty() -> Result<()> {
        let dir = unique_temp_dir("logbridge-api-garbage");
        let db = dir.join("garbage.db");
        fs::write(&db, b"this is not a sqlite database, just bytes that pretend to be one")?;

        let result = api().export_messages(&db, &dir.join("messages.csv"), || {
            panic!("cutoff should not be requested when nothing was extracted")
        })?;
        assert_eq!(result.staging, None);
        assert!(!dir.join("messages.csv").exists());
        Ok(())
    }

    #[test]
    fn call_export_then_xml_conversion() -> Result<()> {
        let dir = unique_temp_dir("logbridge-api-calls");
        let db = dir.join("CallHistory.storedata");
        let conn = Connection::open(&db)?;
        conn.execute_batch(CALL_SCHEMA_SQL)?;
        conn.execute_batch(
            r"
            INSERT INTO ZCALLRECORD VALUES (1, '+15550003333', 30.5, 725814300.0, 1, 1, 0, 'com.apple.Telephony');
            INSERT INTO ZCALLRECORD VALUES (2, '+15550004444', 0, 725814245.0, 0, 0, 6, 'net.whatsapp.WhatsApp');
            ",
        )?;
        drop(conn);

        let csv = dir.join("call_logs.csv");
        let exported = api().export_calls(&db, &csv)?;
        assert_eq!(exported.extracted, 2);
        assert_eq!(exported.staging.as_ref().map(|staging| staging.rows), Some(2));

        let xml = dir.join("call_logs.xml");
        let converted = api().calls_to_xml(&csv, &xml)?;
        assert_eq!(converted.staged_rows, 2);

        let document = fs::read_to_string(&xml)?;
        assert!(document.contains("<calls count=\"2\">"));
        let first = document.find("+15550004444").unwrap_or(usize::MAX);
        let second = document.find("+15550003333").unwrap_or(usize::MAX);
        assert!(first < second, "calls should be ordered by date");
        assert!(document.contains("type=\"5\""));
        assert!(document.contains("subscription_id=\"15550001111@s.whatsapp.net\""));
        Ok(())
    }

    #[test]
    fn empty_staging_file_produces_no_document() -> Result<()> {
        let dir = unique_temp_dir("logbridge-api-empty-csv");
        let csv = dir.join("messages.csv");
        fs::write(&csv, "rowid,date,readable_date,body,phone_number,is_from_me,cache_roomname,service\n")?;

        let result = api().messages_to_xml(&csv, &dir.join("output.xml"))?;
        assert_eq!(result.target, None);
        assert!(!dir.join("output.xml").exists());

        let missing = api().messages_to_xml(&dir.join("absent.csv"), &dir.join("output.xml"));
        assert!(missing.as_ref().is_err_and(is_missing_input));
        Ok(())
    }

    #[test]
    fn cutoff_from_backup_reads_prior_document() -> Result<()> {
        let dir = unique_temp_dir("logbridge-api-cutoff");
        let xml = dir.join("prior.xml");
        fs::write(&xml, r#"<smses count="1"><sms date="1704121445400"/></smses>"#)?;
        assert_eq!(api().cutoff_from_backup(&xml).cutoff(), Cutoff::After(1_704_121_445_000));
        assert!(matches!(api().cutoff_from_backup(&dir.join("absent.xml")), PriorBackup::Unreadable(_)));
        Ok(())
    }
}
