use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use logbridge_core::{BridgeError, ConversationLookup, RawCallRow, RawMessageRow};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

const CALL_ROWS_SQL: &str = r"
SELECT Z_PK, ZADDRESS, ZDURATION, ZDATE, ZORIGINATED, ZANSWERED, ZDISCONNECTED_CAUSE, ZSERVICE_PROVIDER
FROM ZCALLRECORD
";

const MESSAGE_ROWS_SQL: &str = r"
SELECT message.ROWID, message.date, message.text, message.attributedBody, handle.id,
       message.is_from_me, message.cache_roomnames, message.service
FROM message
LEFT JOIN handle ON message.handle_id = handle.ROWID
";

const MESSAGE_CONVERSATION_SQL: &str =
    "SELECT chat_id FROM chat_message_join WHERE message_id = ?1";
const CONVERSATION_IDENTIFIER_SQL: &str = "SELECT chat_identifier FROM chat WHERE ROWID = ?1";

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Open a source database without write access.
///
/// # Errors
/// Returns [`BridgeError::MissingInput`] when the file does not exist, or an error when
/// `SQLite` refuses to open it.
fn open_read_only(path: &Path) -> Result<Connection> {
    if !path.exists() {
        return Err(BridgeError::MissingInput(path.to_path_buf()).into());
    }

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT).context("failed to configure sqlite busy timeout")?;
    Ok(conn)
}

/// Reader over a `CallHistory.storedata` database.
pub struct CallHistoryStore {
    conn: Connection,
    path: PathBuf,
}

impl CallHistoryStore {
    /// # Errors
    /// Returns [`BridgeError::MissingInput`] (inside the `anyhow` chain) when the file is
    /// absent, or an open error otherwise.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_read_only(path)?;
        Ok(Self { conn, path: path.to_path_buf() })
    }

    /// Read every `ZCALLRECORD` row in storage order.
    ///
    /// # Errors
    /// Returns an error when the table cannot be queried, e.g. the file is not a call
    /// history database.
    pub fn read_call_rows(&self) -> Result<Vec<RawCallRow>> {
        let mut stmt = self
            .conn
            .prepare(CALL_ROWS_SQL)
            .with_context(|| format!("failed to query call records in {}", self.path.display()))?;
        let rows = stmt.query_map([], |row| {
            Ok(RawCallRow {
                row_id: row.get(0)?,
                address: lenient_text(row, 1)?,
                duration: lenient_real(row, 2)?,
                date: lenient_real(row, 3)?,
                originated: lenient_integer(row, 4)?,
                answered: lenient_integer(row, 5)?,
                disconnected_cause: lenient_integer(row, 6)?,
                service_provider: lenient_text(row, 7)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode call record row")?);
        }
        tracing::debug!(rows = out.len(), "read call history rows");
        Ok(out)
    }
}

/// Reader over a `chat.db` database. Also serves the conversation lookups used to
/// resolve the counterparty of self-sent messages.
pub struct ChatStore {
    conn: Connection,
    path: PathBuf,
}

impl ChatStore {
    /// # Errors
    /// Returns [`BridgeError::MissingInput`] (inside the `anyhow` chain) when the file is
    /// absent, or an open error otherwise.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_read_only(path)?;
        Ok(Self { conn, path: path.to_path_buf() })
    }

    /// Read every `message` row joined with its handle identifier.
    ///
    /// # Errors
    /// Returns an error when the query fails, e.g. the file is not a message database.
    pub fn read_message_rows(&self) -> Result<Vec<RawMessageRow>> {
        let mut stmt = self
            .conn
            .prepare(MESSAGE_ROWS_SQL)
            .with_context(|| format!("failed to query messages in {}", self.path.display()))?;
        let rows = stmt.query_map([], |row| {
            Ok(RawMessageRow {
                row_id: row.get(0)?,
                date: lenient_integer(row, 1)?,
                text: lenient_text(row, 2)?,
                attributed_body: lenient_blob(row, 3)?,
                handle_identifier: lenient_text(row, 4)?,
                is_from_me: lenient_integer(row, 5)?.unwrap_or(0),
                room_name: lenient_text(row, 6)?,
                service: lenient_text(row, 7)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode message row")?);
        }
        tracing::debug!(rows = out.len(), "read message rows");
        Ok(out)
    }
}

impl ConversationLookup for ChatStore {
    fn conversation_for_message(&self, message_id: i64) -> Result<Option<i64>, BridgeError> {
        let conversation = self
            .conn
            .prepare_cached(MESSAGE_CONVERSATION_SQL)
            .and_then(|mut stmt| {
                stmt.query_row(params![message_id], |row| lenient_integer(row, 0)).optional()
            })
            .map_err(|err| BridgeError::SourceRead(err.to_string()))?;
        Ok(conversation.flatten())
    }

    fn conversation_identifier(&self, conversation_id: i64) -> Result<Option<String>, BridgeError> {
        let identifier = self
            .conn
            .prepare_cached(CONVERSATION_IDENTIFIER_SQL)
            .and_then(|mut stmt| {
                stmt.query_row(params![conversation_id], |row| lenient_text(row, 0)).optional()
            })
            .map_err(|err| BridgeError::SourceRead(err.to_string()))?;
        Ok(identifier.flatten())
    }
}

/// `SQLite` columns are dynamically typed; source databases occasionally store numbers
/// as text or text as blobs, so every column is read through `ValueRef`.
fn lenient_text(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(value) => Some(value.to_string()),
        ValueRef::Real(value) => Some(value.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    })
}

#[allow(clippy::cast_precision_loss)]
fn lenient_real(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<f64>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Integer(value) => Some(value as f64),
        ValueRef::Real(value) => Some(value),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes).ok().and_then(|text| text.trim().parse().ok()),
        ValueRef::Null | ValueRef::Blob(_) => None,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn lenient_integer(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<i64>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Integer(value) => Some(value),
        // Saturating cast; NaN maps to zero.
        ValueRef::Real(value) => Some(value.trunc() as i64),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes).ok().and_then(|text| text.trim().parse().ok()),
        ValueRef::Null | ValueRef::Blob(_) => None,
    })
}

fn lenient_blob(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Vec<u8>>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Blob(bytes) | ValueRef::Text(bytes) => Some(bytes.to_vec()),
        ValueRef::Null | ValueRef::Integer(_) | ValueRef::Real(_) => None,
    })
}
