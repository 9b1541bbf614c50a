use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use imessage_database::util::typedstream::models::Archivable;
use imessage_database::util::typedstream::parser::TypedStreamReader;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

/// Unix seconds of 2001-01-01T00:00:00Z, the epoch both source databases count from.
pub const REFERENCE_UNIX_SECONDS: i64 = 978_307_200;
pub const INVALID_DATE: &str = "Invalid Date";
pub const NO_CUTOFF: i64 = -1;
pub const REJECTED_DISCONNECT_CAUSE: i64 = 6;

pub const TELEPHONY_SUBSCRIPTION_ID: &str = "1";
pub const TELEPHONY_COMPONENT: &str =
    "com.android.phone/com.android.services.telephony.TelephonyConnectionService";
pub const WHATSAPP_COMPONENT: &str =
    "com.whatsapp/com.whatsapp.calling.telecom.SelfManagedConnectionService";
pub const WHATSAPP_SUBSCRIPTION_SUFFIX: &str = "@s.whatsapp.net";
pub const CALL_PRESENTATION: i64 = 1;

const NANOS_PER_SECOND: i128 = 1_000_000_000;
// 0001-01-01 through 9999-12-31 minus one day, so any display offset stays representable.
const MIN_UNIX_SECONDS: i64 = -62_135_596_800;
const MAX_UNIX_SECONDS: i64 = 253_402_214_400;
const PARENTHESIZED_PATTERN: &str = r"\(.*?\)";

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("input file not found: {}", .0.display())]
    MissingInput(PathBuf),
    #[error("source read error: {0}")]
    SourceRead(String),
    #[error("row {row_id}: {reason}")]
    RowConversion { row_id: i64, reason: String },
    #[error("failed to write {}: {reason}", path.display())]
    OutputWrite { path: PathBuf, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TimestampError {
    #[error("timestamp is missing")]
    Missing,
    #[error("timestamp is not a finite number")]
    NotFinite,
    #[error("timestamp {0} is outside the supported calendar range")]
    OutOfRange(String),
    #[error("failed to render timestamp: {0}")]
    Format(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DecodeError {
    #[error("blob is not a typedstream archive")]
    NotTypedStream,
    #[error("archive holds no string payload")]
    NoStringPayload,
    #[error("malformed typedstream: {0}")]
    Malformed(String),
}

/// Raw epoch value read from a source database, tagged with its unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceEpoch {
    /// Fractional seconds since the reference instant (`ZCALLRECORD.ZDATE`).
    CallSeconds(f64),
    /// Nanoseconds since the reference instant (`message.date`).
    MessageNanoseconds(i64),
}

/// Time zone used to render `readable_date` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayZone {
    /// The host's zone, resolved per instant so daylight saving is honoured.
    #[default]
    Local,
    Fixed(UtcOffset),
}

impl DisplayZone {
    #[must_use]
    pub fn utc() -> Self {
        Self::Fixed(UtcOffset::UTC)
    }

    /// Parse `local`, `utc`/`Z`, or a signed `+HH:MM` offset.
    ///
    /// # Errors
    /// Returns [`BridgeError::Config`] when the value is none of the accepted forms.
    pub fn parse(value: &str) -> Result<Self, BridgeError> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("local") {
            return Ok(Self::Local);
        }
        if trimmed.eq_ignore_ascii_case("utc") || trimmed == "Z" {
            return Ok(Self::utc());
        }
        UtcOffset::parse(trimmed, format_description!("[offset_hour sign:mandatory]:[offset_minute]"))
            .map(Self::Fixed)
            .map_err(|err| BridgeError::Config(format!("invalid UTC offset `{trimmed}`: {err}")))
    }

    fn offset_at(self, instant: OffsetDateTime) -> UtcOffset {
        match self {
            Self::Fixed(offset) => offset,
            Self::Local => UtcOffset::local_offset_at(instant).unwrap_or(UtcOffset::UTC),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalTimestamp {
    pub millis: i64,
    pub display: String,
}

impl CanonicalTimestamp {
    #[must_use]
    pub fn invalid() -> Self {
        Self { millis: 0, display: INVALID_DATE.to_string() }
    }
}

/// Convert a source epoch into Unix milliseconds plus its display rendering.
///
/// Sub-second precision is truncated toward zero before scaling to milliseconds.
///
/// # Errors
/// Returns [`TimestampError`] when the value is not finite or lands outside the calendar range.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn normalize_timestamp(
    epoch: SourceEpoch,
    zone: DisplayZone,
) -> Result<CanonicalTimestamp, TimestampError> {
    let unix_seconds = match epoch {
        SourceEpoch::CallSeconds(seconds) => {
            if !seconds.is_finite() {
                return Err(TimestampError::NotFinite);
            }
            let absolute = (seconds + REFERENCE_UNIX_SECONDS as f64).trunc();
            if absolute < MIN_UNIX_SECONDS as f64 || absolute > MAX_UNIX_SECONDS as f64 {
                return Err(TimestampError::OutOfRange(seconds.to_string()));
            }
            absolute as i64
        }
        SourceEpoch::MessageNanoseconds(nanos) => {
            let absolute = i128::from(nanos) + i128::from(REFERENCE_UNIX_SECONDS) * NANOS_PER_SECOND;
            i64::try_from(absolute / NANOS_PER_SECOND)
                .map_err(|_| TimestampError::OutOfRange(nanos.to_string()))?
        }
    };

    if !(MIN_UNIX_SECONDS..=MAX_UNIX_SECONDS).contains(&unix_seconds) {
        return Err(TimestampError::OutOfRange(unix_seconds.to_string()));
    }

    let instant = OffsetDateTime::from_unix_timestamp(unix_seconds)
        .map_err(|err| TimestampError::OutOfRange(err.to_string()))?;
    let display = render_display(instant, zone)?;
    let millis = unix_seconds
        .checked_mul(1000)
        .ok_or_else(|| TimestampError::OutOfRange(unix_seconds.to_string()))?;

    Ok(CanonicalTimestamp { millis, display })
}

/// Best-effort variant used by the row normalizers: failures degrade to
/// [`CanonicalTimestamp::invalid`] and are logged with the row id.
#[must_use]
pub fn normalize_timestamp_or_invalid(
    row_id: i64,
    epoch: Option<SourceEpoch>,
    zone: DisplayZone,
) -> CanonicalTimestamp {
    let result = epoch.ok_or(TimestampError::Missing).and_then(|epoch| normalize_timestamp(epoch, zone));
    match result {
        Ok(timestamp) => timestamp,
        Err(err) => {
            let err = BridgeError::RowConversion { row_id, reason: format!("date conversion failed: {err}") };
            tracing::warn!("{err}");
            CanonicalTimestamp::invalid()
        }
    }
}

/// Render Unix milliseconds the way `readable_date` columns are written.
///
/// # Errors
/// Returns [`TimestampError`] when the value is outside the calendar range.
pub fn render_unix_millis(millis: i64, zone: DisplayZone) -> Result<String, TimestampError> {
    let seconds = millis.div_euclid(1000);
    if !(MIN_UNIX_SECONDS..=MAX_UNIX_SECONDS).contains(&seconds) {
        return Err(TimestampError::OutOfRange(millis.to_string()));
    }
    let instant = OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|err| TimestampError::OutOfRange(err.to_string()))?;
    render_display(instant, zone)
}

fn render_display(instant: OffsetDateTime, zone: DisplayZone) -> Result<String, TimestampError> {
    let local = instant.to_offset(zone.offset_at(instant));
    local
        .format(format_description!(
            "[day] [month repr:short] [year] [hour repr:12 padding:none]:[minute]:[second] [period case:lower]"
        ))
        .map_err(|err| TimestampError::Format(err.to_string()))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Unknown,
    Incoming,
    Outgoing,
    Missed,
    Rejected,
}

impl CallType {
    /// Numeric code used by the target call-log schema.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Incoming => 1,
            Self::Outgoing => 2,
            Self::Missed => 3,
            Self::Rejected => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CallDirection {
    Incoming,
    Outgoing,
    Unknown,
}

impl CallDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incoming => "Incoming",
            Self::Outgoing => "Outgoing",
            Self::Unknown => "Unknown",
        }
    }
}

/// Derive the call type and direction label from the `ZORIGINATED`, `ZANSWERED`
/// and `ZDISCONNECTED_CAUSE` columns.
///
/// A disconnect cause of 6 always yields [`CallType::Rejected`]; the direction label is
/// left as derived from `originated`.
#[must_use]
pub fn classify_call(
    originated: Option<i64>,
    answered: Option<i64>,
    disconnected_cause: Option<i64>,
) -> (CallType, CallDirection) {
    let (call_type, direction) = match originated {
        Some(0) if answered == Some(0) => (CallType::Missed, CallDirection::Incoming),
        Some(0) => (CallType::Incoming, CallDirection::Incoming),
        Some(1) => (CallType::Outgoing, CallDirection::Outgoing),
        _ => (CallType::Unknown, CallDirection::Unknown),
    };

    if disconnected_cause == Some(REJECTED_DISCONNECT_CAUSE) {
        return (CallType::Rejected, direction);
    }
    (call_type, direction)
}

/// Rules applied to message counterparty identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterpartyRules {
    pub country_prefix: String,
    /// The prefix is removed only from identifiers shorter than this many characters.
    pub short_number_limit: usize,
    pub self_placeholder: String,
    pub missing_handle: String,
}

impl Default for CounterpartyRules {
    fn default() -> Self {
        Self {
            country_prefix: "+91".to_string(),
            short_number_limit: 13,
            self_placeholder: "Me".to_string(),
            missing_handle: "Not found".to_string(),
        }
    }
}

/// Per-run settings handed to the normalizers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunConfig {
    /// Operator's own number, used for WhatsApp subscription ids.
    pub self_number: String,
    pub display_zone: DisplayZone,
    pub counterparty: CounterpartyRules,
}

/// One `ZCALLRECORD` row as read from the call history database.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawCallRow {
    pub row_id: i64,
    pub address: Option<String>,
    pub duration: Option<f64>,
    pub date: Option<f64>,
    pub originated: Option<i64>,
    pub answered: Option<i64>,
    pub disconnected_cause: Option<i64>,
    pub service_provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: i64,
    pub counterparty_id: String,
    pub duration_seconds: i64,
    pub timestamp_ms: i64,
    pub timestamp_display: String,
    pub call_type: CallType,
    pub direction: CallDirection,
    pub presentation: i64,
    pub subscription_id: String,
    pub subscription_component: String,
    pub service_provider: String,
}

/// Normalize one call row. Calls are never dropped: bad dates degrade to
/// [`CanonicalTimestamp::invalid`].
#[must_use]
pub fn normalize_call(row: RawCallRow, config: &RunConfig) -> CallRecord {
    let timestamp = normalize_timestamp_or_invalid(
        row.row_id,
        row.date.map(SourceEpoch::CallSeconds),
        config.display_zone,
    );
    let (call_type, direction) = classify_call(row.originated, row.answered, row.disconnected_cause);
    let service_provider = row.service_provider.unwrap_or_default();

    let (subscription_id, subscription_component) =
        if service_provider.to_lowercase().contains("whatsapp") {
            (
                format!("{}{WHATSAPP_SUBSCRIPTION_SUFFIX}", config.self_number),
                WHATSAPP_COMPONENT.to_string(),
            )
        } else {
            (TELEPHONY_SUBSCRIPTION_ID.to_string(), TELEPHONY_COMPONENT.to_string())
        };

    CallRecord {
        id: row.row_id,
        counterparty_id: row.address.unwrap_or_default(),
        duration_seconds: round_duration(row.duration),
        timestamp_ms: timestamp.millis,
        timestamp_display: timestamp.display,
        call_type,
        direction,
        presentation: CALL_PRESENTATION,
        subscription_id,
        subscription_component,
        service_provider,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn round_duration(duration: Option<f64>) -> i64 {
    match duration {
        Some(seconds) if seconds.is_finite() && seconds > 0.0 => {
            // `as` saturates for values beyond i64.
            seconds.round_ties_even() as i64
        }
        _ => 0,
    }
}

/// Order calls by timestamp; equal timestamps keep their extraction order.
#[must_use]
pub fn reconcile_calls(mut records: Vec<CallRecord>) -> Vec<CallRecord> {
    records.sort_by_key(|record| record.timestamp_ms);
    records
}

/// Capability that turns an `attributedBody` blob into plain text.
pub trait ArchiveDecoder {
    /// # Errors
    /// Returns [`DecodeError`] when the blob holds no recoverable string.
    fn decode(&self, blob: &[u8]) -> Result<String, DecodeError>;
}

/// Reads the text of an `NSString`/`NSMutableString` archived as an `attributedBody`
/// typedstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypedStreamDecoder;

impl TypedStreamDecoder {
    const SIGNATURE: &'static [u8] = b"streamtyped";
}

impl ArchiveDecoder for TypedStreamDecoder {
    fn decode(&self, blob: &[u8]) -> Result<String, DecodeError> {
        if blob.get(2..2 + Self::SIGNATURE.len()) != Some(Self::SIGNATURE) {
            return Err(DecodeError::NotTypedStream);
        }

        let components = TypedStreamReader::from(blob)
            .parse()
            .map_err(|err| DecodeError::Malformed(err.to_string()))?;
        components
            .iter()
            .find_map(Archivable::as_nsstring)
            .map(ToString::to_string)
            .ok_or(DecodeError::NoStringPayload)
    }
}

/// Read-only lookups used to resolve the counterparty of self-sent messages.
pub trait ConversationLookup {
    /// Conversation (chat) id that the message belongs to.
    ///
    /// # Errors
    /// Returns [`BridgeError::SourceRead`] when the lookup query fails.
    fn conversation_for_message(&self, message_id: i64) -> Result<Option<i64>, BridgeError>;

    /// Display identifier of a conversation.
    ///
    /// # Errors
    /// Returns [`BridgeError::SourceRead`] when the lookup query fails.
    fn conversation_identifier(&self, conversation_id: i64) -> Result<Option<String>, BridgeError>;
}

/// Follow message -> conversation -> conversation identifier. Any missing link or
/// lookup failure yields the configured self placeholder.
#[must_use]
pub fn resolve_self_sent_identifier(
    message_id: i64,
    lookup: &dyn ConversationLookup,
    rules: &CounterpartyRules,
) -> String {
    let resolved = lookup.conversation_for_message(message_id).and_then(|conversation_id| {
        match conversation_id {
            Some(conversation_id) => lookup.conversation_identifier(conversation_id),
            None => Ok(None),
        }
    });

    match resolved {
        Ok(Some(identifier)) => identifier,
        Ok(None) => rules.self_placeholder.clone(),
        Err(err) => {
            tracing::warn!("error getting chat identifier for message {message_id}: {err}");
            rules.self_placeholder.clone()
        }
    }
}

/// One `message` row joined with its `handle` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawMessageRow {
    pub row_id: i64,
    pub date: Option<i64>,
    pub text: Option<String>,
    pub attributed_body: Option<Vec<u8>>,
    pub handle_identifier: Option<String>,
    pub is_from_me: i64,
    pub room_name: Option<String>,
    pub service: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub timestamp_ms: i64,
    pub timestamp_display: String,
    pub body: String,
    pub counterparty_id: String,
    pub is_from_self: bool,
    pub room_name: String,
    pub service: String,
}

impl MessageRecord {
    fn same_event(&self, other: &Self) -> bool {
        self.timestamp_ms == other.timestamp_ms
            && self.body == other.body
            && self.counterparty_id == other.counterparty_id
            && self.is_from_self == other.is_from_self
    }

    fn dedup_order(lhs: &Self, rhs: &Self) -> Ordering {
        lhs.timestamp_ms
            .cmp(&rhs.timestamp_ms)
            .then_with(|| lhs.body.cmp(&rhs.body))
            .then_with(|| lhs.counterparty_id.cmp(&rhs.counterparty_id))
            .then_with(|| lhs.is_from_self.cmp(&rhs.is_from_self))
            .then_with(|| rhs.service.cmp(&lhs.service))
    }
}

pub struct MessageNormalizer<'a> {
    config: &'a RunConfig,
    decoder: &'a dyn ArchiveDecoder,
    parenthesized: Regex,
}

impl<'a> MessageNormalizer<'a> {
    /// # Errors
    /// Returns [`BridgeError::Config`] when the identifier cleanup pattern cannot be compiled.
    pub fn new(config: &'a RunConfig, decoder: &'a dyn ArchiveDecoder) -> Result<Self, BridgeError> {
        let parenthesized = Regex::new(PARENTHESIZED_PATTERN)
            .map_err(|err| BridgeError::Config(format!("invalid identifier pattern: {err}")))?;
        Ok(Self { config, decoder, parenthesized })
    }

    /// Normalize one message row, or `None` when no body can be recovered.
    pub fn normalize(
        &self,
        row: RawMessageRow,
        lookup: &dyn ConversationLookup,
    ) -> Option<MessageRecord> {
        let body = self.resolve_body(&row)?;
        let counterparty_id = self.resolve_counterparty(&row, lookup);
        let timestamp = normalize_timestamp_or_invalid(
            row.row_id,
            row.date.map(SourceEpoch::MessageNanoseconds),
            self.config.display_zone,
        );

        Some(MessageRecord {
            id: row.row_id,
            timestamp_ms: timestamp.millis,
            timestamp_display: timestamp.display,
            body,
            counterparty_id,
            is_from_self: row.is_from_me == 1,
            room_name: row.room_name.unwrap_or_default(),
            service: row.service.unwrap_or_default(),
        })
    }

    fn resolve_body(&self, row: &RawMessageRow) -> Option<String> {
        if let Some(text) = &row.text {
            return Some(text.clone());
        }

        let Some(blob) = &row.attributed_body else {
            tracing::debug!("message {} has neither text nor attributedBody; skipped", row.row_id);
            return None;
        };

        match self.decoder.decode(blob) {
            Ok(body) => Some(body),
            Err(err) => {
                let err = BridgeError::RowConversion {
                    row_id: row.row_id,
                    reason: format!("error decoding attributedBody: {err}"),
                };
                tracing::warn!("{err}; message skipped");
                None
            }
        }
    }

    fn resolve_counterparty(&self, row: &RawMessageRow, lookup: &dyn ConversationLookup) -> String {
        let rules = &self.config.counterparty;
        let raw = match (&row.handle_identifier, row.is_from_me == 1) {
            (None, true) => resolve_self_sent_identifier(row.row_id, lookup, rules),
            (Some(identifier), _) => identifier.clone(),
            (None, false) => rules.missing_handle.clone(),
        };
        self.clean_identifier(&raw)
    }

    /// Strip parenthesized fragments, trim, and drop the country prefix from short numbers.
    #[must_use]
    pub fn clean_identifier(&self, raw: &str) -> String {
        let stripped = self.parenthesized.replace_all(raw, "");
        let trimmed = stripped.trim();
        let rules = &self.config.counterparty;

        if !rules.country_prefix.is_empty() && trimmed.chars().count() < rules.short_number_limit {
            if let Some(rest) = trimmed.strip_prefix(rules.country_prefix.as_str()) {
                return rest.to_string();
            }
        }
        trimmed.to_string()
    }
}

/// Lower bound for incremental message exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Cutoff {
    #[default]
    Unbounded,
    After(i64),
}

impl Cutoff {
    /// Map a raw value where [`NO_CUTOFF`] means "keep everything".
    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        if millis == NO_CUTOFF {
            Self::Unbounded
        } else {
            Self::After(millis)
        }
    }

    /// Round to the nearest whole second (ties to even), matching the precision of
    /// exported timestamps. [`Cutoff::Unbounded`] is left alone.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn rounded_to_second(self) -> Self {
        match self {
            Self::Unbounded => Self::Unbounded,
            Self::After(millis) => {
                let seconds = (millis as f64 / 1000.0).round_ties_even() as i64;
                Self::After(seconds.saturating_mul(1000))
            }
        }
    }

    /// Parse operator input: empty means no cutoff, otherwise an integer in milliseconds.
    ///
    /// # Errors
    /// Returns [`BridgeError::Config`] when the input is not an integer.
    pub fn parse_input(input: &str) -> Result<Self, BridgeError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self::Unbounded);
        }
        trimmed
            .parse::<i64>()
            .map(|millis| Self::from_millis(millis).rounded_to_second())
            .map_err(|err| BridgeError::Config(format!("invalid cutoff `{trimmed}`: {err}")))
    }

    #[must_use]
    pub fn retains(self, timestamp_ms: i64) -> bool {
        match self {
            Self::Unbounded => true,
            Self::After(cutoff) => timestamp_ms > cutoff,
        }
    }
}

impl Display for Cutoff {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unbounded => write!(f, "none"),
            Self::After(millis) => write!(f, "{millis}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub total: usize,
    pub written: usize,
    pub skipped: usize,
}

/// Deduplicate, order, and cutoff-filter normalized messages.
///
/// Rows sharing `(timestamp_ms, body, counterparty_id, is_from_self)` collapse to the one
/// that sorts last when `service` is ordered descending. The result is ordered by
/// `timestamp_ms`; `stats.total` counts rows after deduplication.
#[must_use]
pub fn reconcile_messages(
    mut records: Vec<MessageRecord>,
    cutoff: Cutoff,
) -> (Vec<MessageRecord>, ReconcileStats) {
    records.sort_by(MessageRecord::dedup_order);

    let mut deduped: Vec<MessageRecord> = Vec::with_capacity(records.len());
    for record in records {
        match deduped.last_mut() {
            Some(last) if last.same_event(&record) => *last = record,
            _ => deduped.push(record),
        }
    }

    deduped.sort_by_key(|record| record.timestamp_ms);
    let total = deduped.len();
    deduped.retain(|record| cutoff.retains(record.timestamp_ms));
    let written = deduped.len();

    (deduped, ReconcileStats { total, written, skipped: total - written })
}
