//! Wall-clock time handling.
//!
//! Task instants are local naive datetimes: the LLM speaks ISO local time
//! and the original schedule is a personal, single-timezone artifact. All
//! parsing of model output goes through [`safe_parse_iso`], which never
//! fails loudly: a bad string becomes `None` and the caller falls back.

use std::str::FromStr;

use chrono::{DateTime, Days, Duration, Local, NaiveDate, NaiveDateTime};

/// Storage format for SQLite TEXT datetime columns.
const STORE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Current local wall-clock time, naive.
pub fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Parse an ISO-8601-ish datetime string from an untrusted source.
///
/// Accepts plain local datetimes (`2025-10-01T09:00:00`, with or without
/// fractional seconds), RFC 3339 with an offset (converted to local naive),
/// and bare dates (midnight). Anything else is `None`.
pub fn safe_parse_iso(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = NaiveDateTime::from_str(trimmed) {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Local).naive_local());
    }
    if let Ok(date) = NaiveDate::from_str(trimmed) {
        return date.and_hms_opt(0, 0, 0);
    }
    None
}

/// Encode a datetime for a SQLite TEXT column.
pub fn encode_ts(ts: &NaiveDateTime) -> String {
    ts.format(STORE_FORMAT).to_string()
}

/// Second-precision ISO rendering for LLM prompts and API payloads.
pub fn format_iso(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Decode a datetime from a SQLite TEXT column.
///
/// Rows only ever contain values written by [`encode_ts`], but a hand-edited
/// database should not panic the process, so this degrades like
/// [`safe_parse_iso`].
pub fn decode_ts(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, STORE_FORMAT)
        .ok()
        .or_else(|| safe_parse_iso(raw))
}

// ---------------------------------------------------------------------------
// Fallback window
// ---------------------------------------------------------------------------

/// Deterministic schedule window used when the LLM has not been consulted
/// (task creation) or returned unparseable times.
#[derive(Debug, Clone, Copy)]
pub struct FallbackWindow {
    /// Hour of day the window opens, 0..=23.
    pub start_hour: u32,
    /// Window length in hours.
    pub duration_hours: i64,
}

impl FallbackWindow {
    /// Compute the window relative to `now`: today at `start_hour`, pushed
    /// to the same clock tomorrow once that instant has passed.
    pub fn window(&self, now: NaiveDateTime) -> (NaiveDateTime, NaiveDateTime) {
        let midnight = now.date().and_hms_opt(0, 0, 0).unwrap_or(now);
        let mut start = midnight + Duration::hours(i64::from(self.start_hour));
        if start < now {
            start = start
                .checked_add_days(Days::new(1))
                .unwrap_or(start + Duration::hours(24));
        }
        let end = start + Duration::hours(self.duration_hours);
        (start, end)
    }
}
