//! Parsing of container runtime timestamps.
//!
//! The runtime reports `StartedAt`/`FinishedAt` as RFC 3339 strings with up to
//! nanosecond precision, e.g. `2024-03-01T10:00:00.123456789Z`. A container
//! that never started (or never finished) reports the zero time
//! `0001-01-01T00:00:00Z` instead of omitting the field.

use crate::{Error, Result};
use chrono::{DateTime, Utc};

/// The runtime's "never happened" value.
pub const UNSET_TIMESTAMP: &str = "0001-01-01T00:00:00Z";

/// Parse a runtime timestamp; the unset sentinel maps to `None`.
pub fn parse_runtime_timestamp(raw: &str) -> Result<Option<DateTime<Utc>>> {
    let raw = raw.trim();
    if raw.is_empty() || raw == UNSET_TIMESTAMP {
        return Ok(None);
    }

    DateTime::parse_from_rfc3339(raw)
        .map(|ts| Some(ts.with_timezone(&Utc)))
        .map_err(|e| Error::InvalidTimestamp(format!("{raw}: {e}")))
}

/// Render a timestamp back into the runtime's wire format.
pub fn format_runtime_timestamp(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        None => UNSET_TIMESTAMP.to_string(),
    }
}
