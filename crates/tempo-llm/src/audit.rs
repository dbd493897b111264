//! Defensive serialization for the audit log.
//!
//! Audit rows must always be writable: a value that refuses JSON encoding
//! falls back to its `Debug` representation rather than failing the call
//! that produced it.

use std::fmt::Debug;

use serde::Serialize;
use tracing::warn;

/// Serialize for the audit log: structured JSON when possible, `Debug`
/// otherwise. Never fails.
pub fn safe_serialize<T: Serialize + Debug>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "audit serialization fell back to debug repr");
            format!("{value:?}")
        }
    }
}
