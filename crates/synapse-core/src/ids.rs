//! Timestamps and identifier generation.

use chrono::Utc;
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// `<prefix>_<epoch-ms>_<8 hex>`; unique per call.
fn prefixed_id(prefix: &str) -> String {
    let entropy = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", prefix, now_ms(), &entropy[..8])
}

/// A fresh id for one connection attempt.
pub fn session_id() -> String {
    prefixed_id("synapse")
}

pub fn message_id() -> String {
    prefixed_id("msg")
}
