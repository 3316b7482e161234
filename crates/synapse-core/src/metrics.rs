//! Lifetime counters of a session. Never reset.

use serde::Serialize;

use crate::ids::now_ms;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub audio_chunks_sent: u64,
    pub audio_chunks_received: u64,
    pub audio_chunks_dropped: u64,
    pub reconnections: u64,
    pub errors: u64,
    pub tool_calls_expired: u64,
    /// Epoch milliseconds of the last inbound frame or caller activity.
    pub last_activity: i64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            messages_sent: 0,
            messages_received: 0,
            audio_chunks_sent: 0,
            audio_chunks_received: 0,
            audio_chunks_dropped: 0,
            reconnections: 0,
            errors: 0,
            tool_calls_expired: 0,
            last_activity: now_ms(),
        }
    }
}

impl Metrics {
    pub fn touch(&mut self) {
        self.last_activity = now_ms();
    }
}
