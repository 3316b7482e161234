//! Ping/pong liveness tracking and the derived connection quality.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Round trips at or below this are rated excellent.
const EXCELLENT_ROUND_TRIP: Duration = Duration::from_millis(250);

/// Soft liveness indicator. Independent from `ConnectionStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Poor,
    Good,
    Excellent,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    timeout: Duration,
    /// Send time of the oldest ping still waiting for a pong.
    unanswered_since: Option<Instant>,
    last_ping: Option<Instant>,
    last_round_trip: Option<Duration>,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            unanswered_since: None,
            last_ping: None,
            last_round_trip: None,
        }
    }

    /// Forgets all samples; called whenever a new transport goes live.
    pub fn reset(&mut self) {
        self.unanswered_since = None;
        self.last_ping = None;
        self.last_round_trip = None;
    }

    pub fn record_ping(&mut self, now: Instant) {
        self.last_ping = Some(now);
        self.unanswered_since.get_or_insert(now);
    }

    pub fn record_pong(&mut self, now: Instant) {
        if let Some(sent) = self.last_ping {
            self.last_round_trip = Some(now.saturating_duration_since(sent));
        }
        self.unanswered_since = None;
    }

    pub fn quality(&self, now: Instant) -> ConnectionQuality {
        if let Some(since) = self.unanswered_since {
            if now.saturating_duration_since(since) >= self.timeout {
                return ConnectionQuality::Poor;
            }
        }
        match self.last_round_trip {
            Some(rtt) if rtt <= EXCELLENT_ROUND_TRIP => ConnectionQuality::Excellent,
            _ => ConnectionQuality::Good,
        }
    }
}
