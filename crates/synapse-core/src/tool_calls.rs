//! Correlation of remote tool invocations with the caller's responses.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::context::ContextPatch;
use crate::ids::now_ms;

/// A request from the peer for the client to perform a named action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub tool_type: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextPatch>,
    #[serde(default = "now_ms")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResponse {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

impl ToolCallResponse {
    pub fn success(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
            timestamp: now_ms(),
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
            timestamp: now_ms(),
        }
    }
}

struct PendingToolCall {
    call: ToolCall,
    registered_at: Instant,
}

/// Outstanding tool calls keyed by id.
///
/// Entries leave the registry when answered or when they outlive the TTL
/// passed to [`ToolCallRegistry::evict_expired`].
#[derive(Default)]
pub struct ToolCallRegistry {
    pending: HashMap<String, PendingToolCall>,
}

impl ToolCallRegistry {
    /// Registers a call; returns the entry it replaced if the id was reused.
    pub fn register(&mut self, call: ToolCall, now: Instant) -> Option<ToolCall> {
        self.pending
            .insert(
                call.id.clone(),
                PendingToolCall {
                    call,
                    registered_at: now,
                },
            )
            .map(|previous| previous.call)
    }

    pub fn take(&mut self, id: &str) -> Option<ToolCall> {
        self.pending.remove(id).map(|pending| pending.call)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending calls, oldest first.
    pub fn pending(&self) -> Vec<ToolCall> {
        let mut entries: Vec<&PendingToolCall> = self.pending.values().collect();
        entries.sort_by_key(|pending| pending.registered_at);
        entries.into_iter().map(|pending| pending.call.clone()).collect()
    }

    /// Removes and returns every call registered more than `ttl` ago.
    pub fn evict_expired(&mut self, now: Instant, ttl: Duration) -> Vec<ToolCall> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.registered_at) >= ttl)
            .map(|(id, _)| id.clone())
            .collect();
        expired.into_iter().filter_map(|id| self.take(&id)).collect()
    }
}
