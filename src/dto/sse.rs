//! Payloads carried on the Server-Sent Events streams.

use serde::Serialize;
use utoipa::ToSchema;

use crate::services::reconciliation::FeedHealth;

#[derive(Clone, Debug)]
/// Dispatched payload carried across SSE channels.
pub struct ServerEvent {
    /// SSE event name; omitted for plain messages.
    pub event: Option<String>,
    /// Serialized payload.
    pub data: String,
}

impl ServerEvent {
    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }

    /// Wrap an already serialized payload.
    pub fn new(event: Option<String>, data: String) -> Self {
        Self { event, data }
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Token issued to the admin stream; required in `X-Admin-Token` on admin routes.
pub struct AdminHandshake {
    /// Token value.
    pub token: String,
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast when degraded mode or the store feed health changes.
pub struct SystemStatus {
    /// Whether the store is unreachable.
    pub degraded: bool,
    /// Change feed state, absent while degraded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<FeedHealth>,
}

#[derive(Debug, Serialize, ToSchema)]
/// Admin-only notice that a verdict was scored but its claim is still being cleared.
pub struct AdjudicationWarningEvent {
    /// Player the verdict was about.
    pub player: String,
    /// Human readable explanation.
    pub message: String,
}
