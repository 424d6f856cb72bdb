//! Payload of the health check.

use serde::Serialize;
use utoipa::ToSchema;

use crate::services::reconciliation::FeedHealth;

/// Simple health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// State of the store change feed, absent while degraded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<FeedHealth>,
}

impl HealthResponse {
    /// Store reachable.
    pub fn ok(feed: Option<FeedHealth>) -> Self {
        Self {
            status: "ok".to_string(),
            feed,
        }
    }

    /// Store unreachable; the engine runs in degraded mode.
    pub fn degraded() -> Self {
        Self {
            status: "degraded".to_string(),
            feed: None,
        }
    }
}
