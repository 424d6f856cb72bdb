use std::time::SystemTime;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Adjudication and roster payloads.
pub mod admin;
/// Health check payloads.
pub mod health;
/// Buzz payloads.
pub mod player;
/// Server-Sent Events payloads.
pub mod sse;
/// Turn, roster and score read models.
pub mod turn;
/// Player name rules.
pub mod validation;
/// WebSocket messages.
pub mod ws;

fn format_system_time(time: SystemTime) -> String {
    OffsetDateTime::from(time)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "invalid-timestamp".into())
}
