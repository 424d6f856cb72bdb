//! Payloads of the buzz endpoint and socket message.

use serde::Serialize;
use utoipa::ToSchema;

use crate::{dao::models::epoch_millis, services::buzz_gateway::ClaimOutcome};

/// How a buzz was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BuzzOutcome {
    /// The claim was recorded.
    Accepted,
    /// The player already had a claim this round.
    AlreadyHeld,
    /// The player is benched or unknown.
    NotEligible,
}

/// Answer to a buzz, over REST or the player socket.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BuzzResponse {
    /// How the buzz was handled.
    pub outcome: BuzzOutcome,
    /// Set when the player's claim for this round was already rejected.
    pub failed: bool,
    /// Store time of the recorded claim, in epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    /// Human readable summary.
    pub message: String,
}

impl From<ClaimOutcome> for BuzzResponse {
    fn from(outcome: ClaimOutcome) -> Self {
        match outcome {
            ClaimOutcome::Accepted { started_at } => Self {
                outcome: BuzzOutcome::Accepted,
                failed: false,
                started_at_ms: Some(epoch_millis(started_at)),
                message: "buzz registered".into(),
            },
            ClaimOutcome::AlreadyHeld { failed: true } => Self {
                outcome: BuzzOutcome::AlreadyHeld,
                failed: true,
                started_at_ms: None,
                message: "your answer was already rejected this round".into(),
            },
            ClaimOutcome::AlreadyHeld { failed: false } => Self {
                outcome: BuzzOutcome::AlreadyHeld,
                failed: false,
                started_at_ms: None,
                message: "you already buzzed".into(),
            },
            ClaimOutcome::NotEligible => Self {
                outcome: BuzzOutcome::NotEligible,
                failed: false,
                started_at_ms: None,
                message: "you are not part of this game".into(),
            },
        }
    }
}
