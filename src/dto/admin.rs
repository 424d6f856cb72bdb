//! Payloads of the admin endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    dto::validation::validate_player_name,
    services::turn_coordinator::{AdjudicationReport, ClearStatus},
    state::state_machine::Verdict,
};

/// Optional guard against adjudicating a turn that already moved on.
#[derive(Debug, Default, Deserialize, ToSchema, Validate)]
pub struct AdjudicationRequest {
    /// Rejects the verdict with 409 when this player no longer holds the turn.
    #[validate(custom(function = "validate_player_name"))]
    pub expected_holder: Option<String>,
}

/// Outcome of an accept or fail verdict.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AdjudicationResponse {
    /// Player the verdict was about.
    pub player: String,
    /// Verdict applied.
    pub verdict: Verdict,
    /// Score change requested by the verdict.
    pub delta: i64,
    /// Player's total after the verdict.
    pub points: i64,
    /// The turn had already been scored by an earlier attempt.
    pub duplicate: bool,
    /// Fate of the holder's claim.
    pub clear: ClearStatus,
    /// Player holding the turn afterwards.
    pub next_holder: Option<String>,
    /// Present when the verdict completed only partially.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl From<AdjudicationReport> for AdjudicationResponse {
    fn from(report: AdjudicationReport) -> Self {
        Self {
            player: report.player,
            verdict: report.verdict,
            delta: report.delta,
            points: report.points,
            duplicate: report.duplicate,
            clear: report.clear,
            next_holder: report.next_holder,
            warning: None,
        }
    }
}

/// Register a player ahead of their first buzz.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct JoinPlayerRequest {
    /// Display name, unique across the game.
    #[validate(custom(function = "validate_player_name"))]
    pub name: String,
}

/// Bench or reinstate a player.
#[derive(Debug, Deserialize, ToSchema)]
pub struct EligibilityRequest {
    /// Whether the player may buzz.
    pub eligible: bool,
}

/// Result of clearing every claim.
#[derive(Debug, Serialize, ToSchema)]
pub struct ResetRoundResponse {
    /// Number of player records whose claim was cleared.
    pub cleared: usize,
}

/// Generic acknowledgement for admin actions without a richer payload.
#[derive(Debug, Serialize, ToSchema)]
pub struct ActionResponse {
    /// Human readable summary.
    pub message: String,
}
