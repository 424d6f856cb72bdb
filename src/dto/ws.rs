//! Messages exchanged with player WebSocket clients.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use validator::ValidationErrors;

use crate::dto::{player::BuzzOutcome, validation::validate_player_name};

#[derive(Debug, Deserialize, Serialize, ToSchema)]
/// Messages accepted from player WebSocket clients.
#[serde(tag = "type")]
pub enum PlayerInboundMessage {
    /// Bind the socket to a player.
    #[serde(rename = "identification")]
    Identification {
        /// Display name of the player.
        name: String,
    },
    /// Claim the turn.
    #[serde(rename = "buzz")]
    Buzz,
    /// Any other `type`; ignored.
    #[serde(other)]
    Unknown,
}

/// Why a text frame was rejected.
#[derive(Debug, Error)]
pub enum InboundMessageError {
    /// Not JSON, or not one of the known shapes.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The identification carried an unusable name.
    #[error("invalid player name: {0}")]
    InvalidName(ValidationErrors),
}

impl PlayerInboundMessage {
    /// Parse a text frame, validating the player name of identification messages.
    pub fn from_json_str(text: &str) -> Result<Self, InboundMessageError> {
        let message: Self = serde_json::from_str(text)?;
        if let Self::Identification { name } = &message {
            validate_player_name(name).map_err(|err| {
                let mut errors = ValidationErrors::new();
                errors.add("name", err);
                InboundMessageError::InvalidName(errors)
            })?;
        }
        Ok(message)
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Messages pushed to player WebSocket clients.
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerOutboundMessage {
    /// Identification accepted.
    Ack {
        /// Name the socket is bound to.
        name: String,
    },
    /// Result of this player's buzz.
    BuzzFeedback {
        /// How the buzz was handled.
        outcome: BuzzOutcome,
        /// Set when the player's claim for this round was already rejected.
        failed: bool,
    },
    /// Holder changed. `can_answer` is true only on the holder's own sockets.
    Turn {
        /// Player holding the turn.
        holder: Option<String>,
        /// Whether this socket's player may answer now.
        can_answer: bool,
        /// Deadline in store time, epoch milliseconds.
        deadline_ms: Option<i64>,
        /// Store time when the message was built.
        server_now_ms: i64,
        /// Whole seconds left on the countdown.
        remaining_seconds: u64,
    },
    /// The last message could not be handled.
    Error {
        /// What went wrong.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identification_name_is_validated() {
        assert!(matches!(
            PlayerInboundMessage::from_json_str(r#"{"type":"identification","name":"alice"}"#),
            Ok(PlayerInboundMessage::Identification { .. })
        ));
        assert!(matches!(
            PlayerInboundMessage::from_json_str(r#"{"type":"identification","name":"  "}"#),
            Err(InboundMessageError::InvalidName(_))
        ));
    }

    #[test]
    fn unknown_types_are_tolerated() {
        assert!(matches!(
            PlayerInboundMessage::from_json_str(r#"{"type":"dance"}"#),
            Ok(PlayerInboundMessage::Unknown)
        ));
        assert!(matches!(
            PlayerInboundMessage::from_json_str(r#"{"type":"buzz"}"#),
            Ok(PlayerInboundMessage::Buzz)
        ));
    }
}
