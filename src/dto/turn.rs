//! Read models of the turn, the roster and the scores.

use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dao::models::{PlayerTurnRecord, ScoreRecord, epoch_millis},
    dto::format_system_time,
    services::turn_coordinator::{PhaseKind, TurnView},
    state::{election::queue_order, state_machine::Verdict},
};

/// Current turn as seen by every client.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TurnSnapshotResponse {
    /// Player currently answering.
    pub holder: Option<String>,
    /// Deadline in store time, epoch milliseconds.
    pub deadline_ms: Option<i64>,
    /// Deadline formatted as RFC 3339.
    pub deadline: Option<String>,
    /// Store time when the snapshot was taken; clients derive their drift from it.
    pub server_now_ms: i64,
    /// Whole seconds left on the countdown.
    pub remaining_seconds: u64,
    /// Coarse phase.
    pub phase: PhaseKind,
    /// Verdict being written while resolving.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// Bumped on every phase change.
    pub version: usize,
}

impl From<TurnView> for TurnSnapshotResponse {
    fn from(view: TurnView) -> Self {
        Self {
            holder: view.holder,
            deadline_ms: view.deadline.map(epoch_millis),
            deadline: view.deadline.map(format_system_time),
            server_now_ms: epoch_millis(view.server_now),
            remaining_seconds: view.remaining_seconds,
            phase: view.phase,
            verdict: view.verdict,
            version: view.version,
        }
    }
}

/// Countdown tick, sent every second while a turn runs.
#[derive(Debug, Serialize, ToSchema)]
pub struct TurnTickEvent {
    /// Player answering.
    pub holder: String,
    /// Whole seconds left.
    pub remaining_seconds: u64,
}

/// Sent once when the holder's countdown reaches zero.
#[derive(Debug, Serialize, ToSchema)]
pub struct TurnExpiredEvent {
    /// Player whose turn expired.
    pub holder: String,
}

/// One player's turn record.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PlayerSummary {
    /// Record id.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Whether the player may buzz.
    pub is_eligible: bool,
    /// Whether the player holds a claim this round.
    pub has_buzzed: bool,
    /// Whether that claim was answered wrong.
    pub has_failed: bool,
    /// Store time of the claim, epoch milliseconds.
    pub turn_started_at_ms: Option<i64>,
}

impl From<&PlayerTurnRecord> for PlayerSummary {
    fn from(record: &PlayerTurnRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            is_eligible: record.is_eligible,
            has_buzzed: record.has_buzzed,
            has_failed: record.has_failed,
            turn_started_at_ms: record.turn_started_at.map(epoch_millis),
        }
    }
}

/// Players grouped by claim state. `queued` is in turn order; its head holds the turn.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PlayersBoard {
    /// Live claims in turn order.
    pub queued: Vec<PlayerSummary>,
    /// Players already failed this round, by name.
    pub failed: Vec<PlayerSummary>,
    /// Everyone else, by name.
    pub idle: Vec<PlayerSummary>,
}

impl PlayersBoard {
    /// Group raw records.
    pub fn from_records(records: &[PlayerTurnRecord]) -> Self {
        let queued: Vec<PlayerSummary> = queue_order(records)
            .into_iter()
            .map(PlayerSummary::from)
            .collect();
        let mut failed = Vec::new();
        let mut idle = Vec::new();
        for record in records {
            if record.has_failed {
                failed.push(PlayerSummary::from(record));
            } else if !queued.iter().any(|entry| entry.id == record.id) {
                idle.push(PlayerSummary::from(record));
            }
        }
        failed.sort_by(|a, b| a.name.cmp(&b.name));
        idle.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            queued,
            failed,
            idle,
        }
    }
}

/// One row of the score table.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScoreEntry {
    /// Player name.
    pub player: String,
    /// Total points.
    pub points: i64,
}

impl From<ScoreRecord> for ScoreEntry {
    fn from(record: ScoreRecord) -> Self {
        Self {
            player: record.player,
            points: record.points,
        }
    }
}

/// Score table, points descending then name ascending.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScoreBoard {
    /// Rows in display order.
    pub scores: Vec<ScoreEntry>,
}

impl From<Vec<ScoreRecord>> for ScoreBoard {
    fn from(records: Vec<ScoreRecord>) -> Self {
        Self {
            scores: records.into_iter().map(ScoreEntry::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn record(name: &str, buzzed_at: Option<u64>, failed: bool) -> PlayerTurnRecord {
        let mut record = PlayerTurnRecord::registered(name, SystemTime::UNIX_EPOCH);
        if let Some(at) = buzzed_at {
            let mut fields = record
                .turn_fields()
                .claimed(SystemTime::UNIX_EPOCH + Duration::from_secs(at));
            if failed {
                fields = fields.failed();
            }
            record.apply_turn_fields(fields, SystemTime::UNIX_EPOCH);
        }
        record
    }

    #[test]
    fn board_groups_players_by_claim_state() {
        let records = vec![
            record("carol", None, false),
            record("bob", Some(9), false),
            record("alice", Some(4), true),
            record("dave", Some(2), false),
        ];
        let board = PlayersBoard::from_records(&records);

        let names = |entries: &[PlayerSummary]| {
            entries.iter().map(|p| p.name.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(&board.queued), ["dave", "bob"]);
        assert_eq!(names(&board.failed), ["alice"]);
        assert_eq!(names(&board.idle), ["carol"]);
    }
}
