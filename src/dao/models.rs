//! Records stored by every backend and the change notifications about them.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Per-player turn-claim row shared by every coordinator observing the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerTurnRecord {
    /// Time-ordered identifier assigned at registration; breaks claim-time ties.
    pub id: Uuid,
    /// Stable player name resolved by the identity provider.
    pub name: String,
    /// Whether the player currently takes part in the game.
    pub is_eligible: bool,
    /// Whether the player has an open or consumed claim this round.
    pub has_buzzed: bool,
    /// Whether the adjudicator rejected the claim (implies `has_buzzed`).
    pub has_failed: bool,
    /// Authoritative instant at which the claim was registered.
    pub turn_started_at: Option<SystemTime>,
    /// Last time the store mutated this row.
    pub last_updated_at: SystemTime,
}

impl PlayerTurnRecord {
    /// Build a freshly registered, eligible record without any claim.
    pub fn registered(name: impl Into<String>, now: SystemTime) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            is_eligible: true,
            has_buzzed: false,
            has_failed: false,
            turn_started_at: None,
            last_updated_at: truncate_to_millis(now),
        }
    }

    /// Columns participating in compare-and-swap updates.
    pub fn turn_fields(&self) -> TurnFields {
        TurnFields {
            is_eligible: self.is_eligible,
            has_buzzed: self.has_buzzed,
            has_failed: self.has_failed,
            turn_started_at: self.turn_started_at,
        }
    }

    /// Replace the turn columns, stamping the update time.
    pub fn apply_turn_fields(&mut self, fields: TurnFields, now: SystemTime) {
        self.is_eligible = fields.is_eligible;
        self.has_buzzed = fields.has_buzzed;
        self.has_failed = fields.has_failed;
        self.turn_started_at = fields.turn_started_at;
        self.last_updated_at = truncate_to_millis(now);
    }

    /// True when the record is waiting in the turn queue.
    pub fn is_queued(&self) -> bool {
        self.turn_fields().is_queued()
    }
}

/// The subset of a [`PlayerTurnRecord`] that claims and adjudications mutate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnFields {
    /// Whether the player takes part in the game.
    pub is_eligible: bool,
    /// Whether the player has a claim this round.
    pub has_buzzed: bool,
    /// Whether the claim was answered wrong.
    pub has_failed: bool,
    /// Store time of the claim.
    pub turn_started_at: Option<SystemTime>,
}

impl TurnFields {
    /// Fields after a successful claim registered at `at`.
    pub fn claimed(self, at: SystemTime) -> Self {
        Self {
            has_buzzed: true,
            has_failed: false,
            turn_started_at: Some(truncate_to_millis(at)),
            ..self
        }
    }

    /// Fields after a rejected claim. The claim stays consumed until reset.
    pub fn failed(self) -> Self {
        Self {
            has_buzzed: true,
            has_failed: true,
            ..self
        }
    }

    /// Fields with every claim marker cleared.
    pub fn cleared(self) -> Self {
        Self {
            has_buzzed: false,
            has_failed: false,
            turn_started_at: None,
            ..self
        }
    }

    /// Fields with eligibility toggled. Leaving the game also drops any claim.
    pub fn with_eligibility(self, eligible: bool) -> Self {
        if eligible {
            Self {
                is_eligible: true,
                ..self
            }
        } else {
            Self {
                is_eligible: false,
                ..self.cleared()
            }
        }
    }

    /// Eligible with a live, unfailed claim.
    pub fn is_queued(&self) -> bool {
        self.is_eligible && self.has_buzzed && !self.has_failed
    }

    /// True when any claim marker is set.
    pub fn has_claim_state(&self) -> bool {
        self.has_buzzed || self.has_failed || self.turn_started_at.is_some()
    }
}

/// Row selection accepted by `read_player_records`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    /// Every record.
    All,
    /// Players taking part in the game.
    Eligible,
    /// The record with this exact name.
    Name(String),
}

impl RecordFilter {
    /// Whether `record` is selected.
    pub fn matches(&self, record: &PlayerTurnRecord) -> bool {
        match self {
            RecordFilter::All => true,
            RecordFilter::Eligible => record.is_eligible,
            RecordFilter::Name(name) => record.name == *name,
        }
    }
}

/// One row of the score ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreRecord {
    /// Player name.
    pub player: String,
    /// Total points.
    pub points: i64,
}

/// Result of an idempotent score adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreAdjustment {
    /// The delta was added; `points` is the new total.
    Applied {
        /// Total after the adjustment.
        points: i64,
    },
    /// The same adjustment id was already counted; nothing changed.
    AlreadyApplied {
        /// Current total.
        points: i64,
    },
}

impl ScoreAdjustment {
    /// Total after the call, whichever way it went.
    pub fn points(&self) -> i64 {
        match self {
            ScoreAdjustment::Applied { points } | ScoreAdjustment::AlreadyApplied { points } => {
                *points
            }
        }
    }
}

/// Number of adjustment ids remembered per score row.
pub const REMEMBERED_ADJUSTMENTS: usize = 16;

/// Tables exposed by the store change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Per-player turn records.
    PlayerTurns,
    /// Score rows.
    Scores,
}

impl Table {
    /// Every table, in read order.
    pub const ALL: [Table; 2] = [Table::PlayerTurns, Table::Scores];
}

/// Notification that a table changed. Carries no row data on purpose: consumers re-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Table that changed.
    pub table: Table,
}

/// Sort score rows by points descending, then player name ascending.
pub fn sort_scores(scores: &mut [ScoreRecord]) {
    scores.sort_by(|a, b| b.points.cmp(&a.points).then_with(|| a.player.cmp(&b.player)));
}

/// Drop sub-millisecond precision so timestamps survive every backend unchanged.
pub fn truncate_to_millis(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => UNIX_EPOCH + Duration::from_millis(since.as_millis() as u64),
        Err(_) => time,
    }
}

/// Milliseconds since the Unix epoch, negative before it.
pub fn epoch_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_millis() as i64,
        Err(err) => -(err.duration().as_millis() as i64),
    }
}

/// Inverse of [`epoch_millis`].
pub fn from_epoch_millis(millis: i64) -> SystemTime {
    if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_claim_stays_buzzed() {
        let fields = TurnFields {
            is_eligible: true,
            has_buzzed: false,
            has_failed: false,
            turn_started_at: None,
        };
        let failed = fields.claimed(UNIX_EPOCH + Duration::from_secs(5)).failed();
        assert!(failed.has_buzzed);
        assert!(failed.has_failed);
        assert!(!failed.is_queued());
    }

    #[test]
    fn leaving_the_game_drops_the_claim() {
        let fields = TurnFields {
            is_eligible: true,
            has_buzzed: true,
            has_failed: false,
            turn_started_at: Some(UNIX_EPOCH),
        };
        let left = fields.with_eligibility(false);
        assert!(!left.is_eligible);
        assert!(!left.has_claim_state());
    }

    #[test]
    fn truncation_keeps_whole_millis() {
        let time = UNIX_EPOCH + Duration::from_nanos(1_234_567_891);
        assert_eq!(epoch_millis(truncate_to_millis(time)), 1_234);
        assert_eq!(from_epoch_millis(1_234), truncate_to_millis(time));
    }

    #[test]
    fn scores_sort_by_points_then_name() {
        let mut scores = vec![
            ScoreRecord {
                player: "carol".into(),
                points: 1,
            },
            ScoreRecord {
                player: "bob".into(),
                points: 3,
            },
            ScoreRecord {
                player: "alice".into(),
                points: 1,
            },
        ];
        sort_scores(&mut scores);
        let order: Vec<_> = scores.iter().map(|s| s.player.as_str()).collect();
        assert_eq!(order, ["bob", "alice", "carol"]);
    }
}
