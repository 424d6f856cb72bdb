use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use tracing::{info, warn};
use uuid::Uuid;

use crate::dao::{
    models::{ScoreAdjustment, ScoreRecord, epoch_millis},
    storage::StorageResult,
    turn_store::TurnStore,
};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Idempotent score adjustments on top of the store's upsert-increment.
#[derive(Clone)]
pub struct ScoreLedger {
    store: Arc<dyn TurnStore>,
    attempts: u32,
}

/// Adjustment id shared by every attempt at scoring one turn.
///
/// Derived from the record and its claim time, so a retried verdict for the same turn (even
/// from another replica) can never be counted twice.
pub fn adjustment_id_for_turn(record_id: Uuid, turn_started_at: SystemTime) -> Uuid {
    Uuid::new_v5(&record_id, &epoch_millis(turn_started_at).to_be_bytes())
}

impl ScoreLedger {
    /// Ledger trying each adjustment up to `attempts` times.
    pub fn new(store: Arc<dyn TurnStore>, attempts: u32) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
        }
    }

    /// Add `delta` to `player`, creating the row when missing.
    ///
    /// Transient failures are retried with the same `adjustment_id`; the store reports
    /// `AlreadyApplied` if an earlier attempt landed but its reply was lost.
    pub async fn adjust(
        &self,
        player: &str,
        delta: i64,
        adjustment_id: Uuid,
    ) -> StorageResult<ScoreAdjustment> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .adjust_score(player.to_owned(), delta, adjustment_id)
                .await
            {
                Ok(outcome) => {
                    info!(
                        player,
                        delta,
                        points = outcome.points(),
                        duplicate = matches!(outcome, ScoreAdjustment::AlreadyApplied { .. }),
                        "score adjusted"
                    );
                    return Ok(outcome);
                }
                Err(err) if err.is_retryable() && attempt < self.attempts => {
                    warn!(player, attempt, error = %err, "score adjustment failed; retrying");
                    tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Current score table.
    pub async fn scores(&self) -> StorageResult<Vec<ScoreRecord>> {
        self.store.read_scores().await
    }
}
