use std::{sync::Arc, time::SystemTime};

use thiserror::Error;
use tracing::{debug, info};

use crate::dao::{
    models::{PlayerTurnRecord, RecordFilter},
    storage::StorageError,
    turn_store::TurnStore,
};

/// Read-decide-write cycles attempted before a lost race is reported as already held.
const CLAIM_ATTEMPTS: usize = 2;

/// Admission decision for one claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The claim was registered at `started_at` (store time).
    Accepted {
        /// Store time stamped on the claim.
        started_at: SystemTime,
    },
    /// The player already has a claim this round; nothing was written.
    AlreadyHeld {
        /// Set when that claim was already answered wrong.
        failed: bool,
    },
    /// The player is not part of the game.
    NotEligible,
}

/// Why a claim could not be decided.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// No player name could be resolved; rejected before reaching the store.
    #[error("player identity unavailable")]
    IdentityUnavailable,
    /// The store failed underneath the claim.
    #[error(transparent)]
    Store(#[from] StorageError),
}

/// Race-safe admission of per-player claims.
///
/// The gateway only decides whether this player's claim is new. Ordering between players is
/// left to holder election over the claim timestamps.
#[derive(Clone)]
pub struct BuzzGateway {
    store: Arc<dyn TurnStore>,
    auto_register: bool,
}

impl BuzzGateway {
    /// Gateway writing to `store`. With `auto_register`, unknown players join on their first buzz.
    pub fn new(store: Arc<dyn TurnStore>, auto_register: bool) -> Self {
        Self {
            store,
            auto_register,
        }
    }

    /// Record a claim for `player_name` unless it already holds one this round.
    pub async fn claim(&self, player_name: Option<&str>) -> Result<ClaimOutcome, ClaimError> {
        let name = resolve_identity(player_name)?;

        for attempt in 1..=CLAIM_ATTEMPTS {
            let existing = self
                .store
                .read_player_records(RecordFilter::Name(name.to_owned()))
                .await?
                .into_iter()
                .next();

            let Some(record) = existing else {
                if !self.auto_register {
                    info!(player = %name, "claim rejected: unknown player");
                    return Ok(ClaimOutcome::NotEligible);
                }
                let now = self.store.authoritative_now().await?;
                let mut record = PlayerTurnRecord::registered(name, now);
                let fields = record.turn_fields().claimed(now);
                record.apply_turn_fields(fields, now);
                if self.store.insert_player_record(record).await? {
                    info!(player = %name, "first buzz registered player and claim");
                    return Ok(ClaimOutcome::Accepted {
                        started_at: fields.turn_started_at.unwrap_or(now),
                    });
                }
                debug!(player = %name, attempt, "registration raced; re-reading");
                continue;
            };

            if !record.is_eligible {
                info!(player = %name, "claim rejected: not eligible");
                return Ok(ClaimOutcome::NotEligible);
            }
            if record.has_buzzed {
                debug!(player = %name, failed = record.has_failed, "claim already held");
                return Ok(ClaimOutcome::AlreadyHeld {
                    failed: record.has_failed,
                });
            }

            let now = self.store.authoritative_now().await?;
            let expected = record.turn_fields();
            let claimed = expected.claimed(now);
            if self
                .store
                .conditional_update_player_record(record.id, expected, claimed)
                .await?
            {
                info!(player = %name, "claim accepted");
                return Ok(ClaimOutcome::Accepted {
                    started_at: claimed.turn_started_at.unwrap_or(now),
                });
            }
            debug!(player = %name, attempt, "claim lost a race; re-reading");
        }

        info!(player = %name, "claim still contended; reporting already held");
        Ok(ClaimOutcome::AlreadyHeld { failed: false })
    }
}

fn resolve_identity(player_name: Option<&str>) -> Result<&str, ClaimError> {
    match player_name.map(str::trim) {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(ClaimError::IdentityUnavailable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::turn_store::memory::MemoryTurnStore,
        state::clock::{Clock, ManualClock},
    };

    fn gateway(auto_register: bool) -> (MemoryTurnStore, BuzzGateway) {
        let store = MemoryTurnStore::new(Arc::new(ManualClock::default()));
        let gateway = BuzzGateway::new(Arc::new(store.clone()), auto_register);
        (store, gateway)
    }

    #[tokio::test]
    async fn double_click_is_idempotent() {
        let (store, gateway) = gateway(true);

        let first = gateway.claim(Some("alice")).await.unwrap();
        assert!(matches!(first, ClaimOutcome::Accepted { .. }));
        let writes = store.write_count();

        assert_eq!(
            gateway.claim(Some("alice")).await.unwrap(),
            ClaimOutcome::AlreadyHeld { failed: false }
        );
        assert_eq!(
            gateway.claim(Some("alice")).await.unwrap(),
            ClaimOutcome::AlreadyHeld { failed: false }
        );
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn blank_identity_never_reaches_the_store() {
        let (store, gateway) = gateway(true);
        store.faults().set_offline(true);

        assert!(matches!(
            gateway.claim(Some("   ")).await,
            Err(ClaimError::IdentityUnavailable)
        ));
        assert!(matches!(
            gateway.claim(None).await,
            Err(ClaimError::IdentityUnavailable)
        ));
    }

    #[tokio::test]
    async fn unknown_player_without_registration_is_not_eligible() {
        let (store, gateway) = gateway(false);
        assert_eq!(
            gateway.claim(Some("bob")).await.unwrap(),
            ClaimOutcome::NotEligible
        );
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn benched_player_is_not_eligible() {
        let (store, gateway) = gateway(true);
        let mut record = PlayerTurnRecord::registered("carol", SystemTime::UNIX_EPOCH);
        record.is_eligible = false;
        store.insert_player_record(record).await.unwrap();

        assert_eq!(
            gateway.claim(Some("carol")).await.unwrap(),
            ClaimOutcome::NotEligible
        );
    }

    #[tokio::test]
    async fn claim_is_stamped_with_store_time() {
        let clock = ManualClock::default();
        let store = MemoryTurnStore::new(Arc::new(clock.clone()));
        store
            .insert_player_record(PlayerTurnRecord::registered("dave", clock.now()))
            .await
            .unwrap();
        let gateway = BuzzGateway::new(Arc::new(store.clone()), true);

        let outcome = gateway.claim(Some(" dave ")).await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Accepted {
                started_at: clock.now()
            }
        );
        let records = store
            .read_player_records(RecordFilter::Name("dave".into()))
            .await
            .unwrap();
        assert!(records[0].is_queued());
        assert_eq!(records[0].turn_started_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn transient_store_failure_is_surfaced() {
        let (store, gateway) = gateway(true);
        store
            .insert_player_record(PlayerTurnRecord::registered("erin", SystemTime::UNIX_EPOCH))
            .await
            .unwrap();
        store.faults().fail_updates(1);

        assert!(matches!(
            gateway.claim(Some("erin")).await,
            Err(ClaimError::Store(_))
        ));
        assert!(matches!(
            gateway.claim(Some("erin")).await.unwrap(),
            ClaimOutcome::Accepted { .. }
        ));
    }
}
