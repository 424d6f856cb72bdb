//! Business logic powering the admin REST routes: verdicts, round resets and the player roster.

use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dao::models::{PlayerTurnRecord, RecordFilter},
    dto::{
        admin::{
            ActionResponse, AdjudicationRequest, AdjudicationResponse, EligibilityRequest,
            JoinPlayerRequest, ResetRoundResponse,
        },
        turn::PlayerSummary,
    },
    error::ServiceError,
    services::turn_coordinator::ClearStatus,
    state::{SharedState, state_machine::Verdict},
};

/// Conditional writes retried before an eligibility change is reported as a conflict.
const ELIGIBILITY_ATTEMPTS: usize = 2;

/// Outcome of an adjudication request. `complete` is false while the holder's claim is
/// still being cleared in the background.
pub struct AdjudicationOutcome {
    /// Payload returned to the adjudicator.
    pub response: AdjudicationResponse,
    /// False while the claim clear is still pending.
    pub complete: bool,
}

/// Accept the holder's answer.
pub async fn accept(
    state: &SharedState,
    request: AdjudicationRequest,
) -> Result<AdjudicationOutcome, ServiceError> {
    adjudicate(state, Verdict::Accept, request).await
}

/// Reject the holder's answer.
pub async fn fail(
    state: &SharedState,
    request: AdjudicationRequest,
) -> Result<AdjudicationOutcome, ServiceError> {
    adjudicate(state, Verdict::Fail, request).await
}

async fn adjudicate(
    state: &SharedState,
    verdict: Verdict,
    request: AdjudicationRequest,
) -> Result<AdjudicationOutcome, ServiceError> {
    let coordinator = state.coordinator().await?;
    let expected = request.expected_holder.as_deref();
    let result = match verdict {
        Verdict::Accept => coordinator.accept(expected).await,
        Verdict::Fail => coordinator.fail(expected).await,
    };

    match result {
        Ok(report) => Ok(AdjudicationOutcome {
            response: AdjudicationResponse::from(report),
            complete: true,
        }),
        Err(ServiceError::PartialAdjudication {
            player,
            points,
            duplicate,
        }) => {
            warn!(player = %player, ?verdict, "verdict scored; claim clear still pending");
            Ok(AdjudicationOutcome {
                response: AdjudicationResponse {
                    player,
                    verdict,
                    delta: state.config().delta_for(verdict),
                    points,
                    duplicate,
                    clear: ClearStatus::Pending,
                    next_holder: coordinator.holder().await,
                    warning: Some(
                        "score recorded; the turn will be cleared once the store accepts it"
                            .into(),
                    ),
                },
                complete: false,
            })
        }
        Err(err) => Err(err),
    }
}

/// Clear every claim of the current round.
pub async fn reset_round(state: &SharedState) -> Result<ResetRoundResponse, ServiceError> {
    let coordinator = state.coordinator().await?;
    let cleared = coordinator.reset_round().await?;
    Ok(ResetRoundResponse { cleared })
}

/// Register a player ahead of their first buzz.
pub async fn join_player(
    state: &SharedState,
    request: JoinPlayerRequest,
) -> Result<PlayerSummary, ServiceError> {
    let store = state.require_turn_store().await?;
    let name = request.name.trim().to_string();
    let now = store.authoritative_now().await?;
    let record = PlayerTurnRecord::registered(name.clone(), now);
    let summary = PlayerSummary::from(&record);

    if !store.insert_player_record(record).await? {
        return Err(ServiceError::Conflict(format!(
            "player `{name}` is already registered"
        )));
    }
    info!(player = %name, "player registered by admin");
    Ok(summary)
}

/// Let a player take part in the game or bench them. Benching drops any open claim.
pub async fn set_eligibility(
    state: &SharedState,
    id: Uuid,
    request: EligibilityRequest,
) -> Result<PlayerSummary, ServiceError> {
    let store = state.require_turn_store().await?;

    for attempt in 1..=ELIGIBILITY_ATTEMPTS {
        let mut record = store
            .read_player_records(RecordFilter::All)
            .await?
            .into_iter()
            .find(|record| record.id == id)
            .ok_or_else(|| ServiceError::NotFound(format!("player `{id}` not found")))?;

        let expected = record.turn_fields();
        let updated = expected.with_eligibility(request.eligible);
        if updated == expected {
            return Ok(PlayerSummary::from(&record));
        }
        if store
            .conditional_update_player_record(id, expected, updated)
            .await?
        {
            info!(player = %record.name, eligible = request.eligible, "eligibility changed");
            let now = store.authoritative_now().await.unwrap_or(record.last_updated_at);
            record.apply_turn_fields(updated, now);
            return Ok(PlayerSummary::from(&record));
        }
        warn!(player = %record.name, attempt, "eligibility update lost a race; re-reading");
    }

    Err(ServiceError::Conflict(
        "player record kept changing; try again".into(),
    ))
}

/// Force a full re-read of the store.
pub async fn resync(state: &SharedState) -> Result<ActionResponse, ServiceError> {
    state.request_resync().await?;
    Ok(ActionResponse {
        message: "resync requested".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig,
        dao::turn_store::{TurnStore, memory::MemoryTurnStore},
        state::{AppState, clock::ManualClock},
    };
    use std::sync::Arc;

    async fn running_state() -> (SharedState, MemoryTurnStore) {
        let clock = ManualClock::default();
        let state = AppState::with_clock(AppConfig::default(), Arc::new(clock.clone()));
        let store = MemoryTurnStore::new(Arc::new(clock));
        state.install_turn_store(Arc::new(store.clone())).await;
        (state, store)
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_names_conflict() {
        let (state, _store) = running_state().await;
        let request = || JoinPlayerRequest {
            name: "alice".into(),
        };
        let joined = join_player(&state, request()).await.unwrap();
        assert_eq!(joined.name, "alice");
        assert!(matches!(
            join_player(&state, request()).await,
            Err(ServiceError::Conflict(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn benching_drops_the_claim() {
        let (state, store) = running_state().await;
        state
            .buzz_gateway()
            .await
            .unwrap()
            .claim(Some("bob"))
            .await
            .unwrap();
        let bob = store
            .read_player_records(RecordFilter::Name("bob".into()))
            .await
            .unwrap()
            .remove(0);

        let summary = set_eligibility(&state, bob.id, EligibilityRequest { eligible: false })
            .await
            .unwrap();
        assert!(!summary.is_eligible);

        let stored = store
            .read_player_records(RecordFilter::Name("bob".into()))
            .await
            .unwrap()
            .remove(0);
        assert!(!stored.is_eligible);
        assert!(!stored.has_buzzed);
        assert!(stored.turn_started_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_player_is_not_found() {
        let (state, _store) = running_state().await;
        assert!(matches!(
            set_eligibility(&state, Uuid::now_v7(), EligibilityRequest { eligible: true }).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn verdict_while_degraded_is_refused() {
        let state = AppState::new(AppConfig::default());
        assert!(matches!(
            accept(&state, AdjudicationRequest::default()).await,
            Err(ServiceError::Degraded)
        ));
    }
}
