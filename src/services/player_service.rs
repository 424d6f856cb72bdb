//! Buzz handling for clients that reach the engine over plain HTTP.

use tracing::warn;

use crate::{
    dto::player::BuzzResponse,
    error::ServiceError,
    services::buzz_gateway::ClaimError,
    state::SharedState,
};

/// Register a buzz for `player`, as resolved by the identity header.
pub async fn buzz(state: &SharedState, player: Option<&str>) -> Result<BuzzResponse, ServiceError> {
    let gateway = state.buzz_gateway().await?;
    match gateway.claim(player).await {
        Ok(outcome) => Ok(BuzzResponse::from(outcome)),
        Err(ClaimError::IdentityUnavailable) => {
            Err(ServiceError::Unauthorized("identity unavailable".into()))
        }
        Err(ClaimError::Store(err)) => {
            warn!(error = %err, "buzz could not reach the store");
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig,
        dao::turn_store::memory::MemoryTurnStore,
        dto::player::BuzzOutcome,
        state::{AppState, clock::ManualClock},
    };
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn buzz_needs_an_identity_and_a_store() {
        let clock = ManualClock::default();
        let state = AppState::with_clock(AppConfig::default(), Arc::new(clock.clone()));
        assert!(matches!(
            buzz(&state, Some("alice")).await,
            Err(ServiceError::Degraded)
        ));

        state
            .install_turn_store(Arc::new(MemoryTurnStore::new(Arc::new(clock))))
            .await;
        assert!(matches!(
            buzz(&state, None).await,
            Err(ServiceError::Unauthorized(_))
        ));

        let first = buzz(&state, Some("alice")).await.unwrap();
        assert_eq!(first.outcome, BuzzOutcome::Accepted);
        let second = buzz(&state, Some("alice")).await.unwrap();
        assert_eq!(second.outcome, BuzzOutcome::AlreadyHeld);
    }
}
