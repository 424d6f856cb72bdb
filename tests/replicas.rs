//! Two engine replicas sharing one store must agree on the holder and the scores.

use std::{sync::Arc, time::Duration};

use buzz_turn_back::{
    config::AppConfig,
    dao::turn_store::memory::MemoryTurnStore,
    dto::{admin::AdjudicationRequest, player::BuzzOutcome},
    services::{admin_service, player_service, public_service},
    state::{AppState, SharedState, clock::ManualClock},
};

async fn replica(clock: &ManualClock, store: &MemoryTurnStore) -> SharedState {
    let state = AppState::with_clock(AppConfig::default(), Arc::new(clock.clone()));
    state.install_turn_store(Arc::new(store.clone())).await;
    state
}

/// Let change feeds and debounce timers run.
async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

async fn holder(state: &SharedState) -> Option<String> {
    public_service::get_turn(state).await.unwrap().holder
}

#[tokio::test(start_paused = true)]
async fn replicas_agree_on_the_holder() {
    let clock = ManualClock::default();
    let store = MemoryTurnStore::new(Arc::new(clock.clone()));
    let left = replica(&clock, &store).await;
    let right = replica(&clock, &store).await;

    let first = player_service::buzz(&right, Some("bob")).await.unwrap();
    assert_eq!(first.outcome, BuzzOutcome::Accepted);
    clock.advance(Duration::from_millis(300));
    player_service::buzz(&left, Some("alice")).await.unwrap();
    settle().await;

    assert_eq!(holder(&left).await.as_deref(), Some("bob"));
    assert_eq!(holder(&right).await.as_deref(), Some("bob"));
}

#[tokio::test(start_paused = true)]
async fn verdict_on_one_replica_moves_the_other() {
    let clock = ManualClock::default();
    let store = MemoryTurnStore::new(Arc::new(clock.clone()));
    let left = replica(&clock, &store).await;
    let right = replica(&clock, &store).await;

    player_service::buzz(&left, Some("alice")).await.unwrap();
    clock.advance(Duration::from_secs(1));
    player_service::buzz(&right, Some("bob")).await.unwrap();
    settle().await;

    let outcome = admin_service::fail(
        &left,
        AdjudicationRequest {
            expected_holder: Some("alice".into()),
        },
    )
    .await
    .unwrap();
    assert!(outcome.complete);
    assert_eq!(outcome.response.next_holder.as_deref(), Some("bob"));
    settle().await;

    assert_eq!(holder(&right).await.as_deref(), Some("bob"));
    let scores = public_service::get_scores(&right).await.unwrap();
    let alice = scores
        .scores
        .iter()
        .find(|entry| entry.player == "alice")
        .map(|entry| entry.points);
    assert_eq!(alice, Some(-1));
}

#[tokio::test(start_paused = true)]
async fn reset_on_one_replica_reopens_buzzing_everywhere() {
    let clock = ManualClock::default();
    let store = MemoryTurnStore::new(Arc::new(clock.clone()));
    let left = replica(&clock, &store).await;
    let right = replica(&clock, &store).await;

    player_service::buzz(&left, Some("alice")).await.unwrap();
    settle().await;
    assert_eq!(holder(&right).await.as_deref(), Some("alice"));

    let reset = admin_service::reset_round(&right).await.unwrap();
    assert_eq!(reset.cleared, 1);
    settle().await;
    assert_eq!(holder(&left).await, None);

    let again = player_service::buzz(&left, Some("alice")).await.unwrap();
    assert_eq!(again.outcome, BuzzOutcome::Accepted);
}

#[tokio::test(start_paused = true)]
async fn stuck_clear_is_finished_later_without_rescoring() {
    let clock = ManualClock::default();
    let store = MemoryTurnStore::new(Arc::new(clock.clone()));
    let left = replica(&clock, &store).await;

    player_service::buzz(&left, Some("alice")).await.unwrap();
    settle().await;
    store.faults().fail_updates(3);

    let outcome = admin_service::fail(&left, AdjudicationRequest::default())
        .await
        .unwrap();
    assert!(!outcome.complete);
    assert!(outcome.response.warning.is_some());
    assert_eq!(outcome.response.points, -1);
    assert!(!outcome.response.duplicate);

    admin_service::resync(&left).await.unwrap();
    settle().await;
    let players = public_service::get_players(&left).await.unwrap();
    assert!(players.failed.iter().any(|player| player.name == "alice"));
    let scores = public_service::get_scores(&left).await.unwrap();
    assert_eq!(scores.scores.len(), 1);
    assert_eq!(scores.scores[0].points, -1);
}

#[tokio::test(start_paused = true)]
async fn retried_verdict_with_stuck_clear_reports_the_earlier_score() {
    let clock = ManualClock::default();
    let store = MemoryTurnStore::new(Arc::new(clock.clone()));
    let left = replica(&clock, &store).await;

    player_service::buzz(&left, Some("alice")).await.unwrap();
    settle().await;
    // The first increment lands without a reply, so the retry finds it applied.
    store.faults().lose_adjustment_acks(1);
    store.faults().fail_updates(3);

    let outcome = admin_service::accept(&left, AdjudicationRequest::default())
        .await
        .unwrap();
    assert!(!outcome.complete);
    assert!(outcome.response.duplicate);
    assert_eq!(outcome.response.points, 1);
}
