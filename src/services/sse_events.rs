use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::{
    dto::{
        admin::AdjudicationResponse,
        sse::{AdjudicationWarningEvent, ServerEvent, SystemStatus},
        turn::{PlayersBoard, ScoreBoard, TurnExpiredEvent, TurnSnapshotResponse, TurnTickEvent},
    },
    services::{
        reconciliation::FeedHealth,
        turn_coordinator::{TurnUpdate, TurnView},
        websocket_service,
    },
    state::{AppState, SharedState},
};

/// Holder, deadline or phase changed.
pub const EVENT_TURN_SNAPSHOT: &str = "turn.snapshot";
/// Once-per-second countdown.
pub const EVENT_TURN_TICK: &str = "turn.tick";
/// The holder ran out of time.
pub const EVENT_TURN_EXPIRED: &str = "turn.expired";
/// Fresh score table.
pub const EVENT_SCORES_UPDATED: &str = "scores.updated";
/// Fresh roster.
pub const EVENT_PLAYERS_UPDATED: &str = "players.updated";
/// A verdict was applied.
pub const EVENT_ADJUDICATION: &str = "adjudication";
/// Admin only: a verdict is scored but its clear is pending.
pub const EVENT_ADJUDICATION_WARNING: &str = "adjudication.warning";
/// Degraded mode or feed health changed.
pub const EVENT_SYSTEM_STATUS: &str = "system.status";

/// Relay coordinator updates to SSE subscribers and player sockets until the session ends.
pub async fn forward_turn_updates(state: SharedState, mut updates: broadcast::Receiver<TurnUpdate>) {
    loop {
        match updates.recv().await {
            Ok(update) => dispatch(&state, update),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // The next snapshot or resync carries the full state again.
                debug!(skipped, "turn update forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Announce store feed health changes on the public stream.
pub async fn forward_feed_health(state: SharedState, mut health: watch::Receiver<FeedHealth>) {
    while health.changed().await.is_ok() {
        let feed = *health.borrow_and_update();
        broadcast_system_status(&state, state.is_degraded(), Some(feed));
    }
}

fn dispatch(state: &AppState, update: TurnUpdate) {
    match update {
        TurnUpdate::Snapshot(view) => broadcast_turn_snapshot(state, view),
        TurnUpdate::Tick {
            holder,
            remaining_seconds,
        } => send_public_event(
            state,
            EVENT_TURN_TICK,
            &TurnTickEvent {
                holder,
                remaining_seconds,
            },
        ),
        TurnUpdate::Expired { holder } => {
            let payload = TurnExpiredEvent { holder };
            send_public_event(state, EVENT_TURN_EXPIRED, &payload);
            send_admin_event(state, EVENT_TURN_EXPIRED, &payload);
        }
        TurnUpdate::Scores(scores) => {
            send_public_event(state, EVENT_SCORES_UPDATED, &ScoreBoard::from(scores))
        }
        TurnUpdate::Players(records) => send_public_event(
            state,
            EVENT_PLAYERS_UPDATED,
            &PlayersBoard::from_records(&records),
        ),
        TurnUpdate::Adjudicated(report) => {
            let payload = AdjudicationResponse::from(report);
            send_public_event(state, EVENT_ADJUDICATION, &payload);
            send_admin_event(state, EVENT_ADJUDICATION, &payload);
        }
        TurnUpdate::Warning(warning) => send_admin_event(
            state,
            EVENT_ADJUDICATION_WARNING,
            &AdjudicationWarningEvent {
                player: warning.player,
                message: warning.message,
            },
        ),
    }
}

/// Broadcast the current turn to both streams and to every player socket.
pub fn broadcast_turn_snapshot(state: &AppState, view: TurnView) {
    websocket_service::notify_turn(state, &view);
    let payload = TurnSnapshotResponse::from(view);
    send_public_event(state, EVENT_TURN_SNAPSHOT, &payload);
    send_admin_event(state, EVENT_TURN_SNAPSHOT, &payload);
}

/// Broadcast degraded mode and feed health.
pub fn broadcast_system_status(state: &AppState, degraded: bool, feed: Option<FeedHealth>) {
    let payload = SystemStatus { degraded, feed };
    send_public_event(state, EVENT_SYSTEM_STATUS, &payload);
    send_admin_event(state, EVENT_SYSTEM_STATUS, &payload);
}

/// Serialize a payload into a named event, for streams that replay state on connect.
pub fn named_event(event: &str, payload: &impl Serialize) -> Option<ServerEvent> {
    match ServerEvent::json(Some(event.to_string()), payload) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(event, error = %err, "failed to serialize SSE payload");
            None
        }
    }
}

fn send_public_event(state: &AppState, event: &str, payload: &impl Serialize) {
    if let Some(event) = named_event(event, payload) {
        state.public_sse().broadcast(event);
    }
}

fn send_admin_event(state: &AppState, event: &str, payload: &impl Serialize) {
    if let Some(event) = named_event(event, payload) {
        state.admin_sse().hub().broadcast(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig,
        services::turn_coordinator::{AdjudicationWarning, PhaseKind},
    };
    use std::time::{Duration, SystemTime};

    #[tokio::test]
    async fn snapshots_reach_both_streams() {
        let state = AppState::new(AppConfig::default());
        let mut public = state.public_sse().subscribe();
        let mut admin = state.admin_sse().hub().subscribe();

        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        dispatch(
            &state,
            TurnUpdate::Snapshot(TurnView {
                holder: Some("alice".into()),
                deadline: Some(now + Duration::from_secs(15)),
                server_now: now,
                remaining_seconds: 15,
                phase: PhaseKind::Active,
                verdict: None,
                version: 1,
            }),
        );

        let event = public.try_recv().unwrap();
        assert_eq!(event.event.as_deref(), Some(EVENT_TURN_SNAPSHOT));
        assert!(event.data.contains("\"holder\":\"alice\""));
        assert!(event.data.contains("\"deadline_ms\":115000"));
        assert_eq!(
            admin.try_recv().unwrap().event.as_deref(),
            Some(EVENT_TURN_SNAPSHOT)
        );
    }

    #[tokio::test]
    async fn warnings_stay_on_the_admin_stream() {
        let state = AppState::new(AppConfig::default());
        let mut public = state.public_sse().subscribe();
        let mut admin = state.admin_sse().hub().subscribe();

        dispatch(
            &state,
            TurnUpdate::Warning(AdjudicationWarning {
                player: "bob".into(),
                message: "clear pending".into(),
            }),
        );

        assert!(public.try_recv().is_err());
        assert_eq!(
            admin.try_recv().unwrap().event.as_deref(),
            Some(EVENT_ADJUDICATION_WARNING)
        );
    }
}
