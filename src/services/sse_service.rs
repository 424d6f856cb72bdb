use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    dao::models::RecordFilter,
    dto::{
        sse::{AdminHandshake, ServerEvent, SystemStatus},
        turn::{PlayersBoard, ScoreBoard, TurnSnapshotResponse},
    },
    error::ServiceError,
    services::sse_events::{
        self, EVENT_PLAYERS_UPDATED, EVENT_SCORES_UPDATED, EVENT_SYSTEM_STATUS,
        EVENT_TURN_SNAPSHOT,
    },
    state::{SharedState, SseHub},
};

/// Subscribe to the shared public SSE stream.
///
/// A new viewer is also a hint that local state may be stale, so the running session is
/// asked to resync.
pub async fn subscribe_public(state: &SharedState) -> broadcast::Receiver<ServerEvent> {
    let receiver = state.public_sse().subscribe();
    state.wake_reconciliation().await;
    receiver
}

/// Subscribe to the admin-only SSE stream.
pub async fn subscribe_admin(
    state: &SharedState,
) -> Result<(broadcast::Receiver<ServerEvent>, String), ServiceError> {
    let token = state.admin_sse().claim_token().await.ok_or_else(|| {
        ServiceError::Unauthorized("Another admin SSE stream is already active".into())
    })?;
    let receiver = state.admin_sse().hub().subscribe();
    Ok((receiver, token))
}

/// Events replayed to a stream right after it connects so late joiners render current state.
pub async fn initial_events(state: &SharedState) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    let status = SystemStatus {
        degraded: state.is_degraded(),
        feed: state.feed_health().await,
    };
    events.extend(sse_events::named_event(EVENT_SYSTEM_STATUS, &status));

    let Ok(coordinator) = state.coordinator().await else {
        return events;
    };
    let view = coordinator.snapshot().await;
    events.extend(sse_events::named_event(
        EVENT_TURN_SNAPSHOT,
        &TurnSnapshotResponse::from(view),
    ));

    // Boards are best effort here; the next change pushes them anyway.
    if let Ok(store) = state.require_turn_store().await {
        if let Ok(scores) = store.read_scores().await {
            events.extend(sse_events::named_event(
                EVENT_SCORES_UPDATED,
                &ScoreBoard::from(scores),
            ));
        }
        if let Ok(records) = store.read_player_records(RecordFilter::All).await {
            events.extend(sse_events::named_event(
                EVENT_PLAYERS_UPDATED,
                &PlayersBoard::from_records(&records),
            ));
        }
    }
    events
}

/// Identifies the target SSE stream so we can perform stream-specific
/// bookkeeping when the connection is torn down.
#[derive(Clone)]
pub enum StreamKind {
    /// Read-only stream open to everyone.
    Public,
    /// Carries the shared state so teardown can release the admin token.
    Admin(SharedState),
}

fn to_event(payload: ServerEvent) -> Event {
    let mut event = Event::default().data(payload.data);
    if let Some(name) = payload.event {
        event = event.event(name);
    }
    event
}

/// Convert a broadcast receiver into an SSE response, forwarding events and
/// cleaning up once the client disconnects.
pub fn to_sse_stream(
    mut receiver: broadcast::Receiver<ServerEvent>,
    kind: StreamKind,
    initial: Vec<ServerEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // small bounded channel between forwarder and response
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        let mut open = true;
        for payload in initial {
            if tx.send(Ok(to_event(payload))).await.is_err() {
                open = false;
                break;
            }
        }

        while open {
            tokio::select! {
                _ = tx.closed() => break,
                recv_result = receiver.recv() => {
                    match recv_result {
                        Ok(payload) => {
                            if tx.send(Ok(to_event(payload))).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(_)) => {
                            // Skip lagged messages but keep the stream alive.
                            continue;
                        }
                    }
                }
            }
        }

        match kind {
            StreamKind::Public => tracing::info!("Public SSE stream disconnected"),
            StreamKind::Admin(state) => {
                state.admin_sse().release_token().await;
                tracing::info!("Admin SSE stream disconnected")
            }
        }
    });

    // response stream reads from mpsc; when client disconnects axum drops this stream
    let stream = ReceiverStream::new(rx);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// Build the handshake event carrying the admin token.
pub fn admin_handshake(token: &str) -> Option<ServerEvent> {
    ServerEvent::json(
        Some("admin_token".to_string()),
        &AdminHandshake {
            token: token.to_string(),
        },
    )
    .ok()
}

/// Send a human-readable info message onto the public SSE stream.
pub fn broadcast_public_info(hub: &SseHub, message: &str) {
    hub.broadcast(ServerEvent::new(
        Some("info".to_string()),
        message.to_string(),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AppConfig, state::AppState};

    #[tokio::test]
    async fn second_admin_stream_is_refused() {
        let state = AppState::new(AppConfig::default());
        let (_receiver, token) = subscribe_admin(&state).await.unwrap();
        assert!(!token.is_empty());
        assert!(matches!(
            subscribe_admin(&state).await,
            Err(ServiceError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn degraded_streams_start_with_system_status() {
        let state = AppState::new(AppConfig::default());
        let events = initial_events(&state).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some(EVENT_SYSTEM_STATUS));
        assert!(events[0].data.contains("\"degraded\":true"));
    }
}
