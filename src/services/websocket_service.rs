use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::models::epoch_millis,
    dto::{
        player::BuzzResponse,
        ws::{PlayerInboundMessage, PlayerOutboundMessage},
    },
    error::ServiceError,
    services::{buzz_gateway::ClaimError, turn_coordinator::TurnView},
    state::{AppState, PlayerConnection, SharedState},
};

const IDENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Internal error type for socket-side buzz handling, distinct from the HTTP-facing
/// `ServiceError`.
#[derive(Debug, Error)]
enum BuzzError {
    /// Writer channel closed - connection should be terminated immediately.
    #[error("connection closed")]
    ConnectionClosed,
    #[error("claim failed: {0}")]
    Claim(#[from] ClaimError),
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}

/// Handle the full lifecycle for an individual player WebSocket connection.
pub async fn handle_socket(state: SharedState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound messages flowing even while we await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let initial_message = match tokio::time::timeout(IDENT_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(error = %err, "websocket receive error");
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(None) | Err(_) => {
            warn!("websocket identification timed out");
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let inbound = match PlayerInboundMessage::from_json_str(&initial_message) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "failed to parse or validate player message");
            let _ = send_error(&outbound_tx, &err.to_string());
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let PlayerInboundMessage::Identification { name } = inbound else {
        warn!("first message was not identification");
        let _ = outbound_tx.send(Message::Close(None));
        finalize(writer_task, outbound_tx).await;
        return;
    };

    let connection_id = Uuid::new_v4();
    state.players().insert(
        connection_id,
        PlayerConnection {
            name: name.clone(),
            tx: outbound_tx.clone(),
        },
    );
    info!(player = %name, %connection_id, "player connected");

    if send_welcome(&state, &name, &outbound_tx).await.is_err() {
        info!(player = %name, "connection closed during welcome, terminating");
        state.players().remove(&connection_id);
        finalize(writer_task, outbound_tx).await;
        return;
    }

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match PlayerInboundMessage::from_json_str(&text) {
                Ok(PlayerInboundMessage::Buzz) => {
                    if let Err(err) = handle_buzz(&state, &name, &outbound_tx).await {
                        warn!(player = %name, error = %err, "error while handling buzz");
                        if matches!(err, BuzzError::ConnectionClosed) {
                            info!(player = %name, "connection closed during buzz handling, terminating");
                            break;
                        }
                        if send_error(&outbound_tx, client_message(&err)).is_err() {
                            break;
                        }
                    }
                }
                Ok(PlayerInboundMessage::Identification { .. }) => {
                    warn!(player = %name, "ignoring duplicate identification message");
                }
                Ok(PlayerInboundMessage::Unknown) => {
                    debug!(player = %name, "ignoring unknown message type");
                }
                Err(err) => {
                    warn!(player = %name, error = %err, "failed to parse or validate player message");
                }
            },
            Ok(Message::Ping(payload)) => {
                let _ = outbound_tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(frame)) => {
                info!(player = %name, "player closed");
                let _ = outbound_tx.send(Message::Close(frame));
                break;
            }
            Ok(Message::Binary(_)) => {}
            Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(player = %name, error = %err, "websocket error");
                break;
            }
        }
    }

    state.players().remove(&connection_id);
    info!(player = %name, %connection_id, "player disconnected");

    finalize(writer_task, outbound_tx).await;
}

/// Acknowledge identification and push the current turn so the client can render at once.
async fn send_welcome(
    state: &SharedState,
    name: &str,
    tx: &mpsc::UnboundedSender<Message>,
) -> Result<(), BuzzError> {
    send_message_to_websocket(
        tx,
        &PlayerOutboundMessage::Ack {
            name: name.to_string(),
        },
    )?;
    match state.coordinator().await {
        Ok(coordinator) => {
            let view = coordinator.snapshot().await;
            send_message_to_websocket(tx, &turn_message(&view, name))
        }
        Err(_) => send_error(tx, "reconnecting"),
    }
}

async fn handle_buzz(
    state: &SharedState,
    name: &str,
    tx: &mpsc::UnboundedSender<Message>,
) -> Result<(), BuzzError> {
    let gateway = state.buzz_gateway().await?;
    let outcome = gateway.claim(Some(name)).await?;
    let feedback = BuzzResponse::from(outcome);
    info!(player = %name, outcome = ?feedback.outcome, "buzz handled");
    send_message_to_websocket(
        tx,
        &PlayerOutboundMessage::BuzzFeedback {
            failed: feedback.failed,
            outcome: feedback.outcome,
        },
    )
}

/// Text shown to the player. Store details stay in the logs.
fn client_message(err: &BuzzError) -> &'static str {
    match err {
        BuzzError::Claim(ClaimError::IdentityUnavailable) => "identity unavailable",
        _ => "reconnecting",
    }
}

fn send_error(tx: &mpsc::UnboundedSender<Message>, message: &str) -> Result<(), BuzzError> {
    send_message_to_websocket(
        tx,
        &PlayerOutboundMessage::Error {
            message: message.to_string(),
        },
    )
}

fn turn_message(view: &TurnView, name: &str) -> PlayerOutboundMessage {
    PlayerOutboundMessage::Turn {
        holder: view.holder.clone(),
        can_answer: view.holder.as_deref() == Some(name),
        deadline_ms: view.deadline.map(epoch_millis),
        server_now_ms: epoch_millis(view.server_now),
        remaining_seconds: view.remaining_seconds,
    }
}

/// Push the current turn to every connected player.
///
/// Connections whose writer has gone away are dropped from the registry.
pub fn notify_turn(state: &AppState, view: &TurnView) {
    let dead: Vec<Uuid> = state
        .players()
        .iter()
        .filter_map(|entry| {
            let connection = entry.value();
            send_message_to_websocket(&connection.tx, &turn_message(view, &connection.name))
                .err()
                .map(|_| *entry.key())
        })
        .collect();
    for id in dead {
        warn!(connection_id = %id, "send failed (writer closed), removing player connection");
        state.players().remove(&id);
    }
}

/// Serialize a payload and push it onto the provided WebSocket sender.
///
/// Serialization failures are logged and swallowed; only a closed writer is an error.
fn send_message_to_websocket<T>(
    tx: &mpsc::UnboundedSender<Message>,
    value: &T,
) -> Result<(), BuzzError>
where
    T: ?Sized + serde::Serialize + std::fmt::Debug,
{
    let payload = match serde_json::to_string(value) {
        Ok(p) => p,
        Err(err) => {
            warn!(error = %err, "failed to serialize message `{value:?}` (permanent error, not retrying)");
            return Ok(());
        }
    };

    tx.send(Message::Text(payload.into()))
        .map_err(|_| BuzzError::ConnectionClosed)
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AppConfig, services::turn_coordinator::PhaseKind};
    use std::time::UNIX_EPOCH;

    fn view(holder: Option<&str>) -> TurnView {
        let now = UNIX_EPOCH + Duration::from_secs(50);
        TurnView {
            holder: holder.map(str::to_string),
            deadline: holder.map(|_| now + Duration::from_secs(15)),
            server_now: now,
            remaining_seconds: if holder.is_some() { 15 } else { 0 },
            phase: if holder.is_some() {
                PhaseKind::Active
            } else {
                PhaseKind::Idle
            },
            verdict: None,
            version: 3,
        }
    }

    fn connect(state: &AppState, name: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.players().insert(
            Uuid::new_v4(),
            PlayerConnection {
                name: name.into(),
                tx,
            },
        );
        rx
    }

    fn text(message: Message) -> String {
        match message {
            Message::Text(text) => text.to_string(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn only_the_holder_may_answer() {
        let state = AppState::new(AppConfig::default());
        let mut alice = connect(&state, "alice");
        let mut bob = connect(&state, "bob");

        notify_turn(&state, &view(Some("alice")));

        let to_alice = text(alice.try_recv().unwrap());
        let to_bob = text(bob.try_recv().unwrap());
        assert!(to_alice.contains("\"can_answer\":true"));
        assert!(to_bob.contains("\"can_answer\":false"));
        assert!(to_bob.contains("\"deadline_ms\":65000"));
    }

    #[tokio::test]
    async fn closed_connections_are_dropped() {
        let state = AppState::new(AppConfig::default());
        let gone = connect(&state, "carol");
        drop(gone);
        let _alive = connect(&state, "dave");

        notify_turn(&state, &view(None));
        assert_eq!(state.players().len(), 1);
    }
}
