use axum::Router;

use crate::state::SharedState;

/// Adjudication and roster endpoints.
pub mod admin;
/// Swagger UI and OpenAPI document.
pub mod docs;
/// Liveness endpoint.
pub mod health;
/// Buzz endpoint.
pub mod player;
/// Read-only turn, roster and score endpoints.
pub mod public;
/// Server-Sent Events streams.
pub mod sse;
/// Player WebSocket endpoint.
pub mod websocket;

/// Compose all route trees, wiring in shared state and documentation routes.
pub fn router(state: SharedState) -> Router<()> {
    let api_router = health::router()
        .merge(sse::router())
        .merge(websocket::router())
        .merge(player::router())
        .merge(public::router())
        .merge(admin::router(state.clone()));

    let docs_router = docs::router(state.clone());

    api_router.merge(docs_router).with_state(state)
}
