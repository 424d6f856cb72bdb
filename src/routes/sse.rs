use std::convert::Infallible;

use axum::{Router, extract::State, response::sse::Sse, routing::get};
use futures::Stream;
use tracing::info;

use crate::{
    error::AppError,
    services::sse_service::{self, StreamKind},
    state::SharedState,
};

#[utoipa::path(
    get,
    path = "/sse/public",
    tag = "sse",
    responses((status = 200, description = "Public SSE stream", content_type = "text/event-stream", body = String))
)]
/// Stream turn, score and player updates to connected frontends.
pub async fn public_stream(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<axum::response::sse::Event, Infallible>>> {
    let receiver = sse_service::subscribe_public(&state).await;
    info!("New public SSE connection");
    let initial = sse_service::initial_events(&state).await;
    sse_service::to_sse_stream(receiver, StreamKind::Public, initial)
}

#[utoipa::path(
    get,
    path = "/sse/admin",
    tag = "sse",
    responses(
        (status = 200, description = "Admin SSE stream", content_type = "text/event-stream", body = String),
        (status = 401, description = "Another admin stream is already open")
    )
)]
/// Stream admin events. The first event carries the token required by admin routes.
pub async fn admin_stream(
    State(state): State<SharedState>,
) -> Result<Sse<impl Stream<Item = Result<axum::response::sse::Event, Infallible>>>, AppError> {
    let (receiver, token) = sse_service::subscribe_admin(&state).await?;
    info!("New admin SSE connection");
    let mut initial: Vec<_> = sse_service::admin_handshake(&token).into_iter().collect();
    initial.extend(sse_service::initial_events(&state).await);
    Ok(sse_service::to_sse_stream(
        receiver,
        StreamKind::Admin(state),
        initial,
    ))
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new()
        .route("/sse/public", get(public_stream))
        .route("/sse/admin", get(admin_stream))
}
