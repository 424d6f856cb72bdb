use axum::{Json, Router, extract::State, routing::get};

use crate::{
    dto::turn::{PlayersBoard, ScoreBoard, TurnSnapshotResponse},
    error::AppError,
    services::public_service,
    state::SharedState,
};

/// Public read-only endpoints that expose the current turn and boards.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/public/turn", get(get_turn))
        .route("/public/scores", get(get_scores))
        .route("/public/players", get(get_players))
}

#[utoipa::path(
    get,
    path = "/public/turn",
    tag = "public",
    responses(
        (status = 200, description = "Current turn", body = TurnSnapshotResponse),
        (status = 503, description = "Degraded mode")
    )
)]
/// Return the holder, the deadline and the store clock.
pub async fn get_turn(
    State(state): State<SharedState>,
) -> Result<Json<TurnSnapshotResponse>, AppError> {
    Ok(Json(public_service::get_turn(&state).await?))
}

#[utoipa::path(
    get,
    path = "/public/scores",
    tag = "public",
    responses((status = 200, description = "Score table", body = ScoreBoard))
)]
/// Return the score table, best first.
pub async fn get_scores(State(state): State<SharedState>) -> Result<Json<ScoreBoard>, AppError> {
    Ok(Json(public_service::get_scores(&state).await?))
}

#[utoipa::path(
    get,
    path = "/public/players",
    tag = "public",
    responses((status = 200, description = "Players by claim state", body = PlayersBoard))
)]
/// Return players grouped into the turn queue, rejected claims and idle players.
pub async fn get_players(
    State(state): State<SharedState>,
) -> Result<Json<PlayersBoard>, AppError> {
    Ok(Json(public_service::get_players(&state).await?))
}
