use axum::{Json, Router, extract::State, http::HeaderMap, routing::post};

use crate::{
    dto::player::BuzzResponse, error::AppError, services::player_service, state::SharedState,
};

/// Header carrying the identity resolved by the upstream identity provider.
pub const PLAYER_NAME_HEADER: &str = "x-player-name";

/// Buzz endpoint for clients without a WebSocket.
pub fn router() -> Router<SharedState> {
    Router::new().route("/player/buzz", post(buzz))
}

#[utoipa::path(
    post,
    path = "/player/buzz",
    tag = "player",
    params(("X-Player-Name" = String, Header, description = "Player identity")),
    responses(
        (status = 200, description = "Buzz handled", body = BuzzResponse),
        (status = 401, description = "No identity supplied"),
        (status = 503, description = "Store unreachable")
    )
)]
/// Claim the turn for the calling player.
pub async fn buzz(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<BuzzResponse>, AppError> {
    let player = headers
        .get(PLAYER_NAME_HEADER)
        .and_then(|value| value.to_str().ok());
    Ok(Json(player_service::buzz(&state, player).await?))
}
