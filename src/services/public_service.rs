//! Service helpers that expose read-only public projections of the current turn.

use crate::{
    dao::models::RecordFilter,
    dto::turn::{PlayersBoard, ScoreBoard, TurnSnapshotResponse},
    error::ServiceError,
    state::SharedState,
};

/// Current holder and countdown.
pub async fn get_turn(state: &SharedState) -> Result<TurnSnapshotResponse, ServiceError> {
    let coordinator = state.coordinator().await?;
    Ok(TurnSnapshotResponse::from(coordinator.snapshot().await))
}

/// Score table, best first.
pub async fn get_scores(state: &SharedState) -> Result<ScoreBoard, ServiceError> {
    let store = state.require_turn_store().await?;
    Ok(ScoreBoard::from(store.read_scores().await?))
}

/// Players grouped into queue, failed and idle.
pub async fn get_players(state: &SharedState) -> Result<PlayersBoard, ServiceError> {
    let store = state.require_turn_store().await?;
    let records = store.read_player_records(RecordFilter::All).await?;
    Ok(PlayersBoard::from_records(&records))
}
