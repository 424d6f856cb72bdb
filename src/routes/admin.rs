use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{post, put},
};
use axum_valid::Valid;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dto::{
        admin::{
            ActionResponse, AdjudicationRequest, AdjudicationResponse, EligibilityRequest,
            JoinPlayerRequest, ResetRoundResponse,
        },
        turn::PlayerSummary,
    },
    error::AppError,
    services::admin_service::{self, AdjudicationOutcome},
    state::SharedState,
};

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Adjudicator endpoints, guarded by the token of the admin SSE stream.
pub fn router(state: SharedState) -> Router<SharedState> {
    Router::new()
        .route("/admin/turn/accept", post(accept_turn))
        .route("/admin/turn/fail", post(fail_turn))
        .route("/admin/round/reset", post(reset_round))
        .route("/admin/players", post(join_player))
        .route("/admin/players/{id}/eligibility", put(set_eligibility))
        .route("/admin/resync", post(resync))
        .route_layer(middleware::from_fn_with_state(state, require_admin_token))
}

fn adjudication_request(
    body: Option<Json<AdjudicationRequest>>,
) -> Result<AdjudicationRequest, AppError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    request.validate()?;
    Ok(request)
}

/// A verdict that is scored but not yet cleared answers 202 instead of 200.
fn adjudication_reply(outcome: AdjudicationOutcome) -> (StatusCode, Json<AdjudicationResponse>) {
    let status = if outcome.complete {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    (status, Json(outcome.response))
}

/// Accept the holder's answer.
#[utoipa::path(
    post,
    path = "/admin/turn/accept",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Admin token issued by the /sse/admin stream")),
    request_body(content = AdjudicationRequest, description = "Optional holder guard"),
    responses(
        (status = 200, description = "Verdict applied", body = AdjudicationResponse),
        (status = 202, description = "Verdict scored, turn clear pending", body = AdjudicationResponse),
        (status = 409, description = "No holder, or the holder changed")
    )
)]
pub async fn accept_turn(
    State(state): State<SharedState>,
    body: Option<Json<AdjudicationRequest>>,
) -> Result<(StatusCode, Json<AdjudicationResponse>), AppError> {
    let request = adjudication_request(body)?;
    let outcome = admin_service::accept(&state, request).await?;
    Ok(adjudication_reply(outcome))
}

/// Reject the holder's answer and pass the turn on.
#[utoipa::path(
    post,
    path = "/admin/turn/fail",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Admin token issued by the /sse/admin stream")),
    request_body(content = AdjudicationRequest, description = "Optional holder guard"),
    responses(
        (status = 200, description = "Verdict applied", body = AdjudicationResponse),
        (status = 202, description = "Verdict scored, turn clear pending", body = AdjudicationResponse),
        (status = 409, description = "No holder, or the holder changed")
    )
)]
pub async fn fail_turn(
    State(state): State<SharedState>,
    body: Option<Json<AdjudicationRequest>>,
) -> Result<(StatusCode, Json<AdjudicationResponse>), AppError> {
    let request = adjudication_request(body)?;
    let outcome = admin_service::fail(&state, request).await?;
    Ok(adjudication_reply(outcome))
}

/// Clear every claim and reopen buzzing.
#[utoipa::path(
    post,
    path = "/admin/round/reset",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Admin token issued by the /sse/admin stream")),
    responses((status = 200, description = "Every claim cleared", body = ResetRoundResponse))
)]
pub async fn reset_round(
    State(state): State<SharedState>,
) -> Result<Json<ResetRoundResponse>, AppError> {
    Ok(Json(admin_service::reset_round(&state).await?))
}

/// Register a player ahead of their first buzz.
#[utoipa::path(
    post,
    path = "/admin/players",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Admin token issued by the /sse/admin stream")),
    request_body = JoinPlayerRequest,
    responses(
        (status = 201, description = "Player registered", body = PlayerSummary),
        (status = 409, description = "Name already taken")
    )
)]
pub async fn join_player(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<JoinPlayerRequest>>,
) -> Result<(StatusCode, Json<PlayerSummary>), AppError> {
    let summary = admin_service::join_player(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// Bench or reinstate a player.
#[utoipa::path(
    put,
    path = "/admin/players/{id}/eligibility",
    tag = "admin",
    params(
        ("X-Admin-Token" = String, Header, description = "Admin token issued by the /sse/admin stream"),
        ("id" = Uuid, Path, description = "Player record id")
    ),
    request_body = EligibilityRequest,
    responses(
        (status = 200, description = "Eligibility updated", body = PlayerSummary),
        (status = 404, description = "Unknown player")
    )
)]
pub async fn set_eligibility(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<EligibilityRequest>,
) -> Result<Json<PlayerSummary>, AppError> {
    Ok(Json(admin_service::set_eligibility(&state, id, payload).await?))
}

/// Force a full re-read of the store.
#[utoipa::path(
    post,
    path = "/admin/resync",
    tag = "admin",
    params(("X-Admin-Token" = String, Header, description = "Admin token issued by the /sse/admin stream")),
    responses((status = 200, description = "Full re-read scheduled", body = ActionResponse))
)]
pub async fn resync(State(state): State<SharedState>) -> Result<Json<ActionResponse>, AppError> {
    Ok(Json(admin_service::resync(&state).await?))
}

async fn require_admin_token(
    State(state): State<SharedState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let provided = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_owned())
        .ok_or_else(|| {
            AppError::Unauthorized("missing admin token header `X-Admin-Token`".into())
        })?;

    match state.admin_sse().check_token(&provided).await {
        Some(true) => Ok(next.run(req).await),
        Some(false) => Err(AppError::Unauthorized("invalid admin token".into())),
        None => Err(AppError::Unauthorized(
            "admin SSE stream not initialised yet".into(),
        )),
    }
}
