use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the turn engine.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::sse::public_stream,
        crate::routes::sse::admin_stream,
        crate::routes::websocket::ws_handler,
        crate::routes::player::buzz,
        crate::routes::public::get_turn,
        crate::routes::public::get_scores,
        crate::routes::public::get_players,
        crate::routes::admin::accept_turn,
        crate::routes::admin::fail_turn,
        crate::routes::admin::reset_round,
        crate::routes::admin::join_player,
        crate::routes::admin::set_eligibility,
        crate::routes::admin::resync,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::ws::PlayerInboundMessage,
            crate::dto::ws::PlayerOutboundMessage,
            crate::dto::sse::AdminHandshake,
            crate::dto::sse::SystemStatus,
            crate::dto::sse::AdjudicationWarningEvent,
            crate::dto::player::BuzzOutcome,
            crate::dto::player::BuzzResponse,
            crate::dto::turn::TurnSnapshotResponse,
            crate::dto::turn::TurnTickEvent,
            crate::dto::turn::TurnExpiredEvent,
            crate::dto::turn::PlayerSummary,
            crate::dto::turn::PlayersBoard,
            crate::dto::turn::ScoreEntry,
            crate::dto::turn::ScoreBoard,
            crate::dto::admin::AdjudicationRequest,
            crate::dto::admin::AdjudicationResponse,
            crate::dto::admin::JoinPlayerRequest,
            crate::dto::admin::EligibilityRequest,
            crate::dto::admin::ResetRoundResponse,
            crate::dto::admin::ActionResponse,
            crate::services::reconciliation::FeedHealth,
            crate::services::turn_coordinator::PhaseKind,
            crate::services::turn_coordinator::ClearStatus,
            crate::state::state_machine::Verdict,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sse", description = "Server-sent events streams"),
        (name = "player", description = "WebSocket and REST buzzing for players"),
        (name = "public", description = "Read-only turn, score and player views"),
        (name = "admin", description = "Adjudicator actions, guarded by the admin token"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_route_is_documented() {
        let doc = ApiDoc::openapi();
        for path in [
            "/healthcheck",
            "/ws",
            "/player/buzz",
            "/public/turn",
            "/admin/turn/accept",
            "/admin/players/{id}/eligibility",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
