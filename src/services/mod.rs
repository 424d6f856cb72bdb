/// Admin service for adjudication and roster operations.
pub mod admin_service;
/// Race-safe admission of player claims.
pub mod buzz_gateway;
/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Buzzing over plain HTTP.
pub mod player_service;
/// Public service for read-only turn information.
pub mod public_service;
/// Change feed, polling and resync signals feeding the coordinator.
pub mod reconciliation;
/// Idempotent score adjustments.
pub mod score_ledger;
/// Coordinator, reconciliation and ticker bundled per installed store.
pub mod session;
/// Server-Sent Events message generation.
pub mod sse_events;
/// Server-Sent Events broadcasting service.
pub mod sse_service;
/// Store connection supervision and degraded mode.
pub mod storage_supervisor;
/// Holder election, countdown and adjudication.
pub mod turn_coordinator;
/// WebSocket connection and message handling service.
pub mod websocket_service;
