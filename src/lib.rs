//! Library crate for buzz-turn-back, exposing modules for binaries and integration tests.

/// Turn rules, reconciliation cadence and store limits.
pub mod config;
/// Persistence layer: records, the store contract and its backends.
pub mod dao;
/// Request and response payloads.
pub mod dto;
mod error;
/// HTTP, SSE and WebSocket routes.
pub mod routes;
/// Game logic sitting between routes and storage.
pub mod services;
/// Shared application state.
pub mod state;
