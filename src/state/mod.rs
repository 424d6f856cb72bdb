//! Application state shared by every handler.

/// Countdown with drift correction against the store clock.
pub mod clock;
/// Holder election over the stored claims.
pub mod election;
mod sse;
/// Turn phases and their legal transitions.
pub mod state_machine;

use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::info;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::turn_store::TurnStore,
    error::ServiceError,
    services::{
        buzz_gateway::BuzzGateway, reconciliation::FeedHealth, session::TurnSession, sse_events,
        turn_coordinator::TurnCoordinator,
    },
    state::clock::{Clock, SystemClock},
};

pub use self::sse::{AdminSseState, SseHub};
use self::sse::SseState;

/// Handle on the state passed to every route.
pub type SharedState = Arc<AppState>;

const PUBLIC_SSE_CAPACITY: usize = 64;
const ADMIN_SSE_CAPACITY: usize = 32;

/// Outbound channel of one connected player socket.
#[derive(Clone)]
pub struct PlayerConnection {
    /// Player the socket identified as.
    pub name: String,
    /// Frames queued for the socket writer.
    pub tx: mpsc::UnboundedSender<Message>,
}

/// Process-wide state: the installed store, the running session and client connections.
pub struct AppState {
    config: Arc<AppConfig>,
    clock: Arc<dyn Clock>,
    turn_store: RwLock<Option<Arc<dyn TurnStore>>>,
    session: RwLock<Option<TurnSession>>,
    sse: SseState,
    players: DashMap<Uuid, PlayerConnection>,
    degraded: watch::Sender<bool>,
}

impl AppState {
    /// The application starts in degraded mode until a store is installed.
    pub fn new(config: AppConfig) -> SharedState {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Like [`AppState::new`] but reading time from `clock`.
    pub fn with_clock(config: AppConfig, clock: Arc<dyn Clock>) -> SharedState {
        let (degraded, _) = watch::channel(true);
        Arc::new(Self {
            config: Arc::new(config),
            clock,
            turn_store: RwLock::new(None),
            session: RwLock::new(None),
            sse: SseState::new(PUBLIC_SSE_CAPACITY, ADMIN_SSE_CAPACITY),
            players: DashMap::new(),
            degraded,
        })
    }

    /// Runtime configuration.
    pub fn config(&self) -> Arc<AppConfig> {
        self.config.clone()
    }

    /// Installed store, `None` while degraded.
    pub async fn turn_store(&self) -> Option<Arc<dyn TurnStore>> {
        self.turn_store.read().await.clone()
    }

    /// Store or a degraded-mode error.
    pub async fn require_turn_store(&self) -> Result<Arc<dyn TurnStore>, ServiceError> {
        self.turn_store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a store, start a fresh session on it and leave degraded mode.
    pub async fn install_turn_store(self: &Arc<Self>, store: Arc<dyn TurnStore>) {
        let mut session =
            TurnSession::start(store.clone(), self.config.clone(), self.clock.clone()).await;
        session.attach(tokio::spawn(sse_events::forward_turn_updates(
            self.clone(),
            session.coordinator().subscribe(),
        )));
        session.attach(tokio::spawn(sse_events::forward_feed_health(
            self.clone(),
            session.feed_health_watcher(),
        )));

        let previous = {
            let mut guard = self.session.write().await;
            guard.replace(session)
        };
        if let Some(previous) = previous {
            previous.dispose().await;
        }
        *self.turn_store.write().await = Some(store);
        self.update_degraded(false);
    }

    /// Drop the store, stop the session and enter degraded mode.
    pub async fn clear_turn_store(&self) {
        let previous = self.session.write().await.take();
        if let Some(previous) = previous {
            previous.dispose().await;
        }
        self.turn_store.write().await.take();
        self.update_degraded(true);
    }

    /// Whether no store is installed.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Watch degraded mode toggle.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Flip the degraded flag and announce the change.
    pub fn update_degraded(&self, value: bool) {
        if self.degraded.send_replace(value) != value {
            info!(degraded = value, "degraded mode changed");
            sse_events::broadcast_system_status(self, value, None);
        }
    }

    /// Coordinator of the running session, or a degraded-mode error.
    pub async fn coordinator(&self) -> Result<TurnCoordinator, ServiceError> {
        let guard = self.session.read().await;
        guard
            .as_ref()
            .map(|session| session.coordinator().clone())
            .ok_or(ServiceError::Degraded)
    }

    /// Gateway of the running session, or a degraded-mode error.
    pub async fn buzz_gateway(&self) -> Result<BuzzGateway, ServiceError> {
        let guard = self.session.read().await;
        guard
            .as_ref()
            .map(|session| session.gateway().clone())
            .ok_or(ServiceError::Degraded)
    }

    /// Ask the running session for an immediate resync. No-op while degraded.
    pub async fn wake_reconciliation(&self) {
        if let Some(session) = self.session.read().await.as_ref() {
            session.wake();
        }
    }

    /// Ask the running session for a full re-read.
    pub async fn request_resync(&self) -> Result<(), ServiceError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(ServiceError::Degraded)?;
        session.request_resync();
        Ok(())
    }

    /// Push feed state of the running session.
    pub async fn feed_health(&self) -> Option<FeedHealth> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|session| session.feed_health())
    }

    /// Hub of the public stream.
    pub fn public_sse(&self) -> &SseHub {
        self.sse.public()
    }

    /// Hub and token of the admin stream.
    pub fn admin_sse(&self) -> &AdminSseState {
        self.sse.admin()
    }

    /// Connected player sockets keyed by connection id.
    pub fn players(&self) -> &DashMap<Uuid, PlayerConnection> {
        &self.players
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dao::turn_store::memory::MemoryTurnStore, state::clock::ManualClock};

    #[tokio::test(start_paused = true)]
    async fn installing_a_store_leaves_degraded_mode() {
        let clock = ManualClock::default();
        let state = AppState::with_clock(AppConfig::default(), Arc::new(clock.clone()));
        assert!(state.is_degraded());
        assert!(matches!(
            state.coordinator().await,
            Err(ServiceError::Degraded)
        ));

        let store = MemoryTurnStore::new(Arc::new(clock));
        state.install_turn_store(Arc::new(store)).await;
        assert!(!state.is_degraded());
        assert!(state.coordinator().await.is_ok());

        state.clear_turn_store().await;
        assert!(state.is_degraded());
        assert!(matches!(
            state.buzz_gateway().await,
            Err(ServiceError::Degraded)
        ));
    }
}
