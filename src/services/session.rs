//! Lifecycle of one game session: coordinator, reconciliation channel and ticker.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    config::AppConfig,
    dao::turn_store::TurnStore,
    error::ServiceError,
    services::{
        buzz_gateway::BuzzGateway,
        reconciliation::{FeedHealth, ReconcileSettings, ReconcileSignal, ReconciliationChannel},
        turn_coordinator::TurnCoordinator,
    },
    state::clock::Clock,
};

const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Running session. Dropping it without [`TurnSession::dispose`] leaves tasks behind.
pub struct TurnSession {
    coordinator: TurnCoordinator,
    gateway: BuzzGateway,
    channel: ReconciliationChannel,
    tasks: Vec<JoinHandle<()>>,
}

impl TurnSession {
    /// Read the store once, then start reconciling and ticking in the background.
    pub async fn start(
        store: Arc<dyn TurnStore>,
        config: Arc<AppConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let coordinator = TurnCoordinator::new(store.clone(), config.clone(), clock);
        let gateway = BuzzGateway::new(store.clone(), config.auto_register);

        if let Err(err) = coordinator.start().await {
            warn!(error = %err, "initial turn read failed; relying on reconciliation");
        }

        let (channel, signals) =
            ReconciliationChannel::spawn(store, ReconcileSettings::from(config.as_ref()));
        let tasks = vec![
            tokio::spawn(consume_signals(coordinator.clone(), signals)),
            tokio::spawn(run_ticker(coordinator.clone())),
        ];
        info!("turn session started");

        Self {
            coordinator,
            gateway,
            channel,
            tasks,
        }
    }

    /// Coordinator driven by this session.
    pub fn coordinator(&self) -> &TurnCoordinator {
        &self.coordinator
    }

    /// Gateway admitting buzzes into the session's store.
    pub fn gateway(&self) -> &BuzzGateway {
        &self.gateway
    }

    /// Resync now and restart the poll period.
    pub fn wake(&self) {
        self.channel.wake();
    }

    /// Ask for a full re-read.
    pub fn request_resync(&self) {
        self.channel.request_resync();
    }

    /// Push feed state right now.
    pub fn feed_health(&self) -> FeedHealth {
        self.channel.feed_health()
    }

    /// Watch the push feed state.
    pub fn feed_health_watcher(&self) -> watch::Receiver<FeedHealth> {
        self.channel.health()
    }

    /// Tie a helper task to the session so it is stopped on dispose.
    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Stop every task of the session and the coordinator's clock.
    pub async fn dispose(self) {
        let Self {
            coordinator,
            channel,
            tasks,
            ..
        } = self;
        coordinator.dispose().await;
        channel.dispose().await;
        for task in tasks {
            task.abort();
        }
        info!("turn session disposed");
    }
}

async fn consume_signals(
    coordinator: TurnCoordinator,
    mut signals: mpsc::Receiver<ReconcileSignal>,
) {
    while let Some(signal) = signals.recv().await {
        debug!(sequence = signal.sequence, source = ?signal.source, "reconciling");
        match coordinator.reconcile(&signal).await {
            Ok(()) => {}
            Err(ServiceError::InvalidState(reason)) => {
                debug!(%reason, "signal consumer stopping");
                break;
            }
            Err(err) => {
                warn!(
                    sequence = signal.sequence,
                    error = %err,
                    "reconciliation failed; waiting for the next signal"
                );
            }
        }
    }
}

async fn run_ticker(coordinator: TurnCoordinator) {
    let mut interval = tokio::time::interval(TICK_PERIOD);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(holder) = coordinator.tick().await else {
            continue;
        };
        match coordinator.on_expired(&holder).await {
            Ok(_) => {}
            Err(ServiceError::Conflict(reason)) => {
                debug!(player = %holder, %reason, "expired turn already moved on");
            }
            Err(err) => warn!(player = %holder, error = %err, "expiry handling failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ExpiryPolicy,
        dao::{models::RecordFilter, turn_store::memory::MemoryTurnStore},
        services::turn_coordinator::TurnUpdate,
        state::clock::ManualClock,
    };

    fn session_parts(config: AppConfig) -> (ManualClock, MemoryTurnStore, Arc<AppConfig>) {
        let clock = ManualClock::default();
        let store = MemoryTurnStore::new(Arc::new(clock.clone()));
        (clock, store, Arc::new(config))
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_claim_reaches_the_coordinator() {
        let (clock, store, config) = session_parts(AppConfig::default());
        let session =
            TurnSession::start(Arc::new(store.clone()), config, Arc::new(clock.clone())).await;
        let mut updates = session.coordinator().subscribe();

        session.gateway().claim(Some("alice")).await.unwrap();

        let holder = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(TurnUpdate::Snapshot(view)) = updates.recv().await {
                    if view.holder.is_some() {
                        return view.holder;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(holder.as_deref(), Some("alice"));

        session.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_applies_the_expiry_policy() {
        let config = AppConfig {
            expiry_policy: ExpiryPolicy::AutoFail,
            ..AppConfig::default()
        };
        let (clock, store, config) = session_parts(config);
        let session =
            TurnSession::start(Arc::new(store.clone()), config, Arc::new(clock.clone())).await;

        session.gateway().claim(Some("alice")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(session.coordinator().holder().await.as_deref(), Some("alice"));

        clock.advance(Duration::from_secs(16));
        tokio::time::sleep(Duration::from_secs(2)).await;

        let record = store
            .read_player_records(RecordFilter::Name("alice".into()))
            .await
            .unwrap()
            .remove(0);
        assert!(record.has_failed);
        assert_eq!(session.coordinator().holder().await, None);

        session.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disposed_session_stops_reconciling() {
        let (clock, store, config) = session_parts(AppConfig::default());
        let session =
            TurnSession::start(Arc::new(store.clone()), config, Arc::new(clock.clone())).await;
        let coordinator = session.coordinator().clone();
        let gateway = session.gateway().clone();
        session.dispose().await;

        gateway.claim(Some("alice")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(coordinator.holder().await, None);
    }
}
