//! Merges the store's push feed and a polling fallback into one ordered signal stream.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, sleep_until},
};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::{
    config::AppConfig,
    dao::{
        models::{ChangeEvent, Table},
        turn_store::{ChangeFeed, TurnStore},
    },
};

const SIGNAL_BUFFER: usize = 32;
const DISPOSE_GRACE: Duration = Duration::from_secs(1);
/// Stand-in deadline for disarmed timers.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// Why a full resync was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// The channel just started.
    Startup,
    /// A push subscription attempt has just finished, successfully or not.
    Reconnect,
    /// A consumer came (back) into view.
    Wake,
    /// Asked for explicitly, e.g. by an admin.
    Requested,
}

/// Where a signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    /// The push feed reported a change.
    Pushed,
    /// The poll interval elapsed.
    Polled,
    /// Full re-read for the given reason.
    Resync(ResyncReason),
}

/// "Something changed": the consumer re-reads the listed tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSignal {
    /// Origin of the signal.
    pub source: SignalSource,
    /// Tables to re-read.
    pub tables: Vec<Table>,
    /// Monotonic per channel.
    pub sequence: u64,
}

impl ReconcileSignal {
    /// Whether `table` must be re-read.
    pub fn touches(&self, table: Table) -> bool {
        self.tables.contains(&table)
    }
}

/// State of the push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FeedHealth {
    /// A subscription attempt is in flight.
    Connecting,
    /// Push events are flowing.
    Connected,
    /// No feed; polling covers the gap.
    Disconnected,
}

/// Timing knobs for one channel.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Period of the polling fallback.
    pub poll_interval: Duration,
    /// Window over which push bursts are merged.
    pub debounce: Duration,
    /// Skip polling while the feed is connected.
    pub suspend_polling_when_healthy: bool,
    /// First resubscription delay.
    pub reconnect_initial: Duration,
    /// Cap on the resubscription delay.
    pub reconnect_max: Duration,
    /// Tables watched and listed in full resyncs.
    pub tables: Vec<Table>,
}

impl From<&AppConfig> for ReconcileSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            debounce: config.debounce,
            suspend_polling_when_healthy: config.suspend_polling_when_healthy,
            reconnect_initial: config.reconnect_initial,
            reconnect_max: config.reconnect_max,
            tables: Table::ALL.to_vec(),
        }
    }
}

enum ChannelCommand {
    Wake,
    Resync,
}

/// Handle on the background task feeding one coordinator.
pub struct ReconciliationChannel {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    health: watch::Receiver<FeedHealth>,
    task: JoinHandle<()>,
}

impl ReconciliationChannel {
    /// Start the channel. The receiver yields signals until the channel is disposed.
    pub fn spawn(
        store: Arc<dyn TurnStore>,
        settings: ReconcileSettings,
    ) -> (Self, mpsc::Receiver<ReconcileSignal>) {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (health_tx, health_rx) = watch::channel(FeedHealth::Connecting);

        let worker = ChannelLoop {
            backoff: settings.reconnect_initial,
            store,
            settings,
            signals: signal_tx,
            health: health_tx,
            sequence: 0,
            feed: None,
            reconnect_at: None,
            attempts: 0,
            initial_attempt: true,
            pending: None,
        };
        let task = tokio::spawn(worker.run(command_rx));

        (
            Self {
                commands: command_tx,
                health: health_rx,
                task,
            },
            signal_rx,
        )
    }

    /// Resync now and restart the poll period.
    pub fn wake(&self) {
        let _ = self.commands.send(ChannelCommand::Wake);
    }

    /// Ask for a full resync without touching the poll period.
    pub fn request_resync(&self) {
        let _ = self.commands.send(ChannelCommand::Resync);
    }

    /// Watch the push feed state.
    pub fn health(&self) -> watch::Receiver<FeedHealth> {
        self.health.clone()
    }

    /// Push feed state right now.
    pub fn feed_health(&self) -> FeedHealth {
        *self.health.borrow()
    }

    /// Stop the background task, waiting briefly for it to wind down.
    pub async fn dispose(self) {
        let Self {
            commands, mut task, ..
        } = self;
        drop(commands);
        if tokio::time::timeout(DISPOSE_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
}

struct PendingPush {
    fire_at: Instant,
    tables: Vec<Table>,
}

struct ConsumerGone;

struct ChannelLoop {
    store: Arc<dyn TurnStore>,
    settings: ReconcileSettings,
    signals: mpsc::Sender<ReconcileSignal>,
    health: watch::Sender<FeedHealth>,
    sequence: u64,
    feed: Option<ChangeFeed>,
    reconnect_at: Option<Instant>,
    backoff: Duration,
    attempts: u32,
    /// The first subscription attempt reports its resync as startup.
    initial_attempt: bool,
    pending: Option<PendingPush>,
}

impl ChannelLoop {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ChannelCommand>) {
        if self.reconnect().await.is_err() {
            return;
        }

        let mut poll = interval_at(
            Instant::now() + self.settings.poll_interval,
            self.settings.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut polling = true;

        loop {
            let should_poll = self.feed.is_none() || !self.settings.suspend_polling_when_healthy;
            if should_poll != polling {
                if should_poll {
                    debug!("push feed down; polling resumed");
                    poll.reset();
                } else {
                    debug!("push feed healthy; polling suspended");
                }
                polling = should_poll;
            }

            let far = Instant::now() + FAR_FUTURE;
            let debounce_armed = self.pending.is_some();
            let debounce_at = self.pending.as_ref().map_or(far, |pending| pending.fire_at);
            let reconnect_armed = self.feed.is_none() && self.reconnect_at.is_some();
            let reconnect_at = self.reconnect_at.unwrap_or(far);

            let outcome = tokio::select! {
                command = commands.recv() => match command {
                    None => break,
                    Some(ChannelCommand::Wake) => {
                        poll.reset();
                        self.emit(SignalSource::Resync(ResyncReason::Wake), self.all_tables()).await
                    }
                    Some(ChannelCommand::Resync) => {
                        self.emit(SignalSource::Resync(ResyncReason::Requested), self.all_tables()).await
                    }
                },
                event = next_change(&mut self.feed) => self.on_feed_item(event),
                _ = sleep_until(debounce_at), if debounce_armed => self.flush_pending().await,
                _ = sleep_until(reconnect_at), if reconnect_armed => self.reconnect().await,
                _ = poll.tick(), if polling => {
                    self.emit(SignalSource::Polled, self.all_tables()).await
                }
            };

            if outcome.is_err() {
                debug!("reconciliation consumer gone; stopping channel");
                break;
            }
        }

        self.health.send_replace(FeedHealth::Disconnected);
    }

    fn all_tables(&self) -> Vec<Table> {
        self.settings.tables.clone()
    }

    async fn emit(&mut self, source: SignalSource, tables: Vec<Table>) -> Result<(), ConsumerGone> {
        self.sequence += 1;
        let signal = ReconcileSignal {
            source,
            tables,
            sequence: self.sequence,
        };
        debug!(source = ?signal.source, sequence = signal.sequence, "reconcile signal");
        self.signals.send(signal).await.map_err(|_| ConsumerGone)
    }

    fn on_feed_item(&mut self, event: Option<ChangeEvent>) -> Result<(), ConsumerGone> {
        match event {
            Some(ChangeEvent { table }) => match self.pending.as_mut() {
                Some(pending) => {
                    if !pending.tables.contains(&table) {
                        pending.tables.push(table);
                    }
                }
                None => {
                    self.pending = Some(PendingPush {
                        fire_at: Instant::now() + self.settings.debounce,
                        tables: vec![table],
                    });
                }
            },
            None => {
                warn!("push feed lost; falling back to polling");
                self.feed = None;
                // The reconnect resync covers whatever was pending.
                self.pending = None;
                self.reconnect_at = Some(Instant::now());
                self.health.send_replace(FeedHealth::Disconnected);
            }
        }
        Ok(())
    }

    async fn flush_pending(&mut self) -> Result<(), ConsumerGone> {
        match self.pending.take() {
            Some(pending) => self.emit(SignalSource::Pushed, pending.tables).await,
            None => Ok(()),
        }
    }

    /// Attempt a subscription, then resync whatever the attempt may have missed.
    async fn reconnect(&mut self) -> Result<(), ConsumerGone> {
        self.reconnect_at = None;
        self.attempts += 1;
        self.health.send_replace(FeedHealth::Connecting);

        match self.store.subscribe_changes(self.all_tables()).await {
            Ok(feed) => {
                info!(attempts = self.attempts, "push feed connected");
                self.feed = Some(feed);
                self.attempts = 0;
                self.backoff = self.settings.reconnect_initial;
                self.health.send_replace(FeedHealth::Connected);
            }
            Err(err) => {
                let delay = jittered(self.backoff);
                warn!(
                    attempt = self.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "push feed subscription failed"
                );
                self.reconnect_at = Some(Instant::now() + delay);
                self.backoff = (self.backoff * 2).min(self.settings.reconnect_max);
                self.health.send_replace(FeedHealth::Disconnected);
            }
        }

        // Writes landing during the handshake have no push event; this resync covers them.
        let reason = if std::mem::take(&mut self.initial_attempt) {
            ResyncReason::Startup
        } else {
            ResyncReason::Reconnect
        };
        self.emit(SignalSource::Resync(reason), self.all_tables()).await
    }
}

async fn next_change(feed: &mut Option<ChangeFeed>) -> Option<ChangeEvent> {
    match feed {
        Some(feed) => feed.next().await,
        None => std::future::pending().await,
    }
}

/// Add up to a quarter of `delay` so replicas do not reconnect in lockstep.
fn jittered(delay: Duration) -> Duration {
    let spread = (delay.as_millis() / 4) as u64;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=spread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::{models::PlayerTurnRecord, turn_store::memory::MemoryTurnStore},
        state::clock::{Clock, ManualClock},
    };
    use uuid::Uuid;

    fn settings() -> ReconcileSettings {
        ReconcileSettings::from(&AppConfig::default())
    }

    fn spawn(
        settings: ReconcileSettings,
    ) -> (
        MemoryTurnStore,
        ReconciliationChannel,
        mpsc::Receiver<ReconcileSignal>,
    ) {
        let store = MemoryTurnStore::new(Arc::new(ManualClock::default()));
        let (channel, signals) = ReconciliationChannel::spawn(Arc::new(store.clone()), settings);
        (store, channel, signals)
    }

    async fn connected(channel: &ReconciliationChannel) {
        channel
            .health()
            .wait_for(|health| *health == FeedHealth::Connected)
            .await
            .unwrap();
    }

    async fn collect_for(
        signals: &mut mpsc::Receiver<ReconcileSignal>,
        window: Duration,
    ) -> Vec<ReconcileSignal> {
        let deadline = Instant::now() + window;
        let mut seen = Vec::new();
        while let Ok(Some(signal)) = tokio::time::timeout_at(deadline, signals.recv()).await {
            seen.push(signal);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn starts_with_a_full_resync() {
        let (_, channel, mut signals) = spawn(settings());
        let first = signals.recv().await.unwrap();
        assert_eq!(first.source, SignalSource::Resync(ResyncReason::Startup));
        assert_eq!(first.tables, Table::ALL.to_vec());
        channel.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn push_bursts_collapse_into_one_signal() {
        let (store, channel, mut signals) = spawn(settings());
        signals.recv().await.unwrap();
        connected(&channel).await;

        for _ in 0..3 {
            store
                .adjust_score("alice".into(), 1, Uuid::new_v4())
                .await
                .unwrap();
        }

        let seen = collect_for(&mut signals, Duration::from_millis(500)).await;
        assert_eq!(seen.len(), 1, "{seen:?}");
        assert_eq!(seen[0].source, SignalSource::Pushed);
        assert_eq!(seen[0].tables, vec![Table::Scores]);
        channel.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn polling_is_suspended_while_push_is_healthy() {
        let (_, channel, mut signals) = spawn(settings());
        signals.recv().await.unwrap();
        connected(&channel).await;

        let seen = collect_for(&mut signals, Duration::from_secs(10)).await;
        assert!(
            seen.iter().all(|signal| signal.source != SignalSource::Polled),
            "{seen:?}"
        );
        channel.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn polling_carries_the_load_without_push() {
        let mut settings = settings();
        settings.reconnect_max = Duration::from_secs(60);
        let (store, channel, mut signals) = spawn(settings);
        store.faults().fail_subscriptions(u32::MAX);

        let seen = collect_for(&mut signals, Duration::from_millis(6_500)).await;
        let polls = seen
            .iter()
            .filter(|signal| signal.source == SignalSource::Polled)
            .count();
        assert_eq!(polls, 3, "{seen:?}");
        assert_eq!(channel.feed_health(), FeedHealth::Disconnected);
        channel.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lost_feed_resyncs_and_reconnects() {
        let (store, channel, mut signals) = spawn(settings());
        signals.recv().await.unwrap();
        connected(&channel).await;

        store.sever_feeds();
        let resync = signals.recv().await.unwrap();
        assert_eq!(resync.source, SignalSource::Resync(ResyncReason::Reconnect));
        connected(&channel).await;
        channel.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn polling_resumes_once_the_feed_is_lost() {
        let mut settings = settings();
        settings.reconnect_max = Duration::from_secs(60);
        let (store, channel, mut signals) = spawn(settings);
        signals.recv().await.unwrap();
        connected(&channel).await;

        store.faults().fail_subscriptions(u32::MAX);
        store.sever_feeds();

        let seen = collect_for(&mut signals, Duration::from_millis(6_500)).await;
        let polls = seen
            .iter()
            .filter(|signal| signal.source == SignalSource::Polled)
            .count();
        assert_eq!(polls, 3, "{seen:?}");
        assert!(
            seen.iter()
                .any(|signal| signal.source == SignalSource::Resync(ResyncReason::Reconnect)),
            "{seen:?}"
        );
        assert_eq!(channel.feed_health(), FeedHealth::Disconnected);
        channel.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn write_during_subscribe_handshake_is_resynced() {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryTurnStore::new(clock.clone());
        store.faults().stall_subscriptions(Duration::from_millis(200));
        let (channel, mut signals) =
            ReconciliationChannel::spawn(Arc::new(store.clone()), settings());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(signals.try_recv().is_err(), "resync sent before the feed was live");
        let alice = PlayerTurnRecord::registered("alice", clock.now());
        assert!(store.insert_player_record(alice).await.unwrap());

        // The write had no listener, so only the post-handshake resync can report it.
        let resync = signals.recv().await.unwrap();
        assert_eq!(resync.source, SignalSource::Resync(ResyncReason::Startup));
        assert!(resync.touches(Table::PlayerTurns));
        assert_eq!(channel.feed_health(), FeedHealth::Connected);

        let later = PlayerTurnRecord::registered("bob", clock.now());
        assert!(store.insert_player_record(later).await.unwrap());
        let pushed = signals.recv().await.unwrap();
        assert_eq!(pushed.source, SignalSource::Pushed);
        channel.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_subscriptions_back_off() {
        let (store, channel, mut signals) = spawn(settings());
        store.faults().fail_subscriptions(3);
        let started = Instant::now();
        signals.recv().await.unwrap();

        let mut health = channel.health();
        let drain = tokio::spawn(async move { while signals.recv().await.is_some() {} });
        health
            .wait_for(|health| *health == FeedHealth::Connected)
            .await
            .unwrap();

        // 250ms, 500ms, then 1s between attempts, each with up to 25% jitter.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1_750), "{waited:?}");
        assert!(waited <= Duration::from_millis(2_200), "{waited:?}");
        channel.dispose().await;
        drain.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn wake_requests_an_immediate_resync() {
        let (_, channel, mut signals) = spawn(settings());
        signals.recv().await.unwrap();
        connected(&channel).await;

        channel.wake();
        let signal = signals.recv().await.unwrap();
        assert_eq!(signal.source, SignalSource::Resync(ResyncReason::Wake));
        channel.dispose().await;
    }
}
