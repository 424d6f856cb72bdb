//! In-process turn store for local play and tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use futures::{StreamExt, future::BoxFuture};
use indexmap::IndexMap;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::{
    dao::{
        models::{
            ChangeEvent, PlayerTurnRecord, REMEMBERED_ADJUSTMENTS, RecordFilter,
            ScoreAdjustment, ScoreRecord, Table, TurnFields, sort_scores, truncate_to_millis,
        },
        storage::{StorageError, StorageResult},
        turn_store::{ChangeFeed, TurnStore},
    },
    state::clock::Clock,
};

const FEED_CAPACITY: usize = 256;

/// In-process [`TurnStore`] used for local play and tests.
#[derive(Clone)]
pub struct MemoryTurnStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    clock: Arc<dyn Clock>,
    players: RwLock<IndexMap<Uuid, PlayerTurnRecord>>,
    scores: RwLock<IndexMap<String, ScoreRow>>,
    feed: Mutex<broadcast::Sender<ChangeEvent>>,
    writes: AtomicU64,
    faults: FaultInjector,
}

#[derive(Default)]
struct ScoreRow {
    points: i64,
    recent: VecDeque<Uuid>,
}

/// Knobs that make the memory store misbehave the way a remote database can.
#[derive(Default)]
pub struct FaultInjector {
    offline: AtomicBool,
    failing_updates: AtomicU32,
    failing_adjustments: AtomicU32,
    lost_adjustment_acks: AtomicU32,
    failing_subscriptions: AtomicU32,
    read_stall_ms: AtomicU64,
    subscribe_stall_ms: AtomicU64,
}

impl FaultInjector {
    /// Fail every operation, including health checks, until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` conditional updates before they touch any row.
    pub fn fail_updates(&self, count: u32) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` score adjustments before they apply.
    pub fn fail_adjustments(&self, count: u32) {
        self.failing_adjustments.store(count, Ordering::SeqCst);
    }

    /// Apply the next `count` score adjustments but report an error to the caller.
    pub fn lose_adjustment_acks(&self, count: u32) {
        self.lost_adjustment_acks.store(count, Ordering::SeqCst);
    }

    /// Reject the next `count` feed subscriptions.
    pub fn fail_subscriptions(&self, count: u32) {
        self.failing_subscriptions.store(count, Ordering::SeqCst);
    }

    /// Delay every read by `stall`.
    pub fn stall_reads(&self, stall: Duration) {
        self.read_stall_ms
            .store(stall.as_millis() as u64, Ordering::SeqCst);
    }

    /// Hold every feed subscription for `stall` before it starts listening.
    pub fn stall_subscriptions(&self, stall: Duration) {
        self.subscribe_stall_ms
            .store(stall.as_millis() as u64, Ordering::SeqCst);
    }

    fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    fn read_stall(&self) -> Option<Duration> {
        stall_of(&self.read_stall_ms)
    }

    fn subscribe_stall(&self) -> Option<Duration> {
        stall_of(&self.subscribe_stall_ms)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

fn stall_of(millis: &AtomicU64) -> Option<Duration> {
    match millis.load(Ordering::SeqCst) {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    }
}

fn injected(operation: &str) -> StorageError {
    StorageError::unavailable(
        format!("memory store rejected `{operation}`"),
        std::io::Error::other("injected fault"),
    )
}

impl MemoryTurnStore {
    /// Empty store stamping writes with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                clock,
                players: RwLock::new(IndexMap::new()),
                scores: RwLock::new(IndexMap::new()),
                feed: Mutex::new(sender),
                writes: AtomicU64::new(0),
                faults: FaultInjector::default(),
            }),
        }
    }

    /// Failure knobs shared by every clone of this store.
    pub fn faults(&self) -> &FaultInjector {
        &self.inner.faults
    }

    /// Number of successful mutations since creation.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// End every open change feed, as a dropped realtime connection would.
    pub fn sever_feeds(&self) {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        let mut feed = self
            .inner
            .feed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *feed = sender;
    }

    fn notify(&self, table: Table) {
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        let feed = self
            .inner
            .feed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Nobody listening is fine: readers poll.
        let _ = feed.send(ChangeEvent { table });
    }

    fn ensure_online(&self, operation: &str) -> StorageResult<()> {
        if self.inner.faults.is_offline() {
            Err(injected(operation))
        } else {
            Ok(())
        }
    }

    async fn read_records(&self, filter: RecordFilter) -> StorageResult<Vec<PlayerTurnRecord>> {
        self.ensure_online("read_player_records")?;
        if let Some(stall) = self.inner.faults.read_stall() {
            tokio::time::sleep(stall).await;
        }
        let players = self.inner.players.read().await;
        Ok(players
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }

    async fn insert_record(&self, mut record: PlayerTurnRecord) -> StorageResult<bool> {
        self.ensure_online("insert_player_record")?;
        let mut players = self.inner.players.write().await;
        if players
            .values()
            .any(|existing| existing.id == record.id || existing.name == record.name)
        {
            return Ok(false);
        }
        record.last_updated_at = truncate_to_millis(self.inner.clock.now());
        players.insert(record.id, record);
        drop(players);
        self.notify(Table::PlayerTurns);
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected: TurnFields,
        new: TurnFields,
    ) -> StorageResult<bool> {
        self.ensure_online("conditional_update_player_record")?;
        if FaultInjector::take(&self.inner.faults.failing_updates) {
            return Err(injected("conditional_update_player_record"));
        }
        let mut players = self.inner.players.write().await;
        let Some(record) = players.get_mut(&id) else {
            return Ok(false);
        };
        if record.turn_fields() != expected {
            return Ok(false);
        }
        record.apply_turn_fields(new, self.inner.clock.now());
        drop(players);
        self.notify(Table::PlayerTurns);
        Ok(true)
    }

    async fn apply_adjustment(
        &self,
        player: String,
        delta: i64,
        adjustment_id: Uuid,
    ) -> StorageResult<ScoreAdjustment> {
        self.ensure_online("adjust_score")?;
        if FaultInjector::take(&self.inner.faults.failing_adjustments) {
            return Err(injected("adjust_score"));
        }
        let mut scores = self.inner.scores.write().await;
        let row = scores.entry(player).or_default();
        if row.recent.contains(&adjustment_id) {
            return Ok(ScoreAdjustment::AlreadyApplied { points: row.points });
        }
        row.points += delta;
        row.recent.push_back(adjustment_id);
        while row.recent.len() > REMEMBERED_ADJUSTMENTS {
            row.recent.pop_front();
        }
        let points = row.points;
        drop(scores);
        self.notify(Table::Scores);

        if FaultInjector::take(&self.inner.faults.lost_adjustment_acks) {
            return Err(injected("adjust_score"));
        }
        Ok(ScoreAdjustment::Applied { points })
    }

    async fn scores(&self) -> StorageResult<Vec<ScoreRecord>> {
        self.ensure_online("read_scores")?;
        let scores = self.inner.scores.read().await;
        let mut rows: Vec<ScoreRecord> = scores
            .iter()
            .map(|(player, row)| ScoreRecord {
                player: player.clone(),
                points: row.points,
            })
            .collect();
        sort_scores(&mut rows);
        Ok(rows)
    }

    fn subscribe(&self, tables: Vec<Table>) -> StorageResult<ChangeFeed> {
        self.ensure_online("subscribe_changes")?;
        if FaultInjector::take(&self.inner.faults.failing_subscriptions) {
            return Err(injected("subscribe_changes"));
        }
        let receiver = self
            .inner
            .feed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            // Lagged receivers skip events; pollers pick the changes up.
            let keep = match item {
                Ok(event) if tables.contains(&event.table) => Some(event),
                _ => None,
            };
            futures::future::ready(keep)
        });
        Ok(stream.boxed())
    }
}

impl TurnStore for MemoryTurnStore {
    fn read_player_records(
        &self,
        filter: RecordFilter,
    ) -> BoxFuture<'static, StorageResult<Vec<PlayerTurnRecord>>> {
        let store = self.clone();
        Box::pin(async move { store.read_records(filter).await })
    }

    fn insert_player_record(
        &self,
        record: PlayerTurnRecord,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.insert_record(record).await })
    }

    fn conditional_update_player_record(
        &self,
        id: Uuid,
        expected: TurnFields,
        new: TurnFields,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.compare_and_swap(id, expected, new).await })
    }

    fn adjust_score(
        &self,
        player: String,
        delta: i64,
        adjustment_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<ScoreAdjustment>> {
        let store = self.clone();
        Box::pin(async move { store.apply_adjustment(player, delta, adjustment_id).await })
    }

    fn read_scores(&self) -> BoxFuture<'static, StorageResult<Vec<ScoreRecord>>> {
        let store = self.clone();
        Box::pin(async move { store.scores().await })
    }

    fn subscribe_changes(&self, tables: Vec<Table>) -> BoxFuture<'static, StorageResult<ChangeFeed>> {
        let store = self.clone();
        Box::pin(async move {
            if let Some(stall) = store.inner.faults.subscribe_stall() {
                tokio::time::sleep(stall).await;
            }
            store.subscribe(tables)
        })
    }

    fn authoritative_now(&self) -> BoxFuture<'static, StorageResult<SystemTime>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_online("authoritative_now")?;
            Ok(truncate_to_millis(store.inner.clock.now()))
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_online("health_check") })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_online("try_reconnect") })
    }
}
