//! The shared store contract and its backends.

/// CouchDB backend.
#[cfg(feature = "couch-store")]
pub mod couchdb;
/// In-process backend.
pub mod memory;
/// MongoDB backend.
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use std::{sync::Arc, time::Duration, time::SystemTime};

use crate::dao::models::{
    ChangeEvent, PlayerTurnRecord, RecordFilter, ScoreAdjustment, ScoreRecord, Table, TurnFields,
};
use crate::dao::storage::{StorageResult, bounded};
use futures::{future::BoxFuture, stream::BoxStream};
use uuid::Uuid;

/// Stream of table-change notifications. Ends when the subscription is lost.
pub type ChangeFeed = BoxStream<'static, ChangeEvent>;

/// Shared persistence contract for turn records and scores.
///
/// Every coordinator talks to the same store; the store is the single source of truth and
/// local state is only a cache of it.
pub trait TurnStore: Send + Sync {
    /// Records selected by `filter`, in no particular order.
    fn read_player_records(
        &self,
        filter: RecordFilter,
    ) -> BoxFuture<'static, StorageResult<Vec<PlayerTurnRecord>>>;
    /// Insert a new record. Returns `false` when a record with that name already exists.
    fn insert_player_record(
        &self,
        record: PlayerTurnRecord,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Replace the turn fields of `id` only if they still equal `expected`.
    fn conditional_update_player_record(
        &self,
        id: Uuid,
        expected: TurnFields,
        new: TurnFields,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Add `delta` to a player's score at most once per `adjustment_id`.
    fn adjust_score(
        &self,
        player: String,
        delta: i64,
        adjustment_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<ScoreAdjustment>>;
    /// Scores ordered by points descending, then name ascending.
    fn read_scores(&self) -> BoxFuture<'static, StorageResult<Vec<ScoreRecord>>>;
    /// Open a push feed of changes to `tables`. Fails when push is unsupported or unreachable.
    fn subscribe_changes(&self, tables: Vec<Table>) -> BoxFuture<'static, StorageResult<ChangeFeed>>;
    /// The store's notion of "now", used to stamp claims and anchor countdowns.
    fn authoritative_now(&self) -> BoxFuture<'static, StorageResult<SystemTime>>;
    /// Cheap liveness round trip.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Re-establish the connection after the store became unreachable.
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// Decorator bounding every round trip of the wrapped store.
#[derive(Clone)]
pub struct TimeoutStore {
    inner: Arc<dyn TurnStore>,
    limit: Duration,
}

impl TimeoutStore {
    /// Bound every call on `inner` by `limit`.
    pub fn new(inner: Arc<dyn TurnStore>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

impl TurnStore for TimeoutStore {
    fn read_player_records(
        &self,
        filter: RecordFilter,
    ) -> BoxFuture<'static, StorageResult<Vec<PlayerTurnRecord>>> {
        let work = self.inner.read_player_records(filter);
        Box::pin(bounded("read_player_records", self.limit, work))
    }

    fn insert_player_record(
        &self,
        record: PlayerTurnRecord,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let work = self.inner.insert_player_record(record);
        Box::pin(bounded("insert_player_record", self.limit, work))
    }

    fn conditional_update_player_record(
        &self,
        id: Uuid,
        expected: TurnFields,
        new: TurnFields,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let work = self.inner.conditional_update_player_record(id, expected, new);
        Box::pin(bounded("conditional_update_player_record", self.limit, work))
    }

    fn adjust_score(
        &self,
        player: String,
        delta: i64,
        adjustment_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<ScoreAdjustment>> {
        let work = self.inner.adjust_score(player, delta, adjustment_id);
        Box::pin(bounded("adjust_score", self.limit, work))
    }

    fn read_scores(&self) -> BoxFuture<'static, StorageResult<Vec<ScoreRecord>>> {
        let work = self.inner.read_scores();
        Box::pin(bounded("read_scores", self.limit, work))
    }

    fn subscribe_changes(&self, tables: Vec<Table>) -> BoxFuture<'static, StorageResult<ChangeFeed>> {
        let work = self.inner.subscribe_changes(tables);
        Box::pin(bounded("subscribe_changes", self.limit, work))
    }

    fn authoritative_now(&self) -> BoxFuture<'static, StorageResult<SystemTime>> {
        let work = self.inner.authoritative_now();
        Box::pin(bounded("authoritative_now", self.limit, work))
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let work = self.inner.health_check();
        Box::pin(bounded("health_check", self.limit, work))
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.inner.try_reconnect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::storage::StorageError;
    use crate::dao::turn_store::memory::MemoryTurnStore;
    use crate::state::clock::ManualClock;

    #[tokio::test(start_paused = true)]
    async fn timeout_store_bounds_stalled_calls() {
        let memory = MemoryTurnStore::new(Arc::new(ManualClock::default()));
        memory.faults().stall_reads(Duration::from_secs(30));
        let store = TimeoutStore::new(Arc::new(memory), Duration::from_millis(100));

        let err = store
            .read_player_records(RecordFilter::All)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Timeout { .. }));
    }
}
