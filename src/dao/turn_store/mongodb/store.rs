//! [`TurnStore`](crate::dao::turn_store::TurnStore) backed by MongoDB collections and change streams.

use std::{sync::Arc, time::SystemTime};

use futures::{StreamExt, TryStreamExt, future::BoxFuture};
use mongodb::{
    Collection, Database,
    bson::{Bson, doc},
    options::{IndexOptions, ReturnDocument},
};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult, is_duplicate_key},
    models::{
        MongoPlayerTurnDocument, MongoScoreDocument, compare_filter, record_filter, swap_update,
    },
};
use crate::dao::{
    models::{
        ChangeEvent, PlayerTurnRecord, REMEMBERED_ADJUSTMENTS, RecordFilter, ScoreAdjustment,
        ScoreRecord, Table, TurnFields, sort_scores,
    },
    storage::StorageResult,
    turn_store::{ChangeFeed, TurnStore},
};

const PLAYER_COLLECTION_NAME: &str = "player_turns";
const SCORE_COLLECTION_NAME: &str = "scores";
/// Upsert races on a fresh score row, each resolved by re-reading.
const ADJUST_ATTEMPTS: usize = 3;

fn table_for(collection: &str) -> Option<Table> {
    match collection {
        PLAYER_COLLECTION_NAME => Some(Table::PlayerTurns),
        SCORE_COLLECTION_NAME => Some(Table::Scores),
        _ => None,
    }
}

fn collection_for(table: Table) -> &'static str {
    match table {
        Table::PlayerTurns => PLAYER_COLLECTION_NAME,
        Table::Scores => SCORE_COLLECTION_NAME,
    }
}

/// [`TurnStore`] backed by a MongoDB replica set.
///
/// Conditional updates are single-document filters on the turn columns. Change feeds use
/// change streams, which need a replica set; on a standalone server subscribing fails fast
/// and reconciliation falls back to polling.
#[derive(Clone)]
pub struct MongoTurnStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

/// The database handle keeps its client alive.
struct MongoState {
    database: Database,
    replica_set: Option<String>,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let deployment = establish_connection(&self.config).await?;
        let mut state = self.state.write().await;
        state.database = deployment.database;
        state.replica_set = deployment.replica_set;
        Ok(())
    }
}

impl MongoTurnStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let deployment = establish_connection(&config).await?;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState {
                database: deployment.database,
                replica_set: deployment.replica_set,
            }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let collection = self.players().await;
        let index = mongodb::IndexModel::builder()
            .keys(doc! {"name": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("player_name_idx".to_owned()))
                    .unique(Some(true))
                    .build(),
            )
            .build();

        collection
            .create_index(index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: PLAYER_COLLECTION_NAME,
                index: "name",
                source,
            })?;
        Ok(())
    }

    async fn database(&self) -> Database {
        let guard = self.inner.state.read().await;
        guard.database.clone()
    }

    async fn players(&self) -> Collection<MongoPlayerTurnDocument> {
        self.database()
            .await
            .collection::<MongoPlayerTurnDocument>(PLAYER_COLLECTION_NAME)
    }

    async fn scores(&self) -> Collection<MongoScoreDocument> {
        self.database()
            .await
            .collection::<MongoScoreDocument>(SCORE_COLLECTION_NAME)
    }

    async fn read_records(&self, filter: RecordFilter) -> MongoResult<Vec<PlayerTurnRecord>> {
        let documents: Vec<MongoPlayerTurnDocument> = self
            .players()
            .await
            .find(record_filter(&filter))
            .await
            .map_err(|source| MongoDaoError::ReadRecords { source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::ReadRecords { source })?;

        documents.into_iter().map(PlayerTurnRecord::try_from).collect()
    }

    async fn insert_record(&self, record: PlayerTurnRecord) -> MongoResult<bool> {
        let name = record.name.clone();
        let document = MongoPlayerTurnDocument::from(record);
        match self.players().await.insert_one(&document).await {
            Ok(_) => Ok(true),
            Err(err) if is_duplicate_key(&err) => Ok(false),
            Err(source) => Err(MongoDaoError::InsertRecord { name, source }),
        }
    }

    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected: TurnFields,
        new: TurnFields,
    ) -> MongoResult<bool> {
        let result = self
            .players()
            .await
            .update_one(compare_filter(id, &expected), swap_update(&new))
            .await
            .map_err(|source| MongoDaoError::UpdateRecord { id, source })?;
        Ok(result.matched_count > 0)
    }

    async fn adjust(
        &self,
        player: String,
        delta: i64,
        adjustment_id: Uuid,
    ) -> MongoResult<ScoreAdjustment> {
        let collection = self.scores().await;
        let marker = adjustment_id.to_string();

        for _ in 0..ADJUST_ATTEMPTS {
            // Matches only rows that have not seen this adjustment. A row that has seen it
            // makes the upsert collide on `_id`.
            let updated = collection
                .find_one_and_update(
                    doc! {"_id": player.as_str(), "recent": {"$ne": marker.as_str()}},
                    doc! {
                        "$inc": {"points": delta},
                        "$push": {"recent": {
                            "$each": [marker.as_str()],
                            "$slice": -(REMEMBERED_ADJUSTMENTS as i64),
                        }},
                    },
                )
                .upsert(true)
                .return_document(ReturnDocument::After)
                .await;

            match updated {
                Ok(Some(document)) => {
                    return Ok(ScoreAdjustment::Applied {
                        points: document.points,
                    });
                }
                Ok(None) => {
                    return Err(MongoDaoError::CorruptDocument {
                        message: format!("upsert of score `{player}` returned no document"),
                    });
                }
                Err(err) if is_duplicate_key(&err) => {
                    let existing = collection
                        .find_one(doc! {"_id": player.as_str()})
                        .await
                        .map_err(|source| MongoDaoError::AdjustScore {
                            player: player.clone(),
                            source,
                        })?;
                    match existing {
                        Some(existing) if existing.recent.contains(&marker) => {
                            return Ok(ScoreAdjustment::AlreadyApplied {
                                points: existing.points,
                            });
                        }
                        _ => {}
                    }
                    // Lost a race creating the row; try again against the row that won.
                }
                Err(source) => return Err(MongoDaoError::AdjustScore { player, source }),
            }
        }

        Err(MongoDaoError::CorruptDocument {
            message: format!("score `{player}` kept colliding on upsert"),
        })
    }

    async fn read_scores(&self) -> MongoResult<Vec<ScoreRecord>> {
        let documents: Vec<MongoScoreDocument> = self
            .scores()
            .await
            .find(doc! {})
            .await
            .map_err(|source| MongoDaoError::ReadScores { source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::ReadScores { source })?;

        let mut scores: Vec<ScoreRecord> = documents.into_iter().map(ScoreRecord::from).collect();
        sort_scores(&mut scores);
        Ok(scores)
    }

    async fn watch(&self, tables: Vec<Table>) -> MongoResult<ChangeFeed> {
        let database = {
            let guard = self.inner.state.read().await;
            if guard.replica_set.is_none() {
                return Err(MongoDaoError::StandaloneDeployment);
            }
            guard.database.clone()
        };
        let names: Vec<&str> = tables.iter().copied().map(collection_for).collect();
        let changes = database
            .watch()
            .pipeline([doc! {"$match": {"ns.coll": {"$in": names}}}])
            .await
            .map_err(|source| MongoDaoError::Watch { source })?;

        let feed = async_stream::stream! {
            let mut changes = Box::pin(changes);
            while let Some(change) = changes.next().await {
                match change {
                    Ok(event) => {
                        let table = event
                            .ns
                            .and_then(|ns| ns.coll)
                            .and_then(|coll| table_for(&coll));
                        if let Some(table) = table {
                            yield ChangeEvent { table };
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "MongoDB change stream ended");
                        break;
                    }
                }
            }
        };
        Ok(feed.boxed())
    }

    async fn server_now(&self) -> MongoResult<SystemTime> {
        let reply = self
            .database()
            .await
            .run_command(doc! {"hello": 1})
            .await
            .map_err(|source| MongoDaoError::ServerTime { source })?;
        match reply.get("localTime") {
            Some(Bson::DateTime(now)) => Ok(now.to_system_time()),
            _ => Err(MongoDaoError::CorruptDocument {
                message: "`hello` reply has no localTime".into(),
            }),
        }
    }
}

impl TurnStore for MongoTurnStore {
    fn read_player_records(
        &self,
        filter: RecordFilter,
    ) -> BoxFuture<'static, StorageResult<Vec<PlayerTurnRecord>>> {
        let store = self.clone();
        Box::pin(async move { store.read_records(filter).await.map_err(Into::into) })
    }

    fn insert_player_record(
        &self,
        record: PlayerTurnRecord,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.insert_record(record).await.map_err(Into::into) })
    }

    fn conditional_update_player_record(
        &self,
        id: Uuid,
        expected: TurnFields,
        new: TurnFields,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .compare_and_swap(id, expected, new)
                .await
                .map_err(Into::into)
        })
    }

    fn adjust_score(
        &self,
        player: String,
        delta: i64,
        adjustment_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<ScoreAdjustment>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .adjust(player, delta, adjustment_id)
                .await
                .map_err(Into::into)
        })
    }

    fn read_scores(&self) -> BoxFuture<'static, StorageResult<Vec<ScoreRecord>>> {
        let store = self.clone();
        Box::pin(async move { store.read_scores().await.map_err(Into::into) })
    }

    fn subscribe_changes(&self, tables: Vec<Table>) -> BoxFuture<'static, StorageResult<ChangeFeed>> {
        let store = self.clone();
        Box::pin(async move { store.watch(tables).await.map_err(Into::into) })
    }

    fn authoritative_now(&self) -> BoxFuture<'static, StorageResult<SystemTime>> {
        let store = self.clone();
        Box::pin(async move { store.server_now().await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
