//! [`TurnStore`](crate::dao::turn_store::TurnStore) over the CouchDB HTTP API.

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::SystemTime,
};

use futures::{StreamExt, future::BoxFuture};
use reqwest::{Client, Method, Response, StatusCode, header::DATE};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, from_value};
use time::{PrimitiveDateTime, format_description};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    config::CouchConfig,
    error::{CouchDaoError, CouchResult},
    models::{
        AllDocsResponse, ChangesResponse, CouchNameDocument, CouchPlayerDocument,
        CouchScoreDocument, END_SUFFIX, PLAYER_PREFIX, SCORE_PREFIX, name_doc_id, player_doc_id,
        score_doc_id, table_for,
    },
};
use crate::dao::{
    models::{
        ChangeEvent, PlayerTurnRecord, REMEMBERED_ADJUSTMENTS, RecordFilter, ScoreAdjustment,
        ScoreRecord, Table, TurnFields, epoch_millis, from_epoch_millis, sort_scores,
    },
    storage::StorageResult,
    turn_store::{ChangeFeed, TurnStore},
};

/// Read-modify-write rounds on a score document before giving up.
const ADJUST_ATTEMPTS: usize = 5;
/// How long CouchDB holds a longpoll request open without changes.
const LONGPOLL_TIMEOUT_MS: &str = "25000";
const HTTP_DATE_FORMAT: &str =
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT";

#[derive(Debug, Deserialize)]
struct PutResponse {
    rev: String,
}

/// Result of a conditional document write.
enum PutOutcome {
    Saved { rev: String },
    Conflict,
}

/// [`TurnStore`] backed by CouchDB.
///
/// Every conditional write is a revision-guarded `PUT`; a `409 Conflict` means another
/// writer got there first. CouchDB has no server clock call, so the authoritative time is
/// derived from the `Date` header and refined with the local clock below one second.
#[derive(Clone)]
pub struct CouchTurnStore {
    client: Client,
    base_url: Arc<str>,
    database: Arc<str>,
    auth: Option<(Arc<str>, Arc<str>)>,
    /// Offset in milliseconds between the server clock and the local clock.
    skew_ms: Arc<AtomicI64>,
}

impl CouchTurnStore {
    /// Establish a connection to CouchDB and ensure the database exists.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| CouchDaoError::ClientBuilder { source })?;

        let base_url = Arc::<str>::from(config.base_url);
        let database = Arc::<str>::from(config.database);
        let auth = config.credentials.map(|credentials| {
            (
                Arc::<str>::from(credentials.username),
                Arc::<str>::from(credentials.password),
            )
        });

        let store = Self {
            client,
            base_url,
            database,
            auth,
            skew_ms: Arc::new(AtomicI64::new(0)),
        };

        store.ensure_database().await?;
        Ok(store)
    }

    fn database_url(&self) -> String {
        format!("{}/{}", self.base_url, self.database)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some((ref user, ref pass)) = self.auth {
            builder.basic_auth(user.as_ref(), Some(pass.as_ref()))
        } else {
            builder
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.database_url(), path);
        self.authorize(self.client.request(method, url))
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let database = self.database.to_string();
        let url = self.database_url();

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|source| CouchDaoError::DatabaseQuery {
                database: database.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                let create = self
                    .authorize(self.client.put(&url))
                    .send()
                    .await
                    .map_err(|source| CouchDaoError::DatabaseCreate {
                        database: database.clone(),
                        source,
                    })?;
                // 412 means a concurrent instance created it first.
                if create.status().is_success() || create.status() == StatusCode::PRECONDITION_FAILED
                {
                    Ok(())
                } else {
                    Err(CouchDaoError::DatabaseStatus {
                        database,
                        status: create.status(),
                    })
                }
            }
            other => Err(CouchDaoError::DatabaseStatus {
                database,
                status: other,
            }),
        }
    }

    async fn get_document<T>(&self, doc_id: &str) -> CouchResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let response = self
            .request(Method::GET, doc_id)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                response.json::<T>().await.map(Some).map_err(|source| {
                    CouchDaoError::DecodeResponse {
                        path: doc_id.to_string(),
                        source,
                    }
                })
            }
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    /// Write a document. A stale or missing `_rev` answers [`PutOutcome::Conflict`].
    async fn put_document<T>(&self, doc_id: &str, document: &T) -> CouchResult<PutOutcome>
    where
        T: ?Sized + Serialize,
    {
        let response = self
            .request(Method::PUT, doc_id)
            .json(document)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::CONFLICT => Ok(PutOutcome::Conflict),
            status if status.is_success() => {
                let saved = response.json::<PutResponse>().await.map_err(|source| {
                    CouchDaoError::DecodeResponse {
                        path: doc_id.to_string(),
                        source,
                    }
                })?;
                Ok(PutOutcome::Saved { rev: saved.rev })
            }
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn delete_document(&self, doc_id: &str, rev: &str) -> CouchResult<()> {
        let response = self
            .request(Method::DELETE, doc_id)
            .query(&[("rev", rev)])
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: response.status(),
            })
        }
    }

    async fn list_documents<T>(&self, prefix: &str) -> CouchResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        const ALL_DOCS: &str = "_all_docs";
        let query = [
            ("include_docs", "true".to_string()),
            ("startkey", format!("\"{}\"", prefix)),
            ("endkey", format!("\"{}{}\"", prefix, END_SUFFIX)),
        ];

        let response = self
            .request(Method::GET, ALL_DOCS)
            .query(&query)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: ALL_DOCS.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: ALL_DOCS.to_string(),
                status: response.status(),
            });
        }

        let payload = response.json::<AllDocsResponse>().await.map_err(|source| {
            CouchDaoError::DecodeResponse {
                path: ALL_DOCS.to_string(),
                source,
            }
        })?;

        let mut documents = Vec::new();
        for row in payload.rows {
            if let Some(doc) = row.doc {
                let parsed = from_value(doc).map_err(|source| CouchDaoError::DeserializeValue {
                    path: row.id,
                    source,
                })?;
                documents.push(parsed);
            }
        }

        Ok(documents)
    }

    async fn read_records(&self, filter: RecordFilter) -> CouchResult<Vec<PlayerTurnRecord>> {
        let documents: Vec<CouchPlayerDocument> = match &filter {
            RecordFilter::Name(name) => {
                let Some(reservation) = self
                    .get_document::<CouchNameDocument>(&name_doc_id(name))
                    .await?
                else {
                    return Ok(Vec::new());
                };
                self.get_document::<CouchPlayerDocument>(&player_doc_id(reservation.player_id))
                    .await?
                    .into_iter()
                    .collect()
            }
            RecordFilter::All | RecordFilter::Eligible => {
                self.list_documents::<CouchPlayerDocument>(PLAYER_PREFIX)
                    .await?
            }
        };

        let mut records = Vec::with_capacity(documents.len());
        for document in documents {
            let record = PlayerTurnRecord::try_from(document)?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn insert_record(&self, record: PlayerTurnRecord) -> CouchResult<bool> {
        let reservation = CouchNameDocument {
            id: name_doc_id(&record.name),
            rev: None,
            player_id: record.id,
        };
        let reservation_rev = match self.put_document(&reservation.id, &reservation).await? {
            PutOutcome::Saved { rev } => rev,
            PutOutcome::Conflict => return Ok(false),
        };

        let document = CouchPlayerDocument::from(record);
        match self.put_document(&document.id, &document).await {
            Ok(PutOutcome::Saved { .. }) => Ok(true),
            Ok(PutOutcome::Conflict) => Err(CouchDaoError::InvalidDocument {
                doc_id: document.id,
                kind: "player id already in use",
            }),
            Err(err) => {
                // Release the name so a retry can claim it again.
                if let Err(cleanup) = self
                    .delete_document(&reservation.id, &reservation_rev)
                    .await
                {
                    warn!(error = %cleanup, name = %document.name, "failed to release player name");
                }
                Err(err)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected: TurnFields,
        new: TurnFields,
    ) -> CouchResult<bool> {
        let doc_id = player_doc_id(id);
        let Some(mut document) = self.get_document::<CouchPlayerDocument>(&doc_id).await? else {
            return Ok(false);
        };
        if document.fields() != expected {
            return Ok(false);
        }

        document.set_fields(new, self.estimated_server_millis());
        match self.put_document(&doc_id, &document).await? {
            PutOutcome::Saved { .. } => Ok(true),
            PutOutcome::Conflict => Ok(false),
        }
    }

    async fn adjust(
        &self,
        player: String,
        delta: i64,
        adjustment_id: Uuid,
    ) -> CouchResult<ScoreAdjustment> {
        let doc_id = score_doc_id(&player);
        let marker = adjustment_id.to_string();

        for _ in 0..ADJUST_ATTEMPTS {
            let mut document = self
                .get_document::<CouchScoreDocument>(&doc_id)
                .await?
                .unwrap_or_else(|| CouchScoreDocument::empty(&player));
            if document.recent.contains(&marker) {
                return Ok(ScoreAdjustment::AlreadyApplied {
                    points: document.points,
                });
            }

            document.points += delta;
            document.recent.push(marker.clone());
            let overflow = document.recent.len().saturating_sub(REMEMBERED_ADJUSTMENTS);
            document.recent.drain(..overflow);

            match self.put_document(&doc_id, &document).await? {
                PutOutcome::Saved { .. } => {
                    return Ok(ScoreAdjustment::Applied {
                        points: document.points,
                    });
                }
                PutOutcome::Conflict => {
                    debug!(player = %player, "score write conflicted; re-reading");
                }
            }
        }

        Err(CouchDaoError::Contention {
            path: doc_id,
            attempts: ADJUST_ATTEMPTS,
        })
    }

    async fn read_scores(&self) -> CouchResult<Vec<ScoreRecord>> {
        let documents = self
            .list_documents::<CouchScoreDocument>(SCORE_PREFIX)
            .await?;
        let mut scores: Vec<ScoreRecord> = documents.into_iter().map(ScoreRecord::from).collect();
        sort_scores(&mut scores);
        Ok(scores)
    }

    /// One `_changes` round trip. Returns the tables touched and the sequence to resume from.
    async fn poll_changes(
        &self,
        mode: ChangesMode,
        since: &Value,
    ) -> CouchResult<(Vec<Table>, Value)> {
        const CHANGES: &str = "_changes";
        let query = changes_query(mode, since);

        let response = self
            .request(Method::GET, CHANGES)
            .query(&query)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: CHANGES.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: CHANGES.to_string(),
                status: response.status(),
            });
        }

        let payload = response.json::<ChangesResponse>().await.map_err(|source| {
            CouchDaoError::DecodeResponse {
                path: CHANGES.to_string(),
                source,
            }
        })?;

        let mut tables = Vec::new();
        for table in payload.results.iter().filter_map(|row| table_for(&row.id)) {
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
        Ok((tables, payload.last_seq))
    }

    async fn watch(&self, tables: Vec<Table>) -> CouchResult<ChangeFeed> {
        // Snapshot the current sequence without waiting, so an idle server still answers
        // inside the store timeout. Unreachable servers fail the subscription here.
        let (_, start) = self
            .poll_changes(ChangesMode::Snapshot, &Value::String("now".into()))
            .await?;
        let store = self.clone();

        let feed = async_stream::stream! {
            let mut since = start;
            loop {
                match store.poll_changes(ChangesMode::Wait, &since).await {
                    Ok((changed, next)) => {
                        since = next;
                        for table in changed {
                            if tables.contains(&table) {
                                yield ChangeEvent { table };
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "CouchDB changes feed ended");
                        break;
                    }
                }
            }
        };
        Ok(feed.boxed())
    }

    fn estimated_server_millis(&self) -> i64 {
        epoch_millis(SystemTime::now()) + self.skew_ms.load(Ordering::Relaxed)
    }

    /// Re-anchor the skew whenever the local estimate leaves the server's current second.
    fn observe_server_date(&self, server_second_ms: i64) -> i64 {
        let local = epoch_millis(SystemTime::now());
        let estimate = local + self.skew_ms.load(Ordering::Relaxed);
        if (server_second_ms..server_second_ms + 1000).contains(&estimate) {
            return estimate;
        }
        let skew = server_second_ms + 500 - local;
        self.skew_ms.store(skew, Ordering::Relaxed);
        local + skew
    }

    async fn server_now(&self) -> CouchResult<SystemTime> {
        let url = self.database_url();
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: url.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: url,
                status: response.status(),
            });
        }

        let server_second_ms = response_date_millis(&response)?;
        Ok(from_epoch_millis(self.observe_server_date(server_second_ms)))
    }
}

fn response_date_millis(response: &Response) -> CouchResult<i64> {
    let header = response
        .headers()
        .get(DATE)
        .and_then(|value| value.to_str().ok())
        .ok_or(CouchDaoError::MissingDate)?;
    parse_http_date(header).ok_or(CouchDaoError::MissingDate)
}

/// How a `_changes` request waits for news.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangesMode {
    /// Answer at once with the current sequence.
    Snapshot,
    /// Hold the request open until a change lands or the server timeout passes.
    Wait,
}

fn changes_query(mode: ChangesMode, since: &Value) -> Vec<(&'static str, String)> {
    let since = match since {
        Value::String(seq) => seq.clone(),
        other => other.to_string(),
    };
    match mode {
        ChangesMode::Snapshot => vec![("feed", "normal".to_string()), ("since", since)],
        ChangesMode::Wait => vec![
            ("feed", "longpoll".to_string()),
            ("since", since),
            ("timeout", LONGPOLL_TIMEOUT_MS.to_string()),
        ],
    }
}

/// Parse an IMF-fixdate such as `Sun, 06 Nov 1994 08:49:37 GMT` into epoch milliseconds.
fn parse_http_date(value: &str) -> Option<i64> {
    let format = format_description::parse(HTTP_DATE_FORMAT).ok()?;
    let parsed = PrimitiveDateTime::parse(value, format.as_slice()).ok()?;
    Some(parsed.assume_utc().unix_timestamp() * 1000)
}

impl TurnStore for CouchTurnStore {
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
        Box::pin(async move {
            let url = store.database_url();
            let response = store
                .authorize(store.client.get(&url))
                .send()
                .await
                .map_err(|source| CouchDaoError::RequestSend {
                    path: url.clone(),
                    source,
                })?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(CouchDaoError::RequestStatus {
                    path: url,
                    status: response.status(),
                }
                .into())
            }
        })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_database().await.map_err(Into::into) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_dates_parse_to_whole_seconds() {
        assert_eq!(
            parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"),
            Some(784_111_777_000)
        );
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn feed_handshake_never_waits_for_a_change() {
        let query = changes_query(ChangesMode::Snapshot, &Value::String("now".into()));
        assert!(query.contains(&("feed", "normal".to_string())));
        assert!(query.iter().all(|(key, _)| *key != "timeout"));

        let query = changes_query(ChangesMode::Wait, &serde_json::json!(42));
        assert!(query.contains(&("feed", "longpoll".to_string())));
        assert!(query.contains(&("since", "42".to_string())));
    }

    #[test]
    fn idle_changes_snapshot_still_yields_a_sequence() {
        let payload: ChangesResponse =
            serde_json::from_str(r#"{"results":[],"last_seq":"17-g1AAAAB","pending":0}"#).unwrap();
        assert!(payload.results.is_empty());
        assert_eq!(payload.last_seq, Value::String("17-g1AAAAB".into()));
    }
}
