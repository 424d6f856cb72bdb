use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::error::{CouchDaoError, CouchResult};
use crate::dao::models::{
    PlayerTurnRecord, ScoreRecord, Table, TurnFields, epoch_millis, from_epoch_millis,
};

pub const PLAYER_PREFIX: &str = "player::";
pub const NAME_PREFIX: &str = "name::";
pub const SCORE_PREFIX: &str = "score::";
pub const END_SUFFIX: &str = "\u{ffff}";

#[derive(Debug, Deserialize)]
pub struct AllDocsResponse {
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
pub struct AllDocsRow {
    pub id: String,
    #[serde(default)]
    pub doc: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ChangesResponse {
    #[serde(default)]
    pub results: Vec<ChangeRow>,
    pub last_seq: Value,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRow {
    pub id: String,
}

/// Turn row of one player, keyed by the record id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchPlayerDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub name: String,
    pub is_eligible: bool,
    pub has_buzzed: bool,
    pub has_failed: bool,
    pub turn_started_at_ms: Option<i64>,
    pub last_updated_at_ms: i64,
}

impl CouchPlayerDocument {
    pub fn fields(&self) -> TurnFields {
        TurnFields {
            is_eligible: self.is_eligible,
            has_buzzed: self.has_buzzed,
            has_failed: self.has_failed,
            turn_started_at: self.turn_started_at_ms.map(from_epoch_millis),
        }
    }

    pub fn set_fields(&mut self, fields: TurnFields, now_ms: i64) {
        self.is_eligible = fields.is_eligible;
        self.has_buzzed = fields.has_buzzed;
        self.has_failed = fields.has_failed;
        self.turn_started_at_ms = fields.turn_started_at.map(epoch_millis);
        self.last_updated_at_ms = now_ms;
    }
}

impl From<PlayerTurnRecord> for CouchPlayerDocument {
    fn from(record: PlayerTurnRecord) -> Self {
        Self {
            id: player_doc_id(record.id),
            rev: None,
            name: record.name,
            is_eligible: record.is_eligible,
            has_buzzed: record.has_buzzed,
            has_failed: record.has_failed,
            turn_started_at_ms: record.turn_started_at.map(epoch_millis),
            last_updated_at_ms: epoch_millis(record.last_updated_at),
        }
    }
}

impl TryFrom<CouchPlayerDocument> for PlayerTurnRecord {
    type Error = CouchDaoError;

    fn try_from(doc: CouchPlayerDocument) -> CouchResult<Self> {
        let id = doc
            .id
            .strip_prefix(PLAYER_PREFIX)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| CouchDaoError::InvalidDocument {
                doc_id: doc.id.clone(),
                kind: "player id is not a UUID",
            })?;
        Ok(Self {
            id,
            name: doc.name,
            is_eligible: doc.is_eligible,
            has_buzzed: doc.has_buzzed,
            has_failed: doc.has_failed,
            turn_started_at: doc.turn_started_at_ms.map(from_epoch_millis),
            last_updated_at: from_epoch_millis(doc.last_updated_at_ms),
        })
    }
}

/// Reservation of a player name. Its document id makes names unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchNameDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub player_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchScoreDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub player: String,
    pub points: i64,
    /// Most recent adjustment ids, oldest first.
    #[serde(default)]
    pub recent: Vec<String>,
}

impl CouchScoreDocument {
    pub fn empty(player: &str) -> Self {
        Self {
            id: score_doc_id(player),
            rev: None,
            player: player.to_string(),
            points: 0,
            recent: Vec::new(),
        }
    }
}

impl From<CouchScoreDocument> for ScoreRecord {
    fn from(doc: CouchScoreDocument) -> Self {
        Self {
            player: doc.player,
            points: doc.points,
        }
    }
}

pub fn player_doc_id(id: Uuid) -> String {
    format!("{PLAYER_PREFIX}{id}")
}

/// Names are hex encoded so any player name yields a safe document id.
pub fn name_doc_id(name: &str) -> String {
    format!("{NAME_PREFIX}{}", hex(name))
}

pub fn score_doc_id(player: &str) -> String {
    format!("{SCORE_PREFIX}{}", hex(player))
}

fn hex(value: &str) -> String {
    value.bytes().map(|byte| format!("{byte:02x}")).collect()
}

/// Table a changed document belongs to, from its id prefix.
pub fn table_for(doc_id: &str) -> Option<Table> {
    if doc_id.starts_with(PLAYER_PREFIX) || doc_id.starts_with(NAME_PREFIX) {
        Some(Table::PlayerTurns)
    } else if doc_id.starts_with(SCORE_PREFIX) {
        Some(Table::Scores)
    } else {
        None
    }
}
