use mongodb::bson::{Binary, Bson, DateTime, Document, doc, spec::BinarySubtype};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{MongoDaoError, MongoResult};
use crate::dao::models::{PlayerTurnRecord, RecordFilter, ScoreRecord, TurnFields};

/// One row of the `player_turns` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoPlayerTurnDocument {
    #[serde(rename = "_id")]
    id: Binary,
    name: String,
    is_eligible: bool,
    has_buzzed: bool,
    has_failed: bool,
    turn_started_at: Option<DateTime>,
    last_updated_at: DateTime,
}

impl From<PlayerTurnRecord> for MongoPlayerTurnDocument {
    fn from(value: PlayerTurnRecord) -> Self {
        Self {
            id: uuid_as_binary(value.id),
            name: value.name,
            is_eligible: value.is_eligible,
            has_buzzed: value.has_buzzed,
            has_failed: value.has_failed,
            turn_started_at: value.turn_started_at.map(DateTime::from_system_time),
            last_updated_at: DateTime::from_system_time(value.last_updated_at),
        }
    }
}

impl TryFrom<MongoPlayerTurnDocument> for PlayerTurnRecord {
    type Error = MongoDaoError;

    fn try_from(value: MongoPlayerTurnDocument) -> MongoResult<Self> {
        let id = Uuid::from_slice(&value.id.bytes).map_err(|err| {
            MongoDaoError::CorruptDocument {
                message: format!("player `{}` has an invalid id: {err}", value.name),
            }
        })?;
        Ok(Self {
            id,
            name: value.name,
            is_eligible: value.is_eligible,
            has_buzzed: value.has_buzzed,
            has_failed: value.has_failed,
            turn_started_at: value.turn_started_at.map(DateTime::to_system_time),
            last_updated_at: value.last_updated_at.to_system_time(),
        })
    }
}

/// One row of the `scores` collection, keyed by player name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoScoreDocument {
    #[serde(rename = "_id")]
    pub player: String,
    pub points: i64,
    /// Most recent adjustment ids, oldest first.
    #[serde(default)]
    pub recent: Vec<String>,
}

impl From<MongoScoreDocument> for ScoreRecord {
    fn from(value: MongoScoreDocument) -> Self {
        Self {
            player: value.player,
            points: value.points,
        }
    }
}

pub fn uuid_as_binary(id: Uuid) -> Binary {
    Binary {
        subtype: BinarySubtype::Uuid,
        bytes: id.into_bytes().to_vec(),
    }
}

pub fn doc_id(id: Uuid) -> Document {
    doc! {"_id": uuid_as_binary(id)}
}

pub fn record_filter(filter: &RecordFilter) -> Document {
    match filter {
        RecordFilter::All => doc! {},
        RecordFilter::Eligible => doc! {"is_eligible": true},
        RecordFilter::Name(name) => doc! {"name": name.as_str()},
    }
}

fn optional_time(fields: &TurnFields) -> Bson {
    match fields.turn_started_at {
        Some(at) => Bson::DateTime(DateTime::from_system_time(at)),
        None => Bson::Null,
    }
}

/// Filter matching `id` only while its turn columns still equal `expected`.
pub fn compare_filter(id: Uuid, expected: &TurnFields) -> Document {
    let mut filter = doc_id(id);
    filter.insert("is_eligible", expected.is_eligible);
    filter.insert("has_buzzed", expected.has_buzzed);
    filter.insert("has_failed", expected.has_failed);
    filter.insert("turn_started_at", optional_time(expected));
    filter
}

/// Pipeline update writing `new` and stamping the server clock.
pub fn swap_update(new: &TurnFields) -> Vec<Document> {
    vec![doc! {
        "$set": {
            "is_eligible": new.is_eligible,
            "has_buzzed": new.has_buzzed,
            "has_failed": new.has_failed,
            "turn_started_at": optional_time(new),
            "last_updated_at": "$$NOW",
        }
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn record_survives_the_document_shape() {
        let mut record =
            PlayerTurnRecord::registered("alice", UNIX_EPOCH + Duration::from_millis(1_500));
        let fields = record
            .turn_fields()
            .claimed(UNIX_EPOCH + Duration::from_millis(2_000));
        record.apply_turn_fields(fields, UNIX_EPOCH + Duration::from_millis(2_000));

        let document = MongoPlayerTurnDocument::from(record.clone());
        let back = PlayerTurnRecord::try_from(document).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn unclaimed_records_compare_against_null() {
        let fields = TurnFields {
            is_eligible: true,
            has_buzzed: false,
            has_failed: false,
            turn_started_at: None,
        };
        let filter = compare_filter(Uuid::now_v7(), &fields);
        assert_eq!(filter.get("turn_started_at"), Some(&Bson::Null));
        assert_eq!(filter.get("has_buzzed"), Some(&Bson::Boolean(false)));
    }
}
