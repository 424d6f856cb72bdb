//! Error types raised by the MongoDB turn store.

use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use thiserror::Error;
use uuid::Uuid;

/// Convenient result alias returning [`MongoDaoError`] failures.
pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

const DUPLICATE_KEY: i32 = 11000;

/// Failures that can occur while interacting with MongoDB.
#[derive(Debug, Error)]
pub enum MongoDaoError {
    /// A required connection setting was not exported.
    #[error("missing environment variable `{var}`")]
    MissingEnvVar {
        /// Name of the variable.
        var: &'static str,
    },
    /// The connection string could not be parsed.
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        /// URI as configured.
        uri: String,
        /// Driver failure.
        #[source]
        source: MongoError,
    },
    /// The driver refused the parsed client options.
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        /// Driver failure.
        #[source]
        source: MongoError,
    },
    /// The server never answered the startup handshake.
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        /// Handshakes tried.
        attempts: u32,
        /// Failure of the last handshake.
        #[source]
        source: MongoError,
    },
    /// A liveness ping failed after startup.
    #[error("MongoDB ping health check failed")]
    HealthPing {
        /// Driver failure.
        #[source]
        source: MongoError,
    },
    /// A unique index the store relies on could not be created.
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        /// Collection holding the index.
        collection: &'static str,
        /// Index name.
        index: &'static str,
        /// Driver failure.
        #[source]
        source: MongoError,
    },
    /// Listing player turn records failed.
    #[error("failed to read player turn records")]
    ReadRecords {
        /// Driver failure.
        #[source]
        source: MongoError,
    },
    /// Registering a player failed for a reason other than a taken name.
    #[error("failed to insert player `{name}`")]
    InsertRecord {
        /// Name being registered.
        name: String,
        /// Driver failure.
        #[source]
        source: MongoError,
    },
    /// A conditional turn update could not be sent.
    #[error("failed to update player record `{id}`")]
    UpdateRecord {
        /// Record targeted.
        id: Uuid,
        /// Driver failure.
        #[source]
        source: MongoError,
    },
    /// A score increment could not be applied.
    #[error("failed to adjust score of `{player}`")]
    AdjustScore {
        /// Player whose score was adjusted.
        player: String,
        /// Driver failure.
        #[source]
        source: MongoError,
    },
    /// Listing scores failed.
    #[error("failed to read scores")]
    ReadScores {
        /// Driver failure.
        #[source]
        source: MongoError,
    },
    /// The change stream could not be opened.
    #[error("failed to open change stream")]
    Watch {
        /// Driver failure.
        #[source]
        source: MongoError,
    },
    /// Change streams only exist on replica sets and sharded clusters.
    #[error("MongoDB deployment is standalone; change streams are unavailable")]
    StandaloneDeployment,
    /// The server clock could not be read.
    #[error("failed to read the server clock")]
    ServerTime {
        /// Driver failure.
        #[source]
        source: MongoError,
    },
    /// A stored document did not have the expected fields.
    #[error("unexpected document shape: {message}")]
    CorruptDocument {
        /// What was wrong.
        message: String,
    },
}

/// Whether `err` is a unique index violation.
pub fn is_duplicate_key(err: &MongoError) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY
    ) || matches!(
        err.kind.as_ref(),
        ErrorKind::Command(command) if command.code == DUPLICATE_KEY
    )
}
