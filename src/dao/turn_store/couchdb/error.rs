//! Error types shared by the CouchDB storage implementation.

use reqwest::StatusCode;
use thiserror::Error;

/// Convenient result alias returning [`CouchDaoError`] failures.
pub type CouchResult<T> = Result<T, CouchDaoError>;

/// Failures that can occur while interacting with CouchDB.
#[derive(Debug, Error)]
pub enum CouchDaoError {
    /// A required connection setting was not exported.
    #[error("missing CouchDB environment variable `{var}`")]
    MissingEnvVar {
        /// Name of the variable.
        var: &'static str,
    },
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build CouchDB client")]
    ClientBuilder {
        /// HTTP client failure.
        #[source]
        source: reqwest::Error,
    },
    /// The existence check on the turn database could not be sent.
    #[error("failed to query CouchDB database `{database}`")]
    DatabaseQuery {
        /// Database being checked.
        database: String,
        /// HTTP client failure.
        #[source]
        source: reqwest::Error,
    },
    /// Creating the missing turn database failed in transit.
    #[error("failed to create CouchDB database `{database}`")]
    DatabaseCreate {
        /// Database being created.
        database: String,
        /// HTTP client failure.
        #[source]
        source: reqwest::Error,
    },
    /// The database endpoint answered with a status other than success or "already exists".
    #[error("unexpected CouchDB database response status {status} for `{database}`")]
    DatabaseStatus {
        /// Database addressed.
        database: String,
        /// Status returned by the server.
        status: StatusCode,
    },
    /// A document, listing or changes request never reached the server.
    #[error("failed to send CouchDB request to `{path}`")]
    RequestSend {
        /// Path relative to the database.
        path: String,
        /// HTTP client failure.
        #[source]
        source: reqwest::Error,
    },
    /// A document, listing or changes request came back with an unexpected status.
    #[error("unexpected CouchDB response status {status} for `{path}`")]
    RequestStatus {
        /// Path relative to the database.
        path: String,
        /// Status returned by the server.
        status: StatusCode,
    },
    /// The response body was not the JSON shape expected for the endpoint.
    #[error("failed to decode CouchDB response for `{path}`")]
    DecodeResponse {
        /// Path relative to the database.
        path: String,
        /// HTTP client failure.
        #[source]
        source: reqwest::Error,
    },
    /// A listed row could not be turned into a player, name or score document.
    #[error("failed to deserialize CouchDB value for `{path}`")]
    DeserializeValue {
        /// Document or listing the value came from.
        path: String,
        /// JSON decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// A stored document does not describe a valid turn record.
    #[error("invalid document `{doc_id}`: {kind}")]
    InvalidDocument {
        /// Offending document id.
        doc_id: String,
        /// What was wrong with it.
        kind: &'static str,
    },
    /// The server answered without a usable `Date` header.
    #[error("CouchDB response carried no parsable Date header")]
    MissingDate,
    /// A read-modify-write kept losing to concurrent writers.
    #[error("document `{path}` kept conflicting after {attempts} attempt(s)")]
    Contention {
        /// Document being updated.
        path: String,
        /// Writes tried before giving up.
        attempts: usize,
    },
}
