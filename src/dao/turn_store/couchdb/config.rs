//! CouchDB connection settings.

use super::error::{CouchDaoError, CouchResult};

const DEFAULT_DB: &str = "buzz_turn";

/// Basic-auth credentials for a CouchDB server.
#[derive(Debug, Clone)]
pub struct CouchCredentials {
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
}

/// Where the turn documents live.
#[derive(Debug, Clone)]
pub struct CouchConfig {
    /// Server root without a trailing slash.
    pub base_url: String,
    /// Database holding the turn documents.
    pub database: String,
    /// Sent as basic auth when present.
    pub credentials: Option<CouchCredentials>,
}

impl CouchConfig {
    /// Anonymous access to `database` (or the default one) on `base_url`.
    pub fn new(base_url: &str, database: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            database: database
                .map(str::trim)
                .filter(|db| !db.is_empty())
                .unwrap_or(DEFAULT_DB)
                .to_owned(),
            credentials: None,
        }
    }

    /// Authenticate every request with basic auth.
    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.credentials = Some(CouchCredentials { username, password });
        self
    }

    /// Read `COUCH_BASE_URL` (required), `COUCH_DB`, and `COUCH_USERNAME`/`COUCH_PASSWORD`.
    ///
    /// Credentials are only used when both halves are set.
    pub fn from_env() -> CouchResult<Self> {
        let base_url = std::env::var("COUCH_BASE_URL").map_err(|_| {
            CouchDaoError::MissingEnvVar {
                var: "COUCH_BASE_URL",
            }
        })?;
        let database = std::env::var("COUCH_DB").ok();
        let config = Self::new(&base_url, database.as_deref());

        Ok(
            match (
                std::env::var("COUCH_USERNAME").ok(),
                std::env::var("COUCH_PASSWORD").ok(),
            ) {
                (Some(username), Some(password)) => config.with_credentials(username, password),
                _ => config,
            },
        )
    }
}
