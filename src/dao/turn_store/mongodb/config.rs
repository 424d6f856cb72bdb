//! MongoDB connection settings.

use mongodb::options::ClientOptions;

use super::error::{MongoDaoError, MongoResult};

const DEFAULT_DB: &str = "buzz_turn";
const APP_NAME: &str = "buzz-turn-back";

/// Parsed connection settings for the turn store database.
#[derive(Clone)]
pub struct MongoConfig {
    /// Driver options parsed from the URI.
    pub options: ClientOptions,
    /// Database holding the turn collections.
    pub database_name: String,
}

impl MongoConfig {
    /// Parse `uri`, picking the database from `db_name`, then the URI, then the default.
    pub async fn from_uri(uri: &str, db_name: Option<&str>) -> MongoResult<Self> {
        let mut options =
            ClientOptions::parse(uri)
                .await
                .map_err(|source| MongoDaoError::InvalidUri {
                    uri: uri.to_owned(),
                    source,
                })?;
        options.app_name.get_or_insert_with(|| APP_NAME.to_owned());

        // An explicit name wins over the one embedded in the URI path.
        let database_name = db_name
            .map(str::to_owned)
            .or_else(|| options.default_database.clone())
            .unwrap_or_else(|| DEFAULT_DB.to_owned());

        Ok(Self {
            options,
            database_name,
        })
    }

    /// Read `MONGO_URI` (required) and `MONGO_DB` (optional).
    pub async fn from_env() -> MongoResult<Self> {
        let uri = std::env::var("MONGO_URI")
            .map_err(|_| MongoDaoError::MissingEnvVar { var: "MONGO_URI" })?;
        let db = std::env::var("MONGO_DB").ok().filter(|db| !db.trim().is_empty());
        Self::from_uri(&uri, db.as_deref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn database_name_falls_back_to_the_uri_then_default() {
        let from_path = MongoConfig::from_uri("mongodb://localhost:27017/quiz", None)
            .await
            .unwrap();
        assert_eq!(from_path.database_name, "quiz");
        assert_eq!(from_path.options.app_name.as_deref(), Some(APP_NAME));

        let explicit = MongoConfig::from_uri("mongodb://localhost:27017/quiz", Some("night"))
            .await
            .unwrap();
        assert_eq!(explicit.database_name, "night");

        let bare = MongoConfig::from_uri("mongodb://localhost:27017", None)
            .await
            .unwrap();
        assert_eq!(bare.database_name, DEFAULT_DB);
    }
}
