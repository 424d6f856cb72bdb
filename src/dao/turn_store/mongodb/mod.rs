mod config;
mod connection;
mod error;
mod models;
/// Store implementation over the driver.
pub mod store;

pub use config::MongoConfig;
pub use error::MongoDaoError;
pub use store::MongoTurnStore;

use crate::dao::storage::StorageError;

impl From<MongoDaoError> for StorageError {
    fn from(err: MongoDaoError) -> Self {
        StorageError::unavailable(err.to_string(), err)
    }
}
