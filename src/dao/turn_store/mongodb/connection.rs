use std::time::Duration;

use mongodb::{Client, Database, bson::doc};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{
    config::MongoConfig,
    error::{MongoDaoError, MongoResult},
};

const HANDSHAKE_ATTEMPTS: u32 = 5;
const FIRST_RETRY: Duration = Duration::from_millis(250);
const LAST_RETRY: Duration = Duration::from_secs(5);

/// A database handle whose deployment answered `hello`.
pub struct Deployment {
    pub database: Database,
    /// Replica set name; `None` on a standalone server, where change streams are unavailable.
    pub replica_set: Option<String>,
}

/// Build a client and wait until the deployment answers `hello`.
pub async fn establish_connection(config: &MongoConfig) -> MongoResult<Deployment> {
    let client = Client::with_options(config.options.clone())
        .map_err(|source| MongoDaoError::ClientConstruction { source })?;
    let database = client.database(&config.database_name);

    let mut delay = FIRST_RETRY;
    let mut attempt = 1;
    let reply = loop {
        match database.run_command(doc! { "hello": 1 }).await {
            Ok(reply) => break reply,
            Err(source) if attempt >= HANDSHAKE_ATTEMPTS => {
                return Err(MongoDaoError::InitialPing {
                    attempts: attempt,
                    source,
                });
            }
            Err(err) => {
                debug!(attempt, error = %err, "MongoDB handshake failed; retrying");
                sleep(delay).await;
                delay = (delay * 2).min(LAST_RETRY);
                attempt += 1;
            }
        }
    };

    let replica_set = reply.get_str("setName").ok().map(str::to_owned);
    match &replica_set {
        Some(name) => info!(
            replica_set = %name,
            database = %config.database_name,
            "MongoDB deployment ready"
        ),
        None => warn!(
            database = %config.database_name,
            "MongoDB is standalone; change streams unavailable, reconciliation will poll"
        ),
    }

    Ok(Deployment {
        database,
        replica_set,
    })
}
