//! Buzz Turn Back binary entrypoint wiring REST, WebSocket, SSE, and the turn store.

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use buzz_turn_back::{
    config::AppConfig,
    dao::{
        storage::StorageError,
        turn_store::{TimeoutStore, TurnStore, memory::MemoryTurnStore},
    },
    routes,
    services::storage_supervisor,
    state::{AppState, SharedState, clock::SystemClock},
};

/// Storage backends selectable through `STORE_BACKEND`.
#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    #[cfg(feature = "mongo-store")]
    Mongo,
    #[cfg(feature = "couch-store")]
    Couch,
}

impl Backend {
    fn from_env() -> anyhow::Result<Self> {
        let raw = env::var("STORE_BACKEND").unwrap_or_else(|_| "memory".into());
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            #[cfg(feature = "mongo-store")]
            "mongo" | "mongodb" => Ok(Backend::Mongo),
            #[cfg(feature = "couch-store")]
            "couch" | "couchdb" => Ok(Backend::Couch),
            other => bail!("unsupported STORE_BACKEND `{other}`"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let store_timeout = config.store_timeout;
    let backend = Backend::from_env()?;
    info!(?backend, "selected storage backend");

    let app_state = AppState::new(config);
    spawn_storage_supervisor(app_state.clone(), backend, store_timeout);

    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    Ok(())
}

/// Every backend call is bounded so a hung store degrades instead of blocking a turn.
fn bounded(store: Arc<dyn TurnStore>, limit: Duration) -> Arc<dyn TurnStore> {
    Arc::new(TimeoutStore::new(store, limit))
}

fn spawn_storage_supervisor(state: SharedState, backend: Backend, limit: Duration) {
    match backend {
        Backend::Memory => {
            // One store for the whole process; reconnecting must not wipe it.
            let store = bounded(Arc::new(MemoryTurnStore::new(Arc::new(SystemClock))), limit);
            tokio::spawn(storage_supervisor::run(state, move || {
                let store = store.clone();
                async move { Ok::<_, StorageError>(store) }
            }));
        }
        #[cfg(feature = "mongo-store")]
        Backend::Mongo => {
            use buzz_turn_back::dao::turn_store::mongodb::{MongoConfig, MongoTurnStore};

            tokio::spawn(storage_supervisor::run(state, move || async move {
                let config = MongoConfig::from_env().await?;
                let store = MongoTurnStore::connect(config).await?;
                Ok::<_, StorageError>(bounded(Arc::new(store), limit))
            }));
        }
        #[cfg(feature = "couch-store")]
        Backend::Couch => {
            use buzz_turn_back::dao::turn_store::couchdb::{CouchConfig, CouchTurnStore};

            tokio::spawn(storage_supervisor::run(state, move || async move {
                let config = CouchConfig::from_env()?;
                let store = CouchTurnStore::connect(config).await?;
                Ok::<_, StorageError>(bounded(Arc::new(store), limit))
            }));
        }
    }
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
