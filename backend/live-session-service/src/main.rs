/// Live Session Service - HTTP Server
///
/// Control API, ingest endpoint and chat WebSocket on one listener.
use actix_web::{middleware as actix_middleware, web, App, HttpServer};
use anyhow::Context;
use live_session_service::handlers;
use live_session_service::logging::init_tracing;
use live_session_service::metrics::MetricsMiddleware;
use live_session_service::services::{
    InMemoryMetadataStore, InMemorySegmentStore, PassthroughExecutor,
};
use live_session_service::models::{Channel, Visibility};
use live_session_service::{AppState, Config};
use std::sync::Arc;
use uuid::Uuid;

/// Channels to register in the in-process metadata store
///
/// `SEED_CHANNELS` is a comma-separated list of
/// `channel_id:owner_id[:private]` entries.
fn seed_channels(store: &InMemoryMetadataStore) -> anyhow::Result<usize> {
    let Ok(raw) = std::env::var("SEED_CHANNELS") else {
        return Ok(0);
    };

    let mut seeded = 0;
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.split(':');
        let id: Uuid = parts
            .next()
            .unwrap_or_default()
            .parse()
            .with_context(|| format!("Invalid channel id in SEED_CHANNELS entry {entry:?}"))?;
        let owner_id: Uuid = parts
            .next()
            .unwrap_or_default()
            .parse()
            .with_context(|| format!("Invalid owner id in SEED_CHANNELS entry {entry:?}"))?;
        let visibility = match parts.next() {
            Some("private") => Visibility::Private,
            _ => Visibility::Public,
        };
        store.upsert_channel(Channel {
            id,
            visibility,
            owner_id,
        });
        seeded += 1;
    }
    Ok(seeded)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_format);

    let bind_address = config.bind_address();
    tracing::info!(
        address = %bind_address,
        variants = ?config.dispatcher.variants,
        "Live Session Service starting HTTP server"
    );

    let metadata = Arc::new(InMemoryMetadataStore::new());
    let seeded = seed_channels(&metadata)?;
    tracing::info!(channels = seeded, "Metadata store seeded");

    let state = AppState::build(
        config,
        Arc::new(PassthroughExecutor),
        Arc::new(InMemorySegmentStore::new()),
        metadata,
    );
    let shutdown = state.shutdown.clone();

    let server_state = state.clone();
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(MetricsMiddleware)
            .wrap(actix_middleware::Logger::default())
            .configure(handlers::configure)
    })
    .bind(&bind_address)
    .with_context(|| format!("Failed to bind {bind_address}"))?
    .run()
    .await
    .context("HTTP server failed")?;

    shutdown.cancel();
    tracing::info!("Live Session Service stopped");
    Ok(())
}
