/// HTTP and WebSocket handlers of the live session service
///
/// This module contains handlers for:
/// - Streams: start, stop, status, key rotation, manifests
/// - Ingest: the media connection endpoint addressed by stream key
/// - Chat: the WebSocket channel protocol
pub mod chat_ws;
pub mod ingest;
pub mod streams;

use actix_web::{web, HttpResponse};

use crate::metrics;

pub use chat_ws::chat_ws;
pub use ingest::ingest;
pub use streams::{get_manifest, get_stream, rotate_key, start_stream, stop_stream};

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "live-session-service",
    }))
}

/// Register every route on an app
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics::serve_metrics))
        .route("/live/{key}", web::post().to(ingest))
        .route("/ws/channels/{channel_id}/chat", web::get().to(chat_ws))
        .service(
            web::scope("/api/v1")
                .route(
                    "/channels/{channel_id}/streams",
                    web::post().to(start_stream),
                )
                .route("/streams/{session_id}", web::get().to(get_stream))
                .route("/streams/{session_id}", web::delete().to(stop_stream))
                .route(
                    "/streams/{session_id}/key/rotate",
                    web::post().to(rotate_key),
                )
                .route(
                    "/streams/{session_id}/manifests/{variant}",
                    web::get().to(get_manifest),
                ),
        );
}
