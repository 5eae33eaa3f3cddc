/// Stream session handlers - start, stop, status, key rotation and manifests
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{SessionState, StreamSession, Variant};
use crate::state::AppState;

/// Session status as exposed to callers
#[derive(Debug, Serialize)]
pub struct StreamView {
    #[serde(flatten)]
    pub session: StreamSession,
    pub ingest_bound: bool,
    pub variants: Vec<Variant>,
}

impl From<StreamSession> for StreamView {
    fn from(session: StreamSession) -> Self {
        Self {
            ingest_bound: session.ingest_connection.is_some(),
            variants: Vec::new(),
            session,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StopStreamResponse {
    pub status: &'static str,
    pub state: SessionState,
}

#[derive(Debug, Serialize)]
pub struct RotateKeyResponse {
    pub session_id: Uuid,
    pub stream_key: String,
    pub ingest_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ManifestQuery {
    pub format: Option<String>,
}

/// Start a stream on a channel
pub async fn start_stream(
    state: web::Data<AppState>,
    channel_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let response = state.registry.start_stream(channel_id.into_inner()).await?;
    Ok(HttpResponse::Created().json(response))
}

/// Stop a stream; stopping an ended stream is a no-op
pub async fn stop_stream(
    state: web::Data<AppState>,
    session_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let state = state.registry.stop_stream(session_id.into_inner())?;
    Ok(HttpResponse::Ok().json(StopStreamResponse {
        status: "ok",
        state,
    }))
}

pub async fn get_stream(
    state: web::Data<AppState>,
    session_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let session_id = session_id.into_inner();
    let session = state.registry.session_status(session_id)?;

    let mut view = StreamView::from(session);
    view.variants = state.publisher.variants(session_id);
    Ok(HttpResponse::Ok().json(view))
}

/// Issue a new key; the previous one stops validating immediately
pub async fn rotate_key(
    state: web::Data<AppState>,
    session_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let session_id = session_id.into_inner();
    let stream_key = state.registry.rotate_key(session_id)?;
    let ingest_url = format!(
        "{}/{}",
        state
            .config
            .server
            .public_ingest_base_url
            .trim_end_matches('/'),
        stream_key
    );

    Ok(HttpResponse::Ok().json(RotateKeyResponse {
        session_id,
        stream_key,
        ingest_url,
    }))
}

/// Current manifest of one variant, as JSON or as an HLS playlist
pub async fn get_manifest(
    state: web::Data<AppState>,
    path: web::Path<(Uuid, String)>,
    query: web::Query<ManifestQuery>,
) -> Result<HttpResponse> {
    let (session_id, variant) = path.into_inner();
    let manifest = state
        .publisher
        .manifest(session_id, &Variant::new(variant))?;

    match query.format.as_deref() {
        None | Some("json") => Ok(HttpResponse::Ok().json(manifest.as_ref())),
        Some("m3u8") => Ok(HttpResponse::Ok()
            .content_type("application/vnd.apple.mpegurl")
            .body(manifest.to_hls_playlist())),
        Some(other) => Err(AppError::BadRequest(format!(
            "unsupported manifest format {other:?}"
        ))),
    }
}
