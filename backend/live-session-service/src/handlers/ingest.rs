/// Ingest endpoint - one media connection per request body
use actix_web::{web, HttpResponse};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::services::IngestStats;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct IngestSummary {
    pub session_id: Uuid,
    pub connection_id: Uuid,
    #[serde(flatten)]
    pub stats: IngestStats,
}

/// Stream media into the session bound to `key`
///
/// The key is validated and the connection bound before any body bytes are
/// read. The body is consumed chunk by chunk until the broadcaster hangs up or
/// the session ends.
pub async fn ingest(
    state: web::Data<AppState>,
    key: web::Path<String>,
    payload: web::Payload,
) -> Result<HttpResponse> {
    let connection_id = Uuid::new_v4();
    let connection = state.gateway.accept_connection(&key, connection_id)?;
    let session_id = connection.session_id;

    let stats = connection.pump(payload).await;

    Ok(HttpResponse::Ok().json(IngestSummary {
        session_id,
        connection_id,
        stats,
    }))
}
