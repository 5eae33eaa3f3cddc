//! WebSocket handler for the chat channel protocol
//!
//! Handles the upgrade for `/ws/channels/{channel_id}/chat`:
//! - caller identity from the `x-user-id` header set by the edge gateway
//! - moderation gate on subscribe, before the upgrade
//! - client events in, channel events out, in channel sequence order
//! - heartbeat: ping every 5s, disconnect after 30s of silence

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::{CloseCode, CloseReason, Message};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, DenyReason};
use crate::models::{ChannelEvent, ClientEvent};
use crate::services::{ChatService, Subscription};
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

pub const USER_ID_HEADER: &str = "x-user-id";

/// Error frame sent back when a client event is refused
#[derive(Debug, Serialize)]
struct ErrorFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<DenyReason>,
}

impl From<&AppError> for ErrorFrame {
    fn from(err: &AppError) -> Self {
        let reason = match err {
            AppError::ModerationDenied(reason) => Some(*reason),
            _ => None,
        };
        Self {
            kind: "error",
            code: err.code().1,
            message: err.to_string(),
            reason,
        }
    }
}

/// Caller identity injected by the gateway in front of this service
pub fn caller_id(req: &HttpRequest) -> Result<Uuid, AppError> {
    let raw = req
        .headers()
        .get(USER_ID_HEADER)
        .ok_or_else(|| AppError::BadRequest(format!("missing {USER_ID_HEADER} header")))?;
    raw.to_str()
        .ok()
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .ok_or_else(|| AppError::BadRequest(format!("invalid {USER_ID_HEADER} header")))
}

/// Chat WebSocket endpoint
///
/// Usage: `GET /ws/channels/{channel_id}/chat` with `x-user-id`.
///
/// Client events are JSON objects tagged by `type`:
/// ```json
/// {"type": "send", "body": "hello", "message_id": "..."}
/// {"type": "ban", "user_id": "..."}
/// ```
///
/// Server events carry `id`, `channel_id`, `sequence`, `emitted_at` and the
/// event body tagged by `type`.
pub async fn chat_ws(
    req: HttpRequest,
    channel_id: web::Path<Uuid>,
    body: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let channel_id = channel_id.into_inner();
    let user_id = caller_id(&req)?;

    // Banned users and outsiders are refused before the upgrade
    let subscription = state.chat.join(channel_id, user_id).await?;

    let (response, session, messages) = actix_ws::handle(&req, body)?;
    info!(%channel_id, %user_id, subscription_id = %subscription.id, "Chat connection opened");

    actix_rt::spawn(run_session(
        state.chat.clone(),
        subscription,
        session,
        messages,
    ));

    Ok(response)
}

async fn send_json<T: Serialize>(session: &mut actix_ws::Session, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(text) => session.text(text).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode chat frame");
            true
        }
    }
}

async fn run_session(
    chat: Arc<ChatService>,
    mut subscription: Subscription,
    mut session: actix_ws::Session,
    mut messages: actix_ws::MessageStream,
) {
    let channel_id = subscription.channel_id;
    let user_id = subscription.user_id;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut last_seen = Instant::now();

    let close_reason: Option<CloseReason> = loop {
        tokio::select! {
            message = messages.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    let outcome = match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(ClientEvent::Leave) => break Some(CloseCode::Normal.into()),
                        Ok(event) => chat.handle(channel_id, user_id, event).await,
                        Err(e) => Err(AppError::from(e)),
                    };
                    if let Err(err) = outcome {
                        debug!(%channel_id, %user_id, error = %err, "Client event refused");
                        if !send_json(&mut session, &ErrorFrame::from(&err)).await {
                            break None;
                        }
                    }
                }
                Some(Ok(Message::Ping(bytes))) => {
                    last_seen = Instant::now();
                    if session.pong(&bytes).await.is_err() {
                        break None;
                    }
                }
                Some(Ok(Message::Pong(_))) => last_seen = Instant::now(),
                Some(Ok(Message::Close(reason))) => break reason,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%channel_id, %user_id, error = %e, "WebSocket protocol error");
                    break None;
                }
                None => break None,
            },
            event = subscription.recv() => match event {
                Ok(Some(event)) => {
                    if !send_json::<ChannelEvent>(&mut session, &event).await {
                        break None;
                    }
                }
                // channel closed or this user was evicted
                Ok(None) => break Some(CloseCode::Normal.into()),
                Err(err) => {
                    warn!(
                        %channel_id,
                        %user_id,
                        last_sequence = subscription.last_sequence(),
                        error = %err,
                        "Closing chat connection of slow consumer"
                    );
                    send_json(&mut session, &subscription.slow_consumer_warning()).await;
                    break Some(CloseReason {
                        code: CloseCode::Policy,
                        description: Some("slow consumer".to_string()),
                    });
                }
            },
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > CLIENT_TIMEOUT {
                    warn!(%channel_id, %user_id, "WebSocket heartbeat failed, disconnecting");
                    break None;
                }
                if session.ping(b"").await.is_err() {
                    break None;
                }
            }
        }
    };

    drop(subscription);
    let _ = session.close(close_reason).await;
    info!(%channel_id, %user_id, "Chat connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handlers;
    use crate::models::{BanState, Channel, MemberRole, Membership, Visibility};
    use crate::services::{InMemoryMetadataStore, InMemorySegmentStore, PassthroughExecutor};
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_caller_id_header() {
        let req = test::TestRequest::default()
            .insert_header((USER_ID_HEADER, "not-a-uuid"))
            .to_http_request();
        assert!(matches!(caller_id(&req), Err(AppError::BadRequest(_))));

        let user = Uuid::new_v4();
        let req = test::TestRequest::default()
            .insert_header((USER_ID_HEADER, user.to_string()))
            .to_http_request();
        assert_eq!(caller_id(&req).unwrap(), user);
    }

    #[actix_web::test]
    async fn test_refusals_happen_before_upgrade() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let channel_id = Uuid::new_v4();
        let banned = Uuid::new_v4();
        metadata.upsert_channel(Channel {
            id: channel_id,
            visibility: Visibility::Public,
            owner_id: Uuid::new_v4(),
        });
        let mut membership = Membership::new(channel_id, banned, MemberRole::Member);
        membership.ban = BanState::Banned;
        metadata.upsert_membership(membership);

        let state = AppState::build(
            Config::default(),
            Arc::new(PassthroughExecutor),
            Arc::new(InMemorySegmentStore::new()),
            metadata,
        );
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(handlers::configure),
        )
        .await;
        let uri = format!("/ws/channels/{channel_id}/chat");

        let resp = test::call_service(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get()
            .uri(&uri)
            .insert_header((USER_ID_HEADER, banned.to_string()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["reason"], "banned");
    }

    #[::core::prelude::v1::test]
    fn test_error_frame_carries_deny_reason() {
        let frame = ErrorFrame::from(&AppError::ModerationDenied(DenyReason::Muted));
        let json = serde_json::to_value(frame).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "MODERATION_DENIED");
        assert_eq!(json["reason"], "muted");
    }
}
