/// Error types for Live Session Service
///
/// One enum covers the whole orchestrator taxonomy. Control-API callers get
/// these as typed JSON bodies; internal components use them to decide between
/// local recovery and surfacing.
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type for live-session-service operations
pub type Result<T> = std::result::Result<T, AppError>;

/// Why the moderation gate refused an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DenyReason {
    Muted,
    Banned,
    InsufficientRole,
    NotMember,
    SelfTarget,
    UnknownMessage,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Muted => "muted",
            DenyReason::Banned => "banned",
            DenyReason::InsufficientRole => "insufficientRole",
            DenyReason::NotMember => "notMember",
            DenyReason::SelfTarget => "selfTarget",
            DenyReason::UnknownMessage => "unknownMessage",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AppError {
    #[error("stream key is unknown or revoked")]
    KeyInvalid,

    #[error("channel {channel_id} already has an active session {session_id}")]
    KeyConflict { channel_id: Uuid, session_id: Uuid },

    #[error("session conflict: {0}")]
    SessionConflict(String),

    #[error("session {0} is no longer accepting work")]
    SessionClosed(Uuid),

    #[error("channel {0} is closed")]
    ChannelClosed(Uuid),

    #[error("transcode job {job_id} failed (retryable: {retryable}): {reason}")]
    JobFailed {
        job_id: Uuid,
        retryable: bool,
        reason: String,
    },

    #[error("manifest gap: variant {variant} slot {slot} was already skipped")]
    ManifestGap { variant: String, slot: u64 },

    #[error("ModerationDenied: {0}")]
    ModerationDenied(DenyReason),

    #[error("subscriber fell behind and was disconnected")]
    SlowConsumer,

    #[error("ingest chunk dropped for session {session_id} after waiting {waited:?}")]
    ThrottledDrop { session_id: Uuid, waited: Duration },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns whether a retry of the same operation could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::JobFailed { retryable, .. } => *retryable,
            AppError::ThrottledDrop { .. } | AppError::Storage(_) => true,
            _ => false,
        }
    }

    pub(crate) fn code(&self) -> (&'static str, &'static str) {
        match self {
            AppError::KeyInvalid => ("authentication_error", "KEY_INVALID"),
            AppError::KeyConflict { .. } => ("conflict_error", "KEY_CONFLICT"),
            AppError::SessionConflict(_) => ("conflict_error", "SESSION_CONFLICT"),
            AppError::SessionClosed(_) => ("conflict_error", "SESSION_CLOSED"),
            AppError::ChannelClosed(_) => ("conflict_error", "CHANNEL_CLOSED"),
            AppError::JobFailed { .. } => ("server_error", "JOB_FAILED"),
            AppError::ManifestGap { .. } => ("conflict_error", "MANIFEST_GAP"),
            AppError::ModerationDenied(_) => ("authorization_error", "MODERATION_DENIED"),
            AppError::SlowConsumer => ("rate_limit_error", "SLOW_CONSUMER"),
            AppError::ThrottledDrop { .. } => ("server_error", "THROTTLED_DROP"),
            AppError::NotFound(_) => ("not_found_error", "NOT_FOUND"),
            AppError::Storage(_) => ("server_error", "STORAGE_ERROR"),
            AppError::BadRequest(_) => ("validation_error", "INVALID_REQUEST"),
            AppError::Config(_) | AppError::Internal(_) => {
                ("server_error", "INTERNAL_SERVER_ERROR")
            }
        }
    }
}

/// JSON error body returned to HTTP callers
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::KeyInvalid | AppError::ModerationDenied(_) => StatusCode::FORBIDDEN,
            AppError::KeyConflict { .. }
            | AppError::SessionConflict(_)
            | AppError::SessionClosed(_)
            | AppError::ChannelClosed(_)
            | AppError::ManifestGap { .. } => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::SlowConsumer => StatusCode::TOO_MANY_REQUESTS,
            AppError::ThrottledDrop { .. } | AppError::Storage(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::JobFailed { .. } => StatusCode::BAD_GATEWAY,
            AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let (error_type, code) = self.code();
        let reason = match self {
            AppError::ModerationDenied(reason) => Some(*reason),
            _ => None,
        };

        let body = ErrorResponse {
            error: status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            message: self.to_string(),
            status: status.as_u16(),
            error_type: error_type.to_string(),
            code: code.to_string(),
            reason,
        };

        HttpResponse::build(status).json(body)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(err.to_string())
    }
}
