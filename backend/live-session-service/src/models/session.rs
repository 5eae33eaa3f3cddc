//! Stream session data model and lifecycle states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a live broadcast attempt
///
/// `CREATED → KEY_ISSUED → LIVE → ENDED`, with `ERRORED` reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    KeyIssued,
    Live,
    Ended,
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "CREATED",
            SessionState::KeyIssued => "KEY_ISSUED",
            SessionState::Live => "LIVE",
            SessionState::Ended => "ENDED",
            SessionState::Errored => "ERRORED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Errored)
    }

    /// Check whether the state machine allows moving to `next`
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Created, KeyIssued) => true,
            (KeyIssued, Live) => true,
            // Stopping before any ingest arrived is a clean end, not an error
            (KeyIssued, Ended) | (Live, Ended) => true,
            (from, Errored) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live broadcast attempt on a channel
#[derive(Debug, Clone, Serialize)]
pub struct StreamSession {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub live_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Connection currently bound as the single ingest writer
    pub ingest_connection: Option<Uuid>,
    /// Base reference under which manifests are exposed
    pub manifest_ref: String,
    /// Variants whose jobs exhausted retries; the session stays live without them
    pub degraded_variants: BTreeSet<String>,
    pub thumbnail_ref: Option<String>,
    pub error: Option<String>,
}

impl StreamSession {
    pub fn new(id: Uuid, channel_id: Uuid) -> Self {
        Self {
            id,
            channel_id,
            state: SessionState::Created,
            created_at: Utc::now(),
            live_at: None,
            ended_at: None,
            ingest_connection: None,
            manifest_ref: format!("/api/v1/streams/{}/manifests", id),
            degraded_variants: BTreeSet::new(),
            thumbnail_ref: None,
            error: None,
        }
    }
}

/// Reason a session reached a terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EndReason {
    Stopped,
    IngestTimeout,
    Failed { detail: String },
}

impl EndReason {
    pub fn terminal_state(&self) -> SessionState {
        match self {
            EndReason::Failed { .. } => SessionState::Errored,
            _ => SessionState::Ended,
        }
    }
}

/// Returned by `startStream`
#[derive(Debug, Clone, Serialize)]
pub struct StartStreamResponse {
    pub session_id: Uuid,
    pub stream_key: String,
    pub ingest_url: String,
    pub state: SessionState,
}
