//! Session registry: the stream lifecycle state machine
//!
//! Owns every `StreamSession`. Other components hold a session id and the
//! session's `CancellationToken`; they never mutate session state directly.
//! Ending a session is the cancellation point for everything attached to it:
//! the token is cancelled, the key revoked, manifests finalized and the chat
//! channel receives `streamEnded` as its last event.

use crate::config::SessionConfig;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{
    EndReason, EventPayload, SessionState, StartStreamResponse, StreamSession, Variant,
};
use crate::services::fanout::FanoutBus;
use crate::services::key_registry::KeyRegistry;
use crate::services::metadata_store::MetadataStore;
use crate::services::publisher::SegmentPublisher;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

struct SessionEntry {
    session: Mutex<StreamSession>,
    cancel: CancellationToken,
    /// Bumped on every ingest bind; a grace timer only fires if unchanged
    ingest_epoch: AtomicU64,
}

/// Returned to the ingest gateway when a connection is bound
#[derive(Debug, Clone)]
pub struct IngestBinding {
    pub session_id: Uuid,
    pub channel_id: Uuid,
    pub cancel: CancellationToken,
    /// This bind moved the session from KEY_ISSUED to LIVE
    pub went_live: bool,
}

pub struct SessionRegistry {
    config: SessionConfig,
    ingest_base_url: String,
    variants: Vec<Variant>,
    keys: Arc<KeyRegistry>,
    publisher: Arc<SegmentPublisher>,
    bus: Arc<FanoutBus>,
    metadata: Arc<dyn MetadataStore>,
    sessions: DashMap<Uuid, Arc<SessionEntry>>,
    /// channel → its single non-terminal session
    active_by_channel: DashMap<Uuid, Uuid>,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        ingest_base_url: String,
        variants: Vec<Variant>,
        keys: Arc<KeyRegistry>,
        publisher: Arc<SegmentPublisher>,
        bus: Arc<FanoutBus>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            config,
            ingest_base_url,
            variants,
            keys,
            publisher,
            bus,
            metadata,
            sessions: DashMap::new(),
            active_by_channel: DashMap::new(),
        }
    }

    fn entry(&self, session_id: Uuid) -> Result<Arc<SessionEntry>> {
        self.sessions
            .get(&session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))
    }

    /// startStream: create a session for the channel and issue its key
    pub async fn start_stream(&self, channel_id: Uuid) -> Result<StartStreamResponse> {
        let channel = self
            .metadata
            .load_channel(channel_id)
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?
            .ok_or_else(|| AppError::NotFound(format!("channel {channel_id}")))?;

        let session_id = Uuid::new_v4();
        match self.active_by_channel.entry(channel.id) {
            Entry::Occupied(existing) => {
                warn!(
                    %channel_id,
                    active_session = %existing.get(),
                    "Channel already has an active session"
                );
                return Err(AppError::KeyConflict {
                    channel_id,
                    session_id: *existing.get(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(session_id);
            }
        }

        let entry = Arc::new(SessionEntry {
            session: Mutex::new(StreamSession::new(session_id, channel_id)),
            cancel: CancellationToken::new(),
            ingest_epoch: AtomicU64::new(0),
        });
        self.sessions.insert(session_id, entry.clone());
        metrics::session_started();
        metrics::session_transition(SessionState::Created.as_str());

        self.publisher.open_session(session_id, &self.variants);
        self.bus.reopen_channel(channel_id);

        let stream_key = self.keys.issue(channel_id, session_id);
        let state = {
            let mut session = entry.session.lock();
            session.state = SessionState::KeyIssued;
            session.state
        };
        metrics::session_transition(state.as_str());

        info!(%channel_id, %session_id, "Stream session created");

        Ok(StartStreamResponse {
            session_id,
            ingest_url: format!("{}/{}", self.ingest_base_url.trim_end_matches('/'), stream_key),
            stream_key,
            state,
        })
    }

    /// stopStream: end the session; stopping a terminal session is a no-op
    pub fn stop_stream(&self, session_id: Uuid) -> Result<SessionState> {
        self.finish(session_id, EndReason::Stopped)
    }

    /// sessionStatus: snapshot of the session record
    pub fn session_status(&self, session_id: Uuid) -> Result<StreamSession> {
        Ok(self.entry(session_id)?.session.lock().clone())
    }

    pub fn rotate_key(&self, session_id: Uuid) -> Result<String> {
        let entry = self.entry(session_id)?;
        if entry.session.lock().state.is_terminal() {
            return Err(AppError::SessionClosed(session_id));
        }
        self.keys.rotate(session_id)
    }

    pub fn active_session(&self, channel_id: Uuid) -> Option<Uuid> {
        self.active_by_channel.get(&channel_id).map(|s| *s.value())
    }

    pub fn is_accepting(&self, session_id: Uuid) -> bool {
        self.entry(session_id)
            .map(|e| !e.cancel.is_cancelled() && !e.session.lock().state.is_terminal())
            .unwrap_or(false)
    }

    pub fn cancellation(&self, session_id: Uuid) -> Result<CancellationToken> {
        Ok(self.entry(session_id)?.cancel.clone())
    }

    /// Bind `connection_id` as the session's single ingest writer
    pub fn bind_ingest(&self, session_id: Uuid, connection_id: Uuid) -> Result<IngestBinding> {
        let entry = self.entry(session_id)?;
        let (channel_id, went_live) = {
            let mut session = entry.session.lock();
            if session.state.is_terminal() {
                return Err(AppError::SessionClosed(session_id));
            }
            if let Some(bound) = session.ingest_connection {
                return Err(AppError::SessionConflict(format!(
                    "session {session_id} already has ingest connection {bound}"
                )));
            }

            session.ingest_connection = Some(connection_id);
            entry.ingest_epoch.fetch_add(1, Ordering::AcqRel);

            let went_live = session.state == SessionState::KeyIssued;
            if went_live {
                session.state = SessionState::Live;
                session.live_at = Some(Utc::now());
            }
            (session.channel_id, went_live)
        };

        if went_live {
            metrics::session_transition(SessionState::Live.as_str());
            metrics::live_sessions_inc();
            info!(%session_id, %channel_id, %connection_id, "Session is live");
            if let Err(e) = self
                .bus
                .publish(channel_id, EventPayload::StreamStarted { session_id })
            {
                warn!(%channel_id, error = %e, "Failed to announce stream start");
            }
        } else {
            info!(%session_id, %connection_id, "Ingest reconnected");
        }

        Ok(IngestBinding {
            session_id,
            channel_id,
            cancel: entry.cancel.clone(),
            went_live,
        })
    }

    /// Unbind a dropped ingest connection and start the grace timer
    ///
    /// The session ends with `IngestTimeout` unless a connection is bound
    /// again before the grace period elapses.
    pub fn ingest_disconnected(self: &Arc<Self>, session_id: Uuid, connection_id: Uuid) {
        let Ok(entry) = self.entry(session_id) else {
            return;
        };

        {
            let mut session = entry.session.lock();
            if session.ingest_connection != Some(connection_id) {
                return;
            }
            session.ingest_connection = None;
            if session.state.is_terminal() {
                return;
            }
        }

        let epoch = entry.ingest_epoch.load(Ordering::Acquire);
        let grace = self.config.ingest_grace_period;
        info!(
            %session_id,
            %connection_id,
            grace_ms = grace.as_millis() as u64,
            "Ingest disconnected, waiting for reconnect"
        );

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = entry.cancel.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    let reconnected = entry.ingest_epoch.load(Ordering::Acquire) != epoch
                        || entry.session.lock().ingest_connection.is_some();
                    if !reconnected {
                        warn!(%session_id, "Ingest did not reconnect within grace period");
                        if let Err(e) = registry.finish(session_id, EndReason::IngestTimeout) {
                            error!(%session_id, error = %e, "Failed to end timed out session");
                        }
                    }
                }
            }
        });
    }

    /// Move the session to ERRORED after an irrecoverable failure
    pub fn fail(&self, session_id: Uuid, detail: impl Into<String>) -> Result<SessionState> {
        self.finish(
            session_id,
            EndReason::Failed {
                detail: detail.into(),
            },
        )
    }

    pub fn mark_degraded(&self, session_id: Uuid, variant: &Variant) {
        if let Ok(entry) = self.entry(session_id) {
            let inserted = entry
                .session
                .lock()
                .degraded_variants
                .insert(variant.to_string());
            if inserted {
                warn!(%session_id, %variant, "Variant degraded");
            }
        }
    }

    pub fn is_degraded(&self, session_id: Uuid, variant: &Variant) -> bool {
        self.entry(session_id)
            .map(|e| e.session.lock().degraded_variants.contains(variant.as_str()))
            .unwrap_or(false)
    }

    pub fn record_thumbnail(&self, session_id: Uuid, reference: String) {
        if let Ok(entry) = self.entry(session_id) {
            entry.session.lock().thumbnail_ref = Some(reference);
        }
    }

    fn finish(&self, session_id: Uuid, reason: EndReason) -> Result<SessionState> {
        let entry = self.entry(session_id)?;
        let target = reason.terminal_state();

        let (channel_id, was_live) = {
            let mut session = entry.session.lock();
            if session.state.is_terminal() {
                return Ok(session.state);
            }
            if !session.state.can_transition_to(target) {
                return Err(AppError::Internal(format!(
                    "session {session_id} cannot move from {} to {target}",
                    session.state
                )));
            }

            let was_live = session.state == SessionState::Live;
            session.state = target;
            session.ended_at = Some(Utc::now());
            session.ingest_connection = None;
            if let EndReason::Failed { detail } = &reason {
                session.error = Some(detail.clone());
            }
            (session.channel_id, was_live)
        };

        entry.cancel.cancel();
        self.keys.revoke_session(session_id);
        self.publisher.finalize(session_id);

        match self.bus.publish(
            channel_id,
            EventPayload::StreamEnded {
                session_id,
                reason: reason.clone(),
            },
        ) {
            Ok(_) | Err(AppError::ChannelClosed(_)) => {}
            Err(e) => warn!(%channel_id, error = %e, "Failed to announce stream end"),
        }
        self.bus.close_channel(channel_id);

        // Freed last so a new session cannot reopen the channel before it closed
        self.active_by_channel
            .remove_if(&channel_id, |_, active| *active == session_id);

        metrics::session_transition(target.as_str());
        if was_live {
            metrics::live_sessions_dec();
        }
        match &reason {
            EndReason::Failed { detail } => {
                error!(%session_id, %channel_id, %detail, "Session errored")
            }
            _ => info!(%session_id, %channel_id, ?reason, "Session ended"),
        }

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FanoutConfig, PublisherConfig};
    use crate::models::{Channel, Visibility};
    use crate::services::metadata_store::InMemoryMetadataStore;
    use crate::services::segment_store::InMemorySegmentStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        keys: Arc<KeyRegistry>,
        bus: Arc<FanoutBus>,
        publisher: Arc<SegmentPublisher>,
        channel_id: Uuid,
    }

    fn fixture(grace: Duration) -> Fixture {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let channel_id = Uuid::new_v4();
        metadata.upsert_channel(Channel {
            id: channel_id,
            visibility: Visibility::Public,
            owner_id: Uuid::new_v4(),
        });

        let keys = Arc::new(KeyRegistry::new(16));
        let (tx, _rx) = mpsc::unbounded_channel();
        let bus = Arc::new(FanoutBus::new(FanoutConfig::default(), tx));
        let publisher = Arc::new(SegmentPublisher::new(
            PublisherConfig::default(),
            Arc::new(InMemorySegmentStore::new()),
        ));
        let registry = Arc::new(SessionRegistry::new(
            SessionConfig {
                ingest_grace_period: grace,
                stream_key_bytes: 16,
            },
            "rtmp://ingest.local/live/".to_string(),
            vec![Variant::new("720p")],
            keys.clone(),
            publisher.clone(),
            bus.clone(),
            metadata,
        ));

        Fixture {
            registry,
            keys,
            bus,
            publisher,
            channel_id,
        }
    }

    #[tokio::test]
    async fn test_start_issues_key() {
        let f = fixture(Duration::from_secs(5));
        let started = f.registry.start_stream(f.channel_id).await.unwrap();

        assert_eq!(started.state, SessionState::KeyIssued);
        assert_eq!(
            started.ingest_url,
            format!("rtmp://ingest.local/live/{}", started.stream_key)
        );
        let binding = f.keys.validate(&started.stream_key).unwrap();
        assert_eq!(binding.session_id, started.session_id);
        assert_eq!(f.registry.active_session(f.channel_id), Some(started.session_id));
    }

    #[tokio::test]
    async fn test_unknown_channel_is_not_found() {
        let f = fixture(Duration::from_secs(5));
        let err = f.registry.start_stream(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_second_start_conflicts_until_first_ends() {
        let f = fixture(Duration::from_secs(5));
        let first = f.registry.start_stream(f.channel_id).await.unwrap();

        let err = f.registry.start_stream(f.channel_id).await.unwrap_err();
        assert_eq!(
            err,
            AppError::KeyConflict {
                channel_id: f.channel_id,
                session_id: first.session_id
            }
        );

        f.registry.stop_stream(first.session_id).unwrap();
        assert!(f.registry.start_stream(f.channel_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_bind_goes_live_and_rejects_second_connection() {
        let f = fixture(Duration::from_secs(5));
        let started = f.registry.start_stream(f.channel_id).await.unwrap();

        let binding = f.registry.bind_ingest(started.session_id, Uuid::new_v4()).unwrap();
        assert!(binding.went_live);
        assert_eq!(
            f.registry.session_status(started.session_id).unwrap().state,
            SessionState::Live
        );

        let err = f
            .registry
            .bind_ingest(started.session_id, Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(err, AppError::SessionConflict(_)));
    }

    #[tokio::test]
    async fn test_stop_revokes_key_finalizes_and_cancels() {
        let f = fixture(Duration::from_secs(5));
        let started = f.registry.start_stream(f.channel_id).await.unwrap();
        let mut sub = f.bus.subscribe(f.channel_id, Uuid::new_v4()).unwrap();
        let cancel = f.registry.cancellation(started.session_id).unwrap();

        assert_eq!(f.registry.stop_stream(started.session_id), Ok(SessionState::Ended));

        assert!(cancel.is_cancelled());
        assert_eq!(f.keys.validate(&started.stream_key), Err(AppError::KeyInvalid));
        assert!(f
            .publisher
            .manifest(started.session_id, &Variant::new("720p"))
            .unwrap()
            .closed);
        assert_eq!(sub.recv().await.unwrap().unwrap().payload.kind(), "streamEnded");
        assert_eq!(sub.recv().await, Ok(None));

        // idempotent
        assert_eq!(f.registry.stop_stream(started.session_id), Ok(SessionState::Ended));
        assert!(f.registry.session_status(started.session_id).unwrap().ended_at.is_some());
    }

    #[tokio::test]
    async fn test_fail_moves_to_errored() {
        let f = fixture(Duration::from_secs(5));
        let started = f.registry.start_stream(f.channel_id).await.unwrap();

        assert_eq!(
            f.registry.fail(started.session_id, "storage unavailable"),
            Ok(SessionState::Errored)
        );
        let session = f.registry.session_status(started.session_id).unwrap();
        assert_eq!(session.error.as_deref(), Some("storage unavailable"));
        assert!(!f.registry.is_accepting(started.session_id));
        assert_eq!(
            f.registry.rotate_key(started.session_id),
            Err(AppError::SessionClosed(started.session_id))
        );
    }

    #[tokio::test]
    async fn test_grace_timeout_ends_session() {
        let f = fixture(Duration::from_millis(30));
        let started = f.registry.start_stream(f.channel_id).await.unwrap();
        let connection = Uuid::new_v4();
        f.registry.bind_ingest(started.session_id, connection).unwrap();

        f.registry.ingest_disconnected(started.session_id, connection);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            f.registry.session_status(started.session_id).unwrap().state,
            SessionState::Ended
        );
    }

    #[tokio::test]
    async fn test_reconnect_within_grace_keeps_session_live() {
        let f = fixture(Duration::from_millis(50));
        let started = f.registry.start_stream(f.channel_id).await.unwrap();
        let first = Uuid::new_v4();
        f.registry.bind_ingest(started.session_id, first).unwrap();

        f.registry.ingest_disconnected(started.session_id, first);
        let rebound = f.registry.bind_ingest(started.session_id, Uuid::new_v4()).unwrap();
        assert!(!rebound.went_live);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(
            f.registry.session_status(started.session_id).unwrap().state,
            SessionState::Live
        );
    }

    #[tokio::test]
    async fn test_rotate_key() {
        let f = fixture(Duration::from_secs(5));
        let started = f.registry.start_stream(f.channel_id).await.unwrap();

        let rotated = f.registry.rotate_key(started.session_id).unwrap();

        assert_eq!(f.keys.validate(&started.stream_key), Err(AppError::KeyInvalid));
        assert_eq!(f.keys.validate(&rotated).unwrap().session_id, started.session_id);
    }
}
