//! Ingest gateway
//!
//! Accepts one inbound media connection per session. The single-writer lock
//! lives on the session (bound connection id), not on the key, so a rotated
//! or leaked key cannot take over a stream that already has a broadcaster.
//!
//! Chunks are forwarded to the session's segmenter in arrival order through a
//! bounded queue. When the queue is full the connection waits up to
//! `throttle_wait`; only then is the chunk dropped, logged and counted as a
//! `ThrottledDrop`.

use crate::config::IngestConfig;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::services::dispatcher::{IngestFrame, TranscodeDispatcher};
use crate::services::key_registry::KeyRegistry;
use crate::services::session_registry::SessionRegistry;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct IngestGateway {
    config: IngestConfig,
    keys: Arc<KeyRegistry>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<TranscodeDispatcher>,
}

impl IngestGateway {
    pub fn new(
        config: IngestConfig,
        keys: Arc<KeyRegistry>,
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<TranscodeDispatcher>,
    ) -> Self {
        Self {
            config,
            keys,
            registry,
            dispatcher,
        }
    }

    /// acceptConnection: validate the key and bind the connection as writer
    ///
    /// Fails with `KeyInvalid` for unknown or revoked keys and with
    /// `SessionConflict` while another connection is bound to the session.
    pub fn accept_connection(&self, key: &str, connection_id: Uuid) -> Result<IngestConnection> {
        let binding = self.keys.validate(key)?;
        let bound = self.registry.bind_ingest(binding.session_id, connection_id)?;

        let feed = match self.dispatcher.open_feed(bound.session_id) {
            Ok(feed) => feed,
            Err(e) => {
                self.registry
                    .ingest_disconnected(bound.session_id, connection_id);
                return Err(e);
            }
        };

        info!(
            session_id = %bound.session_id,
            channel_id = %bound.channel_id,
            %connection_id,
            "Ingest connection accepted"
        );

        Ok(IngestConnection {
            connection_id,
            session_id: bound.session_id,
            channel_id: bound.channel_id,
            feed,
            cancel: bound.cancel,
            throttle_wait: self.config.throttle_wait,
            registry: self.registry.clone(),
            stats: IngestStats::default(),
            closed: false,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub chunks_accepted: u64,
    pub bytes_accepted: u64,
    pub chunks_dropped: u64,
}

/// A bound ingest connection
///
/// Dropping it without `disconnect` still unbinds it from the session.
pub struct IngestConnection {
    pub connection_id: Uuid,
    pub session_id: Uuid,
    pub channel_id: Uuid,
    feed: mpsc::Sender<IngestFrame>,
    cancel: CancellationToken,
    throttle_wait: Duration,
    registry: Arc<SessionRegistry>,
    stats: IngestStats,
    closed: bool,
}

impl IngestConnection {
    /// Fires when the session ends and the connection must close
    pub fn session_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Forward one raw media chunk, waiting at most `throttle_wait` for room
    pub async fn push_chunk(&mut self, chunk: Bytes) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::SessionClosed(self.session_id));
        }

        let len = chunk.len();
        let started = Instant::now();
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(AppError::SessionClosed(self.session_id)),
            sent = tokio::time::timeout(
                self.throttle_wait,
                self.feed.send(IngestFrame::Chunk(chunk)),
            ) => sent,
        };

        match sent {
            Ok(Ok(())) => {
                self.stats.chunks_accepted += 1;
                self.stats.bytes_accepted += len as u64;
                metrics::ingest_bytes(len);
                Ok(())
            }
            Ok(Err(_)) => Err(AppError::SessionClosed(self.session_id)),
            Err(_) => {
                let waited = started.elapsed();
                self.stats.chunks_dropped += 1;
                metrics::ingest_throttled_drop();
                warn!(
                    session_id = %self.session_id,
                    connection_id = %self.connection_id,
                    bytes = len,
                    waited_ms = waited.as_millis() as u64,
                    dropped_total = self.stats.chunks_dropped,
                    "ThrottledDrop: dispatcher queue saturated"
                );
                Err(AppError::ThrottledDrop {
                    session_id: self.session_id,
                    waited,
                })
            }
        }
    }

    /// Forward a whole chunk stream until it ends, fails or the session ends
    pub async fn pump<S, E>(mut self, stream: S) -> IngestStats
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        let mut stream = std::pin::pin!(stream);
        let cancel = self.cancel.clone();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(
                        session_id = %self.session_id,
                        connection_id = %self.connection_id,
                        "Session ended, closing ingest connection"
                    );
                    break;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => match self.push_chunk(chunk).await {
                    Ok(()) | Err(AppError::ThrottledDrop { .. }) => {}
                    Err(e) => {
                        debug!(session_id = %self.session_id, error = %e, "Ingest stopped");
                        break;
                    }
                },
                Some(Err(e)) => {
                    warn!(
                        session_id = %self.session_id,
                        connection_id = %self.connection_id,
                        error = %e,
                        "Ingest stream error"
                    );
                    break;
                }
                None => break,
            }
        }

        self.disconnect().await;
        self.stats
    }

    /// Flush buffered media and unbind; the session enters its grace period
    pub async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if !self.cancel.is_cancelled() {
            let flushed =
                tokio::time::timeout(self.throttle_wait, self.feed.send(IngestFrame::Flush)).await;
            if !matches!(flushed, Ok(Ok(()))) {
                warn!(session_id = %self.session_id, "Could not flush partial input segment");
            }
        }

        self.registry
            .ingest_disconnected(self.session_id, self.connection_id);
        info!(
            session_id = %self.session_id,
            connection_id = %self.connection_id,
            bytes = self.stats.bytes_accepted,
            dropped = self.stats.chunks_dropped,
            "Ingest connection closed"
        );
    }
}

impl Drop for IngestConnection {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.feed.try_send(IngestFrame::Flush);
            self.registry
                .ingest_disconnected(self.session_id, self.connection_id);
        }
    }
}
