//! Shared fixtures for live-session-service integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use live_session_service::models::{
    Channel, EncodedOutput, JobTarget, MemberRole, Membership, Variant, Visibility,
};
use live_session_service::services::{
    ExecutorError, InMemoryMetadataStore, InMemorySegmentStore, SegmentStore, StorageError,
    TranscodeExecutor, TranscodeRequest,
};
use live_session_service::{AppState, Config};
use resilience::RetryConfig;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const SEGMENT_BYTES: usize = 8;

/// Executor that fails permanently for chosen variants and counts calls
#[derive(Default)]
pub struct ScriptedExecutor {
    pub broken_variants: HashSet<String>,
    pub calls: AtomicU32,
}

impl ScriptedExecutor {
    pub fn failing(variants: &[&str]) -> Self {
        Self {
            broken_variants: variants.iter().map(|v| v.to_string()).collect(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscodeExecutor for ScriptedExecutor {
    async fn transcode(&self, request: TranscodeRequest) -> Result<EncodedOutput, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let JobTarget::Rendition(variant) = &request.target {
            if self.broken_variants.contains(variant.as_str()) {
                return Err(ExecutorError::Permanent(format!(
                    "encoder does not support {variant}"
                )));
            }
        }
        Ok(EncodedOutput {
            data: request.input.data.clone(),
            duration: request.input.duration,
        })
    }
}

/// Segment store that can be switched into an outage
#[derive(Default)]
pub struct SwitchableStore {
    inner: InMemorySegmentStore,
    pub down: AtomicBool,
}

#[async_trait]
impl SegmentStore for SwitchableStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<String, StorageError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError("bucket unreachable".to_string()));
        }
        self.inner.put(path, data).await
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.session.ingest_grace_period = Duration::from_millis(150);
    config.ingest.input_segment_bytes = SEGMENT_BYTES;
    config.ingest.throttle_wait = Duration::from_millis(200);
    config.dispatcher.variants = vec![Variant::new("720p"), Variant::new("480p")];
    config.dispatcher.thumbnail_every = 0;
    config.dispatcher.retry = RetryConfig {
        max_retries: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        jitter: false,
        ..Default::default()
    };
    config.publisher.gap_timeout = Duration::from_millis(200);
    config.publisher.sweep_interval = Duration::from_millis(50);
    config
}

pub struct Harness {
    pub state: AppState,
    pub metadata: Arc<InMemoryMetadataStore>,
    pub executor: Arc<ScriptedExecutor>,
    pub store: Arc<SwitchableStore>,
    pub channel_id: Uuid,
    pub owner_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(test_config(), ScriptedExecutor::default())
    }

    pub fn with(config: Config, executor: ScriptedExecutor) -> Self {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let executor = Arc::new(executor);
        let store = Arc::new(SwitchableStore::default());
        let channel_id = Uuid::new_v4();
        let owner_id = Uuid::new_v4();
        metadata.upsert_channel(Channel {
            id: channel_id,
            visibility: Visibility::Public,
            owner_id,
        });

        let state = AppState::build(config, executor.clone(), store.clone(), metadata.clone());
        Self {
            state,
            metadata,
            executor,
            store,
            channel_id,
            owner_id,
        }
    }

    pub fn add_member(&self, role: MemberRole) -> Uuid {
        let user_id = Uuid::new_v4();
        self.metadata
            .upsert_membership(Membership::new(self.channel_id, user_id, role));
        user_id
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// One full input segment of filler media
pub fn segment(fill: u8) -> Bytes {
    Bytes::from(vec![fill; SEGMENT_BYTES])
}
