//! Shared application state wiring every orchestrator component together

use crate::config::Config;
use crate::services::{
    ChatService, FanoutBus, IngestGateway, KeyRegistry, MetadataStore, ModerationEngine,
    PresenceTracker, SegmentPublisher, SegmentStore, SessionRegistry, TranscodeDispatcher,
    TranscodeExecutor,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub keys: Arc<KeyRegistry>,
    pub registry: Arc<SessionRegistry>,
    pub publisher: Arc<SegmentPublisher>,
    pub dispatcher: Arc<TranscodeDispatcher>,
    pub gateway: Arc<IngestGateway>,
    pub bus: Arc<FanoutBus>,
    pub presence: Arc<PresenceTracker>,
    pub moderation: Arc<ModerationEngine>,
    pub chat: Arc<ChatService>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build all components and start the background tasks
    ///
    /// Must be called inside a tokio runtime: the presence tracker and the
    /// manifest gap sweeper are spawned here and stop on `shutdown`.
    pub fn build(
        config: Config,
        executor: Arc<dyn TranscodeExecutor>,
        segment_store: Arc<dyn SegmentStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let shutdown = CancellationToken::new();

        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(FanoutBus::new(config.fanout.clone(), presence_tx));
        let presence = Arc::new(PresenceTracker::new());
        presence.spawn(bus.clone(), presence_rx, shutdown.clone());

        let keys = Arc::new(KeyRegistry::new(config.session.stream_key_bytes));
        let publisher = Arc::new(SegmentPublisher::new(
            config.publisher.clone(),
            segment_store,
        ));
        publisher.spawn_sweeper(shutdown.clone());

        let registry = Arc::new(SessionRegistry::new(
            config.session.clone(),
            config.server.public_ingest_base_url.clone(),
            config.dispatcher.variants.clone(),
            keys.clone(),
            publisher.clone(),
            bus.clone(),
            metadata.clone(),
        ));
        let dispatcher = Arc::new(TranscodeDispatcher::new(
            config.dispatcher.clone(),
            config.ingest.clone(),
            executor,
            publisher.clone(),
            registry.clone(),
        ));
        let gateway = Arc::new(IngestGateway::new(
            config.ingest.clone(),
            keys.clone(),
            registry.clone(),
            dispatcher.clone(),
        ));

        let moderation = Arc::new(ModerationEngine::new(
            config.moderation.clone(),
            metadata,
            bus.clone(),
        ));
        let chat = Arc::new(ChatService::new(
            config.moderation.clone(),
            moderation.clone(),
            bus.clone(),
        ));

        Self {
            config: Arc::new(config),
            keys,
            registry,
            publisher,
            dispatcher,
            gateway,
            bus,
            presence,
            moderation,
            chat,
            shutdown,
        }
    }
}
