//! Orchestrator components and their external collaborators

pub mod chat_service;
pub mod dispatcher;
pub mod executor;
pub mod fanout;
pub mod ingest_gateway;
pub mod key_registry;
pub mod metadata_store;
pub mod moderation;
pub mod presence;
pub mod publisher;
pub mod segment_store;
pub mod session_registry;

pub use chat_service::ChatService;
pub use dispatcher::{IngestFrame, TranscodeDispatcher};
pub use executor::{ExecutorError, PassthroughExecutor, TranscodeExecutor, TranscodeRequest};
pub use fanout::{FanoutBus, MembershipChange, Subscription};
pub use ingest_gateway::{IngestConnection, IngestGateway, IngestStats};
pub use key_registry::{KeyBinding, KeyRegistry};
pub use metadata_store::{InMemoryMetadataStore, MetadataError, MetadataStore};
pub use moderation::{authorize, ChannelAction, Decision, ModerationEngine};
pub use presence::PresenceTracker;
pub use publisher::{Published, SegmentPublisher, VariantWriter};
pub use segment_store::{InMemorySegmentStore, SegmentStore, StorageError};
pub use session_registry::{IngestBinding, SessionRegistry};
