//! Data model of the live session orchestrator

pub mod chat;
pub mod job;
pub mod member;
pub mod segment;
pub mod session;

pub use chat::{
    ChannelEvent, ChatMessage, ClientEvent, EventPayload, ModerationAction, ModerationKind,
    ModerationTarget,
};
pub use job::{
    job_id, EncodedOutput, InputSegment, JobResult, JobState, JobTarget, TranscodeJob, Variant,
};
pub use member::{
    BanState, Channel, MemberRole, Membership, MuteState, Participant, Visibility,
};
pub use segment::{Manifest, ManifestEntry, Segment};
pub use session::{EndReason, SessionState, StartStreamResponse, StreamSession};
