//! Chat messages, moderation audit records and channel protocol events

use super::session::EndReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Chat message; append-only, deletion only flags the record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub sender_id: Uuid,
    pub sent_at: DateTime<Utc>,
    pub body: String,
    pub pinned: bool,
    pub deleted: bool,
}

impl ChatMessage {
    pub fn new(id: Uuid, channel_id: Uuid, sender_id: Uuid, body: String) -> Self {
        Self {
            id,
            channel_id,
            sender_id,
            sent_at: Utc::now(),
            body,
            pinned: false,
            deleted: false,
        }
    }

    /// Copy safe to fan out: tombstones keep id and position, not content
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.deleted {
            copy.body.clear();
        }
        copy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationKind {
    Mute,
    Unmute,
    Ban,
    Unban,
    Pin,
    Delete,
}

impl ModerationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationKind::Mute => "mute",
            ModerationKind::Unmute => "unmute",
            ModerationKind::Ban => "ban",
            ModerationKind::Unban => "unban",
            ModerationKind::Pin => "pin",
            ModerationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ModerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModerationTarget {
    User { user_id: Uuid },
    Message { message_id: Uuid, author_id: Uuid },
}

impl ModerationTarget {
    /// User affected by the action (the author, for message actions)
    pub fn user_id(&self) -> Uuid {
        match self {
            ModerationTarget::User { user_id } => *user_id,
            ModerationTarget::Message { author_id, .. } => *author_id,
        }
    }
}

/// Append-only audit record of an enforcement decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationAction {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub target: ModerationTarget,
    pub channel_id: Uuid,
    pub kind: ModerationKind,
    pub created_at: DateTime<Utc>,
}

/// Server → client event body
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventPayload {
    Message {
        message: ChatMessage,
    },
    PresenceDelta {
        joined: Vec<Uuid>,
        left: Vec<Uuid>,
        viewer_count: usize,
    },
    ModerationApplied {
        action: ModerationAction,
    },
    StreamStarted {
        session_id: Uuid,
    },
    StreamEnded {
        session_id: Uuid,
        reason: EndReason,
    },
    SlowConsumerWarning {
        last_sequence: u64,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Message { .. } => "message",
            EventPayload::PresenceDelta { .. } => "presenceDelta",
            EventPayload::ModerationApplied { .. } => "moderationApplied",
            EventPayload::StreamStarted { .. } => "streamStarted",
            EventPayload::StreamEnded { .. } => "streamEnded",
            EventPayload::SlowConsumerWarning { .. } => "slowConsumerWarning",
        }
    }
}

/// Envelope of every server-originated event
///
/// `sequence` is monotonic per channel; `id` is unique for client-side dedup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelEvent {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Client → server event of the chat channel protocol
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    Join,
    Leave,
    Send {
        body: String,
        /// Client-chosen id makes resends idempotent
        #[serde(default)]
        message_id: Option<Uuid>,
    },
    Pin {
        message_id: Uuid,
    },
    Delete {
        message_id: Uuid,
    },
    Mute {
        user_id: Uuid,
    },
    Unmute {
        user_id: Uuid,
    },
    Ban {
        user_id: Uuid,
    },
    Unban {
        user_id: Uuid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_parsing() {
        let send: ClientEvent = serde_json::from_str(r#"{"type":"send","body":"hi"}"#).unwrap();
        assert_eq!(
            send,
            ClientEvent::Send {
                body: "hi".into(),
                message_id: None
            }
        );

        let user = Uuid::new_v4();
        let mute: ClientEvent =
            serde_json::from_str(&format!(r#"{{"type":"mute","user_id":"{}"}}"#, user)).unwrap();
        assert_eq!(mute, ClientEvent::Mute { user_id: user });

        let join: ClientEvent = serde_json::from_str(r#"{"type":"join"}"#).unwrap();
        assert_eq!(join, ClientEvent::Join);
    }

    #[test]
    fn test_channel_event_flattens_payload() {
        let event = ChannelEvent {
            id: Uuid::nil(),
            channel_id: Uuid::nil(),
            sequence: 9,
            emitted_at: Utc::now(),
            payload: EventPayload::PresenceDelta {
                joined: vec![],
                left: vec![],
                viewer_count: 3,
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "presenceDelta");
        assert_eq!(json["sequence"], 9);
        assert_eq!(json["viewer_count"], 3);
    }

    #[test]
    fn test_redacted_clears_deleted_body_only() {
        let mut message =
            ChatMessage::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "gg".into());
        assert_eq!(message.redacted().body, "gg");

        message.deleted = true;
        let tombstone = message.redacted();
        assert!(tombstone.body.is_empty());
        assert_eq!(tombstone.id, message.id);
    }
}
