//! Chat channel service
//!
//! Entry point of the chat channel protocol: every client event is gated by
//! the moderation engine, then appended to the channel history and fanned out.
//! History is bounded and append-only; pin and delete flag records in place.

use crate::config::ModerationConfig;
use crate::error::{AppError, DenyReason, Result};
use crate::models::{
    ChatMessage, ClientEvent, EventPayload, ModerationAction, ModerationKind, ModerationTarget,
};
use crate::services::fanout::{FanoutBus, Subscription};
use crate::services::moderation::{ChannelAction, ModerationEngine};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const MAX_MESSAGE_CHARS: usize = 2000;

pub struct ChatService {
    config: ModerationConfig,
    moderation: Arc<ModerationEngine>,
    bus: Arc<FanoutBus>,
    history: DashMap<Uuid, VecDeque<ChatMessage>>,
}

impl ChatService {
    pub fn new(
        config: ModerationConfig,
        moderation: Arc<ModerationEngine>,
        bus: Arc<FanoutBus>,
    ) -> Self {
        Self {
            config,
            moderation,
            bus,
            history: DashMap::new(),
        }
    }

    /// Subscribe a user to the channel's events; banned users are refused
    pub async fn join(&self, channel_id: Uuid, user_id: Uuid) -> Result<Subscription> {
        self.moderation
            .check(channel_id, user_id, None, ChannelAction::Subscribe)
            .await?;
        self.bus.subscribe(channel_id, user_id)
    }

    /// Append a message and fan it out
    ///
    /// Resending with a known `message_id` returns the stored message and
    /// publishes nothing.
    pub async fn send(
        &self,
        channel_id: Uuid,
        sender_id: Uuid,
        body: String,
        message_id: Option<Uuid>,
    ) -> Result<ChatMessage> {
        let body = body.trim().to_string();
        if body.is_empty() {
            return Err(AppError::BadRequest("message body is empty".to_string()));
        }
        if body.chars().count() > MAX_MESSAGE_CHARS {
            return Err(AppError::BadRequest(format!(
                "message body exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }

        self.moderation
            .check(channel_id, sender_id, None, ChannelAction::Send)
            .await?;

        let message = ChatMessage::new(
            message_id.unwrap_or_else(Uuid::new_v4),
            channel_id,
            sender_id,
            body,
        );

        // Held across publish so history order matches channel sequence
        let mut history = self.history.entry(channel_id).or_default();
        if let Some(existing) = history.iter().find(|m| m.id == message.id) {
            debug!(%channel_id, message_id = %message.id, "Duplicate message ignored");
            return Ok(existing.redacted());
        }

        self.bus.publish(
            channel_id,
            EventPayload::Message {
                message: message.clone(),
            },
        )?;

        history.push_back(message.clone());
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
        Ok(message)
    }

    fn author_of(&self, channel_id: Uuid, message_id: Uuid) -> Result<Uuid> {
        self.history
            .get(&channel_id)
            .and_then(|h| h.iter().find(|m| m.id == message_id).map(|m| m.sender_id))
            .ok_or(AppError::ModerationDenied(DenyReason::UnknownMessage))
    }

    fn flag(&self, channel_id: Uuid, message_id: Uuid, f: impl FnOnce(&mut ChatMessage)) {
        if let Some(mut history) = self.history.get_mut(&channel_id) {
            if let Some(message) = history.iter_mut().find(|m| m.id == message_id) {
                f(message);
            }
        }
    }

    pub async fn pin(
        &self,
        channel_id: Uuid,
        actor_id: Uuid,
        message_id: Uuid,
    ) -> Result<ModerationAction> {
        let author_id = self.author_of(channel_id, message_id)?;
        let action = self
            .moderation
            .apply(
                channel_id,
                actor_id,
                ModerationKind::Pin,
                ModerationTarget::Message {
                    message_id,
                    author_id,
                },
            )
            .await?;
        self.flag(channel_id, message_id, |m| m.pinned = true);
        Ok(action)
    }

    /// Soft-delete: the record stays in place as a tombstone
    pub async fn delete(
        &self,
        channel_id: Uuid,
        actor_id: Uuid,
        message_id: Uuid,
    ) -> Result<ModerationAction> {
        let author_id = self.author_of(channel_id, message_id)?;
        let action = self
            .moderation
            .apply(
                channel_id,
                actor_id,
                ModerationKind::Delete,
                ModerationTarget::Message {
                    message_id,
                    author_id,
                },
            )
            .await?;
        self.flag(channel_id, message_id, |m| m.deleted = true);
        Ok(action)
    }

    pub async fn moderate_user(
        &self,
        channel_id: Uuid,
        actor_id: Uuid,
        kind: ModerationKind,
        user_id: Uuid,
    ) -> Result<ModerationAction> {
        self.moderation
            .apply(channel_id, actor_id, kind, ModerationTarget::User { user_id })
            .await
    }

    /// Apply one client event from a connected user
    ///
    /// `join` and `leave` concern the connection itself and are handled by the
    /// transport.
    pub async fn handle(&self, channel_id: Uuid, user_id: Uuid, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::Join | ClientEvent::Leave => Ok(()),
            ClientEvent::Send { body, message_id } => {
                self.send(channel_id, user_id, body, message_id).await.map(|_| ())
            }
            ClientEvent::Pin { message_id } => {
                self.pin(channel_id, user_id, message_id).await.map(|_| ())
            }
            ClientEvent::Delete { message_id } => {
                self.delete(channel_id, user_id, message_id).await.map(|_| ())
            }
            ClientEvent::Mute { user_id: target } => self
                .moderate_user(channel_id, user_id, ModerationKind::Mute, target)
                .await
                .map(|_| ()),
            ClientEvent::Unmute { user_id: target } => self
                .moderate_user(channel_id, user_id, ModerationKind::Unmute, target)
                .await
                .map(|_| ()),
            ClientEvent::Ban { user_id: target } => self
                .moderate_user(channel_id, user_id, ModerationKind::Ban, target)
                .await
                .map(|_| ()),
            ClientEvent::Unban { user_id: target } => self
                .moderate_user(channel_id, user_id, ModerationKind::Unban, target)
                .await
                .map(|_| ()),
        }
    }

    /// Channel history with deleted bodies cleared
    pub fn history(&self, channel_id: Uuid) -> Vec<ChatMessage> {
        self.history
            .get(&channel_id)
            .map(|h| h.iter().map(ChatMessage::redacted).collect())
            .unwrap_or_default()
    }
}
