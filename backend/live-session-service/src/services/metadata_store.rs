//! Metadata store collaborator
//!
//! Durable source of channel, role, mute and ban truth. Saving a moderation
//! action is the write path: the store applies mute/ban changes to the
//! membership row in the same call.

use crate::models::{
    BanState, Channel, MemberRole, Membership, ModerationAction, ModerationKind, MuteState,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("metadata store error: {0}")]
pub struct MetadataError(pub String);

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn load_channel(&self, channel_id: Uuid) -> Result<Option<Channel>, MetadataError>;

    async fn load_membership(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Membership>, MetadataError>;

    async fn save_moderation_action(&self, action: &ModerationAction) -> Result<(), MetadataError>;
}

/// Process-local metadata store with seeding helpers
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    channels: DashMap<Uuid, Channel>,
    memberships: DashMap<(Uuid, Uuid), Membership>,
    audit: Mutex<Vec<ModerationAction>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a channel and its owner membership
    pub fn upsert_channel(&self, channel: Channel) {
        self.memberships.insert(
            (channel.id, channel.owner_id),
            Membership::new(channel.id, channel.owner_id, MemberRole::Owner),
        );
        self.channels.insert(channel.id, channel);
    }

    pub fn upsert_membership(&self, membership: Membership) {
        self.memberships
            .insert((membership.channel_id, membership.user_id), membership);
    }

    pub fn audit_log(&self) -> Vec<ModerationAction> {
        self.audit.lock().clone()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn load_channel(&self, channel_id: Uuid) -> Result<Option<Channel>, MetadataError> {
        Ok(self.channels.get(&channel_id).map(|c| c.value().clone()))
    }

    async fn load_membership(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Membership>, MetadataError> {
        Ok(self
            .memberships
            .get(&(channel_id, user_id))
            .map(|m| m.value().clone()))
    }

    async fn save_moderation_action(&self, action: &ModerationAction) -> Result<(), MetadataError> {
        let changes_membership = !matches!(
            action.kind,
            ModerationKind::Pin | ModerationKind::Delete
        );

        if changes_membership {
            let user_id = action.target.user_id();
            let mut entry = self
                .memberships
                .entry((action.channel_id, user_id))
                .or_insert_with(|| Membership::new(action.channel_id, user_id, MemberRole::Member));
            let membership = entry.value_mut();
            match action.kind {
                ModerationKind::Mute => membership.mute = MuteState::Muted,
                ModerationKind::Unmute => membership.mute = MuteState::Unmuted,
                ModerationKind::Ban => membership.ban = BanState::Banned,
                ModerationKind::Unban => membership.ban = BanState::Active,
                ModerationKind::Pin | ModerationKind::Delete => {}
            }
        }

        self.audit.lock().push(action.clone());
        Ok(())
    }
}
