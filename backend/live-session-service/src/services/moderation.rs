//! Moderation engine
//!
//! `authorize` is a pure function over the acting and targeted participants;
//! every chat-send, pin, delete, mute and ban passes through it before
//! anything reaches the fanout bus. `ModerationEngine` wraps it with a
//! membership cache backed by the metadata store, records allowed actions and
//! re-publishes them so every subscriber converges on the same view.

use crate::config::ModerationConfig;
use crate::error::{AppError, DenyReason, Result};
use crate::metrics;
use crate::models::{
    Channel, EventPayload, MemberRole, Membership, ModerationAction, ModerationKind,
    ModerationTarget, Participant, Visibility,
};
use crate::services::fanout::FanoutBus;
use crate::services::metadata_store::MetadataStore;
use chrono::Utc;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything a participant can attempt on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAction {
    Subscribe,
    Send,
    Pin,
    Delete,
    Mute,
    Unmute,
    Ban,
    Unban,
}

impl ChannelAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelAction::Subscribe => "subscribe",
            ChannelAction::Send => "send",
            ChannelAction::Pin => "pin",
            ChannelAction::Delete => "delete",
            ChannelAction::Mute => "mute",
            ChannelAction::Unmute => "unmute",
            ChannelAction::Ban => "ban",
            ChannelAction::Unban => "unban",
        }
    }
}

impl fmt::Display for ChannelAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ModerationKind> for ChannelAction {
    fn from(kind: ModerationKind) -> Self {
        match kind {
            ModerationKind::Mute => ChannelAction::Mute,
            ModerationKind::Unmute => ChannelAction::Unmute,
            ModerationKind::Ban => ChannelAction::Ban,
            ModerationKind::Unban => ChannelAction::Unban,
            ModerationKind::Pin => ChannelAction::Pin,
            ModerationKind::Delete => ChannelAction::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn into_result(self) -> Result<()> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(AppError::ModerationDenied(reason)),
        }
    }
}

/// `actor` outranks whoever holds `target`; participants without a role rank lowest
fn outranks(actor: MemberRole, target: Option<MemberRole>) -> bool {
    target.map_or(true, |role| actor.can_manage(role))
}

/// Decide whether `actor` may perform `action`
///
/// `target` is the affected user for mute/ban actions and the message author
/// for pin/delete.
pub fn authorize(
    actor: &Participant,
    target: Option<&Participant>,
    action: ChannelAction,
) -> Decision {
    if actor.is_banned() {
        return Decision::Deny(DenyReason::Banned);
    }
    let Some(role) = actor.role() else {
        return Decision::Deny(DenyReason::NotMember);
    };

    match action {
        ChannelAction::Subscribe => Decision::Allow,
        ChannelAction::Send if actor.is_muted() => Decision::Deny(DenyReason::Muted),
        ChannelAction::Send => Decision::Allow,
        ChannelAction::Pin if role.can_moderate() => Decision::Allow,
        ChannelAction::Pin => Decision::Deny(DenyReason::InsufficientRole),
        ChannelAction::Delete => match target {
            Some(author) if author.user_id() == actor.user_id() => Decision::Allow,
            Some(author) if role.can_moderate() && outranks(role, author.role()) => Decision::Allow,
            Some(_) => Decision::Deny(DenyReason::InsufficientRole),
            None => Decision::Deny(DenyReason::UnknownMessage),
        },
        ChannelAction::Mute | ChannelAction::Unmute | ChannelAction::Ban | ChannelAction::Unban => {
            match target {
                Some(user) if user.user_id() == actor.user_id() => {
                    Decision::Deny(DenyReason::SelfTarget)
                }
                Some(user) if role.can_moderate() && outranks(role, user.role()) => Decision::Allow,
                Some(_) => Decision::Deny(DenyReason::InsufficientRole),
                None => Decision::Deny(DenyReason::NotMember),
            }
        }
    }
}

struct Cached<T> {
    value: T,
    loaded_at: Instant,
}

pub struct ModerationEngine {
    config: ModerationConfig,
    metadata: Arc<dyn MetadataStore>,
    bus: Arc<FanoutBus>,
    channels: DashMap<Uuid, Cached<Channel>>,
    memberships: DashMap<(Uuid, Uuid), Cached<Option<Membership>>>,
}

impl ModerationEngine {
    pub fn new(
        config: ModerationConfig,
        metadata: Arc<dyn MetadataStore>,
        bus: Arc<FanoutBus>,
    ) -> Self {
        Self {
            config,
            metadata,
            bus,
            channels: DashMap::new(),
            memberships: DashMap::new(),
        }
    }

    async fn channel(&self, channel_id: Uuid) -> Result<Channel> {
        if let Some(cached) = self.channels.get(&channel_id) {
            if cached.loaded_at.elapsed() < self.config.cache_ttl {
                return Ok(cached.value.clone());
            }
        }

        let channel = self
            .metadata
            .load_channel(channel_id)
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?
            .ok_or_else(|| AppError::NotFound(format!("channel {channel_id}")))?;
        self.channels.insert(
            channel_id,
            Cached {
                value: channel.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(channel)
    }

    async fn membership(&self, channel_id: Uuid, user_id: Uuid) -> Result<Option<Membership>> {
        if let Some(cached) = self.memberships.get(&(channel_id, user_id)) {
            if cached.loaded_at.elapsed() < self.config.cache_ttl {
                return Ok(cached.value.clone());
            }
        }
        self.refresh(channel_id, user_id).await
    }

    /// Reload a membership from the metadata store into the cache
    pub async fn refresh(&self, channel_id: Uuid, user_id: Uuid) -> Result<Option<Membership>> {
        let membership = self
            .metadata
            .load_membership(channel_id, user_id)
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;
        self.memberships.insert(
            (channel_id, user_id),
            Cached {
                value: membership.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(membership)
    }

    /// Resolve how a user appears on a channel
    pub async fn participant(&self, channel_id: Uuid, user_id: Uuid) -> Result<Participant> {
        let channel = self.channel(channel_id).await?;
        Ok(match self.membership(channel_id, user_id).await? {
            Some(membership) => Participant::Member(membership),
            None if channel.visibility == Visibility::Public => {
                Participant::Guest { channel_id, user_id }
            }
            None => Participant::Outsider { channel_id, user_id },
        })
    }

    /// Gate an action; denials come back as `ModerationDenied`
    pub async fn check(
        &self,
        channel_id: Uuid,
        actor_id: Uuid,
        target_id: Option<Uuid>,
        action: ChannelAction,
    ) -> Result<()> {
        let actor = self.participant(channel_id, actor_id).await?;
        let target = match target_id {
            Some(user_id) => Some(self.participant(channel_id, user_id).await?),
            None => None,
        };

        let decision = authorize(&actor, target.as_ref(), action);
        match decision {
            Decision::Allow => metrics::moderation_decision(action.as_str(), "allow"),
            Decision::Deny(reason) => {
                metrics::moderation_decision(action.as_str(), reason.as_str());
                debug!(%channel_id, %actor_id, %action, %reason, "Action denied");
            }
        }
        decision.into_result()
    }

    /// Authorize, record and publish a moderation action
    ///
    /// Bans also end the target's live subscriptions on the channel.
    pub async fn apply(
        &self,
        channel_id: Uuid,
        actor_id: Uuid,
        kind: ModerationKind,
        target: ModerationTarget,
    ) -> Result<ModerationAction> {
        let target_user = target.user_id();
        self.check(channel_id, actor_id, Some(target_user), kind.into())
            .await?;

        let action = ModerationAction {
            id: Uuid::new_v4(),
            actor_id,
            target,
            channel_id,
            kind,
            created_at: Utc::now(),
        };
        self.metadata
            .save_moderation_action(&action)
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;
        self.refresh(channel_id, target_user).await?;

        info!(%channel_id, %actor_id, %target_user, %kind, "Moderation action applied");

        match self.bus.publish(
            channel_id,
            EventPayload::ModerationApplied {
                action: action.clone(),
            },
        ) {
            Ok(_) => {}
            Err(e) => {
                warn!(%channel_id, error = %e, "Moderation action recorded but not fanned out")
            }
        }

        if kind == ModerationKind::Ban {
            self.bus.evict_user(channel_id, target_user);
        }

        Ok(action)
    }
}
