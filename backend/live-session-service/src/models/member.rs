//! Channel membership: roles, mute and ban state
//!
//! Roles have a natural ordering: Member < Moderator < Admin < Owner.
//! A role may act on any role strictly below it, never on peers or above.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Member role in a channel with natural hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    /// Regular member - can chat and watch
    Member = 0,
    /// Moderator - can pin, delete, mute and ban members
    Moderator = 1,
    /// Admin - can additionally moderate moderators
    Admin = 2,
    /// Owner - full control over the channel
    Owner = 3,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Moderator => "moderator",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }

    /// Check if this role outranks `target`
    pub fn can_manage(&self, target: MemberRole) -> bool {
        *self > target
    }

    /// Check if this role may perform moderation actions at all
    pub fn can_moderate(&self) -> bool {
        *self >= MemberRole::Moderator
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemberRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(Self::Member),
            "moderator" => Ok(Self::Moderator),
            "admin" => Ok(Self::Admin),
            "owner" => Ok(Self::Owner),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub visibility: Visibility,
    pub owner_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuteState {
    Unmuted,
    Muted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BanState {
    Active,
    Banned,
}

/// (channel, user) → role, mute state, ban state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub role: MemberRole,
    pub mute: MuteState,
    pub ban: BanState,
}

impl Membership {
    pub fn new(channel_id: Uuid, user_id: Uuid, role: MemberRole) -> Self {
        Self {
            channel_id,
            user_id,
            role,
            mute: MuteState::Unmuted,
            ban: BanState::Active,
        }
    }

    pub fn is_banned(&self) -> bool {
        self.ban == BanState::Banned
    }

    pub fn is_muted(&self) -> bool {
        self.mute == MuteState::Muted
    }
}

/// Who is acting on a channel, as seen by the moderation gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Participant {
    /// Stored membership row
    Member(Membership),
    /// Viewer of a public channel without a membership row
    Guest { channel_id: Uuid, user_id: Uuid },
    /// No membership on a private channel
    Outsider { channel_id: Uuid, user_id: Uuid },
}

impl Participant {
    pub fn user_id(&self) -> Uuid {
        match self {
            Participant::Member(m) => m.user_id,
            Participant::Guest { user_id, .. } | Participant::Outsider { user_id, .. } => *user_id,
        }
    }

    /// Effective role; guests act with member capabilities
    pub fn role(&self) -> Option<MemberRole> {
        match self {
            Participant::Member(m) => Some(m.role),
            Participant::Guest { .. } => Some(MemberRole::Member),
            Participant::Outsider { .. } => None,
        }
    }

    pub fn is_banned(&self) -> bool {
        matches!(self, Participant::Member(m) if m.is_banned())
    }

    pub fn is_muted(&self) -> bool {
        matches!(self, Participant::Member(m) if m.is_muted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(MemberRole::Member < MemberRole::Moderator);
        assert!(MemberRole::Moderator < MemberRole::Admin);
        assert!(MemberRole::Admin < MemberRole::Owner);
    }

    #[test]
    fn test_can_manage_strictly_below() {
        assert!(MemberRole::Owner.can_manage(MemberRole::Admin));
        assert!(MemberRole::Admin.can_manage(MemberRole::Moderator));
        assert!(MemberRole::Moderator.can_manage(MemberRole::Member));

        assert!(!MemberRole::Admin.can_manage(MemberRole::Admin));
        assert!(!MemberRole::Moderator.can_manage(MemberRole::Admin));
        assert!(!MemberRole::Member.can_manage(MemberRole::Member));
    }

    #[test]
    fn test_role_parse_roundtrip() {
        for role in [
            MemberRole::Member,
            MemberRole::Moderator,
            MemberRole::Admin,
            MemberRole::Owner,
        ] {
            assert_eq!(role.as_str().parse::<MemberRole>(), Ok(role));
        }
        assert!("superuser".parse::<MemberRole>().is_err());
    }

    #[test]
    fn test_guest_acts_as_member() {
        let guest = Participant::Guest {
            channel_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        };
        assert_eq!(guest.role(), Some(MemberRole::Member));
        assert!(!guest.is_banned());
        assert!(!guest.is_muted());
    }
}
