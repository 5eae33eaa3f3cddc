//! Stream key registry
//!
//! Issues random keys bound to exactly one (channel, session) and validates
//! inbound ingest requests against them. Revoked keys stay recorded so late
//! reconnect attempts are logged as revoked rather than unknown.

use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBinding {
    pub channel_id: Uuid,
    pub session_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl KeyBinding {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

pub struct KeyRegistry {
    key_bytes: usize,
    keys: DashMap<String, KeyBinding>,
    /// session → its current key
    by_session: DashMap<Uuid, String>,
}

impl KeyRegistry {
    pub fn new(key_bytes: usize) -> Self {
        Self {
            key_bytes,
            keys: DashMap::new(),
            by_session: DashMap::new(),
        }
    }

    fn generate(&self) -> String {
        let mut raw = vec![0u8; self.key_bytes];
        rand::thread_rng().fill_bytes(&mut raw);
        hex::encode(raw)
    }

    /// Issue the key for a session; any previous key of the session is revoked
    pub fn issue(&self, channel_id: Uuid, session_id: Uuid) -> String {
        let key = self.generate();
        let binding = KeyBinding {
            channel_id,
            session_id,
            issued_at: Utc::now(),
            revoked_at: None,
        };
        self.keys.insert(key.clone(), binding);

        if let Some(previous) = self.by_session.insert(session_id, key.clone()) {
            self.mark_revoked(&previous);
        }

        info!(%channel_id, %session_id, "Stream key issued");
        key
    }

    /// Resolve a key to its binding; unknown and revoked keys are both `KeyInvalid`
    pub fn validate(&self, key: &str) -> Result<KeyBinding> {
        match self.keys.get(key) {
            Some(binding) if !binding.is_revoked() => Ok(binding.clone()),
            Some(binding) => {
                warn!(session_id = %binding.session_id, "Rejected revoked stream key");
                Err(AppError::KeyInvalid)
            }
            None => {
                warn!("Rejected unknown stream key");
                Err(AppError::KeyInvalid)
            }
        }
    }

    /// Replace the session's key; the old one stops validating immediately
    pub fn rotate(&self, session_id: Uuid) -> Result<String> {
        let channel_id = {
            let current = self
                .by_session
                .get(&session_id)
                .ok_or_else(|| AppError::NotFound(format!("stream key for session {session_id}")))?;
            let binding = self
                .keys
                .get(current.value())
                .ok_or_else(|| AppError::NotFound(format!("stream key for session {session_id}")))?;
            if binding.is_revoked() {
                return Err(AppError::SessionClosed(session_id));
            }
            binding.channel_id
        };

        let key = self.issue(channel_id, session_id);
        info!(%session_id, "Stream key rotated");
        Ok(key)
    }

    /// Revoke the session's current key (session end)
    pub fn revoke_session(&self, session_id: Uuid) {
        if let Some(key) = self.by_session.get(&session_id).map(|k| k.value().clone()) {
            self.mark_revoked(&key);
            info!(%session_id, "Stream key revoked");
        }
    }

    fn mark_revoked(&self, key: &str) {
        if let Some(mut binding) = self.keys.get_mut(key) {
            if binding.revoked_at.is_none() {
                binding.revoked_at = Some(Utc::now());
            }
        }
    }
}
