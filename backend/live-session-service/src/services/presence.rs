//! Presence tracker
//!
//! Counts live subscriptions per (channel, user) from the fanout bus'
//! membership changes. Changes that arrive together are coalesced into one
//! `presenceDelta` per channel, so the viewer count always reflects actual
//! connections rather than room membership.

use super::fanout::{FanoutBus, MembershipChange};
use crate::error::AppError;
use crate::models::EventPayload;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Delta {
    joined: Vec<Uuid>,
    left: Vec<Uuid>,
}

pub struct PresenceTracker {
    /// channel → user → open subscriptions
    connections: DashMap<Uuid, HashMap<Uuid, usize>>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Start consuming membership changes and publishing deltas on `bus`
    ///
    /// Runs until `shutdown` fires or every membership sender is gone.
    pub fn spawn(
        self: &Arc<Self>,
        bus: Arc<FanoutBus>,
        mut changes: mpsc::UnboundedReceiver<MembershipChange>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    change = changes.recv() => match change {
                        Some(change) => change,
                        None => break,
                    },
                };
                let mut batch = vec![first];
                while let Ok(next) = changes.try_recv() {
                    batch.push(next);
                }

                for (channel_id, delta) in tracker.apply(batch) {
                    let payload = EventPayload::PresenceDelta {
                        joined: delta.joined,
                        left: delta.left,
                        viewer_count: tracker.viewer_count(channel_id),
                    };
                    match bus.publish(channel_id, payload) {
                        Ok(_) | Err(AppError::ChannelClosed(_)) => {}
                        Err(e) => {
                            warn!(%channel_id, error = %e, "Failed to publish presence delta")
                        }
                    }
                }
            }
            debug!("Presence tracker stopped");
        })
    }

    /// Apply a batch and return the per-channel visible changes
    ///
    /// A user only joins when their first subscription opens and only leaves
    /// when their last one closes.
    fn apply(&self, batch: Vec<MembershipChange>) -> BTreeMap<Uuid, Delta> {
        let mut deltas: BTreeMap<Uuid, Delta> = BTreeMap::new();

        for change in batch {
            let channel_id = change.channel_id();
            let mut users = self.connections.entry(channel_id).or_default();
            match change {
                MembershipChange::Joined { user_id, .. } => {
                    let count = users.entry(user_id).or_insert(0);
                    *count += 1;
                    if *count == 1 {
                        let delta = deltas.entry(channel_id).or_default();
                        // join after leave within one batch cancels out
                        if let Some(pos) = delta.left.iter().position(|u| *u == user_id) {
                            delta.left.remove(pos);
                        } else {
                            delta.joined.push(user_id);
                        }
                    }
                }
                MembershipChange::Left { user_id, .. } => {
                    let remaining = match users.get_mut(&user_id) {
                        Some(count) => {
                            *count = count.saturating_sub(1);
                            *count
                        }
                        None => continue,
                    };
                    if remaining == 0 {
                        users.remove(&user_id);
                        let delta = deltas.entry(channel_id).or_default();
                        if let Some(pos) = delta.joined.iter().position(|u| *u == user_id) {
                            delta.joined.remove(pos);
                        } else {
                            delta.left.push(user_id);
                        }
                    }
                }
            }
        }

        deltas.retain(|_, d| !d.joined.is_empty() || !d.left.is_empty());
        deltas
    }

    /// Distinct users currently connected to the channel
    pub fn viewer_count(&self, channel_id: Uuid) -> usize {
        self.connections
            .get(&channel_id)
            .map(|users| users.len())
            .unwrap_or(0)
    }

    pub fn members(&self, channel_id: Uuid) -> Vec<Uuid> {
        let mut members: Vec<Uuid> = self
            .connections
            .get(&channel_id)
            .map(|users| users.keys().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn is_present(&self, channel_id: Uuid, user_id: Uuid) -> bool {
        self.connections
            .get(&channel_id)
            .map(|users| users.contains_key(&user_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanoutConfig;
    use std::time::Duration;

    fn joined(channel_id: Uuid, user_id: Uuid) -> MembershipChange {
        MembershipChange::Joined { channel_id, user_id }
    }

    fn left(channel_id: Uuid, user_id: Uuid) -> MembershipChange {
        MembershipChange::Left { channel_id, user_id }
    }

    #[test]
    fn test_counts_distinct_users() {
        let tracker = PresenceTracker::new();
        let channel = Uuid::new_v4();
        let user = Uuid::new_v4();

        let deltas = tracker.apply(vec![
            joined(channel, user),
            joined(channel, user),
            joined(channel, Uuid::new_v4()),
        ]);

        assert_eq!(tracker.viewer_count(channel), 2);
        assert_eq!(deltas[&channel].joined.len(), 2);

        // closing one of two tabs is not a leave
        assert!(tracker.apply(vec![left(channel, user)]).is_empty());
        assert!(tracker.is_present(channel, user));

        let deltas = tracker.apply(vec![left(channel, user)]);
        assert_eq!(deltas[&channel].left, vec![user]);
        assert_eq!(tracker.viewer_count(channel), 1);
    }

    #[test]
    fn test_join_then_leave_in_batch_cancels() {
        let tracker = PresenceTracker::new();
        let channel = Uuid::new_v4();
        let user = Uuid::new_v4();

        let deltas = tracker.apply(vec![joined(channel, user), left(channel, user)]);

        assert!(deltas.is_empty());
        assert_eq!(tracker.viewer_count(channel), 0);
    }

    #[tokio::test]
    async fn test_subscribe_emits_presence_delta() {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Arc::new(FanoutBus::new(FanoutConfig::default(), tx));
        let tracker = Arc::new(PresenceTracker::new());
        let _task = tracker.spawn(bus.clone(), rx, CancellationToken::new());

        let channel = Uuid::new_v4();
        let user = Uuid::new_v4();
        let mut sub = bus.subscribe(channel, user).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        match event.payload {
            EventPayload::PresenceDelta {
                joined,
                viewer_count,
                ..
            } => {
                assert_eq!(joined, vec![user]);
                assert_eq!(viewer_count, 1);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(tracker.members(channel), vec![user]);
    }

    #[tokio::test]
    async fn test_tracker_stops_on_shutdown() {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Arc::new(FanoutBus::new(FanoutConfig::default(), tx));
        let shutdown = CancellationToken::new();
        let task = Arc::new(PresenceTracker::new()).spawn(bus.clone(), rx, shutdown.clone());

        shutdown.cancel();

        // the bus still holds the sender, so only the token can end the task
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
