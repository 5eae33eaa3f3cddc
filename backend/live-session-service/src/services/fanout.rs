//! Chat fanout bus
//!
//! One topic per channel. Publishing takes the topic lock, assigns the next
//! channel sequence and enqueues into every subscriber's bounded queue before
//! releasing it, so all subscribers observe the same total order per channel.
//! The lock is per topic; publishers on other channels never contend.
//!
//! A subscriber whose queue is full is removed on the spot instead of making
//! the publisher wait. Its `Subscription` drains what was already queued and
//! then reports `AppError::SlowConsumer`.

use crate::config::FanoutConfig;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{ChannelEvent, EventPayload};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Subscribe/unsubscribe notification consumed by the presence tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Joined { channel_id: Uuid, user_id: Uuid },
    Left { channel_id: Uuid, user_id: Uuid },
}

impl MembershipChange {
    pub fn channel_id(&self) -> Uuid {
        match self {
            MembershipChange::Joined { channel_id, .. }
            | MembershipChange::Left { channel_id, .. } => *channel_id,
        }
    }
}

struct SubscriberSlot {
    id: Uuid,
    user_id: Uuid,
    tx: mpsc::Sender<ChannelEvent>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Default)]
struct TopicState {
    /// Sequence of the last published event
    sequence: u64,
    subscribers: Vec<SubscriberSlot>,
    closed: bool,
}

struct ChannelTopic {
    channel_id: Uuid,
    state: Mutex<TopicState>,
}

pub struct FanoutBus {
    config: FanoutConfig,
    topics: DashMap<Uuid, Arc<ChannelTopic>>,
    presence_tx: mpsc::UnboundedSender<MembershipChange>,
}

impl FanoutBus {
    /// Create the bus; membership changes are sent to `presence_tx`
    pub fn new(config: FanoutConfig, presence_tx: mpsc::UnboundedSender<MembershipChange>) -> Self {
        Self {
            config,
            topics: DashMap::new(),
            presence_tx,
        }
    }

    fn topic(&self, channel_id: Uuid) -> Arc<ChannelTopic> {
        self.topics
            .entry(channel_id)
            .or_insert_with(|| {
                Arc::new(ChannelTopic {
                    channel_id,
                    state: Mutex::new(TopicState::default()),
                })
            })
            .value()
            .clone()
    }

    fn notify(&self, change: MembershipChange) {
        // Presence is advisory; a stopped tracker must not break fanout
        let _ = self.presence_tx.send(change);
    }

    /// Publish an event to every current subscriber of the channel
    pub fn publish(&self, channel_id: Uuid, payload: EventPayload) -> Result<ChannelEvent> {
        let topic = self.topic(channel_id);
        let kind = payload.kind();
        let mut slow = Vec::new();

        let event = {
            let mut state = topic.state.lock();
            if state.closed {
                return Err(AppError::ChannelClosed(channel_id));
            }

            state.sequence += 1;
            let event = ChannelEvent {
                id: Uuid::new_v4(),
                channel_id,
                sequence: state.sequence,
                emitted_at: Utc::now(),
                payload,
            };

            state.subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    sub.overflowed.store(true, Ordering::Release);
                    slow.push((sub.id, sub.user_id));
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });

            event
        };

        for (subscription_id, user_id) in slow {
            warn!(
                %channel_id,
                %subscription_id,
                %user_id,
                sequence = event.sequence,
                "Slow consumer disconnected"
            );
            metrics::slow_consumer_disconnected();
            self.notify(MembershipChange::Left { channel_id, user_id });
        }

        metrics::chat_event_published(kind);
        debug!(%channel_id, sequence = event.sequence, kind, "Event published");
        Ok(event)
    }

    /// Subscribe to the channel's event stream
    pub fn subscribe(&self, channel_id: Uuid, user_id: Uuid) -> Result<Subscription> {
        let topic = self.topic(channel_id);
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);
        let overflowed = Arc::new(AtomicBool::new(false));
        let id = Uuid::new_v4();

        {
            let mut state = topic.state.lock();
            if state.closed {
                return Err(AppError::ChannelClosed(channel_id));
            }
            state.subscribers.push(SubscriberSlot {
                id,
                user_id,
                tx,
                overflowed: overflowed.clone(),
            });
        }

        self.notify(MembershipChange::Joined { channel_id, user_id });
        debug!(%channel_id, %user_id, subscription_id = %id, "Subscriber added");

        Ok(Subscription {
            id,
            channel_id,
            user_id,
            rx,
            overflowed,
            last_sequence: 0,
            topic,
            presence_tx: self.presence_tx.clone(),
        })
    }

    /// Reject further publishes and end every subscriber stream
    ///
    /// Called after the terminal `streamEnded` event, so that event is the last
    /// one subscribers receive.
    pub fn close_channel(&self, channel_id: Uuid) {
        let topic = self.topic(channel_id);
        let dropped: Vec<SubscriberSlot> = {
            let mut state = topic.state.lock();
            state.closed = true;
            state.subscribers.drain(..).collect()
        };

        for slot in &dropped {
            self.notify(MembershipChange::Left {
                channel_id,
                user_id: slot.user_id,
            });
        }
        info!(%channel_id, subscribers = dropped.len(), "Channel closed");
    }

    /// Accept publishes and subscriptions again (next session on the channel)
    pub fn reopen_channel(&self, channel_id: Uuid) {
        let topic = self.topic(channel_id);
        let mut state = topic.state.lock();
        if state.closed {
            state.closed = false;
            info!(%channel_id, "Channel reopened");
        }
    }

    pub fn is_closed(&self, channel_id: Uuid) -> bool {
        self.topics
            .get(&channel_id)
            .map(|topic| topic.state.lock().closed)
            .unwrap_or(false)
    }

    /// End every subscription a user holds on the channel
    pub fn evict_user(&self, channel_id: Uuid, user_id: Uuid) -> usize {
        let Some(topic) = self.topics.get(&channel_id).map(|t| t.value().clone()) else {
            return 0;
        };

        let evicted = {
            let mut state = topic.state.lock();
            let before = state.subscribers.len();
            state.subscribers.retain(|sub| sub.user_id != user_id);
            before - state.subscribers.len()
        };

        for _ in 0..evicted {
            self.notify(MembershipChange::Left { channel_id, user_id });
        }
        if evicted > 0 {
            info!(%channel_id, %user_id, evicted, "Evicted subscriptions");
        }
        evicted
    }

    pub fn subscriber_count(&self, channel_id: Uuid) -> usize {
        self.topics
            .get(&channel_id)
            .map(|topic| topic.state.lock().subscribers.len())
            .unwrap_or(0)
    }

    /// Sequence of the last event published on the channel
    pub fn last_sequence(&self, channel_id: Uuid) -> u64 {
        self.topics
            .get(&channel_id)
            .map(|topic| topic.state.lock().sequence)
            .unwrap_or(0)
    }
}

/// Receiving end of one channel subscription
///
/// Dropping it unsubscribes.
pub struct Subscription {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub user_id: Uuid,
    rx: mpsc::Receiver<ChannelEvent>,
    overflowed: Arc<AtomicBool>,
    last_sequence: u64,
    topic: Arc<ChannelTopic>,
    presence_tx: mpsc::UnboundedSender<MembershipChange>,
}

impl Subscription {
    /// Next event in channel order
    ///
    /// `Ok(None)` means the stream finished (channel closed, evicted);
    /// `Err(SlowConsumer)` means this subscriber was dropped for overflowing.
    pub async fn recv(&mut self) -> Result<Option<ChannelEvent>> {
        match self.rx.recv().await {
            Some(event) => {
                self.last_sequence = event.sequence;
                Ok(Some(event))
            }
            None if self.overflowed.load(Ordering::Acquire) => Err(AppError::SlowConsumer),
            None => Ok(None),
        }
    }

    /// Sequence of the last event handed out by `recv`
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn is_slow(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Terminal notice sent to a slow consumer before its connection is closed
    ///
    /// Carries the last delivered sequence so the client knows where to resume.
    pub fn slow_consumer_warning(&self) -> ChannelEvent {
        ChannelEvent {
            id: Uuid::new_v4(),
            channel_id: self.channel_id,
            sequence: self.last_sequence,
            emitted_at: Utc::now(),
            payload: EventPayload::SlowConsumerWarning {
                last_sequence: self.last_sequence,
            },
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let removed = {
            let mut state = self.topic.state.lock();
            let before = state.subscribers.len();
            state.subscribers.retain(|sub| sub.id != self.id);
            before != state.subscribers.len()
        };

        if removed {
            let _ = self.presence_tx.send(MembershipChange::Left {
                channel_id: self.topic.channel_id,
                user_id: self.user_id,
            });
        }
    }
}
