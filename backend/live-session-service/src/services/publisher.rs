//! Segment publisher
//!
//! Each (session, variant) is a track with exactly one writer. Encoded output
//! arrives in completion order, keyed by the input slot it was cut from; the
//! track holds it until every earlier slot is resolved, then assigns the next
//! sequence number. A slot is resolved by publishing it or by skipping it
//! (permanent job failure, or the sweeper after the gap timeout). Skipped
//! slots never consume a sequence number, so published sequences stay
//! contiguous and the following entry is flagged as a discontinuity.
//!
//! Manifests are immutable snapshots behind a `watch` channel: readers get
//! either the previous or the next version, never a half-updated window.

use crate::config::PublisherConfig;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{Manifest, ManifestEntry, Segment, Variant};
use crate::services::segment_store::SegmentStore;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredSegment {
    storage_ref: String,
    duration: Duration,
}

struct TrackState {
    /// Next input slot that may be published
    next_slot: u64,
    /// Sequence number the next published segment receives
    next_sequence: u64,
    pending: BTreeMap<u64, StoredSegment>,
    /// Skipped slots, kept so a late arrival is reported as a gap
    skipped: BTreeSet<u64>,
    /// Since when later segments have been waiting on `next_slot`
    blocked_since: Option<Instant>,
    discontinuity: bool,
    window: VecDeque<ManifestEntry>,
    version: u64,
    closed: bool,
    /// Set by `finalize`; the track is dropped `closed_retention` later
    closed_at: Option<Instant>,
}

struct Track {
    session_id: Uuid,
    variant: Variant,
    state: Mutex<TrackState>,
    manifest_tx: watch::Sender<Arc<Manifest>>,
    writer_held: AtomicBool,
}

impl Track {
    fn new(session_id: Uuid, variant: Variant) -> Self {
        let empty = Manifest::empty(session_id, variant.clone());
        let (manifest_tx, _) = watch::channel(Arc::new(empty));
        Self {
            session_id,
            variant,
            state: Mutex::new(TrackState {
                next_slot: 0,
                next_sequence: 0,
                pending: BTreeMap::new(),
                skipped: BTreeSet::new(),
                blocked_since: None,
                discontinuity: false,
                window: VecDeque::new(),
                version: 0,
                closed: false,
                closed_at: None,
            }),
            manifest_tx,
            writer_held: AtomicBool::new(false),
        }
    }

    /// Publish every resolved slot from `next_slot` on; returns what was appended
    fn drain(&self, state: &mut TrackState, config: &PublisherConfig) -> Vec<Segment> {
        let mut published = Vec::new();

        loop {
            let slot = state.next_slot;
            if let Some(stored) = state.pending.remove(&slot) {
                published.push(self.append(state, stored));
            } else if state.skipped.contains(&slot) {
                state.discontinuity = true;
            } else {
                break;
            }
            state.next_slot += 1;
        }

        if state.pending.is_empty() {
            state.blocked_since = None;
        } else if !published.is_empty() || state.blocked_since.is_none() {
            state.blocked_since = Some(Instant::now());
        }

        if !published.is_empty() {
            self.trim_window(state, config);
            self.publish_snapshot(state);
        }
        published
    }

    fn append(&self, state: &mut TrackState, stored: StoredSegment) -> Segment {
        let segment = Segment {
            session_id: self.session_id,
            variant: self.variant.clone(),
            sequence: state.next_sequence,
            duration_ms: stored.duration.as_millis() as u64,
            storage_ref: stored.storage_ref,
            discontinuity: std::mem::take(&mut state.discontinuity),
        };
        state.next_sequence += 1;
        state.window.push_back(ManifestEntry::from(&segment));

        metrics::segment_published(self.variant.as_str());
        debug!(
            session_id = %self.session_id,
            variant = %self.variant,
            sequence = segment.sequence,
            "Segment published"
        );
        segment
    }

    fn trim_window(&self, state: &mut TrackState, config: &PublisherConfig) {
        while state.window.len() > config.window_segments {
            state.window.pop_front();
        }
        let max_ms = config.window_duration.as_millis() as u64;
        while state.window.len() > 1
            && state.window.iter().map(|e| e.duration_ms).sum::<u64>() > max_ms
        {
            state.window.pop_front();
        }
    }

    fn publish_snapshot(&self, state: &mut TrackState) {
        state.version += 1;
        let manifest = Manifest {
            session_id: self.session_id,
            variant: self.variant.clone(),
            version: state.version,
            media_sequence: state.window.front().map(|e| e.sequence).unwrap_or(state.next_sequence),
            entries: state.window.iter().cloned().collect(),
            closed: state.closed,
            updated_at: Utc::now(),
        };
        self.manifest_tx.send_replace(Arc::new(manifest));
    }

    /// Mark `slot` skipped and publish whatever it was blocking
    fn skip(&self, state: &mut TrackState, slot: u64, config: &PublisherConfig) -> Vec<Segment> {
        if slot < state.next_slot
            || state.pending.contains_key(&slot)
            || !state.skipped.insert(slot)
        {
            return Vec::new();
        }
        metrics::manifest_gap_skipped();
        self.drain(state, config)
    }
}

pub struct SegmentPublisher {
    config: PublisherConfig,
    store: Arc<dyn SegmentStore>,
    tracks: DashMap<(Uuid, Variant), Arc<Track>>,
}

impl SegmentPublisher {
    pub fn new(config: PublisherConfig, store: Arc<dyn SegmentStore>) -> Self {
        Self {
            config,
            store,
            tracks: DashMap::new(),
        }
    }

    /// Create empty manifests for every variant of a new session
    pub fn open_session(&self, session_id: Uuid, variants: &[Variant]) {
        for variant in variants {
            self.tracks
                .entry((session_id, variant.clone()))
                .or_insert_with(|| Arc::new(Track::new(session_id, variant.clone())));
        }
    }

    fn track(&self, session_id: Uuid, variant: &Variant) -> Result<Arc<Track>> {
        self.tracks
            .get(&(session_id, variant.clone()))
            .map(|t| t.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("variant {variant} of session {session_id}")))
    }

    fn session_tracks(&self, session_id: Uuid) -> Vec<Arc<Track>> {
        self.tracks
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Claim the single writer of a (session, variant) track
    pub fn open_track(&self, session_id: Uuid, variant: &Variant) -> Result<VariantWriter> {
        let track = self.track(session_id, variant)?;
        if track.state.lock().closed {
            return Err(AppError::SessionClosed(session_id));
        }
        if track
            .writer_held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AppError::SessionConflict(format!(
                "variant {variant} of session {session_id} already has a writer"
            )));
        }

        Ok(VariantWriter {
            track,
            store: self.store.clone(),
            config: self.config.clone(),
        })
    }

    /// Persist a thumbnail and return its storage reference
    pub async fn store_thumbnail(
        &self,
        session_id: Uuid,
        slot: u64,
        data: Bytes,
    ) -> Result<String> {
        let path = format!("{}/thumbnails/{:08}.jpg", session_id, slot);
        self.store
            .put(&path, data)
            .await
            .map_err(|e| AppError::Storage(e.to_string()))
    }

    pub fn manifest(&self, session_id: Uuid, variant: &Variant) -> Result<Arc<Manifest>> {
        let track = self.track(session_id, variant)?;
        let snapshot = track.manifest_tx.borrow().clone();
        Ok(snapshot)
    }

    /// Receive every new manifest version as it is published
    pub fn watch_manifest(
        &self,
        session_id: Uuid,
        variant: &Variant,
    ) -> Result<watch::Receiver<Arc<Manifest>>> {
        Ok(self.track(session_id, variant)?.manifest_tx.subscribe())
    }

    pub fn variants(&self, session_id: Uuid) -> Vec<Variant> {
        let mut variants: Vec<Variant> = self
            .session_tracks(session_id)
            .into_iter()
            .map(|t| t.variant.clone())
            .collect();
        variants.sort();
        variants
    }

    /// Close every manifest of the session
    ///
    /// Segments already stored but still waiting on a gap are published in
    /// slot order with the gap marked as a discontinuity. Later publishes are
    /// rejected with `SessionClosed`.
    pub fn finalize(&self, session_id: Uuid) {
        for track in self.session_tracks(session_id) {
            let mut state = track.state.lock();
            if state.closed {
                continue;
            }

            let waiting: Vec<u64> = state.pending.keys().copied().collect();
            for slot in waiting {
                while state.next_slot < slot {
                    let gap = state.next_slot;
                    track.skip(&mut state, gap, &self.config);
                }
                track.drain(&mut state, &self.config);
            }

            state.closed = true;
            state.closed_at = Some(Instant::now());
            state.pending.clear();
            state.skipped.clear();
            track.publish_snapshot(&mut state);
            info!(
                %session_id,
                variant = %track.variant,
                last_sequence = state.next_sequence,
                "Manifest finalized"
            );
        }
    }

    /// Skip slots that have blocked later segments longer than the gap timeout
    pub fn sweep_stale(&self) -> usize {
        let tracks: Vec<Arc<Track>> = self.tracks.iter().map(|t| t.value().clone()).collect();
        let mut skipped = 0;

        for track in tracks {
            let mut state = track.state.lock();
            if state.closed {
                continue;
            }
            while let Some(since) = state.blocked_since {
                if since.elapsed() < self.config.gap_timeout {
                    break;
                }
                let slot = state.next_slot;
                warn!(
                    session_id = %track.session_id,
                    variant = %track.variant,
                    slot,
                    waited_ms = since.elapsed().as_millis() as u64,
                    "Skipping stale manifest slot"
                );
                track.skip(&mut state, slot, &self.config);
                skipped += 1;
            }
        }
        skipped
    }

    /// Drop tracks whose manifest was finalized more than `closed_retention` ago
    pub fn evict_closed(&self) -> usize {
        let retention = self.config.closed_retention;
        let before = self.tracks.len();
        self.tracks.retain(|_, track| {
            let state = track.state.lock();
            !matches!(state.closed_at, Some(at) if at.elapsed() >= retention)
        });
        let evicted = before.saturating_sub(self.tracks.len());
        if evicted > 0 {
            debug!(evicted, "Finalized manifests evicted");
        }
        evicted
    }

    /// Run `sweep_stale` and `evict_closed` on an interval until cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let publisher = Arc::clone(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        publisher.sweep_stale();
                        publisher.evict_closed();
                    }
                }
            }
        })
    }
}

/// Outcome of delivering one slot to a track
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    /// Where the slot's output was stored; `None` for a duplicate delivery
    pub storage_ref: Option<String>,
    /// Segments made visible by this delivery, possibly including held later slots
    pub released: Vec<Segment>,
}

/// Exclusive writer for one (session, variant) track
///
/// Dropping it releases the track for a new writer.
pub struct VariantWriter {
    track: Arc<Track>,
    store: Arc<dyn SegmentStore>,
    config: PublisherConfig,
}

impl VariantWriter {
    pub fn variant(&self) -> &Variant {
        &self.track.variant
    }

    /// `Ok(false)` when the slot was already delivered
    fn check_slot(&self, state: &TrackState, slot: u64) -> Result<bool> {
        if state.closed {
            return Err(AppError::SessionClosed(self.track.session_id));
        }
        if state.skipped.contains(&slot) {
            return Err(AppError::ManifestGap {
                variant: self.track.variant.to_string(),
                slot,
            });
        }
        Ok(slot >= state.next_slot && !state.pending.contains_key(&slot))
    }

    /// Store encoded output for `slot` and publish it once its turn comes
    ///
    /// Nothing is released while an earlier slot is still outstanding.
    pub async fn publish(&self, slot: u64, data: Bytes, duration: Duration) -> Result<Published> {
        if !self.check_slot(&self.track.state.lock(), slot)? {
            return Ok(Published {
                storage_ref: None,
                released: Vec::new(),
            });
        }

        let path = format!(
            "{}/{}/{:08}.ts",
            self.track.session_id, self.track.variant, slot
        );
        let storage_ref = self
            .store
            .put(&path, data)
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;

        let mut state = self.track.state.lock();
        if !self.check_slot(&state, slot)? {
            return Ok(Published {
                storage_ref: None,
                released: Vec::new(),
            });
        }
        state.pending.insert(
            slot,
            StoredSegment {
                storage_ref: storage_ref.clone(),
                duration,
            },
        );
        Ok(Published {
            storage_ref: Some(storage_ref),
            released: self.track.drain(&mut state, &self.config),
        })
    }

    /// Resolve `slot` without output (its job failed permanently)
    pub fn skip(&self, slot: u64) -> Result<Vec<Segment>> {
        let mut state = self.track.state.lock();
        if state.closed {
            return Err(AppError::SessionClosed(self.track.session_id));
        }
        warn!(
            session_id = %self.track.session_id,
            variant = %self.track.variant,
            slot,
            "Manifest slot skipped"
        );
        Ok(self.track.skip(&mut state, slot, &self.config))
    }
}

impl Drop for VariantWriter {
    fn drop(&mut self) {
        self.track.writer_held.store(false, Ordering::Release);
    }
}
