//! Published segments and per-variant manifests

use super::job::Variant;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;
use uuid::Uuid;

/// Encoded media chunk; immutable once published
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub session_id: Uuid,
    pub variant: Variant,
    pub sequence: u64,
    pub duration_ms: u64,
    pub storage_ref: String,
    /// Set when the previous slot was skipped, so players reset decoders
    pub discontinuity: bool,
}

impl Segment {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// One playable entry of a manifest window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestEntry {
    pub sequence: u64,
    pub variant: Variant,
    pub duration_ms: u64,
    pub reference: String,
    pub discontinuity: bool,
}

impl From<&Segment> for ManifestEntry {
    fn from(segment: &Segment) -> Self {
        Self {
            sequence: segment.sequence,
            variant: segment.variant.clone(),
            duration_ms: segment.duration_ms,
            reference: segment.storage_ref.clone(),
            discontinuity: segment.discontinuity,
        }
    }
}

/// Versioned sliding-window view of one variant's segments
///
/// Snapshots are swapped whole, so a reader holds either the previous or the
/// next version and never a partially updated window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    pub session_id: Uuid,
    pub variant: Variant,
    pub version: u64,
    /// Sequence number of the first entry in the window
    pub media_sequence: u64,
    pub entries: Vec<ManifestEntry>,
    /// Final manifest: no further appends will happen
    pub closed: bool,
    pub updated_at: DateTime<Utc>,
}

impl Manifest {
    pub fn empty(session_id: Uuid, variant: Variant) -> Self {
        Self {
            session_id,
            variant,
            version: 0,
            media_sequence: 0,
            entries: Vec::new(),
            closed: false,
            updated_at: Utc::now(),
        }
    }

    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.entries.iter().map(|e| e.duration_ms).sum())
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.entries.last().map(|e| e.sequence)
    }

    /// Render the window as an HLS media playlist
    pub fn to_hls_playlist(&self) -> String {
        let target_duration = self
            .entries
            .iter()
            .map(|e| e.duration_ms.div_ceil(1000))
            .max()
            .unwrap_or(1)
            .max(1);

        let mut playlist = String::from("#EXTM3U\n");
        playlist.push_str("#EXT-X-VERSION:3\n");
        let _ = writeln!(playlist, "#EXT-X-TARGETDURATION:{}", target_duration);
        let _ = writeln!(playlist, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence);

        for entry in &self.entries {
            if entry.discontinuity {
                playlist.push_str("#EXT-X-DISCONTINUITY\n");
            }
            let _ = writeln!(playlist, "#EXTINF:{:.3},", entry.duration_ms as f64 / 1000.0);
            let _ = writeln!(playlist, "{}", entry.reference);
        }

        if self.closed {
            playlist.push_str("#EXT-X-ENDLIST\n");
        }

        playlist
    }
}
