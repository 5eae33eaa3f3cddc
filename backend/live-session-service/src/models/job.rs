//! Transcode job data model

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Namespace for deterministic job ids (UUIDv5 over session/input/target)
const JOB_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_3a52_8e0d_4b1c_9f3e_2d7a_5b60_c4e1);

/// One encoded rendition of a session, identified by its label (e.g. "720p")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variant(String);

impl Variant {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Variant {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

/// What a job produces
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "variant", rename_all = "lowercase")]
pub enum JobTarget {
    Rendition(Variant),
    Thumbnail,
}

impl JobTarget {
    fn id_component(&self) -> String {
        match self {
            JobTarget::Rendition(variant) => format!("rendition:{}", variant),
            JobTarget::Thumbnail => "thumbnail".to_string(),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            JobTarget::Rendition(variant) => variant.as_str(),
            JobTarget::Thumbnail => "thumbnail",
        }
    }
}

/// A cut of raw ingest media, the input of every job for its slot
#[derive(Debug, Clone)]
pub struct InputSegment {
    pub session_id: Uuid,
    /// Zero-based position in the ingest stream; orders publication per variant
    pub index: u64,
    pub data: Bytes,
    pub duration: Duration,
}

impl InputSegment {
    pub fn reference(&self) -> String {
        format!("ingest/{}/{:08}", self.session_id, self.index)
    }
}

/// Deterministic id so re-submission of the same work is idempotent
pub fn job_id(session_id: Uuid, input_index: u64, target: &JobTarget) -> Uuid {
    let name = format!("{}:{}:{}", session_id, input_index, target.id_component());
    Uuid::new_v5(&JOB_ID_NAMESPACE, name.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Output reported by the executor for one job
#[derive(Debug, Clone)]
pub struct EncodedOutput {
    pub data: Bytes,
    pub duration: Duration,
}

/// Result kept for a succeeded job and returned on duplicate submission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub storage_ref: String,
    pub duration_ms: u64,
    pub size_bytes: usize,
}

/// Unit of transcode work for a session
#[derive(Debug, Clone, Serialize)]
pub struct TranscodeJob {
    pub id: Uuid,
    pub session_id: Uuid,
    pub input_ref: String,
    pub input_index: u64,
    pub target: JobTarget,
    pub state: JobState,
    pub retry_count: u32,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    /// The failure was transient and retries ran out
    pub retryable: bool,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TranscodeJob {
    pub fn queued(input: &InputSegment, target: JobTarget) -> Self {
        Self {
            id: job_id(input.session_id, input.index, &target),
            session_id: input.session_id,
            input_ref: input.reference(),
            input_index: input.index,
            target,
            state: JobState::Queued,
            retry_count: 0,
            result: None,
            error: None,
            retryable: false,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_is_deterministic() {
        let session = Uuid::new_v4();
        let target = JobTarget::Rendition(Variant::new("720p"));

        assert_eq!(job_id(session, 3, &target), job_id(session, 3, &target));
    }

    #[test]
    fn test_job_id_differs_per_input_and_target() {
        let session = Uuid::new_v4();
        let hd = JobTarget::Rendition(Variant::new("720p"));
        let sd = JobTarget::Rendition(Variant::new("480p"));

        assert_ne!(job_id(session, 0, &hd), job_id(session, 1, &hd));
        assert_ne!(job_id(session, 0, &hd), job_id(session, 0, &sd));
        assert_ne!(job_id(session, 0, &hd), job_id(session, 0, &JobTarget::Thumbnail));
        assert_ne!(job_id(session, 0, &hd), job_id(Uuid::new_v4(), 0, &hd));
    }

    #[test]
    fn test_input_reference_is_zero_padded() {
        let session = Uuid::nil();
        let input = InputSegment {
            session_id: session,
            index: 42,
            data: Bytes::new(),
            duration: Duration::from_secs(2),
        };
        assert_eq!(input.reference(), format!("ingest/{}/00000042", session));
    }
}
