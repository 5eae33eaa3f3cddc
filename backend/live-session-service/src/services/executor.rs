//! Transcode executor collaborator
//!
//! The real encoder pool is external; the dispatcher only needs to hand it one
//! job at a time and learn whether a failure is worth retrying.

use crate::models::{EncodedOutput, InputSegment, JobTarget};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub job_id: Uuid,
    pub input: InputSegment,
    pub target: JobTarget,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    /// Worth retrying: pool busy, worker lost, timeout
    #[error("transient executor failure: {0}")]
    Transient(String),
    /// Retrying cannot help: unsupported input, invalid parameters
    #[error("permanent executor failure: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait TranscodeExecutor: Send + Sync {
    async fn transcode(&self, request: TranscodeRequest) -> Result<EncodedOutput, ExecutorError>;
}

/// In-process executor that re-emits the input payload as the rendition
#[derive(Debug, Default, Clone)]
pub struct PassthroughExecutor;

#[async_trait]
impl TranscodeExecutor for PassthroughExecutor {
    async fn transcode(&self, request: TranscodeRequest) -> Result<EncodedOutput, ExecutorError> {
        if request.input.data.is_empty() {
            return Err(ExecutorError::Permanent(format!(
                "input {} has no media",
                request.input.reference()
            )));
        }

        let data = match request.target {
            JobTarget::Rendition(_) => request.input.data.clone(),
            // Thumbnails are a small still; keep a bounded prefix of the input
            JobTarget::Thumbnail => request.input.data.slice(..request.input.data.len().min(4096)),
        };

        Ok(EncodedOutput {
            data,
            duration: request.input.duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{job_id, Variant};
    use bytes::Bytes;
    use std::time::Duration;

    fn request(data: &'static [u8], target: JobTarget) -> TranscodeRequest {
        let input = InputSegment {
            session_id: Uuid::new_v4(),
            index: 0,
            data: Bytes::from_static(data),
            duration: Duration::from_secs(2),
        };
        TranscodeRequest {
            job_id: job_id(input.session_id, input.index, &target),
            input,
            target,
        }
    }

    #[tokio::test]
    async fn test_passthrough_keeps_duration() {
        let output = PassthroughExecutor
            .transcode(request(b"media", JobTarget::Rendition(Variant::new("720p"))))
            .await
            .unwrap();

        assert_eq!(output.data, Bytes::from_static(b"media"));
        assert_eq!(output.duration, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_passthrough_rejects_empty_input_permanently() {
        let err = PassthroughExecutor
            .transcode(request(b"", JobTarget::Thumbnail))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Permanent(_)));
    }
}
