//! Object storage collaborator for published media

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("object storage unavailable: {0}")]
pub struct StorageError(pub String);

#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Persist `data` under `path` and return the reference players fetch
    async fn put(&self, path: &str, data: Bytes) -> Result<String, StorageError>;
}

/// Process-local store, used when no object storage is wired in
#[derive(Debug, Default)]
pub struct InMemorySegmentStore {
    objects: DashMap<String, Bytes>,
}

impl InMemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.objects.get(path).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl SegmentStore for InMemorySegmentStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<String, StorageError> {
        self.objects.insert(path.to_string(), data);
        Ok(format!("memory://{}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let store = InMemorySegmentStore::new();
        let reference = store
            .put("s/720p/00000001.ts", Bytes::from_static(b"abc"))
            .await
            .unwrap();

        assert_eq!(reference, "memory://s/720p/00000001.ts");
        assert_eq!(store.get("s/720p/00000001.ts"), Some(Bytes::from_static(b"abc")));
        assert_eq!(store.len(), 1);
    }
}
