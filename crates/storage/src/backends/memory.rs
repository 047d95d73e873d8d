//! In-process storage backend.
//!
//! Used for tests and single-process development deployments. Contents do not
//! survive a restart.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectMeta, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    modified: OffsetDateTime,
}

/// Object store backed by a concurrent map.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    objects: Arc<DashMap<String, StoredObject>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn check_key(key: &str) -> StorageResult<()> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StorageError::InvalidKey(format!("invalid key: {key:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Self::check_key(key)?;
        Ok(self.objects.contains_key(key))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        Self::check_key(key)?;
        let object = self
            .objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            size: object.data.len() as u64,
            last_modified: Some(object.modified),
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        Self::check_key(key)?;
        self.objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let data = self.get(key).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        Self::check_key(key)?;
        self.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                modified: OffsetDateTime::now_utc(),
            },
        );
        Ok(())
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        Self::check_key(key)?;
        Ok(Box::new(MemoryUpload {
            objects: self.objects.clone(),
            key: key.to_string(),
            buffer: BytesMut::new(),
        }))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        Self::check_key(key)?;
        self.objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        if prefix.is_empty() {
            return Err(StorageError::InvalidKey(
                "refusing to delete the storage root".to_string(),
            ));
        }
        let before = self.objects.len();
        self.objects.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.objects.len()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryUpload {
    objects: Arc<DashMap<String, StoredObject>>,
    key: String,
    buffer: BytesMut,
}

#[async_trait]
impl StreamingUpload for MemoryUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.buffer.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        let Self {
            objects,
            key,
            buffer,
        } = *self;
        let size = buffer.len() as u64;
        objects.insert(
            key,
            StoredObject {
                data: buffer.freeze(),
                modified: OffsetDateTime::now_utc(),
            },
        );
        Ok(size)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_listing_is_sorted() {
        let backend = MemoryBackend::new();
        backend.put("b/2", Bytes::from_static(b"2")).await.unwrap();
        backend.put("a/1", Bytes::from_static(b"1")).await.unwrap();
        backend.put("b/1", Bytes::from_static(b"1")).await.unwrap();

        assert_eq!(backend.list("b/").await.unwrap(), vec!["b/1", "b/2"]);
        assert_eq!(backend.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let backend = MemoryBackend::new();
        backend.put("x/1", Bytes::from_static(b"1")).await.unwrap();
        backend.put("x/2", Bytes::from_static(b"2")).await.unwrap();
        backend.put("y/1", Bytes::from_static(b"1")).await.unwrap();

        assert_eq!(backend.delete_prefix("x/").await.unwrap(), 2);
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.delete_prefix("x/").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_streaming_upload() {
        let backend = MemoryBackend::new();
        let mut upload = backend.put_stream("artifact").await.unwrap();
        upload.write(Bytes::from_static(b"ab")).await.unwrap();
        upload.write(Bytes::from_static(b"cd")).await.unwrap();
        assert!(!backend.exists("artifact").await.unwrap());
        assert_eq!(upload.finish().await.unwrap(), 4);
        assert_eq!(
            backend.get("artifact").await.unwrap(),
            Bytes::from_static(b"abcd")
        );
    }
}
