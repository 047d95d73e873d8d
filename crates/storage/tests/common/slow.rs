use async_trait::async_trait;
use bytes::Bytes;
use quire_storage::error::{StorageError, StorageResult};
use quire_storage::traits::{ByteStream, ObjectMeta, ObjectStore, StreamingUpload};
use quire_storage::MemoryBackend;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Duration;

/// Backend wrapper that delays chunk writes and can fail the next N puts.
#[allow(dead_code)]
pub struct SlowBackend {
    pub inner: MemoryBackend,
    pub put_delay: Duration,
    pub failing_puts: AtomicUsize,
    pub puts: AtomicUsize,
}

#[allow(dead_code)]
impl SlowBackend {
    pub fn new(put_delay: Duration) -> Self {
        Self {
            inner: MemoryBackend::new(),
            put_delay,
            failing_puts: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for SlowBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.put_delay).await;
        let failing = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StorageError::Io(std::io::Error::other("injected failure")));
        }
        self.inner.put(key, data).await
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.inner.put_stream(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn backend_name(&self) -> &'static str {
        "slow"
    }
}
