// Chunk staging against real backends: ordering, durability, timeouts and
// failure release.

mod common;

use bytes::Bytes;
use common::{SlowBackend, seeded_bytes, sha256_hex, split_chunks};
use quire_core::UploadId;
use quire_core::mime::ContentValidator;
use quire_storage::chunk_store::{artifact_key, chunk_key, staging_prefix};
use quire_storage::{
    AcceptAll, ChunkStore, ChunkStoreError, FilesystemBackend, ObjectStore, StagedChunkStore,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::Duration;

async fn filesystem_store() -> (TempDir, Arc<FilesystemBackend>, StagedChunkStore) {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FilesystemBackend::new(temp_dir.path()).await.unwrap());
    let store = StagedChunkStore::new(backend.clone(), Duration::from_secs(5));
    (temp_dir, backend, store)
}

#[tokio::test]
async fn test_filesystem_assembly_reverse_order() {
    let (_dir, backend, store) = filesystem_store().await;
    let data = seeded_bytes(7, 256 * 1024 + 13);
    let chunks = split_chunks(&data, 5);
    let id = UploadId::new();
    store.allocate(id, 5, data.len() as u64).await.unwrap();

    for (index, chunk) in chunks.iter().enumerate().rev() {
        store
            .write_chunk(id, index as u32, chunk.clone())
            .await
            .unwrap();
        // Durable before success returns
        assert!(backend.exists(&chunk_key(id, index as u32)).await.unwrap());
    }

    let artifact = store.assemble(id, &mut AcceptAll).await.unwrap();
    assert_eq!(artifact.key, artifact_key(id));
    assert_eq!(artifact.size, data.len() as u64);
    assert_eq!(artifact.sha256.to_hex(), sha256_hex(&data));
    assert_eq!(backend.get(&artifact.key).await.unwrap(), data);
    assert!(backend.list(&staging_prefix(id)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_filesystem_text_validation_across_chunk_boundary() {
    let (_dir, _backend, store) = filesystem_store().await;
    let text = "résumé café naïve".as_bytes();
    // Split inside the two-byte "é" of "résumé"
    let (first, second) = text.split_at(2);
    let id = UploadId::new();
    store.allocate(id, 2, text.len() as u64).await.unwrap();
    store
        .write_chunk(id, 0, Bytes::copy_from_slice(first))
        .await
        .unwrap();
    store
        .write_chunk(id, 1, Bytes::copy_from_slice(second))
        .await
        .unwrap();

    let mut check = ContentValidator::new("cv.txt", "text/plain").unwrap();
    let artifact = store.assemble(id, &mut check).await.unwrap();
    assert_eq!(artifact.size, text.len() as u64);
}

#[tokio::test]
async fn test_write_timeout_releases_index() {
    let backend = Arc::new(SlowBackend::new(Duration::from_millis(300)));
    let store = StagedChunkStore::new(backend.clone(), Duration::from_millis(20));
    let id = UploadId::new();
    store.allocate(id, 1, 4).await.unwrap();

    let err = store
        .write_chunk(id, 0, Bytes::from_static(b"data"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChunkStoreError::Timeout(_)));

    // The index and its bytes were released, so a retry is not a duplicate.
    let records = store.records(id).await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_storage_failure_allows_retry() {
    let backend = Arc::new(SlowBackend::new(Duration::ZERO));
    backend.fail_next_puts(1);
    let store = StagedChunkStore::new(backend.clone(), Duration::from_secs(5));
    let id = UploadId::new();
    store.allocate(id, 1, 4).await.unwrap();

    let err = store
        .write_chunk(id, 0, Bytes::from_static(b"data"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChunkStoreError::Storage(_)));

    store
        .write_chunk(id, 0, Bytes::from_static(b"data"))
        .await
        .unwrap();
    let artifact = store.assemble(id, &mut AcceptAll).await.unwrap();
    assert_eq!(artifact.size, 4);
}

#[tokio::test]
async fn test_discard_while_write_in_flight() {
    let backend = Arc::new(SlowBackend::new(Duration::from_millis(100)));
    let store = Arc::new(StagedChunkStore::new(
        backend.clone(),
        Duration::from_secs(5),
    ));
    let id = UploadId::new();
    store.allocate(id, 1, 4).await.unwrap();

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .write_chunk(id, 0, Bytes::from_static(b"data"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.discard(id).await.unwrap();

    let result = writer.await.unwrap();
    assert!(matches!(result, Err(ChunkStoreError::NotAllocated(_))));
    assert!(backend.inner.is_empty());
}
