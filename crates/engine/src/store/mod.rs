//! Cache store module for modplay
//!
//! `CacheStore` layers cache entries over any `ObjectStore`. An entry becomes
//! visible when its manifest is written, which always happens after the audio
//! objects are in place, and stops being visible when the manifest is deleted,
//! which always happens before the audio objects go. The same rule gives atomic
//! publication on backends without rename.
//!
//! Reader reference counts live in this process only. Mutations of one entry are
//! serialized by a per-fingerprint lock; unrelated fingerprints never contend.

pub mod backends;
pub mod entry;
pub mod error;
pub mod traits;

pub use entry::{now_unix_ms, unix_ms, AudioFormat, CacheEntry, EntryMetadata, FormatInfo};
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectMeta, ObjectStore};

use crate::fingerprint::Fingerprint;
use bytes::Bytes;
use dashmap::DashMap;
use entry::{audio_key, entry_prefix, manifest_key};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of an eviction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// Manifest and all objects removed
    Evicted,
    /// Entry has active readers
    InUse,
    /// Entry was accessed after the cutoff
    Fresh,
    /// No manifest present
    Missing,
}

/// Content-addressed cache of converted audio
pub struct CacheStore {
    backend: Arc<dyn ObjectStore>,
    readers: DashMap<Fingerprint, usize>,
    locks: DashMap<Fingerprint, Arc<Mutex<()>>>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn ObjectStore>) -> Self {
        Self {
            backend,
            readers: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub async fn health_check(&self) -> StorageResult<()> {
        self.backend.health_check().await
    }

    fn lock_for(&self, fingerprint: &Fingerprint) -> Arc<Mutex<()>> {
        self.locks
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Whether a complete entry exists
    pub async fn exists(&self, fingerprint: &Fingerprint) -> StorageResult<bool> {
        self.backend.exists(&manifest_key(fingerprint)).await
    }

    /// Read an entry, failing with `NotFound` when absent
    pub async fn get(&self, fingerprint: &Fingerprint) -> StorageResult<CacheEntry> {
        self.read_manifest(fingerprint)
            .await?
            .ok_or_else(|| StorageError::NotFound(manifest_key(fingerprint)))
    }

    async fn read_manifest(&self, fingerprint: &Fingerprint) -> StorageResult<Option<CacheEntry>> {
        let key = manifest_key(fingerprint);
        let raw = match self.backend.get(&key).await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut entry: CacheEntry =
            serde_json::from_slice(&raw).map_err(|e| StorageError::CorruptManifest {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        if &entry.fingerprint != fingerprint {
            return Err(StorageError::CorruptManifest {
                key,
                reason: format!("manifest names {}", entry.fingerprint),
            });
        }
        entry.ref_count = self.ref_count(fingerprint);
        Ok(Some(entry))
    }

    async fn write_manifest(&self, entry: &CacheEntry) -> StorageResult<()> {
        let data = serde_json::to_vec_pretty(entry).map_err(|e| StorageError::CorruptManifest {
            key: manifest_key(&entry.fingerprint),
            reason: e.to_string(),
        })?;
        self.backend
            .put(&manifest_key(&entry.fingerprint), Bytes::from(data))
            .await
    }

    /// Publish a new entry holding the primary format
    ///
    /// The audio object is written before the manifest, so concurrent `exists`
    /// and `get` calls never observe a partial entry.
    pub async fn put(
        &self,
        fingerprint: &Fingerprint,
        data: Bytes,
        format: AudioFormat,
        metadata: EntryMetadata,
    ) -> StorageResult<CacheEntry> {
        let lock = self.lock_for(fingerprint);
        let _guard = lock.lock().await;

        let size_bytes = data.len() as u64;
        self.backend.put(&audio_key(fingerprint, format), data).await?;

        let mut entry = CacheEntry::new(
            fingerprint.clone(),
            FormatInfo { format, size_bytes },
            metadata,
            now_unix_ms(),
        );
        self.write_manifest(&entry).await?;
        entry.ref_count = self.ref_count(fingerprint);

        info!(
            fingerprint = %fingerprint,
            format = %format,
            size_bytes,
            backend = self.backend_name(),
            "Published cache entry"
        );
        Ok(entry)
    }

    /// Attach an alternate encoding to an existing entry
    pub async fn add_alternate_format(
        &self,
        fingerprint: &Fingerprint,
        data: Bytes,
        format: AudioFormat,
    ) -> StorageResult<CacheEntry> {
        let lock = self.lock_for(fingerprint);
        let _guard = lock.lock().await;

        let mut entry = self
            .read_manifest(fingerprint)
            .await?
            .ok_or_else(|| StorageError::NotFound(manifest_key(fingerprint)))?;
        if entry.has_format(format) {
            return Ok(entry);
        }

        let size_bytes = data.len() as u64;
        self.backend.put(&audio_key(fingerprint, format), data).await?;
        entry.alternate = Some(FormatInfo { format, size_bytes });
        self.write_manifest(&entry).await?;

        debug!(fingerprint = %fingerprint, format = %format, size_bytes, "Added alternate format");
        Ok(entry)
    }

    /// Update the last-access time of an entry
    pub async fn touch(&self, fingerprint: &Fingerprint) -> StorageResult<()> {
        let lock = self.lock_for(fingerprint);
        let _guard = lock.lock().await;
        self.touch_locked(fingerprint).await.map(|_| ())
    }

    async fn touch_locked(&self, fingerprint: &Fingerprint) -> StorageResult<Option<CacheEntry>> {
        let Some(mut entry) = self.read_manifest(fingerprint).await? else {
            return Ok(None);
        };
        entry.last_accessed_at_ms = now_unix_ms().max(entry.last_accessed_at_ms);
        self.write_manifest(&entry).await?;
        Ok(Some(entry))
    }

    /// Open an entry for reading
    ///
    /// Looks the entry up, registers one reader and refreshes its access time in a
    /// single step with respect to eviction. Returns `None` on a miss. Every
    /// `Some` must be paired with a `release`.
    pub async fn open(&self, fingerprint: &Fingerprint) -> StorageResult<Option<CacheEntry>> {
        let lock = self.lock_for(fingerprint);
        let _guard = lock.lock().await;

        let Some(mut entry) = self.touch_locked(fingerprint).await? else {
            return Ok(None);
        };
        entry.ref_count = self.increment(fingerprint);
        Ok(Some(entry))
    }

    /// Register one more reader of an entry known to exist
    pub async fn retain(&self, fingerprint: &Fingerprint) -> usize {
        let lock = self.lock_for(fingerprint);
        let _guard = lock.lock().await;
        self.increment(fingerprint)
    }

    fn increment(&self, fingerprint: &Fingerprint) -> usize {
        let mut count = self.readers.entry(fingerprint.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop one reader of an entry
    pub fn release(&self, fingerprint: &Fingerprint) {
        let remaining = match self.readers.get_mut(fingerprint) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => {
                warn!(fingerprint = %fingerprint, "Release without matching reader");
                return;
            }
        };
        if remaining == 0 {
            self.readers.remove_if(fingerprint, |_, count| *count == 0);
        }
    }

    /// Guard that drops one reader of `fingerprint` unless kept
    ///
    /// Take it right after a reader is registered so a caller cancelled before
    /// handing the reader on does not leak it.
    pub fn reader_guard(&self, fingerprint: &Fingerprint) -> ReaderGuard<'_> {
        ReaderGuard {
            store: self,
            fingerprint: Some(fingerprint.clone()),
        }
    }

    /// Active readers of one entry
    pub fn ref_count(&self, fingerprint: &Fingerprint) -> usize {
        self.readers.get(fingerprint).map(|c| *c).unwrap_or(0)
    }

    /// Active readers across all entries
    pub fn active_readers(&self) -> usize {
        self.readers.iter().map(|c| *c.value()).sum()
    }

    /// Delete an entry unless it has active readers
    ///
    /// Returns `Ok(false)` without touching storage when the entry is in use.
    pub async fn delete(&self, fingerprint: &Fingerprint) -> StorageResult<bool> {
        let lock = self.lock_for(fingerprint);
        let _guard = lock.lock().await;

        if self.ref_count(fingerprint) > 0 {
            debug!(fingerprint = %fingerprint, "Skipping delete of entry in use");
            return Ok(false);
        }
        self.delete_locked(fingerprint).await?;
        Ok(true)
    }

    /// Evict an entry if it is idle and was last accessed before `cutoff_ms`
    pub async fn evict_if_stale(
        &self,
        fingerprint: &Fingerprint,
        cutoff_ms: u64,
    ) -> StorageResult<EvictOutcome> {
        let lock = self.lock_for(fingerprint);
        let _guard = lock.lock().await;

        let Some(entry) = self.read_manifest(fingerprint).await? else {
            return Ok(EvictOutcome::Missing);
        };
        if entry.ref_count > 0 {
            return Ok(EvictOutcome::InUse);
        }
        if entry.last_accessed_at_ms >= cutoff_ms {
            return Ok(EvictOutcome::Fresh);
        }

        self.delete_locked(fingerprint).await?;
        Ok(EvictOutcome::Evicted)
    }

    /// Remove every object under a fingerprint, manifest first
    async fn delete_locked(&self, fingerprint: &Fingerprint) -> StorageResult<()> {
        ignore_missing(self.backend.delete(&manifest_key(fingerprint)).await)?;
        for key in self.backend.list(&entry_prefix(fingerprint)).await? {
            ignore_missing(self.backend.delete(&key).await)?;
        }
        debug!(fingerprint = %fingerprint, "Deleted cache entry");
        Ok(())
    }

    /// Remove objects under a fingerprint that has no manifest
    ///
    /// Returns the number of objects removed. Does nothing if a manifest appeared
    /// in the meantime.
    pub async fn remove_orphan(&self, fingerprint: &Fingerprint) -> StorageResult<usize> {
        let lock = self.lock_for(fingerprint);
        let _guard = lock.lock().await;

        if self.exists(fingerprint).await? {
            return Ok(0);
        }
        let keys = self.backend.list(&entry_prefix(fingerprint)).await?;
        for key in &keys {
            ignore_missing(self.backend.delete(key).await)?;
        }
        Ok(keys.len())
    }

    /// All fingerprints with at least one stored object
    pub async fn list_fingerprints(&self) -> StorageResult<Vec<Fingerprint>> {
        let keys = self.backend.list("").await?;
        let fingerprints: BTreeSet<Fingerprint> = keys
            .iter()
            .filter_map(|key| key.split('/').next())
            .filter_map(|first| Fingerprint::parse(first).ok())
            .collect();
        Ok(fingerprints.into_iter().collect())
    }

    /// Metadata of every object stored under a fingerprint
    pub async fn list_objects(
        &self,
        fingerprint: &Fingerprint,
    ) -> StorageResult<Vec<(String, ObjectMeta)>> {
        let mut objects = Vec::new();
        for key in self.backend.list(&entry_prefix(fingerprint)).await? {
            match self.backend.head(&key).await {
                Ok(meta) => objects.push((key, meta)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(objects)
    }

    /// Stream one encoding of an entry
    pub async fn stream(
        &self,
        fingerprint: &Fingerprint,
        format: AudioFormat,
    ) -> StorageResult<ByteStream> {
        self.backend.get_stream(&audio_key(fingerprint, format)).await
    }

    /// Read one encoding of an entry into memory
    pub async fn read(&self, fingerprint: &Fingerprint, format: AudioFormat) -> StorageResult<Bytes> {
        self.backend.get(&audio_key(fingerprint, format)).await
    }

    /// Forget per-key locks nobody is holding
    pub fn prune_locks(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub(crate) fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

fn ignore_missing(result: StorageResult<()>) -> StorageResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// One registered reader, released when dropped
pub struct ReaderGuard<'a> {
    store: &'a CacheStore,
    fingerprint: Option<Fingerprint>,
}

impl ReaderGuard<'_> {
    /// Hand the reader on; the new owner must `release` it
    pub fn keep(mut self) {
        self.fingerprint = None;
    }
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        if let Some(fingerprint) = self.fingerprint.take() {
            self.store.release(&fingerprint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{derive, ConversionRequest};
    use backends::{FilesystemBackend, MemoryBackend};
    use tempfile::TempDir;

    fn fp(name: &str) -> Fingerprint {
        derive(&ConversionRequest::url(format!("https://example.com/{}", name)))
    }

    fn memory_store() -> (Arc<MemoryBackend>, CacheStore) {
        let backend = Arc::new(MemoryBackend::new());
        (backend.clone(), CacheStore::new(backend))
    }

    fn meta() -> EntryMetadata {
        EntryMetadata {
            source_name: "song.mod".to_string(),
            player_format: "Protracker".to_string(),
            sample_rate: 44100,
            channels: 2,
            duration_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_, store) = memory_store();
        let key = fp("a.mod");

        assert!(!store.exists(&key).await.unwrap());
        assert!(store.get(&key).await.unwrap_err().is_not_found());

        let entry = store
            .put(&key, Bytes::from_static(b"RIFFdata"), AudioFormat::Wav, meta())
            .await
            .unwrap();
        assert_eq!(entry.primary.size_bytes, 8);
        assert!(store.exists(&key).await.unwrap());

        let loaded = store.get(&key).await.unwrap();
        assert_eq!(loaded.metadata.player_format, "Protracker");
        assert_eq!(loaded.alternate, None);
        assert_eq!(
            store.read(&key, AudioFormat::Wav).await.unwrap(),
            Bytes::from_static(b"RIFFdata")
        );
    }

    #[tokio::test]
    async fn test_audio_without_manifest_is_not_visible() {
        let (backend, store) = memory_store();
        let key = fp("partial.mod");
        backend
            .put(&audio_key(&key, AudioFormat::Wav), Bytes::from_static(b"half"))
            .await
            .unwrap();

        assert!(!store.exists(&key).await.unwrap());
        assert_eq!(store.open(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_alternate_format() {
        let (_, store) = memory_store();
        let key = fp("b.mod");
        store
            .put(&key, Bytes::from_static(b"wav"), AudioFormat::Wav, meta())
            .await
            .unwrap();

        let entry = store
            .add_alternate_format(&key, Bytes::from_static(b"fl"), AudioFormat::Flac)
            .await
            .unwrap();
        assert_eq!(entry.size_of(AudioFormat::Flac), Some(2));
        assert!(store.get(&key).await.unwrap().has_format(AudioFormat::Flac));

        let missing = store
            .add_alternate_format(&fp("nope"), Bytes::from_static(b"x"), AudioFormat::Flac)
            .await;
        assert!(missing.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_open_counts_readers_and_release() {
        let (_, store) = memory_store();
        let key = fp("c.mod");
        store
            .put(&key, Bytes::from_static(b"wav"), AudioFormat::Wav, meta())
            .await
            .unwrap();

        let first = store.open(&key).await.unwrap().unwrap();
        assert_eq!(first.ref_count, 1);
        let second = store.open(&key).await.unwrap().unwrap();
        assert_eq!(second.ref_count, 2);
        assert_eq!(store.active_readers(), 2);

        store.release(&key);
        store.release(&key);
        assert_eq!(store.ref_count(&key), 0);
        assert_eq!(store.active_readers(), 0);

        // Unmatched release is ignored
        store.release(&key);
        assert_eq!(store.ref_count(&key), 0);
    }

    #[tokio::test]
    async fn test_reader_guard_releases_unless_kept() {
        let (_, store) = memory_store();
        let key = fp("d.mod");
        store
            .put(&key, Bytes::from_static(b"wav"), AudioFormat::Wav, meta())
            .await
            .unwrap();

        store.open(&key).await.unwrap().unwrap();
        drop(store.reader_guard(&key));
        assert_eq!(store.ref_count(&key), 0);

        store.open(&key).await.unwrap().unwrap();
        store.reader_guard(&key).keep();
        assert_eq!(store.ref_count(&key), 1);
        store.release(&key);
    }

    #[tokio::test]
    async fn test_delete_refuses_entry_in_use() {
        let (backend, store) = memory_store();
        let key = fp("d.mod");
        store
            .put(&key, Bytes::from_static(b"wav"), AudioFormat::Wav, meta())
            .await
            .unwrap();

        store.open(&key).await.unwrap().unwrap();
        assert!(!store.delete(&key).await.unwrap());
        assert!(store.exists(&key).await.unwrap());

        store.release(&key);
        assert!(store.delete(&key).await.unwrap());
        assert!(!store.exists(&key).await.unwrap());
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_evict_if_stale_outcomes() {
        let (_, store) = memory_store();
        let key = fp("e.mod");
        assert_eq!(store.evict_if_stale(&key, u64::MAX).await.unwrap(), EvictOutcome::Missing);

        let entry = store
            .put(&key, Bytes::from_static(b"wav"), AudioFormat::Wav, meta())
            .await
            .unwrap();
        assert_eq!(
            store.evict_if_stale(&key, entry.last_accessed_at_ms).await.unwrap(),
            EvictOutcome::Fresh
        );

        store.retain(&key).await;
        assert_eq!(store.evict_if_stale(&key, u64::MAX).await.unwrap(), EvictOutcome::InUse);
        store.release(&key);

        assert_eq!(store.evict_if_stale(&key, u64::MAX).await.unwrap(), EvictOutcome::Evicted);
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_touch_advances_access_time() {
        let (_, store) = memory_store();
        let key = fp("f.mod");
        let created = store
            .put(&key, Bytes::from_static(b"wav"), AudioFormat::Wav, meta())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.touch(&key).await.unwrap();
        let touched = store.get(&key).await.unwrap();
        assert!(touched.last_accessed_at_ms > created.last_accessed_at_ms);
        assert_eq!(touched.created_at_ms, created.created_at_ms);
    }

    #[tokio::test]
    async fn test_list_fingerprints_ignores_foreign_keys() {
        let (backend, store) = memory_store();
        let a = fp("g.mod");
        let b = fp("h.mod");
        store.put(&a, Bytes::from_static(b"1"), AudioFormat::Wav, meta()).await.unwrap();
        store.put(&b, Bytes::from_static(b"2"), AudioFormat::Wav, meta()).await.unwrap();
        backend.put("not-a-fingerprint/x", Bytes::from_static(b"3")).await.unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(store.list_fingerprints().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_remove_orphan_only_without_manifest() {
        let (backend, store) = memory_store();
        let orphan = fp("orphan.mod");
        backend
            .put(&audio_key(&orphan, AudioFormat::Wav), Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(store.remove_orphan(&orphan).await.unwrap(), 1);
        assert!(backend.is_empty().await);

        let complete = fp("complete.mod");
        store
            .put(&complete, Bytes::from_static(b"wav"), AudioFormat::Wav, meta())
            .await
            .unwrap();
        assert_eq!(store.remove_orphan(&complete).await.unwrap(), 0);
        assert!(store.exists(&complete).await.unwrap());
    }

    #[tokio::test]
    async fn test_filesystem_layout() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FilesystemBackend::new(dir.path()).await.unwrap());
        let store = CacheStore::new(backend);
        let key = fp("i.mod");

        store
            .put(&key, Bytes::from_static(b"wav"), AudioFormat::Wav, meta())
            .await
            .unwrap();

        let entry_dir = dir.path().join(key.as_str());
        assert!(entry_dir.join("audio.wav").is_file());
        assert!(entry_dir.join("manifest.json").is_file());

        assert!(store.delete(&key).await.unwrap());
        assert!(!entry_dir.exists());
    }

    #[tokio::test]
    async fn test_prune_locks_keeps_held_locks() {
        let (_, store) = memory_store();
        let a = fp("j.mod");
        let b = fp("k.mod");
        store.touch(&a).await.unwrap();

        let held = store.lock_for(&b);
        store.prune_locks();
        assert_eq!(store.lock_count(), 1);
        drop(held);
        store.prune_locks();
        assert_eq!(store.lock_count(), 0);
    }
}
