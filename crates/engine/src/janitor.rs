//! Janitor module for modplay
//!
//! Periodic cache sweep. Evicts entries that have been idle longer than the TTL
//! and have no active readers, removes orphaned objects left by interrupted
//! writers, and deletes stale job workspaces that no running job owns.

use crate::fingerprint::Fingerprint;
use crate::metrics::{record, SharedMetrics};
use crate::store::{now_unix_ms, unix_ms, CacheStore, EvictOutcome, StorageResult};
use crate::workspace::{Workspaces, WORKSPACE_PREFIX};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Fingerprints examined
    pub scanned: usize,
    pub evicted: usize,
    /// Expired entries skipped because readers hold them
    pub in_use: usize,
    /// Objects removed from fingerprints without a manifest
    pub orphans_removed: usize,
    pub workspaces_removed: usize,
    /// Fingerprints or workspaces that could not be processed
    pub failed: usize,
}

/// Evicts idle cache entries on a fixed interval
pub struct Janitor {
    store: Arc<CacheStore>,
    ttl: Duration,
    workspaces: Workspaces,
    metrics: SharedMetrics,
}

impl Janitor {
    pub fn new(
        store: Arc<CacheStore>,
        ttl: Duration,
        workspaces: Workspaces,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            ttl,
            workspaces,
            metrics,
        }
    }

    /// Run one sweep against the current time
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(now_unix_ms()).await
    }

    /// Run one sweep as if the current time were `now_ms`
    ///
    /// Anything last touched before `now_ms - ttl` is stale. Entries with
    /// readers are skipped and counted in `in_use`; they are looked at again on
    /// the next sweep.
    pub async fn sweep_at(&self, now_ms: u64) -> SweepReport {
        let cutoff_ms = now_ms.saturating_sub(self.ttl.as_millis() as u64);
        let mut report = SweepReport::default();

        match self.store.list_fingerprints().await {
            Ok(fingerprints) => {
                for fingerprint in fingerprints {
                    report.scanned += 1;
                    if let Err(e) = self.sweep_entry(&fingerprint, cutoff_ms, &mut report).await {
                        report.failed += 1;
                        warn!(fingerprint = %fingerprint, error = %e, "Failed to sweep cache entry");
                    }
                }
            }
            Err(e) => {
                report.failed += 1;
                warn!(error = %e, "Failed to list cache entries");
            }
        }

        self.sweep_workspaces(cutoff_ms, &mut report).await;
        self.store.prune_locks();

        record(&self.metrics, |c| {
            c.sweeps += 1;
            c.evictions += report.evicted as u64;
            c.orphans_removed += report.orphans_removed as u64;
        })
        .await;

        info!(
            scanned = report.scanned,
            evicted = report.evicted,
            in_use = report.in_use,
            orphans_removed = report.orphans_removed,
            workspaces_removed = report.workspaces_removed,
            failed = report.failed,
            "Cache sweep complete"
        );
        report
    }

    async fn sweep_entry(
        &self,
        fingerprint: &Fingerprint,
        cutoff_ms: u64,
        report: &mut SweepReport,
    ) -> StorageResult<()> {
        match self.store.evict_if_stale(fingerprint, cutoff_ms).await? {
            EvictOutcome::Evicted => {
                report.evicted += 1;
                debug!(fingerprint = %fingerprint, "Evicted idle entry");
            }
            EvictOutcome::InUse => {
                report.in_use += 1;
                debug!(
                    fingerprint = %fingerprint,
                    readers = self.store.ref_count(fingerprint),
                    "Deferred eviction of entry in use"
                );
            }
            EvictOutcome::Fresh => {}
            EvictOutcome::Missing => {
                // Objects without a manifest: either a writer is still publishing
                // or one crashed. Only the latter is old.
                let objects = self.store.list_objects(fingerprint).await?;
                let newest_ms = objects
                    .iter()
                    .map(|(_, meta)| meta.last_modified.map(unix_ms).unwrap_or(0))
                    .max();
                if matches!(newest_ms, Some(ms) if ms < cutoff_ms) {
                    let removed = self.store.remove_orphan(fingerprint).await?;
                    report.orphans_removed += removed;
                    debug!(fingerprint = %fingerprint, removed, "Removed orphaned objects");
                }
            }
        }
        Ok(())
    }

    async fn sweep_workspaces(&self, cutoff_ms: u64, report: &mut SweepReport) {
        let workspaces = self.workspaces.clone();
        match tokio::task::spawn_blocking(move || remove_stale_workspaces(&workspaces, cutoff_ms))
            .await
        {
            Ok((removed, failed)) => {
                report.workspaces_removed += removed;
                report.failed += failed;
            }
            Err(e) => {
                report.failed += 1;
                warn!(error = %e, "Workspace sweep task failed");
            }
        }
    }

    /// Spawn the periodic sweep task
    ///
    /// The first sweep runs one full interval after start. Ticks missed while a
    /// sweep is running are skipped.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

/// Delete stale workspaces that no job holds, as `(removed, failed)`
fn remove_stale_workspaces(workspaces: &Workspaces, cutoff_ms: u64) -> (usize, usize) {
    let (mut removed, mut failed) = (0, 0);
    for dir in stale_workspaces(workspaces.work_dir(), cutoff_ms) {
        if workspaces.is_live(&dir) {
            debug!(path = %dir.display(), "Skipped workspace of running job");
            continue;
        }
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                removed += 1;
                debug!(path = %dir.display(), "Removed stale workspace");
            }
            // Its job finished and cleaned up meanwhile
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                failed += 1;
                warn!(path = %dir.display(), error = %e, "Failed to remove stale workspace");
            }
        }
    }
    (removed, failed)
}

/// Job workspaces directly under `work_dir` last modified before `cutoff_ms`
fn stale_workspaces(work_dir: &Path, cutoff_ms: u64) -> Vec<PathBuf> {
    use walkdir::WalkDir;

    if !work_dir.exists() {
        return Vec::new();
    }

    WalkDir::new(work_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(WORKSPACE_PREFIX))
                .unwrap_or(false)
        })
        .filter(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            unix_ms(modified) < cutoff_ms
        })
        .map(|entry| entry.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{derive, ConversionRequest};
    use crate::metrics::new_shared_metrics;
    use crate::store::backends::MemoryBackend;
    use crate::store::{AudioFormat, EntryMetadata};
    use bytes::Bytes;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(3600);
    const TTL_MS: u64 = 3_600_000;

    struct Harness {
        janitor: Janitor,
        store: Arc<CacheStore>,
        backend: Arc<MemoryBackend>,
        workspaces: Workspaces,
        work_dir: TempDir,
    }

    fn harness() -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(CacheStore::new(backend.clone()));
        let work_dir = TempDir::new().unwrap();
        let workspaces = Workspaces::new(work_dir.path().to_path_buf());
        let janitor = Janitor::new(store.clone(), TTL, workspaces.clone(), new_shared_metrics());
        Harness {
            janitor,
            store,
            backend,
            workspaces,
            work_dir,
        }
    }

    async fn publish(store: &CacheStore, url: &str) -> Fingerprint {
        let fingerprint = derive(&ConversionRequest::url(url));
        store
            .put(
                &fingerprint,
                Bytes::from_static(b"RIFF"),
                AudioFormat::Wav,
                EntryMetadata::default(),
            )
            .await
            .unwrap();
        fingerprint
    }

    #[tokio::test]
    async fn test_fresh_entry_survives() {
        let h = harness();
        let fingerprint = publish(&h.store, "https://example.com/a.mod").await;

        let report = h.janitor.sweep_at(now_unix_ms()).await;
        assert_eq!(report.scanned, 1);
        assert_eq!(report.evicted, 0);
        assert!(h.store.exists(&fingerprint).await.unwrap());
    }

    #[tokio::test]
    async fn test_reader_defers_eviction() {
        let h = harness();
        let fingerprint = publish(&h.store, "https://example.com/a.mod").await;
        let later = now_unix_ms() + 2 * TTL_MS;

        assert!(h.store.open(&fingerprint).await.unwrap().is_some());
        let report = h.janitor.sweep_at(later).await;
        assert_eq!(report.in_use, 1);
        assert_eq!(report.evicted, 0);
        assert!(h.store.exists(&fingerprint).await.unwrap());

        h.store.release(&fingerprint);
        let report = h.janitor.sweep_at(later).await;
        assert_eq!(report.evicted, 1);
        assert!(!h.store.exists(&fingerprint).await.unwrap());
        assert!(h.backend.is_empty().await);
        assert_eq!(h.janitor.metrics.read().await.counters.evictions, 1);
        assert_eq!(h.janitor.metrics.read().await.counters.sweeps, 2);
    }

    #[tokio::test]
    async fn test_only_expired_entries_are_evicted() {
        let h = harness();
        let old = publish(&h.store, "https://example.com/old.mod").await;
        let later = now_unix_ms() + 2 * TTL_MS;

        let report = h.janitor.sweep_at(later).await;
        assert_eq!(report.evicted, 1);
        assert!(!h.store.exists(&old).await.unwrap());

        let fresh = publish(&h.store, "https://example.com/new.mod").await;
        let report = h.janitor.sweep_at(now_unix_ms()).await;
        assert_eq!(report.evicted, 0);
        assert!(h.store.exists(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_orphans_removed_only_when_old() {
        let h = harness();
        let fingerprint = derive(&ConversionRequest::url("https://example.com/crashed.mod"));
        let key = format!("{}/audio.wav", fingerprint);
        crate::store::ObjectStore::put(h.backend.as_ref(), &key, Bytes::from_static(b"partial"))
            .await
            .unwrap();

        let report = h.janitor.sweep_at(now_unix_ms()).await;
        assert_eq!(report.orphans_removed, 0);
        assert_eq!(h.backend.len().await, 1);

        h.backend
            .set_modified(&key, SystemTime::now() - 2 * TTL)
            .await
            .unwrap();
        let report = h.janitor.sweep_at(now_unix_ms()).await;
        assert_eq!(report.orphans_removed, 1);
        assert!(h.backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_stale_workspaces_removed() {
        let h = harness();
        let workspace = h.work_dir.path().join("job-abc123");
        let unrelated = h.work_dir.path().join("keep-me");
        std::fs::create_dir_all(workspace.join("nested")).unwrap();
        std::fs::create_dir_all(&unrelated).unwrap();

        let report = h.janitor.sweep_at(now_unix_ms()).await;
        assert_eq!(report.workspaces_removed, 0);
        assert!(workspace.exists());

        let report = h.janitor.sweep_at(now_unix_ms() + 2 * TTL_MS).await;
        assert_eq!(report.workspaces_removed, 1);
        assert!(!workspace.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_live_workspace_survives_sweep() {
        let h = harness();
        let workspace = h.workspaces.create().await.unwrap();
        let path = workspace.path().to_path_buf();
        std::fs::write(path.join("input.wav"), b"RIFF").unwrap();

        let report = h.janitor.sweep_at(now_unix_ms() + 2 * TTL_MS).await;
        assert_eq!(report.workspaces_removed, 0);
        assert_eq!(report.failed, 0);
        assert!(path.join("input.wav").exists());

        drop(workspace);
        assert!(!path.exists());
        assert_eq!(h.workspaces.live_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sweep_during_conversion_keeps_job_workspace() {
        use crate::dispatcher::tests::{Behaviour, FakeEmulator, FakeFetcher};
        use crate::dispatcher::{Dispatcher, DispatcherSettings};

        let work_dir = TempDir::new().unwrap();
        let store = Arc::new(CacheStore::new(Arc::new(MemoryBackend::new())));
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(FakeFetcher::serving(&[])),
            Arc::new(FakeEmulator::with_delay(
                Behaviour::Succeed,
                Duration::from_millis(400),
            )),
            DispatcherSettings {
                conversion_timeout: Duration::from_secs(10),
                max_source_bytes: 64 * 1024,
                work_dir: work_dir.path().to_path_buf(),
                max_concurrent_conversions: 1,
            },
            new_shared_metrics(),
        );
        // TTL far below the conversion time
        let janitor = Janitor::new(
            store.clone(),
            Duration::from_millis(100),
            dispatcher.workspaces().clone(),
            new_shared_metrics(),
        );

        let request = ConversionRequest::upload(b"M.K.slow module".to_vec());
        let fingerprint = derive(&request);
        let job = {
            let dispatcher = dispatcher.clone();
            let fingerprint = fingerprint.clone();
            tokio::spawn(async move { dispatcher.acquire(&fingerprint, &request).await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(dispatcher.workspaces().live_count(), 1);
        let report = janitor.sweep_at(now_unix_ms() + 1_000).await;
        assert_eq!(report.workspaces_removed, 0);

        let acquired = job.await.unwrap().unwrap();
        assert!(!acquired.hit);
        assert!(store.exists(&fingerprint).await.unwrap());
        assert_eq!(dispatcher.workspaces().live_count(), 0);
        assert_eq!(std::fs::read_dir(work_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_work_dir() {
        let store = Arc::new(CacheStore::new(Arc::new(MemoryBackend::new())));
        let janitor = Janitor::new(
            store,
            TTL,
            Workspaces::new(PathBuf::from("/nonexistent/modplay-work")),
            new_shared_metrics(),
        );
        assert_eq!(janitor.sweep().await, SweepReport::default());
    }

    #[tokio::test]
    async fn test_spawned_sweeps_run_on_interval() {
        let h = harness();
        let metrics = h.janitor.metrics.clone();
        let handle = Arc::new(h.janitor).spawn(Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();
        assert!(metrics.read().await.counters.sweeps >= 2);
    }
}
