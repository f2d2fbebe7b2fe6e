//! Background reclamation of unpinned tenant directories
//!
//! Two passes per sweep:
//! 1. entries idle longer than the TTL,
//! 2. least recently used entries until usage fits the disk budget.
//!
//! Eviction takes the tenant's keyed lock with `try_lock`, so a tenant that
//! is being materialized is skipped rather than waited on. An evicted
//! directory is renamed into staging before it is deleted, so a partial
//! delete never remains at the tenant's path.

use std::io::ErrorKind;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::manager::{CacheEntry, CacheManager, CacheState};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub evicted: usize,
    pub freed_bytes: u64,
}

impl CacheManager {
    /// Run one reclamation sweep.
    pub async fn reclaim(&self) -> ReclaimReport {
        let mut report = ReclaimReport::default();

        if let Some(ttl) = self.limits.idle_ttl {
            let now = Instant::now();
            let expired = |e: &CacheEntry| evictable(e) && now.duration_since(e.last_used) >= ttl;
            let candidates: Vec<String> = self
                .entries
                .iter()
                .filter(|e| expired(e.value()))
                .map(|e| e.key().clone())
                .collect();

            for key in candidates {
                if let Some(freed) = self.try_evict(&key, &expired).await {
                    report.evicted += 1;
                    report.freed_bytes += freed;
                }
            }
        }

        if let Some(max_bytes) = self.limits.max_bytes {
            self.refresh_sizes().await;
            let mut total = self.total_bytes();
            if total > max_bytes {
                let mut candidates: Vec<(Instant, String)> = self
                    .entries
                    .iter()
                    .filter(|e| evictable(e.value()))
                    .map(|e| (e.last_used, e.key().clone()))
                    .collect();
                candidates.sort();

                for (_, key) in candidates {
                    if total <= max_bytes {
                        break;
                    }
                    if let Some(freed) = self.try_evict(&key, &evictable).await {
                        total = total.saturating_sub(freed);
                        report.evicted += 1;
                        report.freed_bytes += freed;
                    }
                }
            }
        }

        report
    }

    /// Evict `key` if it is unlocked and still satisfies `eligible`.
    async fn try_evict<F>(&self, key: &str, eligible: &F) -> Option<u64>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let _guard = self.locks.try_lock(key)?;
        let (key, entry) = self.entries.remove_if(key, |_, e| eligible(e))?;

        match self.retire(&key).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Directory for {} already gone", key);
            }
            Err(e) => {
                warn!("Failed to evict {}, keeping it: {}", key, e);
                self.entries.insert(key, entry);
                return None;
            }
        }
        self.stats().evictions.fetch_add(1, Ordering::Relaxed);
        info!("Evicted {} ({} bytes)", key, entry.size_bytes);
        Some(entry.size_bytes)
    }
}

fn evictable(entry: &CacheEntry) -> bool {
    entry.state == CacheState::Ready && entry.pins == 0
}

/// Spawn the periodic reclaimer.
///
/// Sweeps every `reclaim_interval` and whenever [`CacheManager::nudge`] is
/// called, until `shutdown_rx` fires.
pub fn start_reclaimer(
    manager: Arc<CacheManager>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(manager.limits.reclaim_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = manager.nudge.notified() => {}
                _ = shutdown_rx.recv() => {
                    debug!("Cache reclaimer shutting down");
                    break;
                }
            }

            let report = manager.reclaim().await;
            if report.evicted > 0 {
                debug!(
                    "Reclaimed {} directories ({} bytes)",
                    report.evicted, report.freed_bytes
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::FsArchiveStore;
    use crate::cache::CacheLimits;
    use crate::tls::TenantId;
    use std::path::Path;
    use std::time::Duration;

    /// Lay out `(tenant, bytes)` directories so the manager adopts them.
    fn seed(root: &Path, tenants: &[(&str, usize)]) {
        for (tenant, size) in tenants {
            std::fs::create_dir_all(root.join(tenant)).unwrap();
            std::fs::write(root.join(tenant).join("data"), vec![0u8; *size]).unwrap();
        }
    }

    async fn manager(root: &Path, limits: CacheLimits) -> Arc<CacheManager> {
        let archives = tempfile::tempdir().unwrap();
        CacheManager::open_with_limits(root, Arc::new(FsArchiveStore::new(archives.path())), limits)
            .await
            .unwrap()
    }

    /// Touch tenants in order so the first is least recently used.
    async fn touch_in_order(manager: &Arc<CacheManager>, tenants: &[&str]) {
        for tenant in tenants {
            drop(manager.ensure_materialized(&TenantId::new(*tenant)).await.unwrap());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_no_limits_evicts_nothing() {
        let root = tempfile::tempdir().unwrap();
        seed(root.path(), &[("t1", 100)]);
        let manager = manager(root.path(), CacheLimits::default()).await;
        assert_eq!(manager.reclaim().await, ReclaimReport::default());
        assert!(root.path().join("t1").exists());
    }

    #[tokio::test]
    async fn test_budget_evicts_least_recently_used() {
        let root = tempfile::tempdir().unwrap();
        seed(root.path(), &[("t1", 1000), ("t2", 1000), ("t3", 1000)]);
        let manager = manager(
            root.path(),
            CacheLimits {
                max_bytes: Some(2500),
                ..CacheLimits::default()
            },
        )
        .await;
        touch_in_order(&manager, &["t1", "t2", "t3"]).await;

        let report = manager.reclaim().await;
        assert_eq!(report.evicted, 1);
        assert_eq!(report.freed_bytes, 1000);
        assert!(!root.path().join("t1").exists());
        assert!(root.path().join("t2").exists());
        assert!(root.path().join("t3").exists());
        assert_eq!(manager.state(&TenantId::new("t1")), CacheState::Absent);
    }

    #[tokio::test]
    async fn test_pinned_entries_survive() {
        let root = tempfile::tempdir().unwrap();
        seed(root.path(), &[("t1", 1000), ("t2", 1000)]);
        let manager = manager(
            root.path(),
            CacheLimits {
                max_bytes: Some(1),
                ..CacheLimits::default()
            },
        )
        .await;
        touch_in_order(&manager, &["t1", "t2"]).await;
        let _lease = manager.ensure_materialized(&TenantId::new("t1")).await.unwrap();

        let report = manager.reclaim().await;
        assert_eq!(report.evicted, 1);
        assert!(root.path().join("t1").exists());
        assert!(!root.path().join("t2").exists());
    }

    #[tokio::test]
    async fn test_locked_tenant_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        seed(root.path(), &[("t1", 1000)]);
        let manager = manager(
            root.path(),
            CacheLimits {
                max_bytes: Some(1),
                ..CacheLimits::default()
            },
        )
        .await;

        let held = manager.locks.lock("t1").await;
        assert_eq!(manager.reclaim().await.evicted, 0);
        assert!(root.path().join("t1").exists());

        drop(held);
        assert_eq!(manager.reclaim().await.evicted, 1);
    }

    #[tokio::test]
    async fn test_idle_ttl_evicts_expired() {
        let root = tempfile::tempdir().unwrap();
        seed(root.path(), &[("old", 10), ("fresh", 10)]);
        let manager = manager(
            root.path(),
            CacheLimits {
                idle_ttl: Some(Duration::from_millis(100)),
                ..CacheLimits::default()
            },
        )
        .await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        touch_in_order(&manager, &["fresh"]).await;

        let report = manager.reclaim().await;
        assert_eq!(report.evicted, 1);
        assert!(!root.path().join("old").exists());
        assert!(root.path().join("fresh").exists());
    }

    #[tokio::test]
    async fn test_budget_counts_growth_since_materialization() {
        let root = tempfile::tempdir().unwrap();
        seed(root.path(), &[("t1", 1000)]);
        let manager = manager(
            root.path(),
            CacheLimits {
                max_bytes: Some(1500),
                ..CacheLimits::default()
            },
        )
        .await;
        assert_eq!(manager.reclaim().await.evicted, 0);

        std::fs::write(root.path().join("t1").join("wal"), vec![0u8; 1000]).unwrap();

        let report = manager.reclaim().await;
        assert_eq!(report.evicted, 1);
        assert_eq!(report.freed_bytes, 2000);
        assert!(!root.path().join("t1").exists());
    }

    #[tokio::test]
    async fn test_evicted_directory_leaves_through_staging() {
        let root = tempfile::tempdir().unwrap();
        seed(root.path(), &[("t1", 1000)]);
        let manager = manager(
            root.path(),
            CacheLimits {
                max_bytes: Some(1),
                ..CacheLimits::default()
            },
        )
        .await;

        // A staging area that cannot take the directory blocks the move.
        let staging = root.path().join(".staging");
        std::fs::remove_dir_all(&staging).unwrap();
        std::fs::write(&staging, b"not a directory").unwrap();

        assert_eq!(manager.reclaim().await.evicted, 0);
        assert_eq!(manager.state(&TenantId::new("t1")), CacheState::Ready);
        assert!(root.path().join("t1").join("data").exists());

        std::fs::remove_file(&staging).unwrap();
        std::fs::create_dir(&staging).unwrap();

        assert_eq!(manager.reclaim().await.evicted, 1);
        assert!(!root.path().join("t1").exists());
        assert!(std::fs::read_dir(&staging).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_interrupted_eviction_is_not_adopted() {
        let root = tempfile::tempdir().unwrap();
        let retired = root.path().join(".staging").join("t1-evict-0");
        std::fs::create_dir_all(&retired).unwrap();
        std::fs::write(retired.join("data"), b"half deleted").unwrap();

        let manager = manager(root.path(), CacheLimits::default()).await;
        assert_eq!(manager.state(&TenantId::new("t1")), CacheState::Absent);
        assert!(!retired.exists());
        assert!(manager
            .ensure_materialized(&TenantId::new("t1"))
            .await
            .is_err());
        assert!(!root.path().join("t1").exists());
    }

    #[tokio::test]
    async fn test_reclaimer_task_stops_on_shutdown() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path(), CacheLimits::default()).await;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = start_reclaimer(Arc::clone(&manager), shutdown_rx);
        manager.nudge();
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
