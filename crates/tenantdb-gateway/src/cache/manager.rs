//! Cache manager: tenant id -> ready local directory

use dashmap::DashMap;
use flate2::read::GzDecoder;
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::keyed::KeyedLocks;
use crate::archive::{ArchiveReader, ArchiveStore};
use crate::config::CacheConfig;
use crate::error::{GatewayError, Result};
use crate::tls::TenantId;

const STAGING_DIR: &str = ".staging";

/// Externally visible state of a tenant's cache entry.
///
/// Failed materializations are removed immediately and report `Absent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Absent,
    Materializing,
    Ready,
}

#[derive(Debug, Clone)]
pub(super) struct CacheEntry {
    pub(super) state: CacheState,
    pub(super) generation: u64,
    pub(super) pins: usize,
    pub(super) last_used: Instant,
    pub(super) size_bytes: u64,
}

impl CacheEntry {
    fn ready(generation: u64, size_bytes: u64, pins: usize) -> Self {
        Self {
            state: CacheState::Ready,
            generation,
            pins,
            last_used: Instant::now(),
            size_bytes,
        }
    }
}

/// Eviction and materialization limits.
#[derive(Debug, Clone)]
pub struct CacheLimits {
    /// Disk budget; `None` disables the LRU pass
    pub max_bytes: Option<u64>,
    /// Idle TTL; `None` disables the TTL pass
    pub idle_ttl: Option<Duration>,
    /// Bound on one extraction
    pub materialize_timeout: Option<Duration>,
    /// Period of the background reclaimer
    pub reclaim_interval: Duration,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_bytes: None,
            idle_ttl: None,
            materialize_timeout: None,
            reclaim_interval: Duration::from_secs(60),
        }
    }
}

impl From<&CacheConfig> for CacheLimits {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_bytes: config.max_bytes(),
            idle_ttl: config.idle_ttl(),
            materialize_timeout: config.materialize_timeout(),
            reclaim_interval: Duration::from_secs(config.reclaim_interval_secs.max(1)),
        }
    }
}

/// Counters exposed for metrics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub materializations: AtomicU64,
    pub failures: AtomicU64,
    pub adoptions: AtomicU64,
    pub evictions: AtomicU64,
}

/// Owns every tenant directory under the cache root.
pub struct CacheManager {
    root: PathBuf,
    staging_root: PathBuf,
    archives: Arc<dyn ArchiveStore>,
    pub(super) entries: DashMap<String, CacheEntry>,
    pub(super) locks: KeyedLocks,
    next_generation: AtomicU64,
    pub(super) limits: CacheLimits,
    pub(super) nudge: Notify,
    stats: CacheStats,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("root", &self.root)
            .field("entries", &self.entries.len())
            .field("limits", &self.limits)
            .finish()
    }
}

impl CacheManager {
    /// Open the cache described by `config`.
    pub async fn open(config: &CacheConfig, archives: Arc<dyn ArchiveStore>) -> Result<Arc<Self>> {
        Self::open_with_limits(&config.root, archives, CacheLimits::from(config)).await
    }

    /// Open a cache rooted at `root`.
    ///
    /// Purges leftover staging directories and adopts complete tenant
    /// directories left by a previous run.
    pub async fn open_with_limits(
        root: impl Into<PathBuf>,
        archives: Arc<dyn ArchiveStore>,
        limits: CacheLimits,
    ) -> Result<Arc<Self>> {
        let root = root.into();
        let staging_root = root.join(STAGING_DIR);

        match tokio::fs::remove_dir_all(&staging_root).await {
            Ok(()) => debug!("Purged stale staging area {}", staging_root.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&staging_root).await?;

        let manager = Self {
            root,
            staging_root,
            archives,
            entries: DashMap::new(),
            locks: KeyedLocks::new(),
            next_generation: AtomicU64::new(1),
            limits,
            nudge: Notify::new(),
            stats: CacheStats::default(),
        };
        manager.adopt_existing().await?;

        Ok(Arc::new(manager))
    }

    async fn adopt_existing(&self) -> Result<()> {
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            let size = directory_size_async(entry.path()).await?;
            let generation = self.next_generation();
            self.entries
                .insert(name.clone(), CacheEntry::ready(generation, size, 0));
            self.stats.adoptions.fetch_add(1, Ordering::Relaxed);
            debug!("Adopted cached directory for {} ({} bytes)", name, size);
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Final directory path for `tenant`.
    pub fn tenant_path(&self, tenant: &TenantId) -> PathBuf {
        self.root.join(tenant.as_str())
    }

    /// Current state of `tenant`'s entry.
    pub fn state(&self, tenant: &TenantId) -> CacheState {
        self.entries
            .get(tenant.as_str())
            .map(|e| e.state)
            .unwrap_or(CacheState::Absent)
    }

    /// Active pins on `tenant`.
    pub fn pins(&self, tenant: &TenantId) -> usize {
        self.entries.get(tenant.as_str()).map(|e| e.pins).unwrap_or(0)
    }

    /// Total bytes across all tracked entries.
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    /// Wake the reclaimer early.
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Make `tenant`'s directory ready and pin it for the lease's lifetime.
    pub async fn ensure_materialized(self: &Arc<Self>, tenant: &TenantId) -> Result<CacheLease> {
        let key = cache_key(tenant)?;

        if let Some(lease) = self.try_pin_ready(tenant).await {
            trace!("Cache hit for {}", tenant);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(lease);
        }

        let _guard = self.locks.lock(key).await;

        if let Some(lease) = self.try_pin_ready(tenant).await {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(lease);
        }

        let final_path = self.tenant_path(tenant);
        if is_directory(&final_path).await {
            let size = directory_size_async(final_path.clone()).await?;
            let generation = self.next_generation();
            self.entries
                .insert(key.to_string(), CacheEntry::ready(generation, size, 1));
            self.stats.adoptions.fetch_add(1, Ordering::Relaxed);
            debug!("Adopted existing directory for {}", tenant);
            return Ok(self.lease(tenant, final_path, generation));
        }

        info!("Database '{}' is not cached, materializing", tenant);
        let generation = self.next_generation();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                state: CacheState::Materializing,
                generation,
                pins: 0,
                last_used: Instant::now(),
                size_bytes: 0,
            },
        );

        match self.materialize(tenant, &final_path).await {
            Ok(size) => {
                self.entries
                    .insert(key.to_string(), CacheEntry::ready(generation, size, 1));
                self.stats.materializations.fetch_add(1, Ordering::Relaxed);
                info!("Materialized {} ({} bytes)", tenant, size);
                Ok(self.lease(tenant, final_path, generation))
            }
            Err(e) => {
                self.entries.remove(key);
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Pin a ready entry whose directory still exists.
    async fn try_pin_ready(self: &Arc<Self>, tenant: &TenantId) -> Option<CacheLease> {
        let generation = {
            let mut entry = self.entries.get_mut(tenant.as_str())?;
            if entry.state != CacheState::Ready {
                return None;
            }
            entry.pins += 1;
            entry.last_used = Instant::now();
            entry.generation
        };

        let path = self.tenant_path(tenant);
        if is_directory(&path).await {
            return Some(self.lease(tenant, path, generation));
        }

        warn!("Cached directory for {} disappeared", tenant);
        self.unpin(tenant.as_str(), generation);
        self.entries
            .remove_if(tenant.as_str(), |_, e| e.generation == generation && e.pins == 0);
        None
    }

    fn lease(self: &Arc<Self>, tenant: &TenantId, path: PathBuf, generation: u64) -> CacheLease {
        CacheLease {
            manager: Arc::clone(self),
            tenant: tenant.clone(),
            path,
            generation,
        }
    }

    fn unpin(&self, key: &str, generation: u64) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.generation == generation {
                entry.pins = entry.pins.saturating_sub(1);
                entry.last_used = Instant::now();
            }
        }
    }

    /// Extract the archive into staging, then rename into place.
    async fn materialize(&self, tenant: &TenantId, final_path: &Path) -> Result<u64> {
        let reader = self
            .archives
            .open_archive(tenant)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("archive for {}", tenant)))?;

        let staging = self
            .staging_root
            .join(format!("{}-{}", tenant, uuid::Uuid::new_v4()));
        let cancel = Arc::new(AtomicBool::new(false));

        let task = {
            let staging = staging.clone();
            let cancel = Arc::clone(&cancel);
            tokio::task::spawn_blocking(move || extract_into(reader, &staging, &cancel))
        };

        let size = self.await_extraction(task, &cancel, &staging, tenant).await?;

        if let Err(e) = tokio::fs::rename(&staging, final_path).await {
            remove_staging(&staging).await;
            return Err(GatewayError::Extraction(format!(
                "failed to move {} into place: {}",
                tenant, e
            )));
        }
        Ok(size)
    }

    async fn await_extraction(
        &self,
        mut task: JoinHandle<Result<u64>>,
        cancel: &AtomicBool,
        staging: &Path,
        tenant: &TenantId,
    ) -> Result<u64> {
        let joined = match self.limits.materialize_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Materialization of {} exceeded {:?}, cancelling", tenant, limit);
                    cancel.store(true, Ordering::Relaxed);
                    // A failed extraction removes its own staging directory;
                    // one that finished anyway is discarded here.
                    if let Ok(Ok(_)) = task.await {
                        remove_staging(staging).await;
                    }
                    return Err(GatewayError::Timeout(format!(
                        "materialization of {} timed out",
                        tenant
                    )));
                }
            },
            None => task.await,
        };

        joined.map_err(|e| GatewayError::Extraction(format!("extraction task failed: {}", e)))?
    }

    /// Move a tenant directory out of the cache root, then delete it.
    ///
    /// Once the rename succeeds the final path is gone; anything the delete
    /// leaves behind sits in staging and is purged on the next start.
    pub(super) async fn retire(&self, key: &str) -> std::io::Result<()> {
        let retired = self
            .staging_root
            .join(format!("{}-evict-{}", key, uuid::Uuid::new_v4()));
        tokio::fs::rename(self.root.join(key), &retired).await?;
        remove_staging(&retired).await;
        Ok(())
    }

    /// Re-measure ready entries not currently being materialized.
    ///
    /// Running engines keep writing into their directories, so the size
    /// recorded at materialization only grows stale.
    pub(super) async fn refresh_sizes(&self) {
        let ready: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|e| e.state == CacheState::Ready)
            .map(|e| (e.key().clone(), e.generation))
            .collect();

        for (key, generation) in ready {
            let Some(_guard) = self.locks.try_lock(&key) else {
                continue;
            };
            match directory_size_async(self.root.join(&key)).await {
                Ok(size) => {
                    if let Some(mut entry) = self.entries.get_mut(&key) {
                        if entry.generation == generation {
                            entry.size_bytes = size;
                        }
                    }
                }
                Err(e) => debug!("Could not measure {}: {}", key, e),
            }
        }
    }
}

/// Pin on a ready tenant directory.
///
/// The directory cannot be evicted while any lease for it is alive.
pub struct CacheLease {
    manager: Arc<CacheManager>,
    tenant: TenantId,
    path: PathBuf,
    generation: u64,
}

impl CacheLease {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bumped each time the directory is materialized or adopted.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for CacheLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLease")
            .field("tenant", &self.tenant)
            .field("path", &self.path)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.manager.unpin(self.tenant.as_str(), self.generation);
    }
}

/// Tenant ids become directory names, so anything that could escape the
/// cache root is treated as nonexistent.
fn cache_key(tenant: &TenantId) -> Result<&str> {
    let id = tenant.as_str();
    if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\', '\0']) {
        return Err(GatewayError::NotFound(format!("invalid tenant id {:?}", id)));
    }
    Ok(id)
}

async fn is_directory(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Blocking: create `staging`, unpack the archive, measure the result.
///
/// `staging` is removed before returning an error.
fn extract_into(reader: ArchiveReader, staging: &Path, cancel: &AtomicBool) -> Result<u64> {
    let result = std::fs::create_dir(staging)
        .map_err(GatewayError::from)
        .and_then(|()| unpack(reader, staging, cancel))
        .and_then(|()| directory_size(staging));

    if result.is_err() {
        if let Err(e) = std::fs::remove_dir_all(staging) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove staging {}: {}", staging.display(), e);
            }
        }
    }
    result
}

fn unpack(reader: ArchiveReader, dest: &Path, cancel: &AtomicBool) -> Result<()> {
    let extraction = |e: std::io::Error| GatewayError::Extraction(e.to_string());

    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(reader)));
    archive.set_preserve_permissions(true);

    for entry in archive.entries().map_err(extraction)? {
        if cancel.load(Ordering::Relaxed) {
            return Err(GatewayError::Extraction("extraction cancelled".into()));
        }
        let mut entry = entry.map_err(extraction)?;
        entry.unpack_in(dest).map_err(extraction)?;
    }
    Ok(())
}

/// Sum of regular file sizes below `path`.
fn directory_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

async fn remove_staging(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to remove staging {}: {}", path.display(), e);
        }
    }
}

async fn directory_size_async(path: PathBuf) -> Result<u64> {
    tokio::task::spawn_blocking(move || directory_size(&path))
        .await
        .map_err(|e| GatewayError::Io(std::io::Error::new(ErrorKind::Other, e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::FsArchiveStore;
    use async_trait::async_trait;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::sync::atomic::AtomicUsize;

    fn write_archive(dir: &Path, tenant: &str, files: &[(&str, &[u8])]) {
        let file = std::fs::File::create(dir.join(format!("{}.tar.gz", tenant))).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o600);
            header.set_cksum();
            builder.append_data(&mut header, name, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    struct Fixture {
        archives: tempfile::TempDir,
        cache: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                archives: tempfile::tempdir().unwrap(),
                cache: tempfile::tempdir().unwrap(),
            }
        }

        async fn manager(&self) -> Arc<CacheManager> {
            self.manager_with(CacheLimits::default()).await
        }

        async fn manager_with(&self, limits: CacheLimits) -> Arc<CacheManager> {
            CacheManager::open_with_limits(
                self.cache.path(),
                Arc::new(FsArchiveStore::new(self.archives.path())),
                limits,
            )
            .await
            .unwrap()
        }

        fn staging_is_empty(&self) -> bool {
            std::fs::read_dir(self.cache.path().join(STAGING_DIR))
                .unwrap()
                .next()
                .is_none()
        }
    }

    /// Counts how many times an archive is opened.
    struct CountingStore {
        inner: FsArchiveStore,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl ArchiveStore for CountingStore {
        async fn open_archive(&self, tenant: &TenantId) -> Result<Option<ArchiveReader>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.open_archive(tenant).await
        }
    }

    #[tokio::test]
    async fn test_materialize_and_pin() {
        let fx = Fixture::new();
        write_archive(fx.archives.path(), "t1", &[("PG_VERSION", b"16\n"), ("base/1/1", b"data")]);
        let manager = fx.manager().await;
        let tenant = TenantId::new("t1");

        let lease = manager.ensure_materialized(&tenant).await.unwrap();
        assert_eq!(lease.path(), fx.cache.path().join("t1"));
        assert_eq!(std::fs::read(lease.path().join("PG_VERSION")).unwrap(), b"16\n");
        assert_eq!(manager.state(&tenant), CacheState::Ready);
        assert_eq!(manager.pins(&tenant), 1);
        assert_eq!(manager.total_bytes(), 7);

        let second = manager.ensure_materialized(&tenant).await.unwrap();
        assert_eq!(second.generation(), lease.generation());
        assert_eq!(manager.pins(&tenant), 2);

        drop(lease);
        drop(second);
        assert_eq!(manager.pins(&tenant), 0);
        assert_eq!(manager.stats().materializations.load(Ordering::Relaxed), 1);
        assert!(fx.staging_is_empty());
    }

    #[tokio::test]
    async fn test_missing_archive_leaves_nothing() {
        let fx = Fixture::new();
        let manager = fx.manager().await;
        let tenant = TenantId::new("missing");

        let err = manager.ensure_materialized(&tenant).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert!(!fx.cache.path().join("missing").exists());
        assert_eq!(manager.state(&tenant), CacheState::Absent);
        assert!(fx.staging_is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_cleaned_up() {
        let fx = Fixture::new();
        std::fs::write(fx.archives.path().join("bad.tar.gz"), b"definitely not gzip").unwrap();
        let manager = fx.manager().await;
        let tenant = TenantId::new("bad");

        let err = manager.ensure_materialized(&tenant).await.unwrap_err();
        assert!(matches!(err, GatewayError::Extraction(_)));
        assert!(!fx.cache.path().join("bad").exists());
        assert!(fx.staging_is_empty());
        assert_eq!(manager.stats().failures.load(Ordering::Relaxed), 1);

        // A fixed archive materializes on the next attempt.
        write_archive(fx.archives.path(), "bad", &[("PG_VERSION", b"16\n")]);
        assert!(manager.ensure_materialized(&tenant).await.is_ok());
    }

    #[tokio::test]
    async fn test_truncated_archive_is_cleaned_up() {
        let fx = Fixture::new();
        write_archive(fx.archives.path(), "t1", &[("big", &[7u8; 64 * 1024])]);
        let path = fx.archives.path().join("t1.tar.gz");
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let manager = fx.manager().await;
        assert!(manager.ensure_materialized(&TenantId::new("t1")).await.is_err());
        assert!(!fx.cache.path().join("t1").exists());
        assert!(fx.staging_is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_callers_extract_once() {
        let fx = Fixture::new();
        write_archive(fx.archives.path(), "t1", &[("PG_VERSION", b"16\n")]);
        let store = Arc::new(CountingStore {
            inner: FsArchiveStore::new(fx.archives.path()),
            opens: AtomicUsize::new(0),
        });
        let manager = CacheManager::open_with_limits(
            fx.cache.path(),
            store.clone(),
            CacheLimits::default(),
        )
        .await
        .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                manager.ensure_materialized(&TenantId::new("t1")).await
            }));
        }

        let mut leases = Vec::new();
        for task in tasks {
            leases.push(task.await.unwrap().unwrap());
        }

        assert_eq!(store.opens.load(Ordering::SeqCst), 1);
        assert!(leases.iter().all(|l| l.path() == leases[0].path()));
        assert_eq!(manager.pins(&TenantId::new("t1")), 10);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let fx = Fixture::new();
        let manager = fx.manager().await;
        for id in ["", ".", "..", ".staging", "a/b", "a\\b"] {
            let err = manager
                .ensure_materialized(&TenantId::new(id))
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::NotFound(_)), "id {:?}", id);
        }
    }

    #[tokio::test]
    async fn test_open_adopts_and_purges() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.cache.path().join("warm")).unwrap();
        std::fs::write(fx.cache.path().join("warm/PG_VERSION"), b"16\n").unwrap();
        std::fs::create_dir_all(fx.cache.path().join(".staging/warm-leftover")).unwrap();

        let manager = fx.manager().await;
        assert!(fx.staging_is_empty());
        assert_eq!(manager.state(&TenantId::new("warm")), CacheState::Ready);

        // No archive exists, so this can only succeed through adoption.
        let lease = manager
            .ensure_materialized(&TenantId::new("warm"))
            .await
            .unwrap();
        assert!(lease.path().join("PG_VERSION").exists());
    }

    #[tokio::test]
    async fn test_vanished_directory_is_rematerialized() {
        let fx = Fixture::new();
        write_archive(fx.archives.path(), "t1", &[("PG_VERSION", b"16\n")]);
        let manager = fx.manager().await;
        let tenant = TenantId::new("t1");

        let first = manager.ensure_materialized(&tenant).await.unwrap();
        let generation = first.generation();
        drop(first);
        std::fs::remove_dir_all(fx.cache.path().join("t1")).unwrap();

        let second = manager.ensure_materialized(&tenant).await.unwrap();
        assert!(second.generation() > generation);
        assert!(second.path().join("PG_VERSION").exists());
    }

    #[tokio::test]
    async fn test_materialize_timeout_cleans_staging() {
        let fx = Fixture::new();
        let files: Vec<(String, Vec<u8>)> = (0..2000)
            .map(|i| (format!("f{}", i), vec![1u8; 512]))
            .collect();
        let refs: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(n, c)| (n.as_str(), c.as_slice()))
            .collect();
        write_archive(fx.archives.path(), "slow", &refs);

        let manager = fx
            .manager_with(CacheLimits {
                materialize_timeout: Some(Duration::from_nanos(1)),
                ..CacheLimits::default()
            })
            .await;

        let result = manager.ensure_materialized(&TenantId::new("slow")).await;
        if let Err(e) = result {
            assert!(matches!(e, GatewayError::Timeout(_)));
            assert!(!fx.cache.path().join("slow").exists());
        }
        assert!(fx.staging_is_empty());
    }
}
