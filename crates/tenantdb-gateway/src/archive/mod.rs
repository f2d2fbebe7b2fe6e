//! Archive store: the immutable source of tenant data
//!
//! Each tenant has exactly one compressed tarball. The gateway only reads
//! archives; uploads are handled elsewhere.

mod fs;

pub use fs::FsArchiveStore;

use async_trait::async_trait;
use std::io::Read;

use crate::error::Result;
use crate::tls::TenantId;

/// Byte stream of a gzip-compressed tar archive.
pub type ArchiveReader = Box<dyn Read + Send>;

/// Source of tenant archives.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Open the archive for `tenant`, or `Ok(None)` if it has none.
    ///
    /// The returned reader is consumed on the blocking pool.
    async fn open_archive(&self, tenant: &TenantId) -> Result<Option<ArchiveReader>>;
}
