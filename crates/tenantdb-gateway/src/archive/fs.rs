//! Archive store over a mounted directory

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{ArchiveReader, ArchiveStore};
use crate::error::Result;
use crate::tls::TenantId;

/// Reads `<root>/<tenant>.tar.gz`.
///
/// `root` is typically an object-store bucket mounted with a FUSE driver.
#[derive(Debug, Clone)]
pub struct FsArchiveStore {
    root: PathBuf,
}

impl FsArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the archive for `tenant`.
    pub fn archive_path(&self, tenant: &TenantId) -> PathBuf {
        self.root.join(format!("{}.tar.gz", tenant))
    }
}

#[async_trait]
impl ArchiveStore for FsArchiveStore {
    async fn open_archive(&self, tenant: &TenantId) -> Result<Option<ArchiveReader>> {
        let path = self.archive_path(tenant);
        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                trace!("Opened archive {}", path.display());
                Ok(Some(Box::new(file.into_std().await)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[tokio::test]
    async fn test_open_existing_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t1.tar.gz"), b"payload").unwrap();
        let store = FsArchiveStore::new(dir.path());

        let mut reader = store
            .open_archive(&TenantId::new("t1"))
            .await
            .unwrap()
            .unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"payload");

        assert!(store
            .open_archive(&TenantId::new("t2"))
            .await
            .unwrap()
            .is_none());
    }
}
