//! Remote blob service adapter
//!
//! Finalized containers ship to the blob service under the worker's home
//! namespace, and the retrieval façade pulls them back for slicing. Proof
//! tokens are opaque to this system; they pass through to callers.

use async_trait::async_trait;
use cafio_common::{ChainMode, Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Capability set of the remote blob service.
///
/// All three operations may fail transiently; callers treat them as
/// retryable I/O.
#[async_trait]
pub trait BlobService: Send + Sync {
    /// Upload the file at `local` under `<worker_home>/<name>`.
    async fn put_container(&self, name: &str, local: &Path) -> Result<()>;

    /// Download `name` into `local` and verify it is non-empty.
    async fn get_container(&self, name: &str, local: &Path) -> Result<()>;

    /// Opaque proof tokens for downstream verification of `name`.
    async fn get_proofs(&self, name: &str) -> Result<Vec<String>>;
}

/// Blob service backed by a local directory tree, namespaced by chain mode.
///
/// Layout: `<home>/<mainnet|testnet>/<container_name>`.
pub struct FsBlobService {
    base: PathBuf,
}

impl FsBlobService {
    pub async fn new(home: impl Into<PathBuf>, mode: ChainMode) -> Result<Self> {
        let base = home.into().join(mode.namespace());
        tokio::fs::create_dir_all(&base)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("blob home unavailable: {e}")))?;
        Ok(Self { base })
    }

    fn remote_path(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }
}

#[async_trait]
impl BlobService for FsBlobService {
    async fn put_container(&self, name: &str, local: &Path) -> Result<()> {
        let remote = self.remote_path(name);
        let bytes = tokio::fs::copy(local, &remote).await?;
        debug!(name, bytes, "stored container");
        Ok(())
    }

    async fn get_container(&self, name: &str, local: &Path) -> Result<()> {
        let remote = self.remote_path(name);
        if !tokio::fs::try_exists(&remote).await? {
            return Err(Error::not_found(name.to_string()));
        }
        let bytes = tokio::fs::copy(&remote, local).await?;
        if bytes == 0 {
            return Err(Error::corrupt(format!("downloaded container {name} is empty")));
        }
        debug!(name, bytes, "fetched container");
        Ok(())
    }

    async fn get_proofs(&self, name: &str) -> Result<Vec<String>> {
        let remote = self.remote_path(name);
        let meta = tokio::fs::metadata(&remote)
            .await
            .map_err(|_| Error::not_found(name.to_string()))?;
        Ok(vec![format!("local:{name}:{}", meta.len())])
    }
}

/// Test double that fails the first `failures` uploads, then delegates.
///
/// Drives the handoff-failure and requeue-recovery scenarios.
pub struct FlakyBlobService {
    inner: Arc<dyn BlobService>,
    failures: AtomicUsize,
}

impl FlakyBlobService {
    #[must_use]
    pub fn new(inner: Arc<dyn BlobService>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl BlobService for FlakyBlobService {
    async fn put_container(&self, name: &str, local: &Path) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::PutFailed(format!("injected failure for {name}")));
        }
        self.inner.put_container(name, local).await
    }

    async fn get_container(&self, name: &str, local: &Path) -> Result<()> {
        self.inner.get_container(name, local).await
    }

    async fn get_proofs(&self, name: &str) -> Result<Vec<String>> {
        self.inner.get_proofs(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_fs_blob_put_get() {
        let home = tempdir().unwrap();
        let work = tempdir().unwrap();
        let blob = FsBlobService::new(home.path(), ChainMode::Testnet)
            .await
            .unwrap();

        let src = work.path().join("c.caf");
        std::fs::write(&src, b"container-bytes").unwrap();
        blob.put_container("batch_1.caf", &src).await.unwrap();

        assert!(home.path().join("testnet/batch_1.caf").exists());

        let dst = work.path().join("fetched.caf");
        blob.get_container("batch_1.caf", &dst).await.unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"container-bytes");
    }

    #[tokio::test]
    async fn test_fs_blob_missing_container() {
        let home = tempdir().unwrap();
        let work = tempdir().unwrap();
        let blob = FsBlobService::new(home.path(), ChainMode::Mainnet)
            .await
            .unwrap();
        let err = blob
            .get_container("missing.caf", &work.path().join("x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_fs_blob_rejects_empty_download() {
        let home = tempdir().unwrap();
        let work = tempdir().unwrap();
        let blob = FsBlobService::new(home.path(), ChainMode::Testnet)
            .await
            .unwrap();
        std::fs::write(home.path().join("testnet/empty.caf"), b"").unwrap();

        let err = blob
            .get_container("empty.caf", &work.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CorruptContainer(_)));
    }

    #[tokio::test]
    async fn test_flaky_blob_recovers() {
        let home = tempdir().unwrap();
        let work = tempdir().unwrap();
        let inner: Arc<dyn BlobService> = Arc::new(
            FsBlobService::new(home.path(), ChainMode::Testnet)
                .await
                .unwrap(),
        );
        let flaky = FlakyBlobService::new(inner, 1);

        let src = work.path().join("c.caf");
        std::fs::write(&src, b"x").unwrap();

        assert!(flaky.put_container("a.caf", &src).await.is_err());
        assert!(flaky.put_container("a.caf", &src).await.is_ok());
    }

    #[tokio::test]
    async fn test_proofs_for_stored_container() {
        let home = tempdir().unwrap();
        let work = tempdir().unwrap();
        let blob = FsBlobService::new(home.path(), ChainMode::Testnet)
            .await
            .unwrap();
        let src = work.path().join("c.caf");
        std::fs::write(&src, b"12345").unwrap();
        blob.put_container("b.caf", &src).await.unwrap();

        let proofs = blob.get_proofs("b.caf").await.unwrap();
        assert_eq!(proofs, vec!["local:b.caf:5".to_string()]);
        assert!(blob.get_proofs("missing").await.unwrap_err().is_not_found());
    }
}
