//! Container and proof caches
//!
//! Downloaded containers live as plain files under the temp directory, one
//! per container name; concurrent fetches of the same container race
//! harmlessly because a correct download is byte-identical and validation
//! catches the rare corruption. Proof tokens get a small TTL cache with a
//! background janitor.

use cafio_adapters::BlobService;
use cafio_archive::CafReader;
use cafio_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Local filesystem cache of downloaded containers.
///
/// No size cap: out-of-space surfaces as an I/O error on the next download.
/// Deletion policy is either keep-forever or delete-after-serving.
pub struct ContainerCache {
    dir: PathBuf,
    keep: bool,
}

impl ContainerCache {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, keep: bool) -> Self {
        Self {
            dir: dir.into(),
            keep,
        }
    }

    /// Local path a container is cached at.
    #[must_use]
    pub fn local_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Produce a validated local copy of `name`: reuse a non-empty cached
    /// file, otherwise download under `deadline` and verify the result is a
    /// readable, non-empty container. Failed downloads and failed
    /// validations delete the local file.
    pub async fn fetch(
        &self,
        blob: &dyn BlobService,
        name: &str,
        deadline: Duration,
    ) -> Result<PathBuf> {
        let local = self.local_path(name);

        if let Ok(meta) = tokio::fs::metadata(&local).await {
            if meta.len() > 0 {
                debug!(name, "container cache hit");
                return Ok(local);
            }
            // Zero-byte leftover from an interrupted download.
            warn!(name, "removing empty cached container");
            let _ = tokio::fs::remove_file(&local).await;
        }

        match tokio::time::timeout(deadline, blob.get_container(name, &local)).await {
            Err(_elapsed) => {
                let _ = tokio::fs::remove_file(&local).await;
                return Err(Error::Timeout {
                    seconds: deadline.as_secs(),
                });
            }
            Ok(Err(e)) => {
                let _ = tokio::fs::remove_file(&local).await;
                return Err(e);
            }
            Ok(Ok(())) => {}
        }

        let validated = local.clone();
        let outcome = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut reader = CafReader::open(&validated);
            reader.load_index()?;
            if reader.list()?.is_empty() {
                return Err(Error::corrupt("container has no members"));
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::internal(format!("validation task failed: {e}")))?;

        if let Err(e) = outcome {
            let _ = tokio::fs::remove_file(&local).await;
            return Err(e);
        }

        debug!(name, "container downloaded and validated");
        Ok(local)
    }

    /// Post-serve cleanup. Removal failure is logged, never propagated.
    pub async fn finish(&self, local: &Path) {
        if self.keep {
            return;
        }
        if let Err(e) = tokio::fs::remove_file(local).await {
            warn!(path = %local.display(), error = %e, "failed to remove served container");
        }
    }
}

// ── Proof cache ───────────────────────────────────────────────────────────────

/// `(container_name, file_path, task_id)`
pub type ProofKey = (String, String, String);

struct ProofEntry {
    proofs: Vec<String>,
    inserted_at: Instant,
}

/// TTL cache of opaque proof-token lists.
#[derive(Clone)]
pub struct ProofCache {
    entries: Arc<Mutex<HashMap<ProofKey, ProofEntry>>>,
    ttl: Duration,
}

impl ProofCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Cached proofs for `key`, unless expired.
    #[must_use]
    pub fn get(&self, key: &ProofKey) -> Option<Vec<String>> {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.proofs.clone())
    }

    pub fn insert(&self, key: ProofKey, proofs: Vec<String>) {
        self.entries.lock().insert(
            key,
            ProofEntry {
                proofs,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) {
        self.entries
            .lock()
            .retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Spawn the background janitor that purges expired entries.
    pub fn spawn_janitor(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                cache.purge_expired();
            }
        })
    }
}
