//! Work queue adapter
//!
//! The broker is an external collaborator; the pipeline only needs a
//! consumer with manual acknowledgement. Message bodies are UTF-8 JSON
//! `{"task_id": ..., "file_path": ...}`; anything else nacks back to the
//! broker.

use async_trait::async_trait;
use bytes::Bytes;
use cafio_common::{Error, LogicalPath, Result, TaskId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Payload of one queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub task_id: String,
    pub file_path: String,
}

impl UploadRequest {
    /// Parse and validate a message body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let request: Self = serde_json::from_slice(body)
            .map_err(|e| Error::validation(format!("malformed queue message: {e}")))?;
        TaskId::new(&request.task_id).map_err(|e| Error::validation(e.to_string()))?;
        LogicalPath::new(&request.file_path).map_err(|e| Error::validation(e.to_string()))?;
        Ok(request)
    }

    /// Encode as a message body.
    #[must_use]
    pub fn to_body(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("request serializes"))
    }
}

/// One delivered message awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub body: Bytes,
}

/// Consumer side of the work queue. Manual acknowledgement is mandatory:
/// every delivery must eventually be acked or nacked back to the broker.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Await the next delivery. `None` means the queue is closed.
    async fn next(&self) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery as fully processed.
    async fn ack(&self, tag: u64) -> Result<()>;

    /// Negatively acknowledge a delivery, returning it to the queue.
    async fn nack_requeue(&self, tag: u64) -> Result<()>;
}

// ── In-memory queue ───────────────────────────────────────────────────────────

/// In-memory queue with requeue support, for tests and local development.
pub struct MemoryQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    unacked: Mutex<HashMap<u64, Bytes>>,
    acked: Mutex<Vec<u64>>,
    next_tag: AtomicU64,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            unacked: Mutex::new(HashMap::new()),
            acked: Mutex::new(Vec::new()),
            next_tag: AtomicU64::new(1),
        }
    }

    /// Publish a message, returning its delivery tag.
    pub fn publish(&self, body: impl Into<Bytes>) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Delivery {
                tag,
                body: body.into(),
            });
        }
        tag
    }

    /// Close the queue; `next` returns `None` once drained.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Tags acked so far, in order.
    #[must_use]
    pub fn acked(&self) -> Vec<u64> {
        self.acked.lock().clone()
    }

    /// Number of deliveries neither acked nor requeued.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.unacked.lock().len()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn next(&self) -> Result<Option<Delivery>> {
        let delivery = self.rx.lock().await.recv().await;
        if let Some(d) = &delivery {
            self.unacked.lock().insert(d.tag, d.body.clone());
        }
        Ok(delivery)
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        if self.unacked.lock().remove(&tag).is_none() {
            return Err(Error::internal(format!("unknown delivery tag {tag}")));
        }
        self.acked.lock().push(tag);
        Ok(())
    }

    async fn nack_requeue(&self, tag: u64) -> Result<()> {
        let body = self
            .unacked
            .lock()
            .remove(&tag)
            .ok_or_else(|| Error::internal(format!("unknown delivery tag {tag}")))?;
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Delivery { tag, body });
        }
        Ok(())
    }
}

// ── Spool-directory queue ─────────────────────────────────────────────────────

const INFLIGHT_SUFFIX: &str = ".inflight";
/// An `.inflight` entry nobody owns for this long is considered abandoned
/// (e.g. the claimer crashed) and is returned to the spool.
const STALE_INFLIGHT: Duration = Duration::from_secs(60);

/// Queue backed by a spool directory: one JSON file per message, claimed by
/// renaming to `<name>.inflight`. Ack deletes the file, nack renames it
/// back. Lets the worker run end-to-end without a broker.
pub struct DirQueue {
    dir: PathBuf,
    inflight: Mutex<HashMap<u64, PathBuf>>,
    next_tag: AtomicU64,
    poll_interval: Duration,
}

impl DirQueue {
    /// Open a spool directory, recovering any `.inflight` leftovers from a
    /// previous run.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("spool directory unavailable: {e}")))?;

        let queue = Self {
            dir,
            inflight: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            poll_interval: Duration::from_millis(250),
        };
        queue.recover_inflight(Duration::ZERO)?;
        Ok(queue)
    }

    /// Drop a message file into the spool.
    pub async fn publish(&self, request: &UploadRequest) -> Result<()> {
        let name = format!(
            "{:020}_{}.json",
            self.next_tag.fetch_add(1, Ordering::SeqCst),
            std::process::id()
        );
        tokio::fs::write(self.dir.join(name), request.to_body()).await?;
        Ok(())
    }

    /// Rename abandoned `.inflight` entries back into the spool.
    fn recover_inflight(&self, min_age: Duration) -> Result<()> {
        let owned = self.inflight.lock();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(original) = name.strip_suffix(INFLIGHT_SUFFIX) else {
                continue;
            };
            if owned.values().any(|p| p == &path) {
                continue;
            }
            let age = path
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .unwrap_or(Duration::ZERO);
            if age >= min_age {
                warn!(message = original, "recovering abandoned in-flight message");
                let _ = std::fs::rename(&path, self.dir.join(original));
            }
        }
        Ok(())
    }

    fn claim_next(&self) -> Result<Option<Delivery>> {
        let mut names: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| !n.ends_with(INFLIGHT_SUFFIX))
            .collect();
        names.sort();

        for name in names {
            let path = self.dir.join(&name);
            let claimed = self.dir.join(format!("{name}{INFLIGHT_SUFFIX}"));
            if std::fs::rename(&path, &claimed).is_err() {
                continue;
            }
            let body = std::fs::read(&claimed)?;
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
            self.inflight.lock().insert(tag, claimed);
            debug!(message = name, tag, "claimed spool message");
            return Ok(Some(Delivery {
                tag,
                body: Bytes::from(body),
            }));
        }
        Ok(None)
    }
}

#[async_trait]
impl WorkQueue for DirQueue {
    async fn next(&self) -> Result<Option<Delivery>> {
        loop {
            if let Some(delivery) = self.claim_next()? {
                return Ok(Some(delivery));
            }
            self.recover_inflight(STALE_INFLIGHT)?;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        let path = self
            .inflight
            .lock()
            .remove(&tag)
            .ok_or_else(|| Error::internal(format!("unknown delivery tag {tag}")))?;
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    async fn nack_requeue(&self, tag: u64) -> Result<()> {
        let path = self
            .inflight
            .lock()
            .remove(&tag)
            .ok_or_else(|| Error::internal(format!("unknown delivery tag {tag}")))?;
        let original = path
            .to_str()
            .and_then(|p| p.strip_suffix(INFLIGHT_SUFFIX))
            .map(PathBuf::from)
            .ok_or_else(|| Error::internal("malformed in-flight path"))?;
        tokio::fs::rename(path, original).await?;
        Ok(())
    }
}
