//! Packing pipeline state machine

use cafio_adapters::{BlobService, Catalog, Delivery, ObjectStore, UploadRequest, WorkQueue};
use cafio_archive::CafWriter;
use cafio_common::{member_path, sanitize_key, Error, WorkerConfig};
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pipeline tuning knobs, derived from the worker configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Hard payload budget per container
    pub max_container_bytes: u64,
    /// Pending-message count that triggers finalization
    pub batch_ceiling: usize,
    /// Finalize whatever is pending after this long without an append
    pub inactivity: Duration,
    /// Per-stream copy deadline during append
    pub copy_deadline: Duration,
    /// Directory for containers-in-flight
    pub temp_dir: PathBuf,
    /// Worker identity recorded on catalog rows
    pub worker_id: u16,
    /// Fixed backoff after a queue receive error
    pub reconnect_backoff: Duration,
}

impl From<&WorkerConfig> for PipelineConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            max_container_bytes: config.max_container_bytes(),
            batch_ceiling: config.batch_ceiling,
            inactivity: config.inactivity(),
            copy_deadline: config.copy_deadline(),
            temp_dir: config.temp_dir.clone(),
            worker_id: config.worker_id,
            reconnect_backoff: Duration::from_secs(5),
        }
    }
}

/// One message whose bytes are already in the in-flight container and whose
/// ack is deferred until the container ships.
struct Pending {
    tag: u64,
    request: UploadRequest,
}

/// The in-flight container plus its deferred acknowledgements.
struct Batch {
    writer: CafWriter,
    pending: Vec<Pending>,
}

#[derive(Default)]
struct InflightState {
    batch: Option<Batch>,
    /// When the inactivity predicate fires. Armed when a writer is created
    /// and re-armed only on successful appends; rejected or failing
    /// deliveries leave it untouched. `None` while no writer is open.
    append_deadline: Option<Instant>,
    /// Blocks new appends while a handoff is in progress.
    uploading: bool,
}

/// Queue-driven batch packer. One instance per worker; at most one append
/// runs at any instant, enforced by the in-flight mutex regardless of the
/// queue prefetch setting.
pub struct PackingPipeline {
    config: PipelineConfig,
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn ObjectStore>,
    blob: Arc<dyn BlobService>,
    catalog: Arc<dyn Catalog>,
    inflight: Mutex<InflightState>,
}

impl PackingPipeline {
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn ObjectStore>,
        blob: Arc<dyn BlobService>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            blob,
            catalog,
            inflight: Mutex::new(InflightState::default()),
        }
    }

    /// Consume the queue until `shutdown` resolves or the queue closes.
    ///
    /// On shutdown the in-flight container is discarded and its pending
    /// messages are returned to the queue; on queue close the pending batch
    /// is finalized first.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        info!(
            budget = self.config.max_container_bytes,
            ceiling = self.config.batch_ceiling,
            "packing pipeline started"
        );

        loop {
            // The inactivity deadline is re-armed only by successful appends
            // (and by writer creation), never by rejected deliveries, so a
            // flood of bad messages cannot hold a finished batch open.
            let deadline = self.inflight.lock().await.append_deadline;

            tokio::select! {
                () = &mut shutdown => {
                    self.abort_inflight().await;
                    break;
                }
                // Inactivity: finalize whatever is pending. Unarmed (and
                // therefore a no-op) when no writer is open.
                () = wait_for_inactivity(deadline) => {
                    let mut state = self.inflight.lock().await;
                    if state.batch.is_some() {
                        debug!("inactivity threshold reached, finalizing batch");
                        self.finalize_open_batch(&mut state).await;
                    }
                }
                next = self.queue.next() => {
                    match next {
                        Ok(Some(delivery)) => self.handle_delivery(delivery).await,
                        Ok(None) => {
                            info!("queue closed, draining pending batch");
                            let mut state = self.inflight.lock().await;
                            self.finalize_open_batch(&mut state).await;
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "queue receive failed, backing off");
                            tokio::time::sleep(self.config.reconnect_backoff).await;
                        }
                    }
                }
            }
        }

        info!("packing pipeline stopped");
    }

    /// Consume until the queue closes.
    pub async fn run(self: Arc<Self>) {
        self.run_until(std::future::pending()).await;
    }

    fn arm_inactivity(&self, state: &mut InflightState) {
        state.append_deadline = Some(Instant::now() + self.config.inactivity);
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let request = match UploadRequest::parse(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                warn!(tag = delivery.tag, error = %e, "rejecting malformed queue message");
                self.nack(delivery.tag).await;
                return;
            }
        };

        let mut state = self.inflight.lock().await;
        if state.uploading {
            // Handoff in progress; do not buffer in memory.
            self.nack(delivery.tag).await;
            return;
        }

        if state.batch.is_none() {
            match self.open_batch().await {
                Ok(batch) => {
                    state.batch = Some(batch);
                    self.arm_inactivity(&mut state);
                }
                Err(e) => {
                    error!(error = %e, "failed to open container");
                    self.nack(delivery.tag).await;
                    return;
                }
            }
        }

        let member = member_path(&request.task_id, &request.file_path);
        let key = sanitize_key(&request.file_path);
        let (stream, declared_len) = match self.store.open_stream(&key).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(member, error = %e, "failed to open source stream");
                self.nack(delivery.tag).await;
                return;
            }
        };

        let batch = state.batch.as_mut().expect("batch is open");
        match batch.writer.append_stream(&member, stream, declared_len).await {
            Ok(true) => {
                batch.pending.push(Pending {
                    tag: delivery.tag,
                    request,
                });
                let at_ceiling = batch.pending.len() >= self.config.batch_ceiling;
                self.arm_inactivity(&mut state);
                if at_ceiling {
                    debug!("batch ceiling reached, finalizing");
                    self.finalize_open_batch(&mut state).await;
                }
            }
            Ok(false) => {
                debug!(member, declared_len, "container full, rolling over");
                self.finalize_open_batch(&mut state).await;
                self.append_to_fresh_container(&mut state, delivery.tag, request)
                    .await;
            }
            Err(e) => {
                error!(member, error = %e, "append failed, discarding container");
                state.append_deadline = None;
                if let Some(batch) = state.batch.take() {
                    self.discard_batch(batch, Some(delivery.tag)).await;
                }
            }
        }
    }

    /// Redirect a message that hit the capacity limit onto a new container.
    /// Its first stream is already consumed and must be re-obtained.
    async fn append_to_fresh_container(
        &self,
        state: &mut InflightState,
        tag: u64,
        request: UploadRequest,
    ) {
        let mut batch = match self.open_batch().await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "failed to open container");
                self.nack(tag).await;
                return;
            }
        };

        let member = member_path(&request.task_id, &request.file_path);
        let key = sanitize_key(&request.file_path);
        let (stream, declared_len) = match self.store.open_stream(&key).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(member, error = %e, "failed to re-open source stream");
                self.nack(tag).await;
                self.discard_batch(batch, None).await;
                return;
            }
        };

        match batch.writer.append_stream(&member, stream, declared_len).await {
            Ok(true) => {
                batch.pending.push(Pending { tag, request });
                state.batch = Some(batch);
                self.arm_inactivity(state);
            }
            Ok(false) => {
                warn!(
                    member,
                    declared_len,
                    budget = self.config.max_container_bytes,
                    "single file exceeds container budget"
                );
                self.nack(tag).await;
                self.discard_batch(batch, None).await;
            }
            Err(e) => {
                error!(member, error = %e, "append failed, discarding container");
                self.discard_batch(batch, Some(tag)).await;
            }
        }
    }

    async fn open_batch(&self) -> cafio_common::Result<Batch> {
        let path = self
            .config
            .temp_dir
            .join(format!("inflight_{}.caf", Uuid::new_v4()));
        let writer = CafWriter::create(Some(path), self.config.max_container_bytes)
            .await?
            .with_copy_deadline(self.config.copy_deadline);
        Ok(Batch {
            writer,
            pending: Vec::new(),
        })
    }

    /// Finalize, ship, index, and ack the open batch, returning to Idle.
    async fn finalize_open_batch(&self, state: &mut InflightState) {
        state.append_deadline = None;
        let Some(batch) = state.batch.take() else {
            return;
        };
        if batch.pending.is_empty() {
            self.discard_batch(batch, None).await;
            return;
        }

        state.uploading = true;
        self.handoff(batch).await;
        state.uploading = false;
    }

    async fn handoff(&self, mut batch: Batch) {
        let members = batch.writer.member_count();
        let payload = batch.writer.payload_len();

        let path = match batch.writer.finalize().await {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, "container finalize failed");
                self.discard_batch(batch, None).await;
                return;
            }
        };

        let name = format!("batch_{}.caf", Utc::now().timestamp_millis());
        match self.ship_and_index(&name, &path, &batch.pending).await {
            Ok(()) => {
                for pending in &batch.pending {
                    self.ack(pending.tag).await;
                }
                info!(container = name, members, payload, "batch shipped");
            }
            Err(e) => {
                error!(container = name, error = %e, "handoff failed, requeueing batch");
                for pending in &batch.pending {
                    self.nack(pending.tag).await;
                }
            }
        }

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "failed to remove local container");
        }
    }

    /// Upload the container and insert one catalog row per pending message.
    ///
    /// Acks happen only after both succeed. Rows inserted before a failure
    /// stay behind; the requeue is the recovery mechanism, and re-inserts of
    /// those rows surface as conflicts which are logged and skipped.
    async fn ship_and_index(
        &self,
        name: &str,
        path: &std::path::Path,
        pending: &[Pending],
    ) -> cafio_common::Result<()> {
        self.blob
            .put_container(name, path)
            .await
            .map_err(|e| Error::PutFailed(e.to_string()))?;

        for entry in pending {
            let result = self
                .catalog
                .insert(
                    &entry.request.task_id,
                    &entry.request.file_path,
                    name,
                    self.config.worker_id,
                )
                .await;
            match result {
                Ok(()) => {}
                Err(Error::Conflict(key)) => {
                    warn!(key, "catalog row already present, skipping insert");
                }
                Err(e) => return Err(Error::IndexInsertFailed(e.to_string())),
            }
        }
        Ok(())
    }

    /// Abort a batch: close the writer, delete the residual file, and nack
    /// its pending messages (plus `extra_tag`, the message that poisoned it).
    async fn discard_batch(&self, mut batch: Batch, extra_tag: Option<u64>) {
        let path = batch.writer.path().to_path_buf();
        batch.writer.cleanup().await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "failed to remove discarded container");
        }
        for pending in &batch.pending {
            self.nack(pending.tag).await;
        }
        if let Some(tag) = extra_tag {
            self.nack(tag).await;
        }
    }

    async fn abort_inflight(&self) {
        let mut state = self.inflight.lock().await;
        state.append_deadline = None;
        if let Some(batch) = state.batch.take() {
            info!(
                pending = batch.pending.len(),
                "shutdown: discarding in-flight container"
            );
            self.discard_batch(batch, None).await;
        }
    }

    async fn ack(&self, tag: u64) {
        if let Err(e) = self.queue.ack(tag).await {
            error!(tag, error = %e, "ack failed");
        }
    }

    async fn nack(&self, tag: u64) {
        if let Err(e) = self.queue.nack_requeue(tag).await {
            error!(tag, error = %e, "nack failed");
        }
    }
}

/// Sleep until the inactivity deadline; never resolves when it is unarmed.
async fn wait_for_inactivity(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cafio_adapters::{
        ByteStream, FlakyBlobService, FsBlobService, MemoryCatalog, MemoryObjectStore, MemoryQueue,
    };
    use cafio_archive::CafReader;
    use cafio_common::ChainMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    struct Harness {
        queue: Arc<MemoryQueue>,
        store: Arc<MemoryObjectStore>,
        catalog: Arc<MemoryCatalog>,
        shutdown: tokio::sync::watch::Sender<bool>,
        task: Option<tokio::task::JoinHandle<()>>,
        temp: TempDir,
        blob_home: TempDir,
    }

    async fn start(configure: impl FnOnce(&mut PipelineConfig)) -> Harness {
        start_custom(configure, |inner| inner, |store| store as Arc<dyn ObjectStore>).await
    }

    async fn start_custom(
        configure: impl FnOnce(&mut PipelineConfig),
        wrap_blob: impl FnOnce(Arc<dyn BlobService>) -> Arc<dyn BlobService>,
        wrap_store: impl FnOnce(Arc<MemoryObjectStore>) -> Arc<dyn ObjectStore>,
    ) -> Harness {
        let temp = tempdir().unwrap();
        let blob_home = tempdir().unwrap();

        let mut config = PipelineConfig {
            max_container_bytes: 1024 * 1024 * 1024,
            batch_ceiling: 1_000,
            inactivity: Duration::from_millis(200),
            copy_deadline: Duration::from_secs(5),
            temp_dir: temp.path().to_path_buf(),
            worker_id: 1,
            reconnect_backoff: Duration::from_millis(50),
        };
        configure(&mut config);

        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryObjectStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let fs_blob: Arc<dyn BlobService> = Arc::new(
            FsBlobService::new(blob_home.path(), ChainMode::Testnet)
                .await
                .unwrap(),
        );

        let pipeline = Arc::new(PackingPipeline::new(
            config,
            queue.clone(),
            wrap_store(store.clone()),
            wrap_blob(fs_blob),
            catalog.clone(),
        ));

        let (shutdown, rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(pipeline.run_until(async move {
            let mut rx = rx;
            let _ = rx.wait_for(|stop| *stop).await;
        }));

        Harness {
            queue,
            store,
            catalog,
            shutdown,
            task: Some(task),
            temp,
            blob_home,
        }
    }

    impl Harness {
        fn publish(&self, task_id: &str, file_path: &str) -> u64 {
            self.queue.publish(
                UploadRequest {
                    task_id: task_id.into(),
                    file_path: file_path.into(),
                }
                .to_body(),
            )
        }

        fn open_container(&self, name: &str) -> CafReader {
            let mut reader = CafReader::open(self.blob_home.path().join("testnet").join(name));
            reader.load_index().unwrap();
            reader
        }

        /// No containers-in-flight left on disk.
        fn assert_temp_clean(&self) {
            let leftovers: Vec<_> = std::fs::read_dir(self.temp.path())
                .unwrap()
                .filter_map(|e| e.ok())
                .map(|e| e.file_name())
                .collect();
            assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");
        }

        async fn stop(&mut self) {
            let _ = self.shutdown.send(true);
            if let Some(task) = self.task.take() {
                let _ = task.await;
            }
        }
    }

    async fn wait_until(predicate: impl Fn() -> bool, what: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !predicate() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn cycling_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 4) as u8).collect()
    }

    #[tokio::test]
    async fn test_single_small_file_inactivity_finalize() {
        let mut h = start(|_| {}).await;
        h.store.put(sanitize_key("a.bin"), cycling_bytes(1024));
        let tag = h.publish("T1", "a.bin");

        wait_until(|| h.catalog.get("T1", "a.bin").is_some(), "catalog row").await;

        let record = h.catalog.get("T1", "a.bin").unwrap();
        assert!(record.bundle_id.starts_with("batch_"));
        assert!(record.bundle_id.ends_with(".caf"));
        assert_eq!(record.js_worker_id, "1");

        let reader = h.open_container(&record.bundle_id);
        assert_eq!(reader.list().unwrap(), vec!["T1/a.bin"]);
        let span = reader.metadata("T1/a.bin").unwrap().unwrap();
        assert_eq!((span.start_byte, span.end_byte), (0, 1024));
        assert_eq!(reader.extract("T1/a.bin").unwrap().to_vec(), cycling_bytes(1024));

        wait_until(|| h.queue.acked() == vec![tag], "ack").await;
        h.assert_temp_clean();
        h.stop().await;
    }

    #[tokio::test]
    async fn test_two_files_share_one_container() {
        let mut h = start(|_| {}).await;
        h.store.put(sanitize_key("a.bin"), vec![0xAA; 100]);
        h.store.put(sanitize_key("b.bin"), vec![0xBB; 200]);
        h.publish("T1", "a.bin");
        h.publish("T1", "b.bin");

        wait_until(|| h.catalog.record_count() == 2, "catalog rows").await;

        let a = h.catalog.get("T1", "a.bin").unwrap();
        let b = h.catalog.get("T1", "b.bin").unwrap();
        assert_eq!(a.bundle_id, b.bundle_id);

        let reader = h.open_container(&a.bundle_id);
        let span = reader.metadata("T1/b.bin").unwrap().unwrap();
        assert_eq!((span.start_byte, span.end_byte), (100, 300));
        assert_eq!(reader.extract("T1/b.bin").unwrap().to_vec(), vec![0xBB; 200]);
        assert_eq!(reader.payload_len().unwrap(), 300);

        h.stop().await;
    }

    #[tokio::test]
    async fn test_budget_rollover_splits_containers() {
        let mut h = start(|c| c.max_container_bytes = 1000).await;
        for name in ["a.bin", "b.bin", "c.bin"] {
            h.store.put(sanitize_key(name), vec![0x11; 400]);
            h.publish("T1", name);
        }

        wait_until(|| h.catalog.record_count() == 3, "catalog rows").await;
        wait_until(|| h.queue.acked().len() == 3, "acks").await;

        let a = h.catalog.get("T1", "a.bin").unwrap();
        let b = h.catalog.get("T1", "b.bin").unwrap();
        let c = h.catalog.get("T1", "c.bin").unwrap();
        assert_eq!(a.bundle_id, b.bundle_id);
        assert_ne!(a.bundle_id, c.bundle_id);

        let first = h.open_container(&a.bundle_id);
        assert_eq!(first.list().unwrap().len(), 2);
        let second = h.open_container(&c.bundle_id);
        assert_eq!(second.list().unwrap(), vec!["T1/c.bin"]);

        h.assert_temp_clean();
        h.stop().await;
    }

    #[tokio::test]
    async fn test_count_ceiling_triggers_finalize() {
        // Long inactivity: only the count predicate can finalize here.
        let mut h = start(|c| {
            c.batch_ceiling = 2;
            c.inactivity = Duration::from_secs(60);
        })
        .await;
        h.store.put(sanitize_key("a.bin"), vec![1u8; 10]);
        h.store.put(sanitize_key("b.bin"), vec![2u8; 10]);
        h.publish("T1", "a.bin");
        h.publish("T1", "b.bin");

        wait_until(|| h.queue.acked().len() == 2, "count-triggered acks").await;
        assert_eq!(h.catalog.record_count(), 2);
        h.assert_temp_clean();
        h.stop().await;
    }

    #[tokio::test]
    async fn test_handoff_failure_nacks_then_requeue_recovers() {
        let mut h = start_custom(
            |_| {},
            |inner| Arc::new(FlakyBlobService::new(inner, 1)) as Arc<dyn BlobService>,
            |store| store as Arc<dyn ObjectStore>,
        )
        .await;
        h.store.put(sanitize_key("a.bin"), vec![7u8; 64]);
        let tag = h.publish("T1", "a.bin");

        // First handoff fails, the message is requeued, the retry ships.
        wait_until(|| h.queue.acked() == vec![tag], "recovered ack").await;
        assert_eq!(h.catalog.record_count(), 1);
        h.assert_temp_clean();
        h.stop().await;
    }

    #[tokio::test]
    async fn test_handoff_failure_leaves_nothing_acked() {
        let mut h = start_custom(
            |c| c.inactivity = Duration::from_millis(100),
            |inner| Arc::new(FlakyBlobService::new(inner, usize::MAX)) as Arc<dyn BlobService>,
            |store| store as Arc<dyn ObjectStore>,
        )
        .await;
        h.store.put(sanitize_key("a.bin"), vec![7u8; 64]);
        h.publish("T1", "a.bin");

        // Give it a few finalize attempts.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(h.queue.acked().is_empty());
        assert_eq!(h.catalog.record_count(), 0);
        h.stop().await;
        h.assert_temp_clean();
    }

    /// Object store that misdeclares stream lengths while `lies_left` is
    /// positive, so those appends hit a size mismatch.
    struct MisdeclaringStore {
        inner: Arc<MemoryObjectStore>,
        lies_left: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ObjectStore for MisdeclaringStore {
        async fn open_stream(&self, key: &str) -> cafio_common::Result<(ByteStream, u64)> {
            let (stream, len) = self.inner.open_stream(key).await?;
            if self
                .lies_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Ok((stream, len + 1));
            }
            Ok((stream, len))
        }
    }

    #[tokio::test]
    async fn test_poisoned_append_discards_container_and_requeues() {
        let lies_left = Arc::new(AtomicUsize::new(0));
        let lies = lies_left.clone();
        let mut h = start_custom(
            |_| {},
            |inner| inner,
            move |store| {
                Arc::new(MisdeclaringStore {
                    inner: store,
                    lies_left: lies,
                }) as Arc<dyn ObjectStore>
            },
        )
        .await;

        h.store.put(sanitize_key("good.bin"), vec![1u8; 32]);
        h.store.put(sanitize_key("bad.bin"), vec![2u8; 32]);

        h.publish("T1", "good.bin");
        // The next open_stream lies about the length, poisoning the
        // container that already holds good.bin.
        lies_left.store(1, Ordering::SeqCst);
        h.publish("T1", "bad.bin");

        // Both messages are requeued and eventually ship in a later batch.
        wait_until(|| h.catalog.record_count() == 2, "recovered rows").await;
        wait_until(|| h.queue.acked().len() == 2, "recovered acks").await;
        h.assert_temp_clean();
        h.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_message_is_not_acked() {
        let mut h = start(|c| c.batch_ceiling = 1).await;
        h.store.put(sanitize_key("a.bin"), vec![1u8; 8]);
        let good = h.publish("T1", "a.bin");
        let bad = h.queue.publish(&b"not json"[..]);

        wait_until(|| h.queue.acked().contains(&good), "good ack").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!h.queue.acked().contains(&bad));
        assert_eq!(h.catalog.record_count(), 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_missing_source_object_is_requeued_not_acked() {
        let mut h = start(|c| c.inactivity = Duration::from_millis(100)).await;
        let tag = h.publish("T1", "ghost.bin");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!h.queue.acked().contains(&tag));
        assert_eq!(h.catalog.record_count(), 0);
        h.stop().await;
        h.assert_temp_clean();
    }

    #[tokio::test]
    async fn test_oversized_single_file_is_rejected() {
        let mut h = start(|c| {
            c.max_container_bytes = 100;
            c.inactivity = Duration::from_millis(100);
        })
        .await;
        h.store.put(sanitize_key("big.bin"), vec![9u8; 150]);
        let tag = h.publish("T1", "big.bin");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!h.queue.acked().contains(&tag));
        assert_eq!(h.catalog.record_count(), 0);
        h.stop().await;
        h.assert_temp_clean();
    }

    #[tokio::test]
    async fn test_sanitized_keys_reach_the_object_store() {
        let mut h = start(|c| c.batch_ceiling = 1).await;
        // Producer stored the object under the sanitized key.
        h.store.put("weights((PLUS))v2.bin", vec![5u8; 16]);
        h.publish("T1", "weights+v2.bin");

        wait_until(|| h.catalog.get("T1", "weights+v2.bin").is_some(), "catalog row").await;

        let record = h.catalog.get("T1", "weights+v2.bin").unwrap();
        let reader = h.open_container(&record.bundle_id);
        // The member path keeps the logical name.
        assert!(reader.has("T1/weights+v2.bin").unwrap());
        h.stop().await;
    }

    #[tokio::test]
    async fn test_rejected_messages_do_not_reset_inactivity() {
        let mut h = start(|c| c.inactivity = Duration::from_millis(500)).await;
        h.store.put(sanitize_key("a.bin"), vec![1u8; 16]);
        let good = h.publish("T1", "a.bin");

        // The append has happened once its delivery sits unacked in the
        // pending list.
        wait_until(|| h.queue.unacked_count() == 1, "append").await;
        let appended_at = tokio::time::Instant::now();

        // Malformed deliveries are nacked and requeued immediately, so
        // these three keep the consumer saturated with rejections, far
        // faster than the inactivity threshold, for the rest of the test.
        let junk: Vec<u64> = (0..3).map(|_| h.queue.publish(&b"not json"[..])).collect();

        // Rejections must not re-arm the window: the batch still finalizes
        // once the threshold measured from the last successful append
        // elapses, and not before it.
        wait_until(|| h.queue.acked().contains(&good), "inactivity finalize").await;
        let elapsed = appended_at.elapsed();
        assert!(
            elapsed >= Duration::from_millis(400),
            "finalized before the inactivity threshold: {elapsed:?}"
        );
        assert_eq!(h.catalog.record_count(), 1);
        for tag in &junk {
            assert!(!h.queue.acked().contains(tag));
        }
        h.assert_temp_clean();
        h.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_discards_inflight_without_acking() {
        let mut h = start(|c| c.inactivity = Duration::from_secs(60)).await;
        h.store.put(sanitize_key("a.bin"), vec![1u8; 8]);
        let tag = h.publish("T1", "a.bin");

        // Wait for the append to land in the pending list.
        wait_until(|| h.queue.unacked_count() == 1, "append").await;
        h.stop().await;

        // Nothing acked, nothing indexed, message back on the queue.
        assert!(!h.queue.acked().contains(&tag));
        assert_eq!(h.catalog.record_count(), 0);
        assert_eq!(h.queue.unacked_count(), 0);
        h.assert_temp_clean();
    }
}
