//! Streaming CAF serializer
//!
//! Append-only: members stream straight to disk while the index accumulates
//! in memory; `finalize` appends the index region and footer. The writer
//! enforces a hard byte budget on the payload region and refuses to reuse a
//! partially written file after a failed append.

use crate::{CafIndex, MemberSpan};
use cafio_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use uuid::Uuid;

/// Hard format ceiling on the payload budget (the footer length field and
/// remote blob limits both assume containers below this).
pub const MAX_BUDGET_BYTES: u64 = 32 * 1024 * 1024 * 1024;

/// Default deadline for draining one member stream.
pub const DEFAULT_COPY_DEADLINE: Duration = Duration::from_secs(300);

const COPY_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    /// A failed append left the payload region partially written; the whole
    /// container must be discarded.
    Poisoned,
    Finalized,
}

/// Streaming serializer producing one CAF container file.
#[derive(Debug)]
pub struct CafWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    payload_len: u64,
    index: CafIndex,
    max_bytes: u64,
    copy_deadline: Duration,
    state: WriterState,
}

impl CafWriter {
    /// Create a writer for `path`, or a unique temp file when `path` is
    /// `None`. `max_bytes` is the hard payload budget, capped at 32 GiB.
    pub async fn create(path: Option<PathBuf>, max_bytes: u64) -> Result<Self> {
        if max_bytes == 0 || max_bytes > MAX_BUDGET_BYTES {
            return Err(Error::Configuration(format!(
                "container budget must be within (0, {MAX_BUDGET_BYTES}] bytes, got {max_bytes}"
            )));
        }

        let path = match path {
            Some(p) => p,
            None => std::env::temp_dir().join(format!("caf_{}.caf", Uuid::new_v4())),
        };

        let file = File::create(&path).await?;
        debug!(path = %path.display(), max_bytes, "created container");

        Ok(Self {
            path,
            file: Some(BufWriter::new(file)),
            payload_len: 0,
            index: CafIndex::default(),
            max_bytes,
            copy_deadline: DEFAULT_COPY_DEADLINE,
            state: WriterState::Open,
        })
    }

    /// Override the per-stream copy deadline.
    #[must_use]
    pub fn with_copy_deadline(mut self, deadline: Duration) -> Self {
        self.copy_deadline = deadline;
        self
    }

    /// Path of the container file being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current payload region length.
    #[must_use]
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// Number of members recorded so far.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.index.files.len()
    }

    /// Configured payload budget.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Payload bytes still available under the budget.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.max_bytes - self.payload_len
    }

    /// Would a member of `len` bytes fit under the budget?
    #[must_use]
    pub fn fits(&self, len: u64) -> bool {
        self.payload_len.saturating_add(len) <= self.max_bytes
    }

    fn check_append(&self, member_path: &str, len: u64) -> Result<bool> {
        match self.state {
            WriterState::Finalized => return Err(Error::UseAfterFinalize),
            WriterState::Poisoned => return Err(Error::WriterPoisoned),
            WriterState::Open => {}
        }
        if len == 0 {
            return Err(Error::validation(format!(
                "empty member not allowed: {member_path}"
            )));
        }
        if self.index.files.contains_key(member_path) {
            return Err(Error::DuplicateMember(member_path.to_string()));
        }
        if !self.fits(len) {
            return Ok(false);
        }
        Ok(true)
    }

    fn record(&mut self, member_path: &str, len: u64) {
        let span = MemberSpan {
            start_byte: self.payload_len,
            end_byte: self.payload_len + len,
        };
        self.index.files.insert(member_path.to_string(), span);
        self.payload_len = span.end_byte;
    }

    /// Append an in-memory buffer as one member.
    ///
    /// Returns `Ok(false)` without touching any state when the member would
    /// exceed the budget.
    pub async fn append_buffer(&mut self, member_path: &str, data: &[u8]) -> Result<bool> {
        if !self.check_append(member_path, data.len() as u64)? {
            return Ok(false);
        }

        let file = self.file.as_mut().ok_or(Error::UseAfterFinalize)?;
        if let Err(e) = file.write_all(data).await {
            self.state = WriterState::Poisoned;
            return Err(e.into());
        }

        self.record(member_path, data.len() as u64);
        Ok(true)
    }

    /// Append one member by draining `reader`, which must yield exactly
    /// `declared_len` bytes.
    ///
    /// Returns `Ok(false)` without touching any state when the member would
    /// exceed the budget. On `SizeMismatch`, `Timeout`, or I/O failure the
    /// payload region is partially written and the writer is poisoned; the
    /// caller must discard the entire container.
    pub async fn append_stream<R>(
        &mut self,
        member_path: &str,
        reader: R,
        declared_len: u64,
    ) -> Result<bool>
    where
        R: AsyncRead + Unpin,
    {
        if !self.check_append(member_path, declared_len)? {
            return Ok(false);
        }

        let deadline = self.copy_deadline;
        let file = self.file.as_mut().ok_or(Error::UseAfterFinalize)?;
        let copy = copy_exact(file, reader, declared_len, member_path);
        match tokio::time::timeout(deadline, copy).await {
            Err(_) => {
                self.state = WriterState::Poisoned;
                warn!(member = member_path, "stream copy exceeded deadline");
                Err(Error::Timeout {
                    seconds: deadline.as_secs(),
                })
            }
            Ok(Err(e)) => {
                self.state = WriterState::Poisoned;
                Err(e)
            }
            Ok(Ok(())) => {
                debug!(
                    member = member_path,
                    len = declared_len,
                    offset = self.payload_len,
                    "appended member"
                );
                self.record(member_path, declared_len);
                Ok(true)
            }
        }
    }

    /// Write the index region and footer, flush, and close.
    ///
    /// The writer is terminal afterwards; any further operation fails with
    /// `UseAfterFinalize`.
    pub async fn finalize(&mut self) -> Result<PathBuf> {
        match self.state {
            WriterState::Finalized => return Err(Error::UseAfterFinalize),
            WriterState::Poisoned => return Err(Error::WriterPoisoned),
            WriterState::Open => {}
        }

        let mut file = self.file.take().ok_or(Error::UseAfterFinalize)?;

        let index_json = serde_json::to_vec(&self.index)
            .map_err(|e| Error::internal(format!("index serialization failed: {e}")))?;
        if index_json.len() as u64 > u64::from(u32::MAX) {
            return Err(Error::internal("index region exceeds u32 length field"));
        }

        file.write_all(&index_json).await?;
        file.write_all(&(index_json.len() as u32).to_le_bytes())
            .await?;
        file.flush().await?;
        file.into_inner().sync_all().await?;

        self.state = WriterState::Finalized;
        debug!(
            path = %self.path.display(),
            payload = self.payload_len,
            index = index_json.len(),
            members = self.index.files.len(),
            "finalized container"
        );
        Ok(self.path.clone())
    }

    /// Flush buffered bytes and close without writing an index.
    ///
    /// Used to abort a writer; the residual file is not a valid container
    /// and the caller is expected to delete it.
    pub async fn cleanup(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
        if self.state == WriterState::Open {
            self.state = WriterState::Poisoned;
        }
    }
}

/// Copy exactly `declared_len` bytes from `reader` into `file`.
///
/// Errors with `SizeMismatch` when the stream ends early or keeps yielding
/// bytes past the declared length.
async fn copy_exact<R>(
    file: &mut BufWriter<File>,
    mut reader: R,
    declared_len: u64,
    member_path: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written: u64 = 0;

    while written < declared_len {
        let want = (declared_len - written).min(COPY_BUF_SIZE as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(Error::SizeMismatch {
                member: member_path.to_string(),
                declared: declared_len,
                actual: written,
            });
        }
        file.write_all(&buf[..n]).await?;
        written += n as u64;
    }

    // The stream must be exhausted at exactly the declared length.
    let n = reader.read(&mut buf[..1]).await?;
    if n != 0 {
        return Err(Error::SizeMismatch {
            member: member_path.to_string(),
            declared: declared_len,
            actual: written + n as u64,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::CafReader;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn caf_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[tokio::test]
    async fn test_append_buffer_and_finalize() {
        let dir = tempdir().unwrap();
        let mut writer = CafWriter::create(Some(caf_path(&dir, "a.caf")), 1024 * 1024)
            .await
            .unwrap();

        assert!(writer.append_buffer("T1/a.bin", b"hello").await.unwrap());
        assert!(writer.append_buffer("T1/b.bin", b"world!").await.unwrap());
        assert_eq!(writer.payload_len(), 11);
        assert_eq!(writer.member_count(), 2);

        let path = writer.finalize().await.unwrap();

        let mut reader = CafReader::open(&path);
        reader.load_index().unwrap();
        assert_eq!(&reader.extract("T1/a.bin").unwrap()[..], b"hello");
        assert_eq!(&reader.extract("T1/b.bin").unwrap()[..], b"world!");
        let meta = reader.metadata("T1/b.bin").unwrap().unwrap();
        assert_eq!(meta.start_byte, 5);
        assert_eq!(meta.end_byte, 11);
    }

    #[tokio::test]
    async fn test_append_stream_exact_length() {
        let dir = tempdir().unwrap();
        let mut writer = CafWriter::create(Some(caf_path(&dir, "a.caf")), 1024)
            .await
            .unwrap();

        let data: Vec<u8> = (0..512u32).map(|i| (i % 4) as u8).collect();
        let ok = writer
            .append_stream("T1/a.bin", Cursor::new(data.clone()), 512)
            .await
            .unwrap();
        assert!(ok);

        let path = writer.finalize().await.unwrap();
        let mut reader = CafReader::open(&path);
        reader.load_index().unwrap();
        assert_eq!(reader.extract("T1/a.bin").unwrap().to_vec(), data);
    }

    #[tokio::test]
    async fn test_budget_refusal_leaves_state_untouched() {
        let dir = tempdir().unwrap();
        let mut writer = CafWriter::create(Some(caf_path(&dir, "a.caf")), 1000)
            .await
            .unwrap();

        assert!(writer.append_buffer("a", &[1u8; 400]).await.unwrap());
        assert!(writer.append_buffer("b", &[2u8; 400]).await.unwrap());

        let before_payload = writer.payload_len();
        let before_members = writer.member_count();
        let ok = writer
            .append_stream("c", Cursor::new(vec![3u8; 400]), 400)
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(writer.payload_len(), before_payload);
        assert_eq!(writer.member_count(), before_members);

        // Writer is still usable after a capacity refusal.
        assert!(writer.append_buffer("d", &[4u8; 200]).await.unwrap());
        writer.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_member_exactly_at_budget() {
        let dir = tempdir().unwrap();
        let mut writer = CafWriter::create(Some(caf_path(&dir, "a.caf")), 1000)
            .await
            .unwrap();
        assert!(writer
            .append_stream("a", Cursor::new(vec![0u8; 1000]), 1000)
            .await
            .unwrap());

        let mut writer2 = CafWriter::create(Some(caf_path(&dir, "b.caf")), 1000)
            .await
            .unwrap();
        assert!(!writer2
            .append_stream("a", Cursor::new(vec![0u8; 1001]), 1001)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_member_rejected_before_write() {
        let dir = tempdir().unwrap();
        let mut writer = CafWriter::create(Some(caf_path(&dir, "a.caf")), 1024)
            .await
            .unwrap();
        assert!(writer.append_buffer("a", b"x").await.unwrap());
        let before = writer.payload_len();

        let err = writer
            .append_stream("a", Cursor::new(vec![0u8; 8]), 8)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateMember(_)));
        assert_eq!(writer.payload_len(), before);

        // Duplicate rejection does not poison the writer.
        assert!(writer.append_buffer("b", b"y").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_member_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = CafWriter::create(Some(caf_path(&dir, "a.caf")), 1024)
            .await
            .unwrap();
        let err = writer.append_buffer("a", b"").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_short_stream_poisons_writer() {
        let dir = tempdir().unwrap();
        let mut writer = CafWriter::create(Some(caf_path(&dir, "a.caf")), 1024)
            .await
            .unwrap();

        let err = writer
            .append_stream("a", Cursor::new(vec![0u8; 10]), 64)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { declared: 64, actual: 10, .. }));

        let err = writer.append_buffer("b", b"x").await.unwrap_err();
        assert!(matches!(err, Error::WriterPoisoned));
        let err = writer.finalize().await.unwrap_err();
        assert!(matches!(err, Error::WriterPoisoned));
    }

    #[tokio::test]
    async fn test_long_stream_poisons_writer() {
        let dir = tempdir().unwrap();
        let mut writer = CafWriter::create(Some(caf_path(&dir, "a.caf")), 1024)
            .await
            .unwrap();

        let err = writer
            .append_stream("a", Cursor::new(vec![0u8; 64]), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { declared: 10, .. }));
        assert!(matches!(
            writer.append_buffer("b", b"x").await.unwrap_err(),
            Error::WriterPoisoned
        ));
    }

    #[tokio::test]
    async fn test_copy_deadline() {
        let dir = tempdir().unwrap();
        let mut writer = CafWriter::create(Some(caf_path(&dir, "a.caf")), 1024)
            .await
            .unwrap()
            .with_copy_deadline(Duration::from_millis(50));

        // A reader that never yields: the write half stays open and silent.
        let (pending, _tx) = tokio::io::simplex(16);
        let err = writer.append_stream("a", pending, 8).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(matches!(
            writer.append_buffer("b", b"x").await.unwrap_err(),
            Error::WriterPoisoned
        ));
    }

    #[tokio::test]
    async fn test_use_after_finalize() {
        let dir = tempdir().unwrap();
        let mut writer = CafWriter::create(Some(caf_path(&dir, "a.caf")), 1024)
            .await
            .unwrap();
        writer.append_buffer("a", b"x").await.unwrap();
        writer.finalize().await.unwrap();

        assert!(matches!(
            writer.append_buffer("b", b"y").await.unwrap_err(),
            Error::UseAfterFinalize
        ));
        assert!(matches!(
            writer.finalize().await.unwrap_err(),
            Error::UseAfterFinalize
        ));
    }

    #[tokio::test]
    async fn test_generated_temp_path() {
        let mut writer = CafWriter::create(None, 1024).await.unwrap();
        assert!(writer.path().to_string_lossy().contains("caf_"));
        writer.append_buffer("a", b"x").await.unwrap();
        let path = writer.finalize().await.unwrap();
        tokio::fs::remove_file(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_budget_ceiling_enforced_at_creation() {
        let err = CafWriter::create(None, MAX_BUDGET_BYTES + 1).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        let err = CafWriter::create(None, 0).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_footer_layout() {
        let dir = tempdir().unwrap();
        let path = caf_path(&dir, "a.caf");
        let mut writer = CafWriter::create(Some(path.clone()), 1024).await.unwrap();
        writer.append_buffer("a", b"abc").await.unwrap();
        writer.finalize().await.unwrap();

        let raw = std::fs::read(&path).unwrap();
        let footer: [u8; 4] = raw[raw.len() - 4..].try_into().unwrap();
        let index_len = u32::from_le_bytes(footer) as usize;
        assert_eq!(raw.len(), 3 + index_len + 4);
        assert_eq!(&raw[..3], b"abc");

        let index: crate::CafIndex =
            serde_json::from_slice(&raw[3..3 + index_len]).unwrap();
        assert_eq!(index.format_version, "1.0");
        assert_eq!(index.files["a"].len(), 3);
    }

    #[tokio::test]
    async fn test_cleanup_aborts_writer() {
        let dir = tempdir().unwrap();
        let path = caf_path(&dir, "a.caf");
        let mut writer = CafWriter::create(Some(path.clone()), 1024).await.unwrap();
        writer.append_buffer("a", b"abc").await.unwrap();
        writer.cleanup().await;
        assert!(matches!(
            writer.finalize().await.unwrap_err(),
            Error::WriterPoisoned
        ));
        // Residual file is not a valid container.
        let mut reader = CafReader::open(&path);
        assert!(reader.load_index().is_err());
    }
}
