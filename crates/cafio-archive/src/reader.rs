//! Random-access CAF deserializer
//!
//! Opens a finalized container, parses footer and index, and slices member
//! byte ranges with positional reads. The reader is synchronous; callers on
//! an async runtime are expected to wrap extraction in `spawn_blocking`.

use crate::{CafIndex, MemberSpan, FOOTER_LEN, FORMAT_VERSION};
use bytes::Bytes;
use cafio_common::{Error, Result};
use serde::Serialize;
use std::fs::File;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

/// Random-access reader over one CAF container file.
pub struct CafReader {
    path: PathBuf,
    file: Option<File>,
    index: Option<CafIndex>,
    file_len: u64,
    payload_len: u64,
}

impl CafReader {
    /// Create a reader for the container at `path`. No I/O happens until
    /// [`load_index`](Self::load_index).
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            index: None,
            file_len: 0,
            payload_len: 0,
        }
    }

    /// Parse footer and index and validate the container layout.
    ///
    /// Must be called before any other operation.
    pub fn load_index(&mut self) -> Result<()> {
        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();

        if file_len < FOOTER_LEN {
            return Err(Error::corrupt(format!(
                "file too short for footer: {file_len} bytes"
            )));
        }

        let mut footer = [0u8; FOOTER_LEN as usize];
        file.read_exact_at(&mut footer, file_len - FOOTER_LEN)?;
        let index_len = u64::from(u32::from_le_bytes(footer));

        if index_len + FOOTER_LEN > file_len {
            return Err(Error::corrupt(format!(
                "index length {index_len} exceeds file length {file_len}"
            )));
        }

        let payload_len = file_len - FOOTER_LEN - index_len;
        let mut index_buf = vec![0u8; index_len as usize];
        file.read_exact_at(&mut index_buf, payload_len)?;

        let index: CafIndex = serde_json::from_slice(&index_buf)
            .map_err(|e| Error::corrupt(format!("index parse failed: {e}")))?;

        if index.format_version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(index.format_version));
        }

        for (member, span) in &index.files {
            if span.start_byte >= span.end_byte || span.end_byte > payload_len {
                return Err(Error::corrupt(format!(
                    "member {member} has invalid range [{}, {}) for payload of {payload_len} bytes",
                    span.start_byte, span.end_byte
                )));
            }
        }

        self.file = Some(file);
        self.index = Some(index);
        self.file_len = file_len;
        self.payload_len = payload_len;
        Ok(())
    }

    fn index(&self) -> Result<&CafIndex> {
        self.index.as_ref().ok_or(Error::IndexNotLoaded)
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(Error::IndexNotLoaded)
    }

    /// Container path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Format version of the loaded container.
    pub fn format_version(&self) -> Result<&str> {
        Ok(&self.index()?.format_version)
    }

    /// Total container file length (payload + index + footer).
    pub fn file_len(&self) -> Result<u64> {
        self.index()?;
        Ok(self.file_len)
    }

    /// Payload region length.
    pub fn payload_len(&self) -> Result<u64> {
        self.index()?;
        Ok(self.payload_len)
    }

    /// All member paths, each exactly once, in unspecified order.
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self.index()?.files.keys().cloned().collect())
    }

    /// Does the container hold `member_path`?
    pub fn has(&self, member_path: &str) -> Result<bool> {
        Ok(self.index()?.files.contains_key(member_path))
    }

    /// Byte range of a member, `None` when absent.
    pub fn metadata(&self, member_path: &str) -> Result<Option<MemberSpan>> {
        Ok(self.index()?.files.get(member_path).copied())
    }

    /// Byte length of a member.
    pub fn member_len(&self, member_path: &str) -> Result<u64> {
        let span = self
            .metadata(member_path)?
            .ok_or_else(|| Error::not_found(member_path.to_string()))?;
        Ok(span.len())
    }

    /// Read a member's bytes with a single positional read.
    pub fn extract(&self, member_path: &str) -> Result<Bytes> {
        let span = self
            .metadata(member_path)?
            .ok_or_else(|| Error::not_found(member_path.to_string()))?;

        let mut buf = vec![0u8; span.len() as usize];
        self.file()?.read_exact_at(&mut buf, span.start_byte)?;
        Ok(Bytes::from(buf))
    }

    /// Extract one member to a filesystem path, creating parent directories.
    pub fn extract_to_path(&self, member_path: &str, output: &Path) -> Result<()> {
        let data = self.extract(member_path)?;
        if let Some(parent) = output.parent() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(output)?;
        std::io::Write::write_all(&mut file, &data)?;
        Ok(())
    }

    /// Extract every member under `dir`, member paths becoming relative
    /// filesystem paths.
    pub fn extract_all(&self, dir: &Path) -> Result<()> {
        let members = self.list()?;
        for member in members {
            let output = dir.join(&member);
            self.extract_to_path(&member, &output)?;
        }
        Ok(())
    }
}

/// Statistics about one container.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveStats {
    pub total_files: usize,
    pub total_size: u64,
    pub format_version: String,
    pub files: Vec<MemberInfo>,
}

/// Per-member entry in [`ArchiveStats`].
#[derive(Debug, Clone, Serialize)]
pub struct MemberInfo {
    pub path: String,
    pub size: u64,
}

/// Gather statistics for the container at `path`.
pub fn archive_stats(path: &Path) -> Result<ArchiveStats> {
    let mut reader = CafReader::open(path);
    reader.load_index()?;

    let mut files: Vec<MemberInfo> = reader
        .index()?
        .files
        .iter()
        .map(|(path, span)| MemberInfo {
            path: path.clone(),
            size: span.len(),
        })
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(ArchiveStats {
        total_files: files.len(),
        total_size: reader.file_len()?,
        format_version: reader.format_version()?.to_string(),
        files,
    })
}

/// Is the file at `path` a structurally valid container this implementation
/// can read?
pub fn validate_archive(path: &Path) -> bool {
    let mut reader = CafReader::open(path);
    reader.load_index().is_ok()
}
