//! Object-store adapter
//!
//! Source bytes arrive as a stream plus a declared length; the packing
//! pipeline never buffers a whole member in memory. Keys handed to
//! `open_stream` are already sanitized by the caller (see
//! `cafio_common::sanitize_key`).

use async_trait::async_trait;
use bytes::Bytes;
use cafio_common::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use tokio::io::AsyncRead;

/// A boxed byte stream yielded by the object store.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Capability set of the object-store backend.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a byte stream for `key`, returning the stream and the declared
    /// object length.
    async fn open_stream(&self, key: &str) -> Result<(ByteStream, u64)>;
}

/// Object store rooted at a local directory. Keys map to relative paths.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn open_stream(&self, key: &str) -> Result<(ByteStream, u64)> {
        let path = self.root.join(key);
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        Ok((Box::new(file), len))
    }
}

/// In-memory object store for tests and local development.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.write().insert(key.into(), data.into());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn open_stream(&self, key: &str) -> Result<(ByteStream, u64)> {
        let data = self
            .objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key.to_string()))?;
        let len = data.len() as u64;
        Ok((Box::new(Cursor::new(data)), len))
    }
}
