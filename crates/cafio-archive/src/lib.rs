//! Chunk Archive Format (CAF)
//!
//! A CAF container is a single regular file holding many member files with
//! fast random-access retrieval:
//!
//! | Region  | Contents |
//! | ------- | -------- |
//! | payload | raw concatenation of member bytes in insertion order, no separators |
//! | index   | UTF-8 JSON `{"format_version":"1.0","files":{<path>:{"start_byte","end_byte"}}}` |
//! | footer  | 4 bytes, little-endian u32 = byte length of the index region |
//!
//! `start_byte` is inclusive, `end_byte` exclusive, both relative to the
//! start of the payload region (which is also the start of the file).
//! Member ranges never overlap and their union covers the whole payload.
//!
//! Readers fetch the trailing 4 bytes, then the index, then slice members
//! with positional reads; writers stream members straight to disk and only
//! buffer the index. The format carries no compression, encryption, or
//! checksums.

pub mod reader;
pub mod writer;

pub use reader::{archive_stats, validate_archive, ArchiveStats, CafReader, MemberInfo};
pub use writer::CafWriter;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The only format version this implementation reads or writes.
pub const FORMAT_VERSION: &str = "1.0";

/// Byte length of the trailing footer.
pub const FOOTER_LEN: u64 = 4;

/// Byte range of one member within the payload region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSpan {
    /// Inclusive offset of the first byte
    pub start_byte: u64,
    /// Exclusive offset past the last byte
    pub end_byte: u64,
}

impl MemberSpan {
    /// Byte length of the member
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end_byte - self.start_byte
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end_byte == self.start_byte
    }
}

/// The index region, serialized as JSON between payload and footer.
///
/// `BTreeMap` keeps the encoding stable across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafIndex {
    pub format_version: String,
    pub files: BTreeMap<String, MemberSpan>,
}

impl CafIndex {
    fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            files: BTreeMap::new(),
        }
    }
}

impl Default for CafIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_span_len() {
        let span = MemberSpan {
            start_byte: 100,
            end_byte: 300,
        };
        assert_eq!(span.len(), 200);
        assert!(!span.is_empty());
    }

    #[test]
    fn test_index_json_shape() {
        let mut index = CafIndex::new();
        index.files.insert(
            "T1/a.bin".to_string(),
            MemberSpan {
                start_byte: 0,
                end_byte: 1024,
            },
        );
        let json = serde_json::to_string(&index).unwrap();
        assert!(json.contains("\"format_version\":\"1.0\""));
        assert!(json.contains("\"T1/a.bin\":{\"start_byte\":0,\"end_byte\":1024}"));

        let parsed: CafIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files["T1/a.bin"].len(), 1024);
    }

    #[test]
    fn test_index_encoding_is_stable() {
        let mut a = CafIndex::new();
        let mut b = CafIndex::new();
        for (name, span) in [
            ("z", MemberSpan { start_byte: 0, end_byte: 1 }),
            ("a", MemberSpan { start_byte: 1, end_byte: 2 }),
        ] {
            a.files.insert(name.to_string(), span);
        }
        for (name, span) in [
            ("a", MemberSpan { start_byte: 1, end_byte: 2 }),
            ("z", MemberSpan { start_byte: 0, end_byte: 1 }),
        ] {
            b.files.insert(name.to_string(), span);
        }
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }
}
