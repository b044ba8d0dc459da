//! Core type definitions for CAFIO
//!
//! Validated identifier newtypes, the in-archive member path convention,
//! and the object-store key sanitization rules.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Task identifier as carried in queue messages and HTTP routes.
///
/// Restricted to `[A-Za-z0-9_-]+` so it can be embedded in member paths,
/// catalog keys, and URLs without quoting.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct TaskId(String);

impl TaskId {
    /// Create a new task ID, validating the character set
    pub fn new(id: impl Into<String>) -> Result<Self, TaskIdError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the task ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), TaskIdError> {
        if id.is_empty() {
            return Err(TaskIdError::Empty);
        }
        for c in id.chars() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
                return Err(TaskIdError::InvalidChar(c));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({:?})", self.0)
    }
}

/// Errors that can occur when creating a task ID
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskIdError {
    #[error("task ID cannot be empty")]
    Empty,
    #[error("task ID contains invalid character: {0:?}")]
    InvalidChar(char),
}

/// Logical file path as carried in queue messages and HTTP routes.
///
/// This is the key under which the source object was uploaded and the key
/// the catalog records. Traversal sequences are rejected so the path can be
/// joined onto local directories safely.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct LogicalPath(String);

impl LogicalPath {
    /// Create a new logical path, rejecting traversal attempts
    pub fn new(path: impl Into<String>) -> Result<Self, LogicalPathError> {
        let path = path.into();
        Self::validate(&path)?;
        Ok(Self(path))
    }

    /// Get the path as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(path: &str) -> Result<(), LogicalPathError> {
        if path.is_empty() {
            return Err(LogicalPathError::Empty);
        }
        if path.starts_with('/') {
            return Err(LogicalPathError::Absolute);
        }
        if path.contains("..") {
            return Err(LogicalPathError::Traversal);
        }
        if path.contains('~') {
            return Err(LogicalPathError::HomeReference);
        }
        Ok(())
    }
}

impl fmt::Debug for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalPath({:?})", self.0)
    }
}

/// Errors that can occur when creating a logical path
#[derive(Debug, Clone, thiserror::Error)]
pub enum LogicalPathError {
    #[error("file path cannot be empty")]
    Empty,
    #[error("file path cannot be absolute")]
    Absolute,
    #[error("file path cannot contain '..'")]
    Traversal,
    #[error("file path cannot contain '~'")]
    HomeReference,
}

/// Compose the in-archive member path for a `(task, path)` pair.
///
/// Retrieval reconstructs the same composition to locate a member, so this
/// is the single place the convention lives.
#[must_use]
pub fn member_path(task_id: &str, file_path: &str) -> String {
    format!("{task_id}/{file_path}")
}

/// Which remote blob deployment the worker ships containers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainMode {
    Mainnet,
    Testnet,
}

impl ChainMode {
    /// Namespace prefix under which containers are stored remotely
    #[must_use]
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
        }
    }
}

impl fmt::Display for ChainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

// ── Object-store key sanitization ─────────────────────────────────────────────

/// Characters that pass through sanitization unchanged.
fn is_portable(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-')
}

fn token_for(c: char) -> String {
    match c {
        '+' => "PLUS".to_string(),
        '=' => "EQUALS".to_string(),
        ':' => "COLON".to_string(),
        ' ' => "SPACE".to_string(),
        '?' => "QUESTION".to_string(),
        '&' => "AMP".to_string(),
        '#' => "HASH".to_string(),
        '%' => "PCT".to_string(),
        other => format!("U{:04X}", other as u32),
    }
}

fn char_for(token: &str) -> Option<char> {
    match token {
        "PLUS" => Some('+'),
        "EQUALS" => Some('='),
        "COLON" => Some(':'),
        "SPACE" => Some(' '),
        "QUESTION" => Some('?'),
        "AMP" => Some('&'),
        "HASH" => Some('#'),
        "PCT" => Some('%'),
        _ => {
            let hex = token.strip_prefix('U')?;
            let code = u32::from_str_radix(hex, 16).ok()?;
            char::from_u32(code)
        }
    }
}

/// Rewrite a logical key into the portable form used by the object store.
///
/// Every character outside `[A-Za-z0-9._/-]` becomes a `((TOKEN))` sequence.
/// Since `(` itself is outside the portable set it is always rewritten, so
/// the delimiters never collide with literal input and the mapping is
/// injective. Applied uniformly by producers and consumers so the logical
/// key round-trips.
#[must_use]
pub fn sanitize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        if is_portable(c) {
            out.push(c);
        } else {
            out.push_str("((");
            out.push_str(&token_for(c));
            out.push_str("))");
        }
    }
    out
}

/// Invert [`sanitize_key`]. Returns `None` for byte sequences that are not
/// a valid sanitized key (unterminated or unknown tokens).
#[must_use]
pub fn desanitize_key(key: &str) -> Option<String> {
    let mut out = String::with_capacity(key.len());
    let mut rest = key;
    while let Some(start) = rest.find("((") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("))")?;
        out.push(char_for(&after[..end])?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Some(out)
}
