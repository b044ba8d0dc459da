//! Request input validation
//!
//! Uniform across the three data endpoints: the task ID is restricted to
//! `[A-Za-z0-9_-]+` and the file path must not traverse outside its tree.
//! Route captures are percent-decoded before they reach these checks, so
//! encoded traversal attempts are caught too.

use crate::error::FacadeError;
use cafio_common::{LogicalPath, TaskId};

pub fn validate_task_id(task_id: &str) -> Result<(), FacadeError> {
    TaskId::new(task_id)
        .map(|_| ())
        .map_err(|_| FacadeError::bad_request("Invalid taskId format"))
}

pub fn validate_file_path(file_path: &str) -> Result<(), FacadeError> {
    LogicalPath::new(file_path)
        .map(|_| ())
        .map_err(|_| FacadeError::bad_request("Invalid filePath format"))
}

/// Validate both route captures, echoing them back in the error envelope.
pub fn validate_request(task_id: &str, file_path: &str) -> Result<(), FacadeError> {
    validate_task_id(task_id).map_err(|e| e.with_context(task_id, file_path))?;
    validate_file_path(file_path).map_err(|e| e.with_context(task_id, file_path))?;
    Ok(())
}
