//! Configuration types for CAFIO
//!
//! The canonical configuration shape: every knob is passed once at
//! initialization, no environment sniffing inside components.

use crate::types::ChainMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Hard ceiling on container size for format compatibility (the footer is a
/// u32 byte length, and remote blob backends reject larger uploads).
pub const MAX_CONTAINER_SIZE_GB: f64 = 32.0;

/// Base port; the worker listens on `HTTP_PORT_BASE + worker_id`.
pub const HTTP_PORT_BASE: u16 = 6700;

/// Worker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identity; selects the catalog worker row and the HTTP port
    pub worker_id: u16,
    /// Which remote blob deployment to ship containers to
    pub chain_mode: ChainMode,
    /// Maximum container size in GB (hard ceiling 32)
    pub caf_max_size_gb: f64,
    /// Inactivity finalization threshold in minutes
    pub caf_timeout_minutes: u64,
    /// Queue prefetch count (1 for the strict single-message guarantee)
    pub prefetch: u16,
    /// Directory for containers-in-flight and the retrieval cache
    pub temp_dir: PathBuf,
    /// Container download deadline in the façade, milliseconds
    pub download_timeout_ms: u64,
    /// Keep downloaded containers after serving instead of deleting them
    pub keep_caf_files: bool,
    /// Pending-message ceiling that triggers batch finalization
    pub batch_ceiling: usize,
    /// Per-stream copy deadline during append, seconds
    pub copy_deadline_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: 1,
            chain_mode: ChainMode::Testnet,
            caf_max_size_gb: 30.0,
            caf_timeout_minutes: 5,
            prefetch: 1,
            temp_dir: std::env::temp_dir(),
            download_timeout_ms: 300_000,
            keep_caf_files: true,
            batch_ceiling: 1_000,
            copy_deadline_secs: 300,
        }
    }
}

impl WorkerConfig {
    /// Validate the configuration, returning a description of the first
    /// problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_id == 0 {
            return Err("worker_id must be a positive integer".to_string());
        }
        if !(self.caf_max_size_gb > 0.0) {
            return Err("caf_max_size_gb must be positive".to_string());
        }
        if self.caf_max_size_gb > MAX_CONTAINER_SIZE_GB {
            return Err(format!(
                "caf_max_size_gb {} exceeds format ceiling of {} GB",
                self.caf_max_size_gb, MAX_CONTAINER_SIZE_GB
            ));
        }
        if self.caf_timeout_minutes == 0 {
            return Err("caf_timeout_minutes must be positive".to_string());
        }
        if self.batch_ceiling == 0 {
            return Err("batch_ceiling must be positive".to_string());
        }
        Ok(())
    }

    /// Deterministic HTTP port for this worker
    #[must_use]
    pub fn http_port(&self) -> u16 {
        HTTP_PORT_BASE + self.worker_id
    }

    /// Container byte budget
    #[must_use]
    pub fn max_container_bytes(&self) -> u64 {
        (self.caf_max_size_gb * 1024.0 * 1024.0 * 1024.0) as u64
    }

    /// Inactivity finalization threshold
    #[must_use]
    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.caf_timeout_minutes * 60)
    }

    /// Container download deadline in the façade
    #[must_use]
    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }

    /// Per-stream copy deadline during append
    #[must_use]
    pub fn copy_deadline(&self) -> Duration {
        Duration::from_secs(self.copy_deadline_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_port(), 6701);
        assert_eq!(config.max_container_bytes(), 30 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_validate_rejects_zero_worker() {
        let config = WorkerConfig {
            worker_id: 0,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_budget() {
        let config = WorkerConfig {
            caf_max_size_gb: 33.0,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fractional_budget() {
        let config = WorkerConfig {
            caf_max_size_gb: 0.5,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.max_container_bytes(), 512 * 1024 * 1024);
    }
}
