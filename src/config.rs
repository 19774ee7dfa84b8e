//! Kernel configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Values are checked once by [`KernelConfig::validate`] before the kernel
//! builds any state from them.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Smallest object table the handle permutation supports.
pub const MIN_TABLE_SIZE: usize = 128;

/// Largest object table the handle permutation supports.
pub const MAX_TABLE_SIZE: usize = 65536;

/// Tunables for a [`crate::Kernel`] instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Number of object-table slots allocated at start-up. Power of two.
    pub initial_table_size: usize,
    /// Hard cap on table growth. Power of two, at least `initial_table_size`.
    pub max_table_size: usize,
    /// Iterations spent spinning on a busy object before sleeping.
    pub wait_spin_count: u32,
    /// Total wait iterations before a busy object yields a timeout.
    pub wait_max_iterations: u32,
    /// Upper bound on a single backoff sleep, in milliseconds.
    pub wait_sleep_cap_ms: u64,
    /// Try to lock object memory into RAM.
    pub lock_pages: bool,
    /// Largest instance block a single object may request.
    pub max_alloc_size: usize,
    /// Run the kernel mechanism self-test during `Kernel::init`.
    pub run_self_test: bool,
    /// Maximum number of deferred (reentrant) messages held at once.
    pub max_queue_len: usize,
    /// Number of audit records kept in memory. Older records are dropped.
    pub audit_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            initial_table_size: 1024,
            max_table_size: 16384,
            wait_spin_count: 10,
            wait_max_iterations: 200,
            wait_sleep_cap_ms: 20,
            lock_pages: true,
            max_alloc_size: 8192,
            run_self_test: true,
            max_queue_len: 256,
            audit_capacity: 4096,
        }
    }
}

impl KernelConfig {
    /// Parse a config from a JSON document.
    pub fn from_json(json: &str) -> KernelResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            log::warn!("rejecting kernel config: {e}");
            KernelError::Config
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> KernelResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            log::warn!("cannot read kernel config {}: {e}", path.as_ref().display());
            KernelError::Config
        })?;
        Self::from_json(&text)
    }

    /// Reject configurations the kernel cannot honour.
    pub fn validate(&self) -> KernelResult<()> {
        let table_ok = |size: usize| {
            size.is_power_of_two() && (MIN_TABLE_SIZE..=MAX_TABLE_SIZE).contains(&size)
        };
        if !table_ok(self.initial_table_size)
            || !table_ok(self.max_table_size)
            || self.max_table_size < self.initial_table_size
        {
            return Err(KernelError::Config);
        }
        if self.wait_max_iterations == 0 || self.wait_spin_count > self.wait_max_iterations {
            return Err(KernelError::Config);
        }
        if self.max_alloc_size < crate::alloc::MIN_ALLOC_SIZE || self.max_queue_len == 0 {
            return Err(KernelError::Config);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(KernelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = KernelConfig::from_json(r#"{ "initial_table_size": 256 }"#).unwrap();
        assert_eq!(config.initial_table_size, 256);
        assert_eq!(config.max_table_size, KernelConfig::default().max_table_size);
    }

    #[test]
    fn test_rejects_bad_table_sizes() {
        // 1. Not a power of two.
        assert_eq!(
            KernelConfig::from_json(r#"{ "initial_table_size": 1000 }"#),
            Err(KernelError::Config)
        );
        // 2. Max smaller than initial.
        assert_eq!(
            KernelConfig::from_json(r#"{ "initial_table_size": 512, "max_table_size": 256 }"#),
            Err(KernelError::Config)
        );
        // 3. Below the smallest permutation.
        assert_eq!(
            KernelConfig::from_json(r#"{ "initial_table_size": 64 }"#),
            Err(KernelError::Config)
        );
    }

    #[test]
    fn test_rejects_unknown_fields() {
        assert_eq!(
            KernelConfig::from_json(r#"{ "table_size": 256 }"#),
            Err(KernelError::Config)
        );
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("hexkernel-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "lock_pages": false, "audit_capacity": 16 }"#).unwrap();
        let config = KernelConfig::from_file(&path);
        let _ = std::fs::remove_file(&path);

        let config = config.unwrap();
        assert!(!config.lock_pages);
        assert_eq!(config.audit_capacity, 16);
        assert_eq!(
            KernelConfig::from_file(std::env::temp_dir().join("hexkernel-no-such-config.json")),
            Err(KernelError::Config)
        );
    }
}
