/*!
 * Transfer configuration
 */

use crate::error::{FerryError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Base chunk size in default mode (4 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Chunk size in aria2 mode (1 MiB)
pub const ARIA2_CHUNK_SIZE: u64 = 1024 * 1024;

/// Worker cap in aria2 mode
pub const ARIA2_MAX_PARALLEL: usize = 16;

/// Chunk-count cap in aria2 mode
pub const ARIA2_MAX_CHUNKS: u64 = 4096;

/// Files above this size get scaled chunk sizes in default mode (100 MiB)
pub const LARGE_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Target chunk count for large files in default mode
pub const LARGE_FILE_CHUNK_TARGET: u64 = 256;

/// Options controlling a single transfer.
///
/// Built from CLI flags; a subset is persisted inside the manifest so a
/// resumed run can be compared against the plan that created it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Reuse a valid manifest instead of starting over
    #[serde(default = "default_true")]
    pub resume: bool,

    /// Ignore any existing manifest and destination; start fresh
    #[serde(default)]
    pub force: bool,

    /// Maximum concurrent chunk workers
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    /// Aggressive profile: 1 MiB chunks, worker cap raised to 16
    #[serde(default)]
    pub aria2: bool,

    /// Aria2 chunk-count hint (accepted and persisted; the sizing table wins)
    #[serde(default = "default_split")]
    pub split: u32,

    /// Explicit chunk size in bytes; None selects the size-tier table
    #[serde(default)]
    pub chunk_size: Option<u64>,

    /// Copy source mode bits onto the destination after publish
    #[serde(default)]
    pub preserve_permissions: bool,

    /// Accepted for scp compatibility; currently a no-op
    #[serde(default)]
    pub compress: bool,

    /// Aggregate throughput cap in bytes per second
    #[serde(default)]
    pub limit_rate: Option<u64>,

    /// SSH port used when the endpoint does not specify one
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Per-operation deadline and cancellation drain budget, in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Per-chunk retry budget
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry delay in seconds; doubles per attempt with ±20% jitter
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
}

fn default_true() -> bool {
    true
}

fn default_parallel() -> usize {
    4
}

fn default_split() -> u32 {
    32
}

fn default_ssh_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    1.0
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            resume: true,
            force: false,
            parallel: default_parallel(),
            aria2: false,
            split: default_split(),
            chunk_size: None,
            preserve_permissions: false,
            compress: false,
            limit_rate: None,
            ssh_port: default_ssh_port(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

impl TransferConfig {
    /// Worker-pool ceiling for this profile. The engine additionally bounds
    /// workers by the number of remaining chunks.
    pub fn worker_cap(&self) -> usize {
        if self.aria2 {
            ARIA2_MAX_PARALLEL
        } else {
            self.parallel.max(1)
        }
    }

    /// Per-operation deadline
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallel == 0 {
            return Err(FerryError::Config("--parallel must be at least 1".into()));
        }
        if let Some(size) = self.chunk_size {
            if size == 0 {
                return Err(FerryError::Config("--chunk must be non-zero".into()));
            }
        }
        if let Some(rate) = self.limit_rate {
            if rate == 0 {
                return Err(FerryError::Config("--limit-rate must be non-zero".into()));
            }
        }
        if self.retry_delay <= 0.0 {
            return Err(FerryError::Config("retry delay must be positive".into()));
        }
        Ok(())
    }
}

/// Parse a human size string ("4M", "100K", "1.5GB", "512") into bytes.
pub fn parse_size(input: &str) -> Option<u64> {
    let s = input.trim().to_ascii_uppercase();
    if s.is_empty() {
        return None;
    }

    const UNITS: [(&str, u64); 7] = [
        ("GB", 1024 * 1024 * 1024),
        ("MB", 1024 * 1024),
        ("KB", 1024),
        ("G", 1024 * 1024 * 1024),
        ("M", 1024 * 1024),
        ("K", 1024),
        ("B", 1),
    ];

    let (digits, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|rest| (rest, *mult)))
        .unwrap_or((s.as_str(), 1));

    let value: f64 = digits.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransferConfig::default();
        assert!(config.resume);
        assert!(!config.force);
        assert_eq!(config.parallel, 4);
        assert_eq!(config.ssh_port, 22);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.chunk_size, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_cap() {
        let mut config = TransferConfig::default();
        assert_eq!(config.worker_cap(), 4);

        config.aria2 = true;
        assert_eq!(config.worker_cap(), ARIA2_MAX_PARALLEL);

        config.aria2 = false;
        config.parallel = 0;
        assert_eq!(config.worker_cap(), 1);
    }

    #[test]
    fn test_validate_rejects_zero_parallel() {
        let config = TransferConfig {
            parallel: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("4M"), Some(4 * 1024 * 1024));
        assert_eq!(parse_size("4MB"), Some(4 * 1024 * 1024));
        assert_eq!(parse_size("100k"), Some(100 * 1024));
        assert_eq!(parse_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("1.5K"), Some(1536));
        assert_eq!(parse_size("7B"), Some(7));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("abc"), None);
        assert_eq!(parse_size("-4M"), None);
    }

    #[test]
    fn test_config_roundtrip_with_unknown_defaults() {
        // A minimal JSON blob (as an old manifest might carry) still decodes
        let json = r#"{"parallel": 8, "aria2": true}"#;
        let config: TransferConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.parallel, 8);
        assert!(config.aria2);
        assert!(config.resume);
        assert_eq!(config.timeout, 30);
    }
}
