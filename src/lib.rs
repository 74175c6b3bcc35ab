/*!
 * Ferry - resumable parallel file transfer over SSH
 *
 * Moves a single file between the local filesystem and a remote host with:
 * - Chunk-level parallelism over a pool of SFTP channels
 * - Resume after interruption via an on-disk manifest
 * - Per-chunk and whole-file SHA-256 verification
 * - Atomic publish: the destination appears only once fully verified
 * - Token-bucket rate limiting and an aggressive "aria2" profile
 */

pub mod chunk;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod progress;
pub mod ratelimit;
pub mod route;
pub mod service;
pub mod session;
pub mod verify;

// Re-export commonly used types for convenience
pub use chunk::{plan_chunks, Chunk, ChunkStatus};
pub use config::{parse_size, TransferConfig};
pub use endpoint::{parse_endpoint, task_id, Endpoint};
pub use engine::{CancelFlag, TransferEngine};
pub use error::{FerryError, Result};
pub use manifest::{Manifest, ManifestStore, TaskStatus};
pub use service::{TransferResult, TransferService};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
