/*!
 * Transfer manifests: the durable record that makes resume possible
 *
 * One JSON file per task under `$HOME/.ferry/transfer/` (overridable via
 * `FERRY_TRANSFER_DIR`). Saves are atomic (tmp + rename, parent directory
 * fsynced); malformed files are quarantined rather than deleted; unknown
 * JSON fields survive a load/save round trip.
 */

use crate::chunk::{plan_is_valid, Chunk, ChunkStatus};
use crate::config::TransferConfig;
use crate::endpoint::Endpoint;
use crate::error::{FerryError, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const MANIFEST_VERSION: &str = "2.0";

/// Environment override for the manifest directory
pub const TRANSFER_DIR_ENV: &str = "FERRY_TRANSFER_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Verifying,
    Paused,
    Completed,
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

/// The config subset persisted with the plan. Resume compares against this
/// rather than the live CLI flags; unknown keys written by newer versions
/// are preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    pub parallel: usize,
    pub aria2: bool,
    pub chunk_size: u64,
    #[serde(default)]
    pub split: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ManifestConfig {
    pub fn from_config(config: &TransferConfig, effective_chunk_size: u64) -> Self {
        Self {
            parallel: config.parallel,
            aria2: config.aria2,
            chunk_size: effective_chunk_size,
            split: config.split,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub task_id: String,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub file_size: u64,
    pub file_mtime: f64,
    #[serde(default)]
    pub file_hash: Option<String>,
    pub chunks: Vec<Chunk>,
    pub config: ManifestConfig,
    #[serde(default)]
    pub status: TaskStatus,
    pub created_at: f64,
    pub updated_at: f64,
    /// Fields written by other versions of the tool, carried verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Seconds since the epoch as a float, matching the on-disk format
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl Manifest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: String,
        src: Endpoint,
        dst: Endpoint,
        file_size: u64,
        file_mtime: f64,
        chunks: Vec<Chunk>,
        config: ManifestConfig,
    ) -> Self {
        let now = unix_now();
        Self {
            version: MANIFEST_VERSION.to_string(),
            task_id,
            src,
            dst,
            file_size,
            file_mtime,
            file_hash: None,
            chunks,
            config,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            extra: serde_json::Map::new(),
        }
    }

    /// Validate this manifest against the current source file and endpoint
    /// pair. `Err` carries the reason, surfaced as a `StaleManifest` log.
    pub fn matches(
        &self,
        src: &Endpoint,
        dst: &Endpoint,
        file_size: u64,
        file_mtime: f64,
    ) -> std::result::Result<(), String> {
        if self.version != MANIFEST_VERSION {
            return Err(format!("unsupported manifest version {}", self.version));
        }
        if self.src.canonical_key() != src.canonical_key()
            || self.dst.canonical_key() != dst.canonical_key()
        {
            return Err("endpoints do not match".into());
        }
        if self.file_size != file_size {
            return Err(format!(
                "file size changed: {} -> {}",
                self.file_size, file_size
            ));
        }
        // Tolerate one second of filesystem mtime rounding
        if (self.file_mtime - file_mtime).abs() > 1.0 {
            return Err(format!(
                "file mtime changed: {} -> {}",
                self.file_mtime, file_mtime
            ));
        }
        if !plan_is_valid(&self.chunks, self.file_size) {
            return Err("chunk plan violates invariants".into());
        }
        Ok(())
    }

    /// Reset in-flight and failed chunks to pending. Bytes written for an
    /// interrupted chunk are irrelevant: the chunk re-transfers whole.
    pub fn reset_incomplete(&mut self) {
        for chunk in &mut self.chunks {
            if matches!(chunk.status, ChunkStatus::InProgress | ChunkStatus::Failed) {
                chunk.status = ChunkStatus::Pending;
                chunk.error = None;
            }
        }
    }

    pub fn pending_indices(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .filter(|c| !c.is_complete())
            .map(|c| c.index)
            .collect()
    }

    pub fn completed_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.is_complete())
            .map(|c| c.size)
            .sum()
    }

    pub fn is_complete(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(|c| c.is_complete())
    }
}

/// File-based manifest storage
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    /// Open the store at the default location (`$HOME/.ferry/transfer`,
    /// overridden by `FERRY_TRANSFER_DIR`), creating it if needed.
    pub fn open_default() -> Result<Self> {
        let dir = match std::env::var_os(TRANSFER_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or_else(|| {
                    FerryError::Config("could not determine home directory".into())
                })?
                .join(".ferry")
                .join("transfer"),
        };
        Self::open(dir)
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }

    fn lock_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json.lock", task_id))
    }

    /// Load a manifest. Missing files yield `None`; malformed files are
    /// moved aside to `<id>.json.corrupt` (never silently deleted) and also
    /// yield `None`.
    pub fn load(&self, task_id: &str) -> Result<Option<Manifest>> {
        let path = self.manifest_path(task_id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<Manifest>(&data) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) => {
                let quarantine = path.with_extension("json.corrupt");
                warn!(
                    manifest = %path.display(),
                    error = %e,
                    "manifest is malformed, moving aside"
                );
                fs::rename(&path, &quarantine)?;
                Ok(None)
            }
        }
    }

    /// Save atomically: write `<id>.json.tmp`, flush, rename over the
    /// final name, then fsync the directory so the rename is durable.
    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        let path = self.manifest_path(&manifest.task_id);
        let tmp = path.with_extension("json.tmp");

        let data = serde_json::to_vec_pretty(manifest)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        sync_dir(&self.dir);
        Ok(())
    }

    /// Idempotent delete
    pub fn cleanup(&self, task_id: &str) -> Result<()> {
        match fs::remove_file(self.manifest_path(task_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate stored task ids
    pub fn list_all(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Take the exclusive per-task lock. Only one engine may run a given
    /// task at a time; contention is an immediate error, not a wait.
    pub fn lock(&self, task_id: &str) -> Result<TaskLock> {
        let path = self.lock_path(task_id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| FerryError::ConcurrentTransfer(path.clone()))?;
        debug!(lock = %path.display(), "acquired task lock");
        Ok(TaskLock { file, path })
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Exclusive lock on a task, released (and its file removed) on drop
pub struct TaskLock {
    file: File,
    path: PathBuf,
}

impl Drop for TaskLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

/// Single-writer manifest handle with coalesced persistence.
///
/// Every chunk completion must reach disk, but not every completion needs
/// its own fsync: at most one save runs at a time and a dirty bit folds
/// bursts of updates into the next write. Shutdown forces a final save.
pub struct ManifestWriter {
    store: ManifestStore,
    shared: Mutex<Manifest>,
    saving: AtomicBool,
    dirty: AtomicBool,
}

impl ManifestWriter {
    pub fn new(store: ManifestStore, manifest: Manifest) -> Self {
        Self {
            store,
            shared: Mutex::new(manifest),
            saving: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> Manifest {
        self.shared.lock().unwrap().clone()
    }

    /// Mutate the manifest under the lock and stamp `updated_at`.
    pub fn update<R>(&self, f: impl FnOnce(&mut Manifest) -> R) -> R {
        let mut manifest = self.shared.lock().unwrap();
        let result = f(&mut manifest);
        manifest.updated_at = unix_now();
        result
    }

    /// Mark a chunk in progress and charge an attempt. Returns
    /// `(offset, size, attempts)`.
    pub fn begin_chunk(&self, index: u32) -> (u64, u64, u32) {
        self.update(|m| {
            let chunk = &mut m.chunks[index as usize];
            chunk.status = ChunkStatus::InProgress;
            chunk.attempts += 1;
            (chunk.offset, chunk.size, chunk.attempts)
        })
    }

    pub fn complete_chunk(&self, index: u32, sha256: String) {
        self.update(|m| {
            let chunk = &mut m.chunks[index as usize];
            chunk.status = ChunkStatus::Completed;
            chunk.sha256 = Some(sha256);
            chunk.error = None;
        });
        self.persist_coalesced();
    }

    /// Put a chunk back in the queue without charging an attempt (used
    /// when a worker gives the chunk up rather than failing it)
    pub fn requeue_chunk(&self, index: u32) {
        self.update(|m| {
            let chunk = &mut m.chunks[index as usize];
            chunk.status = ChunkStatus::Pending;
        });
    }

    pub fn fail_chunk(&self, index: u32, error: &str) {
        self.update(|m| {
            let chunk = &mut m.chunks[index as usize];
            chunk.status = ChunkStatus::Failed;
            chunk.error = Some(error.to_string());
        });
        self.persist_coalesced();
    }

    pub fn set_status(&self, status: TaskStatus) {
        self.update(|m| m.status = status);
    }

    /// Queue a save. The calling worker either becomes the saver and
    /// drains the dirty bit, or returns immediately knowing the current
    /// saver will pick the change up.
    pub fn persist_coalesced(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        loop {
            if self
                .saving
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            while self.dirty.swap(false, Ordering::SeqCst) {
                let snapshot = self.snapshot();
                if let Err(e) = self.store.save(&snapshot) {
                    warn!(error = %e, "coalesced manifest save failed");
                }
            }
            self.saving.store(false, Ordering::SeqCst);
            // A writer may have dirtied the manifest after the drain loop
            // but before we released the saver slot; reclaim if so.
            if !self.dirty.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Unconditional save, used on startup, shutdown and status changes.
    pub fn persist_now(&self) -> Result<()> {
        self.dirty.store(false, Ordering::SeqCst);
        let snapshot = self.snapshot();
        self.store.save(&snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::plan_chunks;
    use tempfile::tempdir;

    fn sample_manifest(task_id: &str) -> Manifest {
        let config = TransferConfig::default();
        let chunks = plan_chunks(8 * 1024 * 1024, &config);
        Manifest::new(
            task_id.to_string(),
            Endpoint::local("/tmp/src.bin"),
            Endpoint::remote("h", Some("u".into()), 22, "/tmp/dst.bin"),
            8 * 1024 * 1024,
            1_700_000_000.0,
            chunks,
            ManifestConfig::from_config(&config, 4 * 1024 * 1024),
        )
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();
        let manifest = sample_manifest("abc123");

        store.save(&manifest).unwrap();
        let loaded = store.load("abc123").unwrap().unwrap();

        assert_eq!(loaded.task_id, "abc123");
        assert_eq!(loaded.version, MANIFEST_VERSION);
        assert_eq!(loaded.chunks.len(), 2);
        assert_eq!(loaded.file_size, 8 * 1024 * 1024);

        // No tmp file left behind
        assert!(!store.manifest_path("abc123").with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_malformed_manifest_quarantined() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();
        fs::write(store.manifest_path("bad"), b"{ truncated").unwrap();

        assert!(store.load("bad").unwrap().is_none());
        assert!(!store.manifest_path("bad").exists());
        assert!(dir.path().join("bad.json.corrupt").exists());
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();
        let mut manifest = sample_manifest("fwd");
        manifest
            .extra
            .insert("x_future".into(), serde_json::json!({"a": 1}));
        store.save(&manifest).unwrap();

        let loaded = store.load("fwd").unwrap().unwrap();
        assert_eq!(loaded.extra.get("x_future"), Some(&serde_json::json!({"a": 1})));

        // And it survives a second save
        store.save(&loaded).unwrap();
        let raw = fs::read_to_string(store.manifest_path("fwd")).unwrap();
        assert!(raw.contains("x_future"));
    }

    #[test]
    fn test_matches_detects_drift() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();
        let manifest = sample_manifest("drift");
        let src = manifest.src.clone();
        let dst = manifest.dst.clone();

        assert!(manifest.matches(&src, &dst, manifest.file_size, manifest.file_mtime).is_ok());

        // Within mtime tolerance
        assert!(manifest
            .matches(&src, &dst, manifest.file_size, manifest.file_mtime + 0.5)
            .is_ok());

        // Size drift
        assert!(manifest.matches(&src, &dst, manifest.file_size + 1, manifest.file_mtime).is_err());
        // Mtime drift beyond tolerance
        assert!(manifest
            .matches(&src, &dst, manifest.file_size, manifest.file_mtime + 2.0)
            .is_err());
        // Different destination
        let other = Endpoint::remote("h2", None, 22, "/elsewhere");
        assert!(manifest.matches(&src, &other, manifest.file_size, manifest.file_mtime).is_err());
    }

    #[test]
    fn test_matches_rejects_old_version() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();
        let mut manifest = sample_manifest("v1");
        manifest.version = "1.0".into();
        let src = manifest.src.clone();
        let dst = manifest.dst.clone();
        assert!(manifest.matches(&src, &dst, manifest.file_size, manifest.file_mtime).is_err());
    }

    #[test]
    fn test_cleanup_idempotent() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();
        let manifest = sample_manifest("gone");
        store.save(&manifest).unwrap();

        store.cleanup("gone").unwrap();
        assert!(store.load("gone").unwrap().is_none());
        // Second delete is fine
        store.cleanup("gone").unwrap();
    }

    #[test]
    fn test_list_all() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();
        store.save(&sample_manifest("aaa")).unwrap();
        store.save(&sample_manifest("bbb")).unwrap();
        fs::write(dir.path().join("noise.txt"), b"x").unwrap();

        assert_eq!(store.list_all().unwrap(), vec!["aaa", "bbb"]);
    }

    #[test]
    fn test_lock_exclusive() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();

        let lock = store.lock("task").unwrap();
        match store.lock("task") {
            Err(FerryError::ConcurrentTransfer(_)) => {}
            other => panic!("expected ConcurrentTransfer, got {:?}", other.map(|_| ())),
        }
        drop(lock);
        // Released on drop
        store.lock("task").unwrap();
    }

    #[test]
    fn test_reset_incomplete() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();
        let mut manifest = sample_manifest("reset");
        manifest.chunks[0].status = ChunkStatus::InProgress;
        manifest.chunks[1].status = ChunkStatus::Completed;

        manifest.reset_incomplete();
        assert_eq!(manifest.chunks[0].status, ChunkStatus::Pending);
        assert_eq!(manifest.chunks[1].status, ChunkStatus::Completed);
        assert_eq!(manifest.pending_indices(), vec![0]);
    }

    #[test]
    fn test_writer_coalesced_saves_land() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();
        let manifest = sample_manifest("writer");
        let writer = ManifestWriter::new(store.clone(), manifest);

        writer.begin_chunk(0);
        writer.complete_chunk(0, "d".repeat(64));
        writer.persist_now().unwrap();

        let loaded = store.load("writer").unwrap().unwrap();
        assert!(loaded.chunks[0].is_complete());
        assert_eq!(loaded.chunks[0].attempts, 1);
        assert_eq!(loaded.chunks[0].sha256.as_deref(), Some(&"d".repeat(64)[..]));
    }
}
