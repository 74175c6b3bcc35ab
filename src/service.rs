/*!
 * Transfer orchestration
 *
 * Glues the parser, session layer, planner, manifest store and engine into
 * one `transfer()` call: resolve endpoints, stat the source, adopt or plan
 * a manifest under the task lock, run the engine, and clean up on success.
 * On failure the staging file and manifest stay behind for resume or
 * diagnostics.
 */

use crate::chunk::{chunk_size_for, plan_chunks};
use crate::config::TransferConfig;
use crate::endpoint::{parse_endpoint, task_id, Endpoint};
use crate::engine::{CancelFlag, EngineOptions, TransferEngine};
use crate::error::{FerryError, Result};
use crate::manifest::{
    Manifest, ManifestConfig, ManifestStore, ManifestWriter, TaskStatus,
};
use crate::progress::{ProgressReporter, ProgressSink, ProgressTracker};
use crate::ratelimit::RateLimiter;
use crate::route::{ChunkRoute, DownloadRoute, UploadRoute};
use crate::session::{stat_opt, SessionSettings, SftpPool, SshSession};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Summary of a finished transfer
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub bytes_transferred: u64,
    pub chunks: usize,
    pub elapsed: Duration,
    pub file_hash: String,
}

/// One stored manifest, as shown by `ferry list`
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub task_id: String,
    pub src: String,
    pub dst: String,
    pub status: TaskStatus,
    pub completed_bytes: u64,
    pub file_size: u64,
}

pub struct TransferService {
    store: ManifestStore,
    sink: Arc<dyn ProgressSink>,
}

impl TransferService {
    pub fn new(store: ManifestStore, sink: Arc<dyn ProgressSink>) -> Self {
        Self { store, sink }
    }

    /// Move one file between the local filesystem and a remote host.
    pub fn transfer(
        &self,
        src: &str,
        dst: &str,
        config: &TransferConfig,
        cancel: CancelFlag,
    ) -> Result<TransferResult> {
        config.validate()?;
        let start = Instant::now();

        let mut src_ep = parse_endpoint(src, config.ssh_port)?;
        let mut dst_ep = parse_endpoint(dst, config.ssh_port)?;

        let download = match (src_ep.is_local, dst_ep.is_local) {
            (true, true) => {
                return Err(FerryError::Parse(
                    "one side must be remote; use cp for local copies".into(),
                ))
            }
            (false, false) => {
                return Err(FerryError::Parse(
                    "remote-to-remote transfers are not supported".into(),
                ))
            }
            (false, true) => true,
            (true, false) => false,
        };

        let remote_ep = if download { &src_ep } else { &dst_ep };
        let settings = SessionSettings::from_endpoint(remote_ep, config)?;
        let session = connect_with_retry(&settings)?;
        let control = session.sftp()?;

        // Expand `~` and relative paths on the remote side
        if download {
            src_ep.path = session.resolve_path(&control, &src_ep.path)?;
        } else {
            dst_ep.path = session.resolve_path(&control, &dst_ep.path)?;
        }

        // Stat the source
        let (file_size, file_mtime, src_mode) = if src_ep.is_local {
            local_source_stat(&src_ep.path)?
        } else {
            let stat = stat_opt(&control, Path::new(&src_ep.path))?
                .ok_or_else(|| FerryError::SourceNotFound(PathBuf::from(&src_ep.path)))?;
            if stat.is_dir {
                return Err(FerryError::Config(format!(
                    "source is a directory: {}",
                    src_ep.path
                )));
            }
            (stat.size, stat.mtime, stat.mode)
        };

        // scp semantics: a destination directory receives the source basename
        resolve_destination(&mut dst_ep, &src_ep, &control)?;

        let id = task_id(&src_ep, &dst_ep);
        debug!(task = %id, src = %src_ep, dst = %dst_ep, file_size, "transfer task resolved");

        // Exactly one engine per task
        let _lock = self.store.lock(&id)?;

        let manifest = self.adopt_or_plan(&id, &src_ep, &dst_ep, file_size, file_mtime, config)?;
        // The plan stored in the manifest wins across resumes, so the rate
        // bucket burst follows its chunk size, not the live flags
        let effective_chunk = manifest.config.chunk_size.max(1);
        let chunks_total = manifest.chunks.len();
        let pending = manifest.pending_indices().len();
        let already_done = manifest.completed_bytes();

        let pool_size = config.worker_cap().min(pending.max(1));
        let pool = Arc::new(SftpPool::open(&session, &settings, pool_size)?);

        let route: Arc<dyn ChunkRoute> = if download {
            Arc::new(DownloadRoute::new(
                Arc::clone(&pool),
                PathBuf::from(&src_ep.path),
                PathBuf::from(&dst_ep.path),
                &id,
            ))
        } else {
            Arc::new(UploadRoute::new(
                Arc::clone(&pool),
                PathBuf::from(&src_ep.path),
                PathBuf::from(&dst_ep.path),
                &id,
            ))
        };

        if config.force {
            // --force starts over: drop any leftover staging bytes
            route.discard();
        }

        let tracker = Arc::new(ProgressTracker::new(file_size, already_done));
        let reporter = ProgressReporter::spawn(Arc::clone(&tracker), Arc::clone(&self.sink));
        let limiter = RateLimiter::new(config.limit_rate, effective_chunk);
        let writer = Arc::new(ManifestWriter::new(self.store.clone(), manifest));

        let options = EngineOptions {
            worker_cap: config.worker_cap(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            drain_timeout: config.timeout_duration(),
            preserve_mode: if config.preserve_permissions {
                src_mode
            } else {
                None
            },
        };

        let engine = TransferEngine::new(
            route,
            writer,
            Arc::clone(&tracker),
            limiter,
            cancel,
            options,
        );
        let run_result = engine.run();
        reporter.stop();

        // Failure leaves the staging file and manifest in place
        let outcome = run_result?;

        self.store.cleanup(&id)?;
        info!(task = %id, bytes = outcome.bytes_transferred, "transfer complete");

        Ok(TransferResult {
            bytes_transferred: outcome.bytes_transferred,
            chunks: chunks_total,
            elapsed: start.elapsed(),
            file_hash: outcome.file_hash,
        })
    }

    /// Reuse a valid manifest when resuming, otherwise plan fresh chunks.
    fn adopt_or_plan(
        &self,
        id: &str,
        src: &Endpoint,
        dst: &Endpoint,
        file_size: u64,
        file_mtime: f64,
        config: &TransferConfig,
    ) -> Result<Manifest> {
        if config.force {
            self.store.cleanup(id)?;
        } else if config.resume {
            if let Some(mut existing) = self.store.load(id)? {
                match existing.matches(src, dst, file_size, file_mtime) {
                    Ok(()) => {
                        existing.reset_incomplete();
                        info!(
                            task = %id,
                            done = existing.completed_bytes(),
                            total = file_size,
                            "resuming from manifest"
                        );
                        return Ok(existing);
                    }
                    Err(reason) => {
                        let stale = FerryError::StaleManifest(reason);
                        warn!(task = %id, error = %stale, "starting fresh");
                        self.store.cleanup(id)?;
                    }
                }
            }
        }

        let chunks = plan_chunks(file_size, config);
        let effective_chunk = chunk_size_for(file_size, config);
        Ok(Manifest::new(
            id.to_string(),
            src.clone(),
            dst.clone(),
            file_size,
            file_mtime,
            chunks,
            ManifestConfig::from_config(config, effective_chunk),
        ))
    }

    /// Stored manifests, for `ferry list`
    pub fn list_tasks(&self) -> Result<Vec<TaskSummary>> {
        let mut summaries = Vec::new();
        for id in self.store.list_all()? {
            let Some(manifest) = self.store.load(&id)? else {
                continue;
            };
            summaries.push(TaskSummary {
                task_id: manifest.task_id.clone(),
                src: manifest.src.to_string(),
                dst: manifest.dst.to_string(),
                status: manifest.status,
                completed_bytes: manifest.completed_bytes(),
                file_size: manifest.file_size,
            });
        }
        Ok(summaries)
    }

    /// Remove one stored manifest, or every one of them. Returns how many
    /// were deleted.
    pub fn clean(&self, task: Option<&str>, all: bool) -> Result<usize> {
        let ids: Vec<String> = match (task, all) {
            (Some(id), _) => vec![id.to_string()],
            (None, true) => self.store.list_all()?,
            (None, false) => {
                return Err(FerryError::Config(
                    "specify a task id or --all".into(),
                ))
            }
        };

        let mut removed = 0;
        for id in ids {
            if self.store.manifest_path(&id).exists() {
                self.store.cleanup(&id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// One reconnect attempt for session-level connection failures
fn connect_with_retry(settings: &SessionSettings) -> Result<SshSession> {
    match SshSession::connect(settings) {
        Err(FerryError::Connect(first)) => {
            warn!(error = %first, "connection failed, retrying once");
            SshSession::connect(settings)
        }
        other => other,
    }
}

fn local_source_stat(path: &str) -> Result<(u64, f64, Option<u32>)> {
    let meta = std::fs::metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            FerryError::SourceNotFound(PathBuf::from(path))
        } else {
            FerryError::Io(e)
        }
    })?;
    if meta.is_dir() {
        return Err(FerryError::Config(format!("source is a directory: {}", path)));
    }

    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        Some(meta.permissions().mode() & 0o7777)
    };
    #[cfg(not(unix))]
    let mode = None;

    Ok((meta.len(), mtime, mode))
}

/// If the destination is an existing directory (or written with a trailing
/// slash), the file keeps its source basename inside it.
fn resolve_destination(dst: &mut Endpoint, src: &Endpoint, control: &ssh2::Sftp) -> Result<()> {
    let basename = Path::new(&src.path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| FerryError::Parse(format!("source has no file name: {}", src.path)))?;

    let trailing_slash = dst.path.ends_with('/');
    let is_dir = if dst.is_local {
        std::fs::metadata(&dst.path).map(|m| m.is_dir()).unwrap_or(false)
    } else {
        stat_opt(control, Path::new(&dst.path))?
            .map(|s| s.is_dir)
            .unwrap_or(false)
    };

    if is_dir || trailing_slash {
        let joined = Path::new(dst.path.trim_end_matches('/')).join(&basename);
        dst.path = joined.to_string_lossy().into_owned();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopSink;
    use tempfile::tempdir;

    #[test]
    fn test_both_local_rejected() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();
        let service = TransferService::new(store, Arc::new(NoopSink));

        let err = service
            .transfer(
                "/tmp/a",
                "/tmp/b",
                &TransferConfig::default(),
                CancelFlag::new(),
            )
            .unwrap_err();
        assert!(matches!(err, FerryError::Parse(_)));
        assert_eq!(err.exit_code(), crate::error::EXIT_PARSE);
    }

    #[test]
    fn test_both_remote_rejected() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();
        let service = TransferService::new(store, Arc::new(NoopSink));

        let err = service
            .transfer(
                "a@h1:/tmp/a",
                "b@h2:/tmp/b",
                &TransferConfig::default(),
                CancelFlag::new(),
            )
            .unwrap_err();
        assert!(matches!(err, FerryError::Parse(_)));
    }

    #[test]
    fn test_clean_requires_target() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();
        let service = TransferService::new(store, Arc::new(NoopSink));
        assert!(service.clean(None, false).is_err());
        assert_eq!(service.clean(None, true).unwrap(), 0);
    }
}
