/*!
 * The transfer engine: a bounded worker pool draining the pending-chunk
 * queue over a route
 *
 * Workers pull chunk indices from a shared FIFO, move the bytes, hash
 * them, and record completion through the coalescing manifest writer.
 * Transient failures re-enter the queue tail after an exponential backoff;
 * exhausted retries stop the pool and surface as a chunk failure. A single
 * stop flag drives both cancellation (→ PAUSED) and internal aborts
 * (→ FAILED), checked at the loop head, before I/O, and inside every
 * sleep.
 */

use crate::error::{FerryError, Result};
use crate::manifest::{ManifestWriter, TaskStatus};
use crate::progress::ProgressTracker;
use crate::ratelimit::RateLimiter;
use crate::route::ChunkRoute;
use crate::verify::{digests_equal, hash_bytes};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Backoff ceiling so a long retry chain cannot stall a worker for minutes
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Queue poll interval; also bounds worker shutdown latency
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared cancellation flag. Setting it asks the engine to drain and
/// persist a PAUSED manifest.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Engine knobs derived from the transfer config by the service
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Worker ceiling (already profile-adjusted); the engine further bounds
    /// this by the number of remaining chunks
    pub worker_cap: usize,
    pub max_retries: u32,
    pub retry_delay: f64,
    /// Cancellation drain budget
    pub drain_timeout: Duration,
    /// Source mode bits to apply before publish
    pub preserve_mode: Option<u32>,
}

/// What a completed run produced
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    /// Bytes moved by this invocation (excludes chunks adopted from a
    /// previous run)
    pub bytes_transferred: u64,
    pub file_hash: String,
}

struct WorkerShared {
    route: Arc<dyn ChunkRoute>,
    manifest: Arc<ManifestWriter>,
    tracker: Arc<ProgressTracker>,
    limiter: RateLimiter,
    /// Merged stop signal: external cancel or internal abort
    stop: CancelFlag,
    remaining: AtomicUsize,
    fatal: Mutex<Option<FerryError>>,
    max_retries: u32,
    retry_delay: f64,
}

impl WorkerShared {
    fn record_fatal(&self, error: FerryError) {
        let mut slot = self.fatal.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.stop.cancel();
    }
}

pub struct TransferEngine {
    route: Arc<dyn ChunkRoute>,
    manifest: Arc<ManifestWriter>,
    tracker: Arc<ProgressTracker>,
    limiter: RateLimiter,
    cancel: CancelFlag,
    options: EngineOptions,
}

impl TransferEngine {
    pub fn new(
        route: Arc<dyn ChunkRoute>,
        manifest: Arc<ManifestWriter>,
        tracker: Arc<ProgressTracker>,
        limiter: RateLimiter,
        cancel: CancelFlag,
        options: EngineOptions,
    ) -> Self {
        Self {
            route,
            manifest,
            tracker,
            limiter,
            cancel,
            options,
        }
    }

    /// Drive the task to COMPLETED, PAUSED or FAILED.
    pub fn run(&self) -> Result<EngineOutcome> {
        let (file_size, pending) = {
            let snapshot = self.manifest.snapshot();
            (snapshot.file_size, snapshot.pending_indices())
        };

        self.manifest.set_status(TaskStatus::Running);
        self.manifest.persist_now()?;
        self.route.prepare(file_size)?;

        let before = self.tracker.transferred();

        if !pending.is_empty() {
            let shared = Arc::new(WorkerShared {
                route: Arc::clone(&self.route),
                manifest: Arc::clone(&self.manifest),
                tracker: Arc::clone(&self.tracker),
                limiter: self.limiter.clone(),
                stop: CancelFlag::new(),
                remaining: AtomicUsize::new(pending.len()),
                fatal: Mutex::new(None),
                max_retries: self.options.max_retries,
                retry_delay: self.options.retry_delay,
            });

            self.run_workers(&shared, &pending);

            // Shutdown always forces a final save so the last chunk states
            // are durable even if coalescing swallowed them
            if let Some(error) = shared.fatal.lock().unwrap().take() {
                self.manifest.set_status(TaskStatus::Failed);
                self.manifest.persist_now()?;
                return Err(error);
            }
            if self.cancel.is_cancelled() {
                self.manifest.set_status(TaskStatus::Paused);
                self.manifest.persist_now()?;
                return Err(FerryError::Cancelled);
            }
        }

        let outcome = self.verify_and_publish(before)?;
        Ok(outcome)
    }

    fn run_workers(&self, shared: &Arc<WorkerShared>, pending: &[u32]) {
        let workers = self.options.worker_cap.min(pending.len()).max(1);
        info!(
            chunks = pending.len(),
            workers, "starting transfer workers"
        );

        let (tx, rx) = unbounded::<u32>();
        for index in pending {
            tx.send(*index).expect("chunk queue closed before start");
        }

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let shared = Arc::clone(shared);
            let rx = rx.clone();
            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(format!("ferry-worker-{}", worker_id))
                .spawn(move || worker_loop(&shared, &rx, &tx))
                .expect("failed to spawn worker");
            handles.push(handle);
        }
        drop(tx);
        drop(rx);

        // Wait for the pool, propagating external cancellation into the
        // workers' stop flag. Once cancelled, workers get `drain_timeout`
        // to come home; stragglers stuck in blocking I/O are abandoned and
        // their channels die with the pool.
        let mut drain_deadline: Option<Instant> = None;
        loop {
            if handles.iter().all(|h| h.is_finished()) {
                break;
            }
            if self.cancel.is_cancelled() && !shared.stop.is_cancelled() {
                shared.stop.cancel();
            }
            if shared.stop.is_cancelled() {
                let deadline =
                    *drain_deadline.get_or_insert_with(|| Instant::now() + self.options.drain_timeout);
                if Instant::now() >= deadline {
                    let alive = handles.iter().filter(|h| !h.is_finished()).count();
                    warn!(alive, "drain timeout expired, abandoning workers");
                    handles.retain(|h| h.is_finished());
                    break;
                }
            }
            thread::sleep(Duration::from_millis(50));
        }

        for handle in handles {
            let _ = handle.join();
        }
    }

    fn verify_and_publish(&self, before: u64) -> Result<EngineOutcome> {
        self.manifest.set_status(TaskStatus::Verifying);
        self.manifest.persist_now()?;

        // Cancellation is still honored here; nothing has been renamed yet
        if self.cancel.is_cancelled() {
            self.manifest.set_status(TaskStatus::Paused);
            self.manifest.persist_now()?;
            return Err(FerryError::Cancelled);
        }

        let actual = match self.route.stage_hash() {
            Ok(hash) => hash,
            Err(e) => {
                self.manifest.set_status(TaskStatus::Failed);
                self.manifest.persist_now()?;
                return Err(e);
            }
        };
        let expected = self.manifest.snapshot().file_hash;

        match expected {
            Some(expected) if !digests_equal(&expected, &actual) => {
                // Keep staging and manifest on disk for diagnostics
                self.manifest.set_status(TaskStatus::Failed);
                self.manifest.persist_now()?;
                return Err(FerryError::Integrity {
                    expected,
                    actual,
                });
            }
            Some(_) => {}
            None => {
                self.manifest.update(|m| m.file_hash = Some(actual.clone()));
            }
        }

        // Point of no return: publish runs to completion even if a cancel
        // arrives now
        self.route.publish(self.options.preserve_mode)?;
        self.manifest.set_status(TaskStatus::Completed);
        self.manifest.persist_now()?;

        info!(hash = %actual, "transfer verified and published");
        Ok(EngineOutcome {
            bytes_transferred: self.tracker.transferred().saturating_sub(before),
            file_hash: actual,
        })
    }
}

fn worker_loop(shared: &Arc<WorkerShared>, rx: &Receiver<u32>, tx: &Sender<u32>) {
    loop {
        if shared.stop.is_cancelled() {
            break;
        }

        let index = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(index) => index,
            Err(RecvTimeoutError::Timeout) => {
                if shared.remaining.load(Ordering::SeqCst) == 0 {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let (offset, size, attempts) = shared.manifest.begin_chunk(index);
        shared.tracker.chunk_started();
        let result = transfer_chunk(shared, offset, size);
        shared.tracker.chunk_finished();

        match result {
            Ok(digest) => {
                debug!(chunk = index, size, attempts, "chunk completed");
                shared.manifest.complete_chunk(index, digest);
                shared.tracker.add_bytes(size);
                shared.remaining.fetch_sub(1, Ordering::SeqCst);
            }
            Err(FerryError::Cancelled) => {
                // The partial bytes are irrelevant: the chunk stays pending
                // and re-transfers whole on resume
                shared.manifest.requeue_chunk(index);
                break;
            }
            Err(error) => {
                warn!(chunk = index, attempts, error = %error, "chunk attempt failed");
                shared.manifest.fail_chunk(index, &error.to_string());

                if attempts <= shared.max_retries && !error.is_fatal() {
                    let delay = backoff_delay(shared.retry_delay, attempts);
                    if sleep_unless_stopped(delay, &shared.stop) {
                        shared.manifest.requeue_chunk(index);
                        let _ = tx.send(index);
                    } else {
                        shared.manifest.requeue_chunk(index);
                        break;
                    }
                } else {
                    shared.record_fatal(FerryError::ChunkFailed {
                        index,
                        attempts,
                        cause: error.to_string(),
                    });
                    break;
                }
            }
        }
    }
}

fn transfer_chunk(shared: &Arc<WorkerShared>, offset: u64, size: u64) -> Result<String> {
    if shared.stop.is_cancelled() {
        return Err(FerryError::Cancelled);
    }
    if !shared.limiter.acquire(size, &shared.stop) {
        return Err(FerryError::Cancelled);
    }

    let buffer = shared.route.read_range(offset, size as usize)?;
    if buffer.len() as u64 != size {
        return Err(FerryError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("chunk read returned {} of {} bytes", buffer.len(), size),
        )));
    }

    if shared.stop.is_cancelled() {
        return Err(FerryError::Cancelled);
    }
    shared.route.write_range(offset, &buffer)?;

    Ok(hash_bytes(&buffer))
}

/// `retry_delay * 2^(attempts-1)`, jittered ±20%, capped
fn backoff_delay(base_secs: f64, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    let raw = base_secs * f64::from(2u32.pow(exponent));
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_secs_f64((raw * jitter).max(0.0)).min(MAX_BACKOFF)
}

/// Sleep in short slices so a stop request interrupts the backoff.
/// Returns false when interrupted.
fn sleep_unless_stopped(duration: Duration, stop: &CancelFlag) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.is_cancelled() {
            return false;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return true;
        }
        thread::sleep(left.min(Duration::from_millis(50)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let first = backoff_delay(1.0, 1);
        let third = backoff_delay(1.0, 3);
        // 1s ±20% vs 4s ±20%
        assert!(first >= Duration::from_secs_f64(0.8));
        assert!(first <= Duration::from_secs_f64(1.2));
        assert!(third >= Duration::from_secs_f64(3.2));
        assert!(third <= Duration::from_secs_f64(4.8));
    }

    #[test]
    fn test_backoff_capped() {
        assert_eq!(backoff_delay(10.0, 12), MAX_BACKOFF);
    }

    #[test]
    fn test_sleep_interrupted_by_stop() {
        let stop = CancelFlag::new();
        let stop_clone = stop.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            stop_clone.cancel();
        });

        let start = Instant::now();
        assert!(!sleep_unless_stopped(Duration::from_secs(10), &stop));
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }

    #[test]
    fn test_sleep_completes_when_not_stopped() {
        let stop = CancelFlag::new();
        assert!(sleep_unless_stopped(Duration::from_millis(20), &stop));
    }
}
