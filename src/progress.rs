/*!
 * Transfer progress tracking
 *
 * Workers feed atomic counters; a reporter thread samples them at a fixed
 * cadence and pushes snapshots to an abstract sink (terminal bar, log line
 * or nothing). Speed is an EMA over a one-second window; ETA is clamped to
 * a day so a stalled transfer never shows absurd estimates.
 */

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::info;

/// Reporter cadence: 12.5 Hz, inside the required 10–30 Hz band
const REPORT_INTERVAL: Duration = Duration::from_millis(80);

/// ETA ceiling
const MAX_ETA: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub total_bytes: u64,
    pub transferred: u64,
    pub active_chunks: usize,
    /// Smoothed throughput in bytes per second
    pub speed_bps: f64,
    /// `None` until the speed estimate is meaningful
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            self.transferred as f64 * 100.0 / self.total_bytes as f64
        }
    }
}

struct SpeedWindow {
    last_sample: Instant,
    last_bytes: u64,
    ema_bps: f64,
}

/// Thread-safe running totals for one task
pub struct ProgressTracker {
    total_bytes: AtomicU64,
    transferred: AtomicU64,
    active_chunks: AtomicUsize,
    window: Mutex<SpeedWindow>,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, already_transferred: u64) -> Self {
        Self {
            total_bytes: AtomicU64::new(total_bytes),
            transferred: AtomicU64::new(already_transferred),
            active_chunks: AtomicUsize::new(0),
            window: Mutex::new(SpeedWindow {
                last_sample: Instant::now(),
                last_bytes: already_transferred,
                ema_bps: 0.0,
            }),
        }
    }

    /// Record bytes landed by a completed chunk. Monotonic.
    pub fn add_bytes(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn chunk_started(&self) {
        self.active_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_finished(&self) {
        self.active_chunks.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Sample the counters and fold the instantaneous rate into the EMA.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let total = self.total_bytes.load(Ordering::Relaxed);
        let transferred = self.transferred.load(Ordering::Relaxed);
        let active = self.active_chunks.load(Ordering::Relaxed);

        let mut window = self.window.lock().unwrap();
        let now = Instant::now();
        let dt = now.duration_since(window.last_sample).as_secs_f64();
        if dt > 0.0 {
            let delta = transferred.saturating_sub(window.last_bytes) as f64;
            let instant_bps = delta / dt;
            // One-second smoothing window
            let alpha = (dt / 1.0).clamp(0.0, 1.0);
            window.ema_bps = window.ema_bps * (1.0 - alpha) + instant_bps * alpha;
            window.last_sample = now;
            window.last_bytes = transferred;
        }

        let speed = window.ema_bps;
        let eta = if speed > 1.0 && transferred < total {
            let secs = (total - transferred) as f64 / speed;
            Some(Duration::from_secs_f64(secs.min(MAX_ETA.as_secs_f64())))
        } else {
            None
        };

        ProgressSnapshot {
            total_bytes: total,
            transferred,
            active_chunks: active,
            speed_bps: speed,
            eta,
        }
    }
}

/// Destination for periodic progress pushes
pub trait ProgressSink: Send + Sync {
    fn update(&self, snapshot: &ProgressSnapshot);
    fn finish(&self, snapshot: &ProgressSnapshot);
}

/// Sink that swallows everything (quiet mode, tests)
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn update(&self, _snapshot: &ProgressSnapshot) {}
    fn finish(&self, _snapshot: &ProgressSnapshot) {}
}

/// Sink that emits a log line roughly once a second
pub struct LogSink {
    last_emit: Mutex<Option<Instant>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            last_emit: Mutex::new(None),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for LogSink {
    fn update(&self, snapshot: &ProgressSnapshot) {
        let mut last = self.last_emit.lock().unwrap();
        let due = last.map_or(true, |t| t.elapsed() >= Duration::from_secs(1));
        if due {
            info!(
                transferred = snapshot.transferred,
                total = snapshot.total_bytes,
                percent = snapshot.percent(),
                speed_bps = snapshot.speed_bps as u64,
                active = snapshot.active_chunks,
                "transfer progress"
            );
            *last = Some(Instant::now());
        }
    }

    fn finish(&self, snapshot: &ProgressSnapshot) {
        info!(
            transferred = snapshot.transferred,
            total = snapshot.total_bytes,
            "transfer progress complete"
        );
    }
}

/// Terminal progress bar sink. The bar length follows the first snapshot,
/// so the sink can be built before the source has been stat'd.
pub struct TerminalSink {
    bar: ProgressBar,
}

impl TerminalSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta}) {msg}",
            )
            .unwrap()
            .progress_chars("=>-"),
        );
        Self { bar }
    }
}

impl Default for TerminalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for TerminalSink {
    fn update(&self, snapshot: &ProgressSnapshot) {
        if self.bar.length() != Some(snapshot.total_bytes) {
            self.bar.set_length(snapshot.total_bytes);
        }
        self.bar.set_position(snapshot.transferred);
        if snapshot.active_chunks > 0 {
            self.bar.set_message(format!("{} chunks", snapshot.active_chunks));
        }
    }

    fn finish(&self, snapshot: &ProgressSnapshot) {
        self.bar.set_position(snapshot.transferred);
        self.bar.finish_and_clear();
    }
}

/// Background sampler pushing tracker snapshots to a sink until stopped
pub struct ProgressReporter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn spawn(tracker: Arc<ProgressTracker>, sink: Arc<dyn ProgressSink>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("ferry-progress".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    sink.update(&tracker.snapshot());
                    thread::sleep(REPORT_INTERVAL);
                }
                sink.finish(&tracker.snapshot());
            })
            .expect("failed to spawn progress reporter");
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let tracker = ProgressTracker::new(1000, 200);
        assert_eq!(tracker.transferred(), 200);

        tracker.chunk_started();
        tracker.add_bytes(300);
        let snap = tracker.snapshot();
        assert_eq!(snap.transferred, 500);
        assert_eq!(snap.total_bytes, 1000);
        assert_eq!(snap.active_chunks, 1);
        assert_eq!(snap.percent(), 50.0);

        tracker.chunk_finished();
        assert_eq!(tracker.snapshot().active_chunks, 0);
    }

    #[test]
    fn test_zero_total_is_complete() {
        let tracker = ProgressTracker::new(0, 0);
        assert_eq!(tracker.snapshot().percent(), 100.0);
    }

    #[test]
    fn test_speed_converges() {
        let tracker = ProgressTracker::new(10_000_000, 0);
        // Feed ~1 MB over ~100ms of samples
        for _ in 0..10 {
            tracker.add_bytes(100_000);
            thread::sleep(Duration::from_millis(10));
            tracker.snapshot();
        }
        let snap = tracker.snapshot();
        assert!(snap.speed_bps > 0.0);
        let eta = snap.eta.expect("eta should exist while moving");
        assert!(eta <= MAX_ETA);
    }

    #[test]
    fn test_reporter_pushes_updates() {
        struct CountingSink(AtomicUsize, AtomicBool);
        impl ProgressSink for CountingSink {
            fn update(&self, _s: &ProgressSnapshot) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
            fn finish(&self, _s: &ProgressSnapshot) {
                self.1.store(true, Ordering::Relaxed);
            }
        }

        let tracker = Arc::new(ProgressTracker::new(100, 0));
        let sink = Arc::new(CountingSink(AtomicUsize::new(0), AtomicBool::new(false)));
        let reporter = ProgressReporter::spawn(Arc::clone(&tracker), sink.clone());
        thread::sleep(Duration::from_millis(300));
        reporter.stop();

        // ~12.5 Hz for 300ms: at least a couple of updates, then finish
        assert!(sink.0.load(Ordering::Relaxed) >= 2);
        assert!(sink.1.load(Ordering::Relaxed));
    }
}
