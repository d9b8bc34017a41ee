use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-task status coalescing window (at most one update per window).
pub const STATUS_WINDOW: Duration = Duration::from_millis(100);

/// Interval between batched log flushes.
pub const LOG_FLUSH_INTERVAL: Duration = Duration::from_millis(200);

/// Messages per flush, upper bound.
pub const LOG_FLUSH_MAX: usize = 50;

/// How long the flusher keeps draining after cancellation before abandoning
/// the remaining messages.
pub const CANCEL_FLUSH_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Queued,
    CreatingJob,
    Polling,
    Downloading,
    WritingSink,
    DownloadingBlobs,
}

#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub phase: TaskPhase,
    pub records: u64,
    pub bytes: u64,
}

/// Delivery contract for progress and batched logs.
///
/// Implementations receive per-task updates at most once per
/// [`STATUS_WINDOW`] and log lines in batches of at most [`LOG_FLUSH_MAX`].
/// Terminal, file, and GUI frontends are thin adapters over this trait.
pub trait ProgressSink: Send + Sync {
    fn task_update(&self, object: &str, update: &TaskUpdate);
    fn log_lines(&self, lines: &[String]);
    fn run_progress(&self, completed: usize, total: usize);
}

/// Adapter that renders progress through the tracing pipeline.
pub struct TerminalProgress;

impl ProgressSink for TerminalProgress {
    fn task_update(&self, object: &str, update: &TaskUpdate) {
        debug!(
            "{}: {:?} ({} records, {} bytes)",
            object, update.phase, update.records, update.bytes
        );
    }

    fn log_lines(&self, lines: &[String]) {
        for line in lines {
            info!("{}", line);
        }
    }

    fn run_progress(&self, completed: usize, total: usize) {
        info!("Progress: {}/{} objects", completed, total);
    }
}

/// Concurrency-safe fan-in point between workers and the progress sink.
///
/// Workers call [`task_update`](ProgressHub::task_update) and
/// [`log`](ProgressHub::log) freely; the hub coalesces status to the 100 ms
/// window and batches log lines through a single flusher task.
pub struct ProgressHub {
    sink: Arc<dyn ProgressSink>,
    log_tx: mpsc::UnboundedSender<String>,
    last_tick: Mutex<HashMap<String, Instant>>,
    completed: AtomicUsize,
    total: usize,
    flusher: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl ProgressHub {
    pub fn new(
        sink: Arc<dyn ProgressSink>,
        total: usize,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let flusher = tokio::spawn(flusher_loop(
            log_rx,
            sink.clone(),
            cancel,
            stop.clone(),
        ));

        Arc::new(Self {
            sink,
            log_tx,
            last_tick: Mutex::new(HashMap::new()),
            completed: AtomicUsize::new(0),
            total,
            flusher: Mutex::new(Some(flusher)),
            stop,
        })
    }

    /// Queue a log line for the next batched flush.
    pub fn log(&self, line: impl Into<String>) {
        let _ = self.log_tx.send(line.into());
    }

    /// Forward a per-task status update, coalesced to the window: only the
    /// first status inside a 100 ms window reaches the sink.
    pub fn task_update(&self, object: &str, update: TaskUpdate) {
        let now = Instant::now();
        {
            let mut ticks = match self.last_tick.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(last) = ticks.get(object) {
                if now.duration_since(*last) < STATUS_WINDOW {
                    return;
                }
            }
            ticks.insert(object.to_string(), now);
        }
        self.sink.task_update(object, &update);
    }

    /// Mark one task terminal and publish the new aggregate fraction.
    pub fn task_done(&self) -> usize {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.sink.run_progress(done, self.total);
        done
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Drain any remaining log lines and stop the flusher.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handle = {
            let mut guard = match self.flusher.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn flusher_loop(
    mut rx: mpsc::UnboundedReceiver<String>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(LOG_FLUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                drain_once(&mut rx, &sink);
            }

            _ = cancel.cancelled() => {
                // Keep flushing inside the grace window, then abandon the
                // remainder.
                let deadline = Instant::now() + CANCEL_FLUSH_GRACE;
                while Instant::now() < deadline {
                    if drain_once(&mut rx, &sink) == 0 {
                        break;
                    }
                    tokio::time::sleep(LOG_FLUSH_INTERVAL).await;
                }
                return;
            }

            _ = stop.cancelled() => {
                // Orderly shutdown flushes everything.
                while drain_once(&mut rx, &sink) > 0 {}
                return;
            }
        }
    }
}

fn drain_once(rx: &mut mpsc::UnboundedReceiver<String>, sink: &Arc<dyn ProgressSink>) -> usize {
    let mut lines = Vec::new();
    while lines.len() < LOG_FLUSH_MAX {
        match rx.try_recv() {
            Ok(line) => lines.push(line),
            Err(_) => break,
        }
    }
    if !lines.is_empty() {
        sink.log_lines(&lines);
    }
    lines.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        updates: Mutex<Vec<(String, TaskPhase)>>,
        batches: Mutex<Vec<usize>>,
        progress: Mutex<Vec<(usize, usize)>>,
    }

    impl ProgressSink for RecordingSink {
        fn task_update(&self, object: &str, update: &TaskUpdate) {
            self.updates
                .lock()
                .unwrap()
                .push((object.to_string(), update.phase));
        }

        fn log_lines(&self, lines: &[String]) {
            self.batches.lock().unwrap().push(lines.len());
        }

        fn run_progress(&self, completed: usize, total: usize) {
            self.progress.lock().unwrap().push((completed, total));
        }
    }

    fn update(phase: TaskPhase) -> TaskUpdate {
        TaskUpdate {
            phase,
            records: 0,
            bytes: 0,
        }
    }

    #[tokio::test]
    async fn test_status_updates_coalesced_per_window() {
        let sink = Arc::new(RecordingSink::default());
        let hub = ProgressHub::new(sink.clone(), 1, CancellationToken::new());

        // Burst of updates inside one window: only the first is forwarded.
        hub.task_update("Account", update(TaskPhase::CreatingJob));
        hub.task_update("Account", update(TaskPhase::Polling));
        hub.task_update("Account", update(TaskPhase::Polling));
        assert_eq!(sink.updates.lock().unwrap().len(), 1);

        // A different object has its own window.
        hub.task_update("Contact", update(TaskPhase::CreatingJob));
        assert_eq!(sink.updates.lock().unwrap().len(), 2);

        // After the window passes the same object is forwarded again.
        tokio::time::sleep(STATUS_WINDOW + Duration::from_millis(20)).await;
        hub.task_update("Account", update(TaskPhase::Downloading));
        assert_eq!(sink.updates.lock().unwrap().len(), 3);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_completed_counter_monotonic_and_bounded() {
        let sink = Arc::new(RecordingSink::default());
        let hub = ProgressHub::new(sink.clone(), 3, CancellationToken::new());

        assert_eq!(hub.task_done(), 1);
        assert_eq!(hub.task_done(), 2);
        assert_eq!(hub.task_done(), 3);
        assert_eq!(hub.completed(), 3);

        let progress = sink.progress.lock().unwrap();
        let counts: Vec<usize> = progress.iter().map(|(c, _)| *c).collect();
        assert_eq!(counts, vec![1, 2, 3], "completed counter never regresses");
        assert!(progress.iter().all(|(c, t)| c <= t));

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_log_flush_batches_bounded() {
        let sink = Arc::new(RecordingSink::default());
        let hub = ProgressHub::new(sink.clone(), 1, CancellationToken::new());

        for i in 0..120 {
            hub.log(format!("line {}", i));
        }
        hub.shutdown().await;

        let batches = sink.batches.lock().unwrap();
        let total: usize = batches.iter().sum();
        assert_eq!(total, 120, "shutdown flushes every queued line");
        assert!(
            batches.iter().all(|&n| n <= LOG_FLUSH_MAX),
            "no flush exceeds the batch bound: {:?}",
            batches
        );
    }

    #[tokio::test]
    async fn test_cancel_drains_pending_lines_within_grace() {
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let hub = ProgressHub::new(sink.clone(), 1, cancel.clone());

        for i in 0..10 {
            hub.log(format!("line {}", i));
        }
        cancel.cancel();

        // The grace window is one second; everything queued fits easily.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let total: usize = sink.batches.lock().unwrap().iter().sum();
        assert_eq!(total, 10, "grace period flushes pending lines");
    }
}
