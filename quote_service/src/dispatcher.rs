//! Bounded dispatcher: a fixed pool of workers draining one FIFO queue.
//!
//! Every inbound request becomes one job. At most `workers` jobs execute at a
//! time; up to `queue_capacity` more wait in the queue, and anything beyond
//! that is rejected immediately with [`DispatchError::Saturated`]. Callers
//! block in [`Dispatcher::submit`] until their job finishes or the deadline
//! elapses, whichever comes first.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Dispatcher errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("dispatcher saturated: {capacity} tasks already queued")]
    Saturated { capacity: usize },

    #[error("task cancelled after waiting {waited:?} in the queue")]
    Cancelled { waited: Duration },

    #[error("task timed out after {elapsed:?}")]
    TimedOut { elapsed: Duration },

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("dispatcher is shut down")]
    Closed,
}

/// Lifecycle of a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TaskState {
    Queued = 0,
    Running = 1,
    Completed = 2,
    Cancelled = 3,
    TimedOut = 4,
    Failed = 5,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Queued,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            3 => TaskState::Cancelled,
            4 => TaskState::TimedOut,
            _ => TaskState::Failed,
        }
    }
}

/// Shared between the caller and the worker so whichever side moves first
/// decides the terminal state.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(TaskState::Queued as u8))
    }

    fn get(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Dispatcher sizing and deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub task_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 1_024,
            task_timeout: Duration::from_secs(5),
        }
    }
}

/// Counters exposed through `/health`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub workers: usize,
    pub queue_capacity: usize,
    pub queued: usize,
    pub running: usize,
    pub peak_running: usize,
    pub submitted: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    running: AtomicUsize,
    peak_running: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

struct Job {
    id: u64,
    state: Arc<StateCell>,
    enqueued_at: Instant,
    run: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
}

impl Job {
    async fn execute(self, worker: usize, counters: &Counters) {
        if !self.state.transition(TaskState::Queued, TaskState::Running) {
            debug!(task = self.id, worker, "skipping task cancelled while queued");
            return;
        }

        let running = counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_running.fetch_max(running, Ordering::SeqCst);
        debug!(
            task = self.id,
            worker,
            queued_for = ?self.enqueued_at.elapsed(),
            "task started"
        );

        let outcome = AssertUnwindSafe((self.run)()).catch_unwind().await;
        counters.running.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(()) => {
                if self.state.transition(TaskState::Running, TaskState::Completed) {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                } else {
                    debug!(task = self.id, worker, "task finished after its caller gave up");
                }
            }
            Err(_) => {
                self.state.transition(TaskState::Running, TaskState::Failed);
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(task = self.id, worker, "task panicked; worker continues");
            }
        }
    }
}

type JobQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>;

/// Fixed-size worker pool gating concurrent store operations.
pub struct Dispatcher {
    config: DispatcherConfig,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    next_task: AtomicU64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Dispatcher {
    /// Spawn the worker pool. Must be called from within a Tokio runtime.
    pub fn start(config: DispatcherConfig) -> Self {
        let mut config = config;
        if config.workers == 0 {
            warn!("Dispatcher configured with zero workers, using one");
            config.workers = 1;
        }
        if config.queue_capacity == 0 {
            warn!("Dispatcher configured with zero queue capacity, using one");
            config.queue_capacity = 1;
        }

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let queue: JobQueue = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let workers = (0..config.workers)
            .map(|index| tokio::spawn(worker_loop(index, queue.clone(), counters.clone())))
            .collect();

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            task_timeout_ms = config.task_timeout.as_millis() as u64,
            "Dispatcher started"
        );

        Self {
            config,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            counters,
            next_task: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run `task` on the pool using the configured deadline.
    pub async fn submit<F, Fut, T>(&self, task: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_with_deadline(self.config.task_timeout, task).await
    }

    /// Run `task` on the pool, giving up after `deadline`.
    ///
    /// A task still queued when the deadline elapses is never started. A task
    /// already running is left to finish; only its result is discarded.
    pub async fn submit_with_deadline<F, Fut, T>(
        &self,
        deadline: Duration,
        task: F,
    ) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.sender.lock().clone().ok_or(DispatchError::Closed)?;

        let id = self.next_task.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(StateCell::new());
        let (result_tx, mut result_rx) = oneshot::channel();

        let job = Job {
            id,
            state: state.clone(),
            enqueued_at: Instant::now(),
            run: Box::new(move || {
                async move {
                    let output = task().await;
                    // The caller may have timed out and dropped the receiver.
                    let _ = result_tx.send(output);
                }
                .boxed()
            }),
        };

        match sender.try_send(job) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(task = id, capacity = self.config.queue_capacity, "Dispatcher queue full, rejecting task");
                return Err(DispatchError::Saturated {
                    capacity: self.config.queue_capacity,
                });
            }
            Err(TrySendError::Closed(_)) => return Err(DispatchError::Closed),
        }
        drop(sender);

        let started = Instant::now();
        match tokio::time::timeout(deadline, &mut result_rx).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(_)) => Err(lost_result(&state)),
            Err(_) => {
                if state.transition(TaskState::Queued, TaskState::Cancelled) {
                    self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    warn!(task = id, ?deadline, "Task deadline elapsed while queued");
                    Err(DispatchError::Cancelled {
                        waited: started.elapsed(),
                    })
                } else if state.transition(TaskState::Running, TaskState::TimedOut) {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!(task = id, ?deadline, "Task deadline elapsed while running");
                    Err(DispatchError::TimedOut {
                        elapsed: started.elapsed(),
                    })
                } else {
                    // Finished between the timer firing and the state check.
                    result_rx.try_recv().map_err(|_| lost_result(&state))
                }
            }
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        let queued = self
            .sender
            .lock()
            .as_ref()
            .map(|s| self.config.queue_capacity.saturating_sub(s.capacity()))
            .unwrap_or(0);

        DispatcherStats {
            workers: self.config.workers,
            queue_capacity: self.config.queue_capacity,
            queued,
            running: self.counters.running.load(Ordering::SeqCst),
            peak_running: self.counters.peak_running.load(Ordering::SeqCst),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, let the workers drain the queue, and wait for them.
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let handles = std::mem::take(&mut *self.workers.lock());
        if handles.is_empty() {
            return;
        }

        info!(workers = handles.len(), "Dispatcher draining");
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Dispatcher worker exited abnormally: {}", e);
            }
        }
        info!("Dispatcher stopped");
    }
}

/// The result sender was dropped without a value. A started task only does
/// that when it panics (the worker may not have recorded `Failed` yet); a
/// queued one only when the pool went away underneath it.
fn lost_result(state: &StateCell) -> DispatchError {
    match state.get() {
        TaskState::Running | TaskState::Failed => {
            DispatchError::TaskFailed("task panicked".to_string())
        }
        _ => DispatchError::Closed,
    }
}

async fn worker_loop(index: usize, queue: JobQueue, counters: Arc<Counters>) {
    debug!(worker = index, "dispatcher worker started");
    loop {
        let job = queue.lock().await.recv().await;
        match job {
            Some(job) => job.execute(index, &counters).await,
            None => break,
        }
    }
    debug!(worker = index, "dispatcher worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    fn config(workers: usize, queue_capacity: usize, timeout_ms: u64) -> DispatcherConfig {
        DispatcherConfig {
            workers,
            queue_capacity,
            task_timeout: Duration::from_millis(timeout_ms),
        }
    }

    async fn wait_until(dispatcher: &Dispatcher, check: impl Fn(&DispatcherStats) -> bool) {
        for _ in 0..200 {
            if check(&dispatcher.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached: {:?}", dispatcher.stats());
    }

    #[tokio::test]
    async fn test_submit_returns_task_output() {
        let dispatcher = Dispatcher::start(config(2, 8, 1_000));

        let value = dispatcher.submit(|| async { 21 * 2 }).await;
        assert_eq!(value, Ok(42));

        let stats = dispatcher.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.running, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_worker_count() {
        let dispatcher = Arc::new(Dispatcher::start(config(3, 64, 5_000)));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..24)
            .map(|i| {
                let dispatcher = dispatcher.clone();
                let active = active.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    dispatcher
                        .submit(move || async move {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(15)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            i
                        })
                        .await
                })
            })
            .collect();

        for handle in futures::future::join_all(handles).await {
            assert_ok!(handle.unwrap());
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(dispatcher.stats().peak_running <= 3);
        assert_eq!(dispatcher.stats().completed, 24);
    }

    #[tokio::test]
    async fn test_running_task_times_out_without_killing_pool() {
        let dispatcher = Dispatcher::start(config(1, 8, 1_000));
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        let result = dispatcher
            .submit_with_deadline(Duration::from_millis(30), move || async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .await;
        assert!(matches!(result, Err(DispatchError::TimedOut { .. })));

        // The slow task keeps its worker until it finishes; the next one still runs.
        assert_eq!(dispatcher.submit(|| async { "alive" }).await, Ok("alive"));
        assert!(finished.load(Ordering::SeqCst));

        let stats = dispatcher.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_queued_task_is_cancelled_and_never_runs() {
        let dispatcher = Arc::new(Dispatcher::start(config(1, 8, 1_000)));
        let gate = Arc::new(Notify::new());
        let ran = Arc::new(AtomicBool::new(false));

        let blocker = {
            let dispatcher = dispatcher.clone();
            let gate = gate.clone();
            tokio::spawn(async move { dispatcher.submit(move || async move { gate.notified().await }).await })
        };
        wait_until(&dispatcher, |s| s.running == 1).await;

        let flag = ran.clone();
        let result = dispatcher
            .submit_with_deadline(Duration::from_millis(30), move || async move {
                flag.store(true, Ordering::SeqCst);
            })
            .await;
        assert!(matches!(result, Err(DispatchError::Cancelled { .. })));

        gate.notify_one();
        assert_ok!(blocker.await.unwrap());
        dispatcher.shutdown().await;

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(dispatcher.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_full_queue_fails_fast() {
        let dispatcher = Arc::new(Dispatcher::start(config(1, 1, 2_000)));
        let gate = Arc::new(Notify::new());

        let running = {
            let dispatcher = dispatcher.clone();
            let gate = gate.clone();
            tokio::spawn(async move { dispatcher.submit(move || async move { gate.notified().await }).await })
        };
        wait_until(&dispatcher, |s| s.running == 1).await;

        let queued = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.submit(|| async { 1 }).await })
        };
        wait_until(&dispatcher, |s| s.queued == 1).await;

        let rejected = dispatcher.submit(|| async { 2 }).await;
        assert_eq!(rejected, Err(DispatchError::Saturated { capacity: 1 }));

        gate.notify_one();
        assert_ok!(running.await.unwrap());
        assert_eq!(queued.await.unwrap(), Ok(1));
        assert_eq!(dispatcher.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_isolated() {
        let dispatcher = Dispatcher::start(config(1, 4, 1_000));

        let result: Result<(), _> = dispatcher
            .submit(|| async {
                panic!("boom");
            })
            .await;
        assert_eq!(result, Err(DispatchError::TaskFailed("task panicked".to_string())));

        assert_eq!(dispatcher.submit(|| async { 7 }).await, Ok(7));
        let stats = dispatcher.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_single_worker_preserves_arrival_order() {
        let dispatcher = Arc::new(Dispatcher::start(config(1, 16, 2_000)));
        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker = {
            let dispatcher = dispatcher.clone();
            let gate = gate.clone();
            tokio::spawn(async move { dispatcher.submit(move || async move { gate.notified().await }).await })
        };
        wait_until(&dispatcher, |s| s.running == 1).await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let dispatcher_ref = dispatcher.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                dispatcher_ref
                    .submit(move || async move { order.lock().push(i) })
                    .await
            }));
            wait_until(&dispatcher, |s| s.queued == i + 1).await;
        }

        gate.notify_one();
        assert_ok!(blocker.await.unwrap());
        for handle in handles {
            assert_ok!(handle.await.unwrap());
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_rejects() {
        let dispatcher = Dispatcher::start(config(2, 8, 1_000));
        assert_eq!(dispatcher.submit(|| async { "before" }).await, Ok("before"));

        dispatcher.shutdown().await;

        assert_err!(dispatcher.submit(|| async { "after" }).await);
        assert_eq!(
            dispatcher.submit(|| async { "after" }).await,
            Err(DispatchError::Closed)
        );
        assert_eq!(dispatcher.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_zero_sizes_are_clamped() {
        let dispatcher = Dispatcher::start(config(0, 0, 1_000));
        assert_eq!(dispatcher.config().workers, 1);
        assert_eq!(dispatcher.config().queue_capacity, 1);
        assert_eq!(dispatcher.submit(|| async { true }).await, Ok(true));
    }
}
