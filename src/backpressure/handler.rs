//! Bounded admission and execution of queued asynchronous work.

use crate::config::duration_secs;
use crate::{Error, RejectReason, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Memory charged to a task when the caller provides no estimate.
const DEFAULT_TASK_ESTIMATE_BYTES: u64 = 1024 * 1024;

/// Completions kept for the rolling average processing time.
const DURATION_WINDOW: usize = 100;

/// How long `shutdown` waits for running tasks to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What to do when a handler is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Refuse the new task; the caller uses its own fallback path.
    Reject,
    /// Evict the oldest still-queued task, then admit the new one.
    DropOldest,
    /// Blend queue depth, memory pressure and recent processing time into
    /// a monotone load score: higher observed load never increases the
    /// admission probability.
    Adaptive,
}

/// Configuration for one named backpressure handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub name: String,
    /// Admitted-but-unstarted tasks allowed to wait.
    pub max_queue_size: usize,
    /// Estimated memory budget across queued and running tasks.
    pub max_memory_mb: u64,
    /// Worker-pool concurrency ceiling.
    pub max_concurrency: usize,
    pub strategy: BackpressureStrategy,
    /// Deadline for a task's combined wait + execution time.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_queue_size: 100,
            max_memory_mb: 256,
            max_concurrency: 8,
            strategy: BackpressureStrategy::Reject,
            timeout: Duration::from_secs(30),
        }
    }
}

impl BackpressureConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    pub fn with_max_concurrency(mut self, workers: usize) -> Self {
        self.max_concurrency = workers.max(1);
        self
    }

    pub fn with_strategy(mut self, strategy: BackpressureStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Stats block for one handler, also feeding Adaptive decisions.
#[derive(Debug, Clone, Serialize)]
pub struct BackpressureStats {
    pub name: String,
    pub current_queue_size: usize,
    pub current_memory_mb: f64,
    pub total_processed: u64,
    pub total_dropped: u64,
    pub total_blocked: u64,
    pub average_processing_time_ms: u64,
    pub strategy: BackpressureStrategy,
}

struct QueuedEntry {
    task_id: String,
    abort: AbortHandle,
}

struct Inner {
    name: String,
    queued: Mutex<VecDeque<QueuedEntry>>,
    memory_bytes: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    blocked: AtomicU64,
    durations: Mutex<VecDeque<Duration>>,
    shutdown: AtomicBool,
}

impl Inner {
    fn take_queued(&self, task_id: &str) -> bool {
        let mut queued = self.queued.lock().unwrap();
        if let Some(pos) = queued.iter().position(|e| e.task_id == task_id) {
            queued.remove(pos);
            true
        } else {
            false
        }
    }

    /// Evict the oldest waiting task. Its handle resolves as dropped; the
    /// memory estimate is released by the task's guard when the abort
    /// lands.
    fn evict_oldest(&self) -> bool {
        let entry = self.queued.lock().unwrap().pop_front();
        match entry {
            Some(entry) => {
                entry.abort.abort();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    handler = self.name.as_str(),
                    task_id = entry.task_id.as_str(),
                    "dropped oldest queued task to admit a newer one"
                );
                true
            }
            None => false,
        }
    }

    fn record_completion(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let mut durations = self.durations.lock().unwrap();
        if durations.len() == DURATION_WINDOW {
            durations.pop_front();
        }
        durations.push_back(elapsed);
    }

    fn average_processing_time(&self) -> Duration {
        let durations = self.durations.lock().unwrap();
        if durations.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = durations.iter().sum();
        total / durations.len() as u32
    }

    fn queue_len(&self) -> usize {
        self.queued.lock().unwrap().len()
    }
}

/// Releases a task's memory estimate exactly once, whenever the task
/// future is dropped: completion, timeout, eviction or cancellation.
struct EstimateGuard {
    inner: Arc<Inner>,
    bytes: u64,
}

impl Drop for EstimateGuard {
    fn drop(&mut self) {
        self.inner.memory_bytes.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}

/// Handle to an admitted task.
///
/// Await the result with [`TaskHandle::join`]; [`TaskHandle::cancel`] is
/// effective only while the task is still waiting for a worker.
pub struct TaskHandle<T> {
    task_id: String,
    inner: Arc<Inner>,
    join: JoinHandle<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel the task if it has not started executing. Returns true when
    /// the cancellation took effect.
    pub fn cancel(&self) -> bool {
        if self.inner.take_queued(&self.task_id) {
            self.join.abort();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                handler = self.inner.name.as_str(),
                task_id = self.task_id.as_str(),
                "task cancelled before start"
            );
            true
        } else {
            false
        }
    }

    /// Wait for the task outcome.
    pub async fn join(self) -> Result<T> {
        match self.join.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(Error::BackpressureRejected {
                resource: self.inner.name.clone(),
                reason: RejectReason::Dropped,
            }),
        }
    }
}

enum AdmitDecision {
    Admit,
    EvictThenAdmit,
    Reject,
}

/// Bounds concurrent and queued asynchronous work for one named resource.
///
/// A bounded worker pool (semaphore permits) executes admitted tasks;
/// admitted-but-unstarted tasks are the queue. Queues are purely
/// per-process memory and die with the process.
pub struct BackpressureHandler {
    config: BackpressureConfig,
    semaphore: Arc<Semaphore>,
    inner: Arc<Inner>,
}

impl BackpressureHandler {
    pub fn new(config: BackpressureConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let inner = Arc::new(Inner {
            name: config.name.clone(),
            queued: Mutex::new(VecDeque::new()),
            memory_bytes: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            durations: Mutex::new(VecDeque::new()),
            shutdown: AtomicBool::new(false),
        });
        Self {
            config,
            semaphore,
            inner,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Submit with a generated task id.
    pub fn submit<T, F>(&self, task: F) -> Option<TaskHandle<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_task(Uuid::new_v4().to_string(), task)
    }

    /// Submit a task under the default memory estimate.
    ///
    /// Returns `None` without blocking when admission is denied; the
    /// caller is expected to take its own fallback path.
    pub fn submit_task<T, F>(&self, task_id: impl Into<String>, task: F) -> Option<TaskHandle<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_task_with_estimate(task_id, DEFAULT_TASK_ESTIMATE_BYTES, task)
    }

    /// Submit a task whose expected working-set size is known.
    pub fn submit_task_with_estimate<T, F>(
        &self,
        task_id: impl Into<String>,
        estimated_bytes: u64,
        task: F,
    ) -> Option<TaskHandle<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let task_id = task_id.into();
        if self.inner.shutdown.load(Ordering::SeqCst) {
            debug!(
                handler = self.config.name.as_str(),
                task_id = task_id.as_str(),
                "submission refused, handler is shutting down"
            );
            return None;
        }

        match self.decide(estimated_bytes) {
            AdmitDecision::Admit => {}
            // One eviction frees exactly the slot the new task takes, so
            // the queue bound holds without re-checking.
            AdmitDecision::EvictThenAdmit => {
                if !self.inner.evict_oldest() {
                    self.refuse(&task_id);
                    return None;
                }
            }
            AdmitDecision::Reject => {
                self.refuse(&task_id);
                return None;
            }
        }

        self.inner.memory_bytes.fetch_add(estimated_bytes, Ordering::Relaxed);
        let guard = EstimateGuard {
            inner: self.inner.clone(),
            bytes: estimated_bytes,
        };

        let inner = self.inner.clone();
        let semaphore = self.semaphore.clone();
        let timeout = self.config.timeout;
        let name = self.config.name.clone();
        let id = task_id.clone();
        let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            let _guard = guard;
            // Hold until the submitter has put us in the queue registry,
            // otherwise a fast start could race its own registration.
            if registered_rx.await.is_err() {
                return Err(Error::BackpressureRejected {
                    resource: name,
                    reason: RejectReason::Cancelled,
                });
            }

            let attempt = tokio::time::timeout(timeout, async {
                let permit = semaphore.acquire_owned().await.map_err(|_| {
                    Error::BackpressureRejected {
                        resource: inner.name.clone(),
                        reason: RejectReason::ShuttingDown,
                    }
                })?;
                if !inner.take_queued(&id) {
                    // Evicted or cancelled while we raced for the permit.
                    return Err(Error::BackpressureRejected {
                        resource: inner.name.clone(),
                        reason: RejectReason::Cancelled,
                    });
                }
                let started = Instant::now();
                let outcome = task.await;
                inner.record_completion(started.elapsed());
                drop(permit);
                outcome
            })
            .await;

            match attempt {
                Ok(outcome) => outcome,
                Err(_elapsed) => {
                    // Covers both a task stuck in the queue and one cut off
                    // mid-execution; the inner future was dropped either way.
                    inner.take_queued(&id);
                    inner.blocked.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        handler = inner.name.as_str(),
                        task_id = id.as_str(),
                        timeout_ms = timeout.as_millis() as u64,
                        "task exceeded its wait+execution deadline"
                    );
                    Err(Error::BackpressureRejected {
                        resource: inner.name.clone(),
                        reason: RejectReason::TimedOut,
                    })
                }
            }
        });

        self.inner.queued.lock().unwrap().push_back(QueuedEntry {
            task_id: task_id.clone(),
            abort: join.abort_handle(),
        });
        let _ = registered_tx.send(());

        Some(TaskHandle {
            task_id,
            inner: self.inner.clone(),
            join,
        })
    }

    pub fn stats(&self) -> BackpressureStats {
        BackpressureStats {
            name: self.config.name.clone(),
            current_queue_size: self.inner.queue_len(),
            current_memory_mb: self.inner.memory_bytes.load(Ordering::Relaxed) as f64
                / (1024.0 * 1024.0),
            total_processed: self.inner.processed.load(Ordering::Relaxed),
            total_dropped: self.inner.dropped.load(Ordering::Relaxed),
            total_blocked: self.inner.blocked.load(Ordering::Relaxed),
            average_processing_time_ms: self.inner.average_processing_time().as_millis() as u64,
            strategy: self.config.strategy,
        }
    }

    /// Refuse new work, drop everything still queued and wait (bounded)
    /// for running tasks. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<QueuedEntry> = {
            let mut queued = self.inner.queued.lock().unwrap();
            queued.drain(..).collect()
        };
        let drained_count = drained.len() as u64;
        for entry in drained {
            entry.abort.abort();
        }
        self.inner.dropped.fetch_add(drained_count, Ordering::Relaxed);
        self.semaphore.close();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.semaphore.available_permits() < self.config.max_concurrency
            && Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let still_running = self
            .config
            .max_concurrency
            .saturating_sub(self.semaphore.available_permits());
        info!(
            handler = self.config.name.as_str(),
            dropped = drained_count,
            still_running,
            "backpressure handler shut down"
        );
    }

    fn refuse(&self, task_id: &str) {
        self.inner.blocked.fetch_add(1, Ordering::Relaxed);
        debug!(
            handler = self.config.name.as_str(),
            task_id,
            queue = self.inner.queue_len(),
            "task rejected at admission"
        );
    }

    fn decide(&self, estimated_bytes: u64) -> AdmitDecision {
        let queue_len = self.inner.queue_len();
        let memory_after =
            self.inner.memory_bytes.load(Ordering::Relaxed) + estimated_bytes;
        let max_bytes = self.config.max_memory_mb * 1024 * 1024;
        let at_capacity = queue_len >= self.config.max_queue_size || memory_after > max_bytes;

        match self.config.strategy {
            BackpressureStrategy::Reject => {
                if at_capacity {
                    AdmitDecision::Reject
                } else {
                    AdmitDecision::Admit
                }
            }
            BackpressureStrategy::DropOldest => {
                if !at_capacity {
                    AdmitDecision::Admit
                } else if queue_len > 0 {
                    AdmitDecision::EvictThenAdmit
                } else {
                    AdmitDecision::Reject
                }
            }
            BackpressureStrategy::Adaptive => {
                let score = self.load_score(queue_len, memory_after, max_bytes);
                if score >= 0.9 {
                    AdmitDecision::Reject
                } else if at_capacity || score >= 0.7 {
                    if queue_len > 0 {
                        AdmitDecision::EvictThenAdmit
                    } else if at_capacity {
                        AdmitDecision::Reject
                    } else {
                        AdmitDecision::Admit
                    }
                } else {
                    AdmitDecision::Admit
                }
            }
        }
    }

    /// Monotone load score in [0, 1]: the worst of queue-depth ratio,
    /// memory ratio and processing-time pressure. Any dimension growing
    /// can only raise the score, so higher load never improves a task's
    /// odds of admission.
    fn load_score(&self, queue_len: usize, memory_after: u64, max_bytes: u64) -> f64 {
        let queue_ratio = if self.config.max_queue_size == 0 {
            1.0
        } else {
            queue_len as f64 / self.config.max_queue_size as f64
        };
        let memory_ratio = if max_bytes == 0 {
            1.0
        } else {
            memory_after as f64 / max_bytes as f64
        };
        let time_pressure = if self.config.timeout.is_zero() {
            0.0
        } else {
            self.inner.average_processing_time().as_secs_f64() / self.config.timeout.as_secs_f64()
        };
        queue_ratio.max(memory_ratio).max(time_pressure).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(config: BackpressureConfig) -> BackpressureHandler {
        BackpressureHandler::new(config)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_submit_and_join() {
        let bp = handler(BackpressureConfig::new("tts"));
        let handle = bp.submit_task("t1", async { Ok(21 * 2) }).unwrap();
        assert_eq!(handle.task_id(), "t1");
        assert_eq!(handle.join().await.unwrap(), 42);

        settle().await;
        let stats = bp.stats();
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.current_queue_size, 0);
    }

    #[tokio::test]
    async fn test_reject_at_queue_capacity_without_blocking() {
        let bp = handler(
            BackpressureConfig::new("asr")
                .with_max_queue_size(2)
                .with_max_concurrency(1)
                .with_strategy(BackpressureStrategy::Reject),
        );

        // Occupy the single worker.
        let _running = bp
            .submit_task("running", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .unwrap();
        settle().await;

        let _q1 = bp
            .submit_task("q1", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .unwrap();
        let _q2 = bp
            .submit_task("q2", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .unwrap();
        settle().await;
        assert_eq!(bp.stats().current_queue_size, 2);

        // At capacity: no handle, immediately.
        assert!(bp.submit_task("q3", async { Ok(()) }).is_none());
        assert_eq!(bp.stats().total_blocked, 1);
    }

    #[tokio::test]
    async fn test_drop_oldest_retains_newest_tasks() {
        let bp = handler(
            BackpressureConfig::new("asr")
                .with_max_queue_size(2)
                .with_max_concurrency(1)
                .with_strategy(BackpressureStrategy::DropOldest),
        );

        let _running = bp
            .submit_task("running", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok("r")
            })
            .unwrap();
        settle().await;

        let oldest = bp.submit_task("old", async { Ok("old") }).unwrap();
        let _mid = bp.submit_task("mid", async { Ok("mid") }).unwrap();
        settle().await;

        let newest = bp.submit_task("new", async { Ok("new") }).unwrap();
        settle().await;

        // The oldest queued task was evicted for the newest.
        assert_eq!(bp.stats().current_queue_size, 2);
        assert_eq!(bp.stats().total_dropped, 1);
        let err = oldest.join().await.unwrap_err();
        assert!(matches!(
            err,
            Error::BackpressureRejected {
                reason: RejectReason::Dropped,
                ..
            }
        ));
        drop(newest);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_blocked() {
        let bp = handler(
            BackpressureConfig::new("slow").with_timeout(Duration::from_millis(50)),
        );
        let handle = bp
            .submit_task("t", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .unwrap();

        let err = handle.join().await.unwrap_err();
        assert!(matches!(
            err,
            Error::BackpressureRejected {
                reason: RejectReason::TimedOut,
                ..
            }
        ));
        assert_eq!(bp.stats().total_blocked, 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let bp = handler(BackpressureConfig::new("x").with_max_concurrency(1));

        let _running = bp
            .submit_task("running", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .unwrap();
        settle().await;

        let queued = bp.submit_task("queued", async { Ok(()) }).unwrap();
        settle().await;
        assert!(queued.cancel());

        let err = queued.join().await.unwrap_err();
        assert!(matches!(err, Error::BackpressureRejected { .. }));
        assert_eq!(bp.stats().total_dropped, 1);
        assert_eq!(bp.stats().current_queue_size, 0);
    }

    #[tokio::test]
    async fn test_cancel_after_start_is_a_no_op() {
        let bp = handler(BackpressureConfig::new("x"));
        let handle = bp
            .submit_task("t", async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(7)
            })
            .unwrap();
        settle().await;

        assert!(!handle.cancel());
        assert_eq!(handle.join().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_memory_limit_gates_admission() {
        let bp = handler(
            BackpressureConfig::new("mem")
                .with_max_memory_mb(2)
                .with_max_concurrency(1)
                .with_strategy(BackpressureStrategy::Reject),
        );

        let one_mb = 1024 * 1024;
        let _a = bp
            .submit_task_with_estimate("a", one_mb, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .unwrap();
        let _b = bp
            .submit_task_with_estimate("b", one_mb, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .unwrap();
        settle().await;

        assert!(bp
            .submit_task_with_estimate("c", one_mb, async { Ok(()) })
            .is_none());
        assert!(bp.stats().current_memory_mb > 1.9);
    }

    #[tokio::test]
    async fn test_memory_released_after_completion() {
        let bp = handler(BackpressureConfig::new("mem"));
        let handle = bp
            .submit_task_with_estimate("a", 1024 * 1024, async { Ok(()) })
            .unwrap();
        handle.join().await.unwrap();
        settle().await;
        assert!(bp.stats().current_memory_mb < 0.01);
    }

    #[tokio::test]
    async fn test_adaptive_rejects_past_the_load_ceiling() {
        let bp = handler(
            BackpressureConfig::new("adaptive")
                .with_max_queue_size(100)
                .with_max_concurrency(1)
                .with_max_memory_mb(10)
                .with_strategy(BackpressureStrategy::Adaptive),
        );

        // A task whose estimate alone puts the load score at the reject
        // line is refused outright, with nothing queued to shed.
        assert!(bp
            .submit_task_with_estimate("huge", 9 * 1024 * 1024 + 1, async { Ok(()) })
            .is_none());
        assert_eq!(bp.stats().total_blocked, 1);
        assert_eq!(bp.stats().current_queue_size, 0);
    }

    #[tokio::test]
    async fn test_adaptive_sheds_oldest_in_the_pressure_band() {
        let bp = handler(
            BackpressureConfig::new("adaptive")
                .with_max_queue_size(10)
                .with_max_concurrency(1)
                .with_max_memory_mb(1024)
                .with_strategy(BackpressureStrategy::Adaptive),
        );

        let _running = bp
            .submit_task("running", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .unwrap();
        settle().await;

        for i in 0..7 {
            assert!(bp
                .submit_task(format!("t{}", i), async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                })
                .is_some());
        }
        settle().await;
        assert_eq!(bp.stats().current_queue_size, 7);

        // At 70% queue load the handler sheds the oldest waiting task
        // instead of growing the queue.
        assert!(bp
            .submit_task("newest", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .is_some());
        settle().await;
        assert_eq!(bp.stats().current_queue_size, 7);
        assert!(bp.stats().total_dropped >= 1);
    }

    #[tokio::test]
    async fn test_queue_never_exceeds_bound() {
        let bp = handler(
            BackpressureConfig::new("bound")
                .with_max_queue_size(3)
                .with_max_concurrency(1)
                .with_strategy(BackpressureStrategy::DropOldest),
        );

        let _running = bp
            .submit_task("running", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .unwrap();
        settle().await;

        for i in 0..10 {
            bp.submit_task(format!("t{}", i), async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            });
            assert!(bp.stats().current_queue_size <= 3);
        }
    }

    #[tokio::test]
    async fn test_shutdown_drops_queued_and_refuses_new() {
        let bp = handler(
            BackpressureConfig::new("down")
                .with_max_queue_size(5)
                .with_max_concurrency(1),
        );

        let _running = bp
            .submit_task("running", async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
            .unwrap();
        settle().await;
        let queued = bp.submit_task("queued", async { Ok(()) }).unwrap();
        settle().await;

        bp.shutdown().await;
        assert!(bp.submit_task("late", async { Ok(()) }).is_none());

        let err = queued.join().await.unwrap_err();
        assert!(matches!(err, Error::BackpressureRejected { .. }));
    }

    #[tokio::test]
    async fn test_average_processing_time_tracked() {
        let bp = handler(BackpressureConfig::new("avg"));
        for i in 0..3 {
            let handle = bp
                .submit_task(format!("t{}", i), async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                })
                .unwrap();
            handle.join().await.unwrap();
        }
        let stats = bp.stats();
        assert_eq!(stats.total_processed, 3);
        assert!(stats.average_processing_time_ms >= 20);
    }
}
