//! Bounded worker pool that runs business methods off the I/O threads.
//!
//! Admission follows the classic executor rule:
//! 1. fewer than `core` workers: start a worker for the task
//! 2. otherwise queue the task if the queue has room
//! 3. otherwise start a worker if fewer than `max` are running
//! 4. otherwise reject with `Overloaded`
//!
//! Workers above the core count exit after `keep_alive` without work. The
//! rejection in step 4 is the only admission control in the system.
//!
//! # Thread Safety
//!
//! All pool state sits behind one `parking_lot::Mutex` with a `Condvar` for
//! idle workers. The process-wide pool is created once through a `OnceLock`.

use crate::config::{PoolConfig, PoolDefaults};
use crate::error::{Result, RpcError};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

static GLOBAL_POOL: OnceLock<Arc<DispatchPool>> = OnceLock::new();

struct PoolState {
    queue: VecDeque<Task>,
    workers: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    work_available: Condvar,
    core_threads: usize,
    max_threads: usize,
    keep_alive: Duration,
    queue_capacity: usize,
    next_worker_id: AtomicUsize,
    completed: AtomicU64,
}

/// Bounded thread pool with a fixed-capacity admission queue.
pub struct DispatchPool {
    shared: Arc<Shared>,
}

impl DispatchPool {
    pub fn new(config: &PoolConfig) -> Self {
        let core_threads = config.core_threads();
        let max_threads = config.max_threads();
        info!(
            "Dispatch pool: core={} max={} keep_alive={:?} queue={}",
            core_threads,
            max_threads,
            config.keep_alive(),
            config.queue_capacity
        );

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: 0,
                    shutdown: false,
                }),
                work_available: Condvar::new(),
                core_threads,
                max_threads,
                keep_alive: config.keep_alive(),
                queue_capacity: config.queue_capacity.max(1),
                next_worker_id: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
            }),
        }
    }

    /// The process-wide pool, built with default sizing on first use unless
    /// [`DispatchPool::init_global`] ran before.
    pub fn global() -> Arc<DispatchPool> {
        GLOBAL_POOL
            .get_or_init(|| Arc::new(DispatchPool::new(&PoolConfig::default())))
            .clone()
    }

    /// Build the process-wide pool from `config`.
    ///
    /// Returns `false` when the pool already existed; the existing pool is
    /// kept unchanged.
    pub fn init_global(config: &PoolConfig) -> bool {
        let mut created = false;
        GLOBAL_POOL.get_or_init(|| {
            created = true;
            Arc::new(DispatchPool::new(config))
        });
        created
    }

    /// Submit a task, or reject it with `Overloaded` when the queue is full
    /// and every allowed worker is running.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let task: Task = Box::new(task);
        let mut state = self.shared.state.lock();

        if state.shutdown {
            return Err(RpcError::Overloaded {
                pending: state.queue.len(),
            });
        }

        if state.workers < self.shared.core_threads {
            state.workers += 1;
            drop(state);
            return self.spawn_worker(task);
        }

        if state.queue.len() < self.shared.queue_capacity {
            state.queue.push_back(task);
            drop(state);
            self.shared.work_available.notify_one();
            return Ok(());
        }

        if state.workers < self.shared.max_threads {
            state.workers += 1;
            drop(state);
            return self.spawn_worker(task);
        }

        let pending = state.queue.len();
        warn!(
            "Dispatch pool rejected task: {} queued, {} workers busy",
            pending, state.workers
        );
        Err(RpcError::Overloaded { pending })
    }

    /// Run `f` on the pool and wait for its result without blocking the
    /// calling task.
    pub async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
                RpcError::InvocationFailed {
                    message: panic_message(payload.as_ref()),
                }
            });
            let _ = tx.send(outcome);
        })?;

        rx.await.map_err(|_| RpcError::InvocationFailed {
            message: "task dropped before completion".to_string(),
        })?
    }

    fn spawn_worker(&self, first: Task) -> Result<()> {
        let id = self.shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let shared = self.shared.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("{}-{}", PoolDefaults::THREAD_NAME_PREFIX, id))
            .spawn(move || worker_loop(shared, first));

        if let Err(e) = spawned {
            self.shared.state.lock().workers -= 1;
            return Err(e.into());
        }
        Ok(())
    }

    /// Workers currently alive.
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().workers
    }

    /// Tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Tasks that have finished (including ones that panicked).
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    pub fn core_threads(&self) -> usize {
        self.shared.core_threads
    }

    pub fn max_threads(&self) -> usize {
        self.shared.max_threads
    }

    pub fn queue_capacity(&self) -> usize {
        self.shared.queue_capacity
    }

    /// Stop accepting tasks. Queued tasks still run; workers exit once the
    /// queue is empty.
    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work_available.notify_all();
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Text of a panic payload raised with `panic!("...")` or `panic!("{}", ..)`.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

fn worker_loop(shared: Arc<Shared>, first: Task) {
    let mut next = Some(first);

    loop {
        if let Some(task) = next.take() {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                warn!("Dispatch task panicked");
            }
            shared.completed.fetch_add(1, Ordering::Relaxed);
        }

        let mut state = shared.state.lock();
        loop {
            if let Some(task) = state.queue.pop_front() {
                next = Some(task);
                break;
            }
            if state.shutdown {
                state.workers -= 1;
                return;
            }
            if state.workers > shared.core_threads {
                let timed_out = shared
                    .work_available
                    .wait_for(&mut state, shared.keep_alive)
                    .timed_out();
                if timed_out && state.queue.is_empty() && state.workers > shared.core_threads {
                    state.workers -= 1;
                    debug!("Dispatch worker retired after keep-alive");
                    return;
                }
            } else {
                shared.work_available.wait(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn small_pool(core: usize, max: usize, capacity: usize) -> DispatchPool {
        DispatchPool::new(&PoolConfig {
            core_threads: Some(core),
            max_threads: Some(max),
            keep_alive_ms: 50,
            queue_capacity: capacity,
        })
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_runs_submitted_tasks() {
        let pool = small_pool(2, 4, 16);
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.submit(move || tx.send(i).unwrap()).unwrap();
        }
        let mut got: Vec<i32> = (0..10).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        got.sort();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
        assert!(pool.worker_count() <= 2);
    }

    #[test]
    fn test_rejects_beyond_queue_capacity() {
        let pool = small_pool(1, 1, 2);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        // Occupies the only worker
        let done = done_tx.clone();
        pool.submit(move || {
            release_rx.recv().unwrap();
            done.send(()).unwrap();
        })
        .unwrap();

        for _ in 0..2 {
            let done = done_tx.clone();
            pool.submit(move || done.send(()).unwrap()).unwrap();
        }
        assert_eq!(pool.queued(), 2);

        match pool.submit(|| {}) {
            Err(RpcError::Overloaded { pending }) => assert_eq!(pending, 2),
            other => panic!("Expected Overloaded, got: {:?}", other.err()),
        }

        release_tx.send(()).unwrap();
        for _ in 0..3 {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn test_grows_to_max_then_retires_extra_workers() {
        let pool = small_pool(1, 2, 1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(std::sync::Mutex::new(release_rx));

        for _ in 0..3 {
            let rx = release_rx.clone();
            pool.submit(move || {
                let _ = rx.lock().unwrap().recv();
            })
            .unwrap();
        }
        // First task on the core worker, second queued, third on a new worker
        assert_eq!(pool.worker_count(), 2);
        assert!(matches!(pool.submit(|| {}), Err(RpcError::Overloaded { .. })));

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        assert!(wait_until(|| pool.completed() == 3));
        assert!(wait_until(|| pool.worker_count() == 1));
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let pool = small_pool(1, 1, 4);
        pool.submit(|| panic!("boom")).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.submit(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        assert_eq!(pool.worker_count(), 1);
    }

    #[test]
    fn test_shutdown_rejects_new_tasks() {
        let pool = small_pool(1, 1, 4);
        pool.shutdown();
        assert!(matches!(pool.submit(|| {}), Err(RpcError::Overloaded { .. })));
    }

    #[tokio::test]
    async fn test_run_returns_result() {
        let pool = small_pool(1, 2, 4);
        let value = pool.run(|| 6 * 7).await.unwrap();
        assert_eq!(value, 42);

        let err = pool.run(|| -> i32 { panic!("boom") }).await.unwrap_err();
        match err {
            RpcError::InvocationFailed { message } => assert_eq!(message, "panicked: boom"),
            other => panic!("Expected InvocationFailed, got: {:?}", other),
        }

        let err = pool
            .run(|| -> i32 { panic!("index {} out of range", 3) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invocation failed: panicked: index 3 out of range");

        // The worker survives and keeps serving
        assert_eq!(pool.run(|| 1).await.unwrap(), 1);
    }

    #[test]
    fn test_global_pool_is_built_once() {
        let a = DispatchPool::global();
        let b = DispatchPool::global();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!DispatchPool::init_global(&PoolConfig::default()));
        assert_eq!(a.queue_capacity(), PoolDefaults::QUEUE_CAPACITY);
        assert_eq!(a.max_threads(), a.core_threads() * 2);
    }
}
