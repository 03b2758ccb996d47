//! Worker pool lifecycle.
//!
//! All background work in the crate (sessions, channel loops, completion
//! fan-out) is spawned through a [`WorkerPool`] so it can be coalesced on
//! shutdown. Submissions after shutdown are discarded. Long-lived tasks
//! additionally watch [`WorkerPool::shutdown_signal`] and exit cooperatively.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Grace period when joining a task during shutdown.
const JOIN_GRACE: Duration = Duration::from_secs(2);

/// Tracks spawned tasks and the shutdown signal they observe.
pub struct WorkerPool {
    /// Refuses new work once set.
    stopped: AtomicBool,
    /// Cooperative shutdown signal.
    shutdown_tx: watch::Sender<bool>,
    /// Handles of live tasks, pruned opportunistically.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool in the stopped state; call [`WorkerPool::start`]
    /// before spawning.
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            stopped: AtomicBool::new(true),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build a dedicated multi-thread runtime with the configured number of
    /// worker threads, for embedders that want the networking service on its
    /// own pool.
    pub fn build_runtime(threads: usize) -> io::Result<tokio::runtime::Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("galena-net")
            .enable_all()
            .build()
    }

    /// Accept work again after a shutdown.
    pub fn start(&self) {
        self.shutdown_tx.send_replace(false);
        self.stopped.store(false, Ordering::Release);
    }

    /// Whether the pool is refusing new work.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// A receiver that flips to `true` when shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a tracked task. A no-op after shutdown.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_stopped() {
            tracing::debug!("task submitted after shutdown, discarding");
            return;
        }

        let handle = tokio::spawn(future);
        let mut tasks = self.tasks.lock().expect("pool task list poisoned");
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Begin shutdown: refuse new work and signal live tasks. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_tx.send_replace(true);
    }

    /// Wait for all tracked tasks to finish, aborting any that outlive the
    /// grace period.
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("pool task list poisoned");
            tasks.drain(..).collect()
        };

        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(JOIN_GRACE, handle).await.is_err() {
                tracing::warn!("task exceeded shutdown grace period, aborting");
                abort.abort();
            }
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}
