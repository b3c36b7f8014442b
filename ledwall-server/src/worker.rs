//! Pool of IO worker reactors.
//!
//! Each worker is an OS thread running its own single-threaded tokio
//! runtime. Sessions are spawned onto the worker with the fewest live
//! sessions at accept time and stay there until they close.
//!
//! ```text
//!   main reactor ── accept ──► least_loaded() ──► worker N: session task
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Number of workers to run when the configuration leaves it at 0.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

// ── IoWorker ─────────────────────────────────────────────────────

/// One worker thread and the handle of its reactor.
#[derive(Debug)]
pub struct IoWorker {
    id: usize,
    handle: Handle,
    sessions: Arc<AtomicUsize>,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl IoWorker {
    /// Start worker `id`. The thread parks on its reactor until [`stop`](Self::stop).
    pub fn start(id: usize) -> std::io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (stop, stopped) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(format!("ledwall-io-{id}"))
            .spawn(move || {
                debug!(worker = id, "IO worker running");
                runtime.block_on(async {
                    let _ = stopped.await;
                });
                // Dropping the runtime drops every task still parked on it.
                drop(runtime);
                debug!(worker = id, "IO worker exited");
            })?;

        Ok(Self {
            id,
            handle,
            sessions: Arc::new(AtomicUsize::new(0)),
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Live sessions on this worker.
    pub fn load(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Run `task` on this worker's reactor. The worker's load counts the
    /// task until it completes or is dropped.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let lease = Lease::new(Arc::clone(&self.sessions));
        self.handle.spawn(async move {
            let _lease = lease;
            task.await;
        });
    }

    /// Ask the worker thread to exit and wait for it.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(worker = self.id, "IO worker panicked");
            }
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Load accounting for one spawned task.
#[derive(Debug)]
struct Lease(Arc<AtomicUsize>);

impl Lease {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── WorkerPool ───────────────────────────────────────────────────

/// Fixed set of [`IoWorker`]s with least-connection assignment.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<IoWorker>,
}

impl WorkerPool {
    /// Start `count` workers (at least one).
    pub fn start(count: usize) -> std::io::Result<Self> {
        let count = count.max(1);
        let workers = (0..count)
            .map(IoWorker::start)
            .collect::<std::io::Result<Vec<_>>>()?;
        info!(workers = count, "IO worker pool started");
        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// The worker with the fewest live sessions. Ties go to the lowest id.
    pub fn least_loaded(&self) -> &IoWorker {
        // The pool always holds at least one worker.
        let mut best = &self.workers[0];
        for worker in &self.workers[1..] {
            if worker.load() < best.load() {
                best = worker;
            }
        }
        best
    }

    /// Live sessions per worker, in id order.
    pub fn loads(&self) -> Vec<usize> {
        self.workers.iter().map(IoWorker::load).collect()
    }

    /// Stop and join every worker.
    pub fn shutdown(mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
        info!("IO worker pool stopped");
    }
}

// ── Tests ────────────────────────────────────────────────────────
