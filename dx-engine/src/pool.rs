//! Merkle worker pool
//!
//! CPU-bound tree building is moved off the async runtime onto a small set
//! of OS threads fed from one explicit job queue. `min_threads` workers are
//! started eagerly; more are spawned while every worker is busy and jobs
//! are waiting, up to `max_threads`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub threads: usize,
    pub busy: usize,
    pub queued: usize,
}

/// Fixed job queue served by a bounded set of worker threads
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Arc<Mutex<Receiver<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    busy: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    min_threads: usize,
    max_threads: usize,
}

impl WorkerPool {
    /// Start `min_threads` workers; the pool never grows past `max_threads`
    pub fn new(min_threads: usize, max_threads: usize) -> EngineResult<Self> {
        if min_threads == 0 || min_threads > max_threads {
            return Err(EngineError::WorkerPool(format!(
                "invalid bounds: min={} max={}",
                min_threads, max_threads
            )));
        }

        let (sender, receiver) = mpsc::channel::<Job>();
        let pool = Self {
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(Mutex::new(receiver)),
            workers: Mutex::new(Vec::with_capacity(max_threads)),
            busy: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
            min_threads,
            max_threads,
        };

        for _ in 0..min_threads {
            pool.spawn_worker()?;
        }
        Ok(pool)
    }

    /// Run `task` on a worker thread and wait for its result
    pub async fn run<F, T>(&self, task: F) -> EngineResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move || {
            let _ = tx.send(task());
        }))?;

        rx.await
            .map_err(|_| EngineError::WorkerPool("worker dropped the job".to_string()))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            threads: self.thread_count(),
            busy: self.busy.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn min_threads(&self) -> usize {
        self.min_threads
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Close the queue and wait for the workers to drain it
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("Merkle worker exited abnormally");
            }
        }
    }

    fn submit(&self, job: Job) -> EngineResult<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sender = sender
            .as_ref()
            .ok_or_else(|| EngineError::WorkerPool("pool is shut down".to_string()))?;

        self.queued.fetch_add(1, Ordering::SeqCst);
        let result = self.grow_if_saturated().and_then(|_| {
            sender
                .send(job)
                .map_err(|_| EngineError::WorkerPool("job queue closed".to_string()))
        });
        if result.is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    fn grow_if_saturated(&self) -> EngineResult<()> {
        let threads = self.thread_count();
        let demand = self.busy.load(Ordering::SeqCst) + self.queued.load(Ordering::SeqCst);
        if demand > threads && threads < self.max_threads {
            self.spawn_worker()?;
        }
        Ok(())
    }

    fn spawn_worker(&self) -> EngineResult<()> {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if workers.len() >= self.max_threads {
            return Ok(());
        }

        let index = workers.len();
        let receiver = self.receiver.clone();
        let busy = self.busy.clone();
        let queued = self.queued.clone();

        let handle = thread::Builder::new()
            .name(format!("dx-merkle-{}", index))
            .spawn(move || worker_loop(receiver, busy, queued))
            .map_err(|e| EngineError::WorkerPool(format!("failed to spawn worker: {}", e)))?;

        workers.push(handle);
        debug!(threads = workers.len(), "Merkle worker started");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit once the queue is closed and empty
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>, busy: Arc<AtomicUsize>, queued: Arc<AtomicUsize>) {
    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            receiver.recv()
        };

        let job = match job {
            Ok(job) => job,
            Err(_) => break,
        };

        queued.fetch_sub(1, Ordering::SeqCst);
        busy.fetch_add(1, Ordering::SeqCst);
        // A panicking job drops its result sender; the caller sees WorkerPool
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("Merkle job panicked");
        }
        busy.fetch_sub(1, Ordering::SeqCst);
    }
}
