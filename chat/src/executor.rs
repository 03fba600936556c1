//! Bounded background work. Every blocking step of the delivery core (socket
//! reads and writes, presence persistence, routing fallbacks) runs as a job
//! here, never inline in the dispatch loop.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use courier_rt::sync::Mutex;
use courier_rt::{self as rt, mpsc, CancellationToken, JoinHandle};
use futures::future::{BoxFuture, FutureExt as _};

/// A unit of background work. The token is cancelled when the executor
/// shuts down.
pub type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

pub trait Executor: Send + Sync {
    /// Queues `job`. Never blocks; jobs scheduled after shutdown are dropped.
    fn schedule(&self, job: Job);

    fn shutdown(&self);
}

/// Boxes an async closure into a [`Job`].
pub fn job<F, Fut>(f: F) -> Job
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |token| f(token).boxed())
}

/// Fixed number of worker tasks sharing one job queue.
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<Job>,
    cancellation_token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("shutdown", &self.cancellation_token.is_cancelled())
            .finish()
    }
}

impl WorkerPool {
    /// Spawns `size` workers (at least one) on the current runtime.
    pub fn start(size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let cancellation_token = CancellationToken::new();
        let workers = (0..size.max(1))
            .map(|worker| rt::spawn(run_worker(worker, rx.clone(), cancellation_token.clone())))
            .collect();
        Self {
            tx,
            cancellation_token,
            workers,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Executor for WorkerPool {
    fn schedule(&self, job: Job) {
        if self.cancellation_token.is_cancelled() || self.tx.send(job).is_err() {
            tracing::warn!("Job scheduled after executor shutdown, dropping it");
        }
    }

    fn shutdown(&self) {
        self.cancellation_token.cancel();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    cancellation_token: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            rt::select! {
                _ = cancellation_token.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = next else { break };
        if let Err(panic) = AssertUnwindSafe(job(cancellation_token.clone()))
            .catch_unwind()
            .await
        {
            tracing::error!(worker, "Panic in scheduled job: {panic:?}");
        }
    }
    tracing::trace!(worker, "Worker stopped");
}
