//! Elastic pool of tokio tasks draining a shared job queue.
//!
//! `min_workers` core workers live until shutdown. When a job is submitted
//! and no worker is idle, an extra worker is spawned (up to `max_workers`);
//! extras exit after `keep_alive` without work.

use crate::error::{ChannelError, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

pub type Job = BoxFuture<'static, ()>;

struct Shared {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>,
    live: AtomicUsize,
    idle: AtomicUsize,
}

struct Running {
    tx: mpsc::UnboundedSender<Job>,
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

pub struct WorkerPool {
    min_workers: usize,
    max_workers: usize,
    keep_alive: Duration,
    running: Mutex<Option<Running>>,
}

impl WorkerPool {
    pub fn new(min_workers: usize, max_workers: usize, keep_alive: Duration) -> Self {
        Self {
            min_workers: min_workers.min(max_workers),
            max_workers,
            keep_alive,
            running: Mutex::new(None),
        }
    }

    /// Spawn the core workers. No-op if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            rx: tokio::sync::Mutex::new(rx),
            live: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
        });

        let handles = (0..self.min_workers)
            .map(|_| spawn_worker(&shared, None))
            .collect();

        debug!(
            "Worker pool started ({} core, {} max)",
            self.min_workers, self.max_workers
        );
        *running = Some(Running {
            tx,
            shared,
            handles,
        });
    }

    /// Abort every worker. Jobs still queued are dropped unrun.
    pub fn shutdown(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(running) = running {
            for handle in &running.handles {
                handle.abort();
            }
            debug!("Worker pool stopped ({} workers aborted)", running.handles.len());
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Workers currently alive (0 when stopped).
    pub fn live_workers(&self) -> usize {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |r| r.shared.live.load(Ordering::SeqCst))
    }

    /// Queue a job. Fails with `NotRunning` if the pool is stopped.
    pub fn submit(&self, job: Job) -> Result<()> {
        let mut guard = self.running.lock().unwrap_or_else(|e| e.into_inner());
        let running = guard.as_mut().ok_or(ChannelError::NotRunning)?;

        running
            .tx
            .send(job)
            .map_err(|_| ChannelError::NotRunning)?;

        let shared = &running.shared;
        if shared.idle.load(Ordering::SeqCst) == 0
            && shared.live.load(Ordering::SeqCst) < self.max_workers
        {
            trace!("No idle worker, spawning an extra one");
            running.handles.retain(|h| !h.is_finished());
            let handle = spawn_worker(shared, Some(self.keep_alive));
            running.handles.push(handle);
        }

        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(shared: &Arc<Shared>, keep_alive: Option<Duration>) -> JoinHandle<()> {
    shared.live.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(worker_loop(Arc::clone(shared), keep_alive))
}

async fn worker_loop(shared: Arc<Shared>, keep_alive: Option<Duration>) {
    loop {
        shared.idle.fetch_add(1, Ordering::SeqCst);
        let next = async { shared.rx.lock().await.recv().await };
        let job = match keep_alive {
            None => next.await,
            Some(limit) => match tokio::time::timeout(limit, next).await {
                Ok(job) => job,
                Err(_) => {
                    shared.idle.fetch_sub(1, Ordering::SeqCst);
                    trace!("Extra worker idle for {:?}, exiting", limit);
                    break;
                }
            },
        };
        shared.idle.fetch_sub(1, Ordering::SeqCst);

        let Some(job) = job else { break };
        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            error!("Dispatch job panicked");
        }
    }
    shared.live.fetch_sub(1, Ordering::SeqCst);
}
