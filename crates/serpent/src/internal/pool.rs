use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{info, info_span, warn};

use super::worker::{NamespaceId, Worker, WorkerState};
use crate::{
    TRACE_TARGET,
    backend::{Backend, ContextMode},
    config::Config,
    error::{Error, Result},
};

/// Snapshot of one worker, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerStatus {
    pub id: usize,
    pub state: WorkerState,
}

/// Snapshot of the pool, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    pub isolated: bool,
    pub workers: Vec<WorkerStatus>,
}

impl PoolStatus {
    #[must_use]
    pub fn healthy(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| matches!(w.state, WorkerState::Ready | WorkerState::Running))
            .count()
    }
}

struct CustodianThread {
    shutdown: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

pub(crate) struct Pool<B: Backend> {
    workers: Vec<Arc<Worker>>,
    failed: Vec<Arc<Worker>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    custodian: Mutex<Option<CustodianThread>>,
    mode: ContextMode,
    next: AtomicUsize,
    next_namespace: AtomicU64,
    closed: AtomicBool,
    // Keeps the loaded runtime alive until every worker has exited.
    _backend: Arc<B>,
}

impl<B: Backend> Pool<B> {
    /// Bring up the custodian (isolated mode) and every worker, one at a
    /// time. Partial failure is tolerated; the failures are returned.
    pub(crate) fn start(backend: B, config: &Config) -> Result<(Self, Vec<Error>)> {
        let _span = info_span!(target: TRACE_TARGET, "pool.init").entered();
        let backend = Arc::new(backend);

        let mode = if config.isolation && config.workers > 1 && backend.supports_isolation() {
            ContextMode::Isolated
        } else {
            ContextMode::Shared
        };
        let count = match mode {
            ContextMode::Isolated => config.workers,
            ContextMode::Shared => 1,
        };
        info!(target: TRACE_TARGET, ?mode, workers = count, "starting pool");

        let custodian = match mode {
            ContextMode::Isolated => Some(spawn_custodian(&backend)?),
            ContextMode::Shared => None,
        };

        let mut workers = Vec::with_capacity(count);
        let mut failed = Vec::new();
        let mut threads = Vec::with_capacity(count);
        let mut failures = Vec::new();
        for id in 0..count {
            let spawned = Worker::spawn(id, Arc::clone(&backend), mode, config.queue_capacity);
            let spawned = match spawned {
                Ok(spawned) => spawned,
                Err(err) => {
                    failures.push(err);
                    continue;
                }
            };
            threads.push(spawned.thread);
            match spawned.ready.blocking_recv() {
                Ok(Ok(())) => workers.push(spawned.worker),
                Ok(Err(err)) => {
                    failures.push(err);
                    failed.push(spawned.worker);
                }
                Err(_) => {
                    failures.push(Error::WorkerExited);
                    failed.push(spawned.worker);
                }
            }
        }

        let pool = Self {
            workers,
            failed,
            threads: Mutex::new(threads),
            custodian: Mutex::new(custodian),
            mode,
            next: AtomicUsize::new(0),
            next_namespace: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            _backend: backend,
        };

        if pool.workers.is_empty() {
            pool.shutdown();
            return Err(Error::AllWorkersFailed(failures));
        }
        if !failures.is_empty() {
            warn!(
                target: TRACE_TARGET,
                healthy = pool.workers.len(),
                failed = failures.len(),
                "some workers failed to start"
            );
        }
        pool.publish_health();
        Ok((pool, failures))
    }

    /// Number of healthy workers.
    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    pub(crate) const fn is_isolated(&self) -> bool {
        matches!(self.mode, ContextMode::Isolated)
    }

    /// Round-robin over the healthy workers, skipping any that have since
    /// crashed.
    pub(crate) fn dispatch(&self) -> Result<&Arc<Worker>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NoHealthyWorkers);
        }
        let count = self.workers.len();
        for _ in 0..count {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % count;
            let worker = &self.workers[index];
            if worker.is_live() {
                return Ok(worker);
            }
        }
        Err(Error::NoHealthyWorkers)
    }

    pub(crate) fn namespace_id(&self) -> NamespaceId {
        NamespaceId(self.next_namespace.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let mut workers: Vec<_> = self
            .workers
            .iter()
            .chain(&self.failed)
            .map(|w| WorkerStatus {
                id: w.id(),
                state: w.state(),
            })
            .collect();
        workers.sort_by_key(|w| w.id);
        PoolStatus {
            isolated: self.is_isolated(),
            workers,
        }
    }

    /// Drain and stop every worker, then release the base runtime.
    ///
    /// Requests already queued are completed before workers exit.
    pub(crate) fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::NotInitialized);
        }
        let _span = info_span!(target: TRACE_TARGET, "pool.close").entered();
        self.shutdown();
        info!(target: TRACE_TARGET, "pool closed");
        Ok(())
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        for worker in self.workers.iter().chain(&self.failed) {
            worker.close_queue();
        }
        for thread in self.threads.lock().drain(..) {
            if thread.join().is_err() {
                warn!(target: TRACE_TARGET, "worker thread panicked");
            }
        }
        if let Some(custodian) = self.custodian.lock().take() {
            let _ = custodian.shutdown.send(());
            if custodian.thread.join().is_err() {
                warn!(target: TRACE_TARGET, "custodian thread panicked");
            }
        }
        metrics::gauge!("serpent_workers_healthy").set(0.0);
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_health(&self) {
        metrics::gauge!("serpent_workers_healthy").set(self.workers.len() as f64);
    }
}

impl<B: Backend> Drop for Pool<B> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

/// Start the base runtime on a dedicated thread that parks until shutdown.
fn spawn_custodian<B: Backend>(backend: &Arc<B>) -> Result<CustodianThread> {
    let (ready_tx, ready) = oneshot::channel::<Result<()>>();
    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let backend = Arc::clone(backend);

    let thread = std::thread::Builder::new()
        .name("serpent-custodian".to_string())
        .spawn(move || {
            let custodian = match backend.start_custodian() {
                Ok(custodian) => custodian,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            // A dropped sender also means shutdown.
            let _ = shutdown_rx.blocking_recv();
            backend.stop_custodian(custodian);
        })?;

    match ready.blocking_recv() {
        Ok(Ok(())) => Ok(CustodianThread { shutdown, thread }),
        Ok(Err(err)) => {
            let _ = thread.join();
            Err(err)
        }
        Err(_) => {
            let _ = thread.join();
            Err(Error::WorkerExited)
        }
    }
}
