use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    thread::JoinHandle,
};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, info_span, warn};

use crate::{
    TRACE_TARGET,
    backend::{Backend, Context, ContextMode},
    codec::{Convention, Invocation},
    error::{Error, Result},
};

/// Identity of a namespace persisted on a worker for a pinned executable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NamespaceId(pub(crate) u64);

/// One unit of work on a worker queue.
pub(crate) enum Job {
    Execute {
        invocation: Invocation,
        /// `None` runs in a throwaway namespace.
        namespace: Option<NamespaceId>,
        reply: oneshot::Sender<Result<String>>,
    },
    /// Drop a persisted namespace without running code.
    Release(NamespaceId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Starting,
    Ready,
    Running,
    Draining,
    Closed,
    Failed,
}

impl WorkerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Draining,
            4 => Self::Closed,
            _ => Self::Failed,
        }
    }
}

/// Pool-side handle of a worker thread.
pub(crate) struct Worker {
    id: usize,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    state: AtomicU8,
}

pub(crate) struct Spawned {
    pub(crate) worker: Arc<Worker>,
    pub(crate) thread: JoinHandle<()>,
    pub(crate) ready: oneshot::Receiver<Result<()>>,
}

impl Worker {
    pub(crate) fn spawn<B: Backend>(
        id: usize,
        backend: Arc<B>,
        mode: ContextMode,
        capacity: usize,
    ) -> Result<Spawned> {
        let (sender, jobs) = mpsc::channel(capacity);
        let (ready_tx, ready) = oneshot::channel();
        let worker = Arc::new(Self {
            id,
            sender: Mutex::new(Some(sender)),
            state: AtomicU8::new(WorkerState::Starting as u8),
        });

        let handle = Arc::clone(&worker);
        let thread = std::thread::Builder::new()
            .name(format!("serpent-worker-{id}"))
            .spawn(move || handle.serve(&*backend, mode, jobs, ready_tx))?;

        Ok(Spawned {
            worker,
            thread,
            ready,
        })
    }

    pub(crate) const fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the worker can still take requests.
    pub(crate) fn is_live(&self) -> bool {
        !matches!(self.state(), WorkerState::Failed | WorkerState::Closed)
            && self
                .sender
                .lock()
                .as_ref()
                .is_some_and(|sender| !sender.is_closed())
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Stop accepting work. Senders already handed out stay valid until
    /// their request has been queued, so the worker drains them first.
    pub(crate) fn close_queue(&self) {
        self.sender.lock().take();
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>> {
        self.sender.lock().clone().ok_or(Error::NoHealthyWorkers)
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.sender()?
            .blocking_send(job)
            .map_err(|_| Error::NoHealthyWorkers)
    }

    async fn submit_async(&self, job: Job) -> Result<()> {
        let sender = self.sender()?;
        sender.send(job).await.map_err(|_| Error::NoHealthyWorkers)
    }

    /// Queue a job without waiting, from any context (including drops).
    pub(crate) fn submit_detached(&self, job: Job) {
        let Ok(sender) = self.sender() else {
            return;
        };
        match sender.try_send(job) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                let spawned = std::thread::Builder::new()
                    .name("serpent-release".to_string())
                    .spawn(move || {
                        let _ = sender.blocking_send(job);
                    });
                if let Err(err) = spawned {
                    warn!(target: TRACE_TARGET, worker = self.id, %err, "dropping queued job");
                }
            }
        }
    }

    /// Run `invocation` on this worker and block until it completes.
    pub(crate) fn call(
        &self,
        invocation: Invocation,
        namespace: Option<NamespaceId>,
    ) -> Result<String> {
        let (reply, done) = oneshot::channel();
        self.submit(Job::Execute {
            invocation,
            namespace,
            reply,
        })?;
        done.blocking_recv().map_err(|_| Error::WorkerExited)?
    }

    pub(crate) async fn call_async(
        &self,
        invocation: Invocation,
        namespace: Option<NamespaceId>,
    ) -> Result<String> {
        let (reply, done) = oneshot::channel();
        self.submit_async(Job::Execute {
            invocation,
            namespace,
            reply,
        })
        .await?;
        done.await.map_err(|_| Error::WorkerExited)?
    }

    /// Thread body: owns the execution context for its whole life.
    fn serve<B: Backend>(
        &self,
        backend: &B,
        mode: ContextMode,
        mut jobs: mpsc::Receiver<Job>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let _span = info_span!(target: TRACE_TARGET, "worker", id = self.id).entered();

        let mut context = match backend.open_context(self.id, mode) {
            Ok(context) => context,
            Err(err) => {
                warn!(target: TRACE_TARGET, %err, "worker failed to start");
                jobs.close();
                self.set_state(WorkerState::Failed);
                let _ = ready.send(Err(err));
                return;
            }
        };

        info!(target: TRACE_TARGET, ?mode, "worker ready");
        self.set_state(WorkerState::Ready);
        let _ = ready.send(Ok(()));

        let mut namespaces = HashMap::new();
        context.suspend();
        while let Some(job) = jobs.blocking_recv() {
            context.resume();
            self.set_state(WorkerState::Running);
            match job {
                Job::Execute {
                    invocation,
                    namespace,
                    reply,
                } => {
                    // Declared after `reply` so it runs first while unwinding.
                    let _crash = CrashGuard(self);
                    let outcome = execute(&mut context, &mut namespaces, &invocation, namespace);
                    record(&invocation, &outcome);
                    let _ = reply.send(outcome);
                }
                Job::Release(id) => {
                    if namespaces.remove(&id).is_some() {
                        debug!(target: TRACE_TARGET, namespace = id.0, "namespace released");
                    }
                }
            }
            self.set_state(WorkerState::Ready);
            context.suspend();
        }

        self.set_state(WorkerState::Draining);
        context.resume();
        drop(namespaces);
        context.close();
        self.set_state(WorkerState::Closed);
        info!(target: TRACE_TARGET, "worker closed");
    }
}

/// Takes a worker out of rotation if its thread unwinds mid-job.
struct CrashGuard<'a>(&'a Worker);

impl Drop for CrashGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!(target: TRACE_TARGET, worker = self.0.id, "worker crashed");
            self.0.set_state(WorkerState::Failed);
            self.0.close_queue();
        }
    }
}

fn execute<C: Context>(
    context: &mut C,
    namespaces: &mut HashMap<NamespaceId, C::Namespace>,
    invocation: &Invocation,
    namespace: Option<NamespaceId>,
) -> Result<String> {
    debug!(
        target: TRACE_TARGET,
        convention = invocation.convention.as_str(),
        pinned = namespace.is_some(),
        "executing"
    );
    let sentinel = match namespace {
        Some(id) => {
            let namespace = match namespaces.entry(id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(context.namespace()?),
            };
            context.execute(namespace, invocation)?
        }
        None => {
            let mut namespace = context.namespace()?;
            context.execute(&mut namespace, invocation)?
        }
    };
    sentinel.ok_or(Error::NoResult)
}

fn record(invocation: &Invocation, outcome: &Result<String>) {
    let convention = invocation.convention.as_str();
    metrics::counter!("serpent_requests_total", "convention" => convention).increment(1);
    match (invocation.convention, outcome) {
        (_, Ok(_)) | (Convention::Stream, Err(Error::NoResult)) => {}
        (_, Err(err)) => {
            metrics::counter!("serpent_request_failures_total", "kind" => err.kind()).increment(1);
        }
    }
}
