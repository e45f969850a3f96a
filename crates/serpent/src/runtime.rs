#[cfg(unix)]
use std::io::Write;
use std::{fmt, path::PathBuf, sync::Arc};

use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::{
    TRACE_TARGET,
    backend::Backend,
    codec::{self, Invocation},
    config::Config,
    error::{Error, Result},
    internal::pool::{Pool, PoolStatus},
    pinned::{Executable, WriterExecutable},
    program::{Program, Writer},
    python::Python,
};

type Opener<B> = Box<dyn Fn() -> Result<B> + Send + Sync>;

/// Outcome of a successful [`Runtime::init`].
#[derive(Debug)]
pub struct InitReport {
    /// Healthy workers accepting requests.
    pub workers: usize,
    /// Whether workers run in isolated contexts.
    pub isolated: bool,
    /// Workers that failed to start; they never receive requests.
    pub failures: Vec<Error>,
}

/// Process-wide gateway into the guest runtime.
///
/// Create one, call [`init`](Self::init) once, share it by reference between
/// threads, and [`close`](Self::close) it (or drop it) when done.
pub struct Runtime<B: Backend = Python> {
    opener: Opener<B>,
    config: Config,
    pool: RwLock<Option<Arc<Pool<B>>>>,
}

impl Runtime<Python> {
    /// Gateway for the shared library at `library`, configured from the
    /// environment.
    #[must_use]
    pub fn new(library: impl Into<PathBuf>) -> Self {
        Self::with_config(library, Config::from_env())
    }

    #[must_use]
    pub fn with_config(library: impl Into<PathBuf>, config: Config) -> Self {
        let library = library.into();
        Self::with_backend(move || Python::open(&library), config)
    }
}

impl<B: Backend> Runtime<B> {
    /// Gateway over any backend. `opener` runs on every `init`.
    #[must_use]
    pub fn with_backend(
        opener: impl Fn() -> Result<B> + Send + Sync + 'static,
        config: Config,
    ) -> Self {
        Self {
            opener: Box::new(opener),
            config,
            pool: RwLock::new(None),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Load the guest runtime and start the worker pool.
    ///
    /// Succeeds when at least one worker is healthy. Blocks until every
    /// worker has reported in, so it must not be called from inside an async
    /// executor thread.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyInitialized`] on a second call, a load error if
    /// the library is unusable, or [`Error::AllWorkersFailed`].
    pub fn init(&self) -> Result<InitReport> {
        let mut slot = self.pool.write();
        if slot.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let backend = (self.opener)()?;
        let (pool, failures) = Pool::start(backend, &self.config)?;
        let report = InitReport {
            workers: pool.len(),
            isolated: pool.is_isolated(),
            failures,
        };
        *slot = Some(Arc::new(pool));
        Ok(report)
    }

    /// Drain queued requests, stop the workers and release the guest runtime.
    ///
    /// # Errors
    /// Returns [`Error::NotInitialized`] if there is nothing to close.
    pub fn close(&self) -> Result<()> {
        let pool = self.pool.write().take().ok_or(Error::NotInitialized)?;
        pool.close()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.pool.read().is_some()
    }

    /// Worker states, or `None` before `init`.
    #[must_use]
    pub fn status(&self) -> Option<PoolStatus> {
        self.pool.read().as_ref().map(|pool| pool.status())
    }

    fn pool(&self) -> Arc<Pool<B>> {
        match self.pool.read().as_ref() {
            Some(pool) => Arc::clone(pool),
            None => panic!("serpent: init must be called before run"),
        }
    }

    /// Run a program once in a throwaway namespace on the next worker.
    ///
    /// # Panics
    /// Panics if called before [`init`](Self::init), or from inside an async
    /// runtime since it blocks the calling thread; use
    /// [`run_async`](Self::run_async) there.
    ///
    /// # Errors
    /// Returns [`Error::RunFailed`] if the guest raises, [`Error::NoResult`]
    /// if it produces nothing, or a codec error if the result does not decode
    /// as `O`.
    pub fn run<I, O>(&self, program: &Program<I, O>, input: &I) -> Result<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let pool = self.pool();
        let invocation = Invocation::value(program.shared_source(), input)?;
        let payload = pool.dispatch()?.call(invocation, None)?;
        codec::decode(&payload)
    }

    /// Async form of [`run`](Self::run). Waits for queue space and for the
    /// result without blocking the executor.
    ///
    /// # Panics
    /// Panics if called before [`init`](Self::init).
    ///
    /// # Errors
    /// Same as [`run`](Self::run).
    pub async fn run_async<I, O>(&self, program: &Program<I, O>, input: &I) -> Result<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let pool = self.pool();
        let invocation = Invocation::value(program.shared_source(), input)?;
        let worker = Arc::clone(pool.dispatch()?);
        let payload = worker.call_async(invocation, None).await?;
        codec::decode(&payload)
    }

    /// Run a streaming program, copying everything it writes into `sink`.
    /// Returns once the program has finished and all output was delivered.
    ///
    /// # Panics
    /// Panics if called before [`init`](Self::init), or from inside an async
    /// runtime since it blocks the calling thread.
    ///
    /// # Errors
    /// Returns [`Error::RunFailed`] if the guest raises, or an I/O error if
    /// the output cannot be copied.
    #[cfg(unix)]
    pub fn run_write<I, W>(
        &self,
        sink: &mut W,
        program: &Program<I, Writer>,
        input: &I,
    ) -> Result<()>
    where
        I: Serialize,
        W: Write + Send,
    {
        let pool = self.pool();
        let worker = pool.dispatch()?;
        crate::stream::bridge(sink, |fd| {
            let invocation = Invocation::stream(program.shared_source(), input, fd)?;
            crate::stream::completed(worker.call(invocation, None))
        })
    }

    /// Pin `program` to one worker with a namespace that persists across
    /// calls. The worker is chosen on the first call.
    ///
    /// # Panics
    /// Panics if called before [`init`](Self::init).
    pub fn load<I, O>(&self, program: &Program<I, O>) -> Executable<I, O, B>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        Executable::new(self.pool(), program.clone())
    }

    /// Streaming counterpart of [`load`](Self::load).
    ///
    /// # Panics
    /// Panics if called before [`init`](Self::init).
    pub fn load_writer<I: Serialize>(
        &self,
        program: &Program<I, Writer>,
    ) -> WriterExecutable<I, B> {
        WriterExecutable::new(self.pool(), program.clone())
    }
}

impl<B: Backend> Drop for Runtime<B> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.get_mut().take() {
            if let Err(err) = pool.close() {
                warn!(target: TRACE_TARGET, %err, "close on drop failed");
            }
        }
    }
}

impl<B: Backend> fmt::Debug for Runtime<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}
