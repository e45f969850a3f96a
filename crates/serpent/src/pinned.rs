//! Executables pinned to one worker with a persistent namespace.
//!
//! The first call picks a worker through the pool's round-robin and
//! allocates a namespace on it; every later call goes to the same worker and
//! sees the globals left behind by earlier calls. Calls from several threads
//! are serialized by the worker queue.

#[cfg(unix)]
use std::io::Write;
use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    TRACE_TARGET,
    backend::Backend,
    codec::{self, Invocation},
    error::Result,
    internal::{
        pool::Pool,
        worker::{Job, NamespaceId, Worker},
    },
    program::{Program, Writer},
    python::Python,
};

#[derive(Clone)]
struct Binding {
    worker: Arc<Worker>,
    namespace: NamespaceId,
}

struct Pinned<B: Backend> {
    pool: Arc<Pool<B>>,
    binding: Mutex<Option<Binding>>,
}

impl<B: Backend> Pinned<B> {
    fn new(pool: Arc<Pool<B>>) -> Self {
        Self {
            pool,
            binding: Mutex::new(None),
        }
    }

    /// Bind on first use. The lock makes the choice exactly once even when
    /// the first calls race.
    fn pin(&self) -> Result<Binding> {
        let mut binding = self.binding.lock();
        if let Some(bound) = binding.as_ref() {
            return Ok(bound.clone());
        }
        let bound = Binding {
            worker: Arc::clone(self.pool.dispatch()?),
            namespace: self.pool.namespace_id(),
        };
        debug!(
            target: TRACE_TARGET,
            worker = bound.worker.id(),
            namespace = bound.namespace.0,
            "executable pinned"
        );
        *binding = Some(bound.clone());
        Ok(bound)
    }

    fn call(&self, invocation: Invocation) -> Result<String> {
        let bound = self.pin()?;
        bound.worker.call(invocation, Some(bound.namespace))
    }

    async fn call_async(&self, invocation: Invocation) -> Result<String> {
        let bound = self.pin()?;
        bound
            .worker
            .call_async(invocation, Some(bound.namespace))
            .await
    }

    fn worker(&self) -> Option<usize> {
        self.binding.lock().as_ref().map(|b| b.worker.id())
    }

    fn close(&self) {
        if let Some(bound) = self.binding.lock().take() {
            bound.worker.submit_detached(Job::Release(bound.namespace));
        }
    }
}

impl<B: Backend> Drop for Pinned<B> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Program loaded with [`Runtime::load`](crate::Runtime::load).
pub struct Executable<I, O, B: Backend = Python> {
    program: Program<I, O>,
    pinned: Pinned<B>,
}

impl<I, O, B> Executable<I, O, B>
where
    I: Serialize,
    O: DeserializeOwned,
    B: Backend,
{
    pub(crate) fn new(pool: Arc<Pool<B>>, program: Program<I, O>) -> Self {
        Self {
            program,
            pinned: Pinned::new(pool),
        }
    }

    /// Call the program in its persistent namespace.
    ///
    /// # Panics
    /// Panics if called from inside an async runtime, since it blocks the
    /// calling thread; use [`run_async`](Self::run_async) there.
    ///
    /// # Errors
    /// Returns an error if the guest raises, produces no result, or the
    /// result does not decode as `O`.
    pub fn run(&self, input: &I) -> Result<O> {
        let invocation = Invocation::value(self.program.shared_source(), input)?;
        codec::decode(&self.pinned.call(invocation)?)
    }

    /// Async form of [`run`](Self::run).
    ///
    /// # Errors
    /// Same as [`run`](Self::run).
    pub async fn run_async(&self, input: &I) -> Result<O> {
        let invocation = Invocation::value(self.program.shared_source(), input)?;
        codec::decode(&self.pinned.call_async(invocation).await?)
    }

    /// Worker this executable is pinned to, once the first call has bound it.
    #[must_use]
    pub fn worker(&self) -> Option<usize> {
        self.pinned.worker()
    }

    /// Release the persistent namespace. Safe to call more than once; a later
    /// `run` binds afresh.
    pub fn close(&self) {
        self.pinned.close();
    }
}

impl<I, O, B: Backend> fmt::Debug for Executable<I, O, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executable")
            .field("program", &self.program)
            .field("worker", &self.pinned.worker())
            .finish_non_exhaustive()
    }
}

/// Streaming program loaded with [`Runtime::load_writer`](crate::Runtime::load_writer).
pub struct WriterExecutable<I, B: Backend = Python> {
    program: Program<I, Writer>,
    pinned: Pinned<B>,
}

impl<I, B> WriterExecutable<I, B>
where
    I: Serialize,
    B: Backend,
{
    pub(crate) fn new(pool: Arc<Pool<B>>, program: Program<I, Writer>) -> Self {
        Self {
            program,
            pinned: Pinned::new(pool),
        }
    }

    /// Call the program, streaming everything it writes into `sink`.
    ///
    /// # Panics
    /// Panics if called from inside an async runtime.
    ///
    /// # Errors
    /// Returns an error if the guest raises or the output cannot be copied.
    #[cfg(unix)]
    pub fn run<W: Write + Send>(&self, sink: &mut W, input: &I) -> Result<()> {
        crate::stream::bridge(sink, |fd| {
            let invocation = Invocation::stream(self.program.shared_source(), input, fd)?;
            crate::stream::completed(self.pinned.call(invocation))
        })
    }

    #[must_use]
    pub fn worker(&self) -> Option<usize> {
        self.pinned.worker()
    }

    pub fn close(&self) {
        self.pinned.close();
    }
}

impl<I, B: Backend> fmt::Debug for WriterExecutable<I, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterExecutable")
            .field("program", &self.program)
            .field("worker", &self.pinned.worker())
            .finish_non_exhaustive()
    }
}
