//! Seam between the worker pool and a concrete guest runtime.
//!
//! All `Context` methods and every `Namespace` drop run on the worker thread
//! that opened the context. A context is never moved to another thread, so
//! neither type needs to be `Send`.

use crate::{codec::Invocation, error::Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextMode {
    /// The single execution context of the base runtime, owned by one worker.
    Shared,
    /// An independently-lockable context created next to a parked custodian.
    Isolated,
}

pub trait Backend: Send + Sync + 'static {
    type Context: Context;
    /// Base runtime state held by the custodian thread in isolated mode.
    type Custodian;

    /// Whether isolated contexts are usable; decided once when the backend
    /// is opened.
    fn supports_isolation(&self) -> bool;

    /// Bring up the base runtime on the calling thread and release its lock.
    ///
    /// # Errors
    /// Returns an error if the base runtime cannot start.
    fn start_custodian(&self) -> Result<Self::Custodian>;

    /// Reacquire and tear down the base runtime, on the custodian thread.
    fn stop_custodian(&self, custodian: Self::Custodian);

    /// Create the execution context for `worker` on the calling thread.
    ///
    /// # Errors
    /// Returns an error if the context cannot be created.
    fn open_context(&self, worker: usize, mode: ContextMode) -> Result<Self::Context>;
}

pub trait Context {
    type Namespace;

    /// Release the context lock while the worker is idle.
    fn suspend(&mut self);

    /// Reacquire the context lock before touching guest state.
    fn resume(&mut self);

    /// Fresh, empty global namespace.
    ///
    /// # Errors
    /// Returns an error if the namespace cannot be allocated.
    fn namespace(&mut self) -> Result<Self::Namespace>;

    /// Run the invocation inside `namespace`.
    ///
    /// Returns the encoded sentinel, or `None` when the program finished
    /// without producing one.
    ///
    /// # Errors
    /// Returns [`Error::RunFailed`](crate::Error::RunFailed) if the guest
    /// raised; the guest error state is cleared before returning.
    fn execute(
        &mut self,
        namespace: &mut Self::Namespace,
        invocation: &Invocation,
    ) -> Result<Option<String>>;

    /// Release the context. Called with the lock held.
    fn close(self)
    where
        Self: Sized;
}
