use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// `init` was called twice without an intervening `close`.
    #[error("already initialized")]
    AlreadyInitialized,

    /// `close` was called without a successful `init`.
    #[error("not initialized")]
    NotInitialized,

    /// A single worker failed to bring up its isolated execution context.
    #[error("worker {worker}: isolated context creation failed: {message}")]
    IsolationContextCreationFailed { worker: usize, message: String },

    /// Every worker failed during `init`.
    #[error("all workers failed to initialize: {}", join_errors(.0))]
    AllWorkersFailed(Vec<Error>),

    /// Dispatch found no usable worker (all failed, or the pool is closed).
    #[error("no healthy workers available")]
    NoHealthyWorkers,

    /// The guest runtime raised while running the program.
    #[error("run failed: {0}")]
    RunFailed(String),

    /// The program completed without producing a result binding.
    #[error("no result")]
    NoResult,

    /// A worker thread went away before completing the request.
    #[error("worker exited before completing the request")]
    WorkerExited,

    #[error("library not found")]
    LibraryNotFound,

    #[error("failed to load library: {0}")]
    Library(#[source] libloading::Error),

    #[error("missing entry point `{name}`: {source}")]
    Symbol {
        name: &'static str,
        #[source]
        source: libloading::Error,
    },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short, stable label used for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyInitialized => "already_initialized",
            Self::NotInitialized => "not_initialized",
            Self::IsolationContextCreationFailed { .. } => "isolation_context_creation_failed",
            Self::AllWorkersFailed(_) => "all_workers_failed",
            Self::NoHealthyWorkers => "no_healthy_workers",
            Self::RunFailed(_) => "run_failed",
            Self::NoResult => "no_result",
            Self::WorkerExited => "worker_exited",
            Self::LibraryNotFound => "library_not_found",
            Self::Library(_) => "library",
            Self::Symbol { .. } => "symbol",
            Self::Codec(_) => "codec",
            Self::Io(_) => "io",
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
