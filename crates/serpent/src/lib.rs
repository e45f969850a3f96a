//! Call gateway into an embedded CPython runtime.
//!
//! A [`Runtime`] loads `libpython` at run time, starts a fixed pool of worker
//! threads (each owning one execution context, isolated when the runtime
//! supports it) and runs guest programs on them with typed inputs and
//! outputs.

pub mod backend;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
mod internal;
pub mod pinned;
pub mod probe;
pub mod program;
pub mod python;
pub mod runtime;
#[cfg(unix)]
mod stream;

pub const TRACE_TARGET: &str = "serpent::pool";

pub use config::Config;
pub use discovery::lib;
pub use error::{Error, Result};
pub use internal::{
    pool::{PoolStatus, WorkerStatus},
    worker::WorkerState,
};
pub use pinned::{Executable, WriterExecutable};
pub use program::{Program, Writer};
pub use python::Python;
pub use runtime::{InitReport, Runtime};
