//! Bridges guest writes on a native descriptor to a host sink.

use std::{
    io::{self, Write},
    os::fd::{AsRawFd, RawFd},
    thread,
};

use crate::error::{Error, Result};

/// Run `call` with the write end of a fresh pipe while a copier thread moves
/// everything read from the other end into `sink`.
///
/// The host write end is closed once `call` returns, so the copier sees end
/// of stream as soon as the guest has closed its duplicate. Returns after all
/// bytes have been delivered; the call's error wins over a copy error.
pub(crate) fn bridge<W, F>(sink: &mut W, call: F) -> Result<()>
where
    W: Write + Send,
    F: FnOnce(RawFd) -> Result<()>,
{
    let (mut reader, writer) = io::pipe()?;
    thread::scope(|scope| {
        let copier = thread::Builder::new()
            .name("serpent-stream".to_string())
            .spawn_scoped(scope, move || io::copy(&mut reader, sink))?;

        let outcome = call(writer.as_raw_fd());
        drop(writer);
        let copied = copier
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));

        outcome?;
        copied?;
        Ok(())
    })
}

/// Streaming programs signal completion by leaving no result behind.
pub(crate) fn completed(outcome: Result<String>) -> Result<()> {
    match outcome {
        Ok(_) | Err(Error::NoResult) => Ok(()),
        Err(err) => Err(err),
    }
}
