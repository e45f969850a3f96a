//! Boundary codec between host values and guest code.
//!
//! Values cross the boundary as JSON text. Guest code is never spliced into
//! the wrapper: the program source and the encoded input are bound into the
//! guest namespace under fixed names and the wrapper template (one per
//! [`Convention`]) compiles and runs the program from that binding. The
//! wrapper is the only code that touches the result binding ([`SENTINEL`]).

use std::{ffi::CStr, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};

use crate::error::Result;

/// Name of the binding that carries the encoded return value.
pub const SENTINEL: &str = "_result";
pub(crate) const SENTINEL_C: &CStr = c"_result";
pub(crate) const SOURCE_BINDING: &CStr = c"_serpent_source";
pub(crate) const INPUT_BINDING: &CStr = c"_serpent_input";

/// Value-return wrapper.
///
/// A program defining `run` is loaded once per namespace; a pinned namespace
/// keeps its globals and only calls `run` again. A program without `run` is
/// re-executed on every call with `result` cleared first. A missing
/// `run`/`result` leaves the sentinel unset instead of raising.
const VALUE_TEMPLATE: &CStr = c"import json as _serpent_json
globals().pop('_result', None)
input = _serpent_json.loads(_serpent_input)
if '_serpent_loaded' not in globals() or not callable(globals().get('run')):
    globals().pop('result', None)
    exec(compile(_serpent_source, '<program>', 'exec'), globals())
    _serpent_loaded = True
if callable(globals().get('run')):
    _result = _serpent_json.dumps(run(input))
elif 'result' in globals():
    _result = _serpent_json.dumps(result)
";

/// Streaming wrapper.
///
/// Duplicates the host pipe descriptor so the guest owns a private one,
/// hands `run` a writer bound to it and always closes it afterwards. Never
/// sets the sentinel.
const STREAM_TEMPLATE: &CStr = c"import json as _serpent_json
import os as _serpent_os
globals().pop('_result', None)
_serpent_envelope = _serpent_json.loads(_serpent_input)
input = _serpent_envelope['input']
if '_serpent_loaded' not in globals():
    exec(compile(_serpent_source, '<program>', 'exec'), globals())
    _serpent_loaded = True

class _SerpentWriter:
    def __init__(self, fd):
        self._fd = fd

    def write(self, data):
        if isinstance(data, str):
            data = data.encode()
        view = memoryview(data)
        while view:
            view = view[_serpent_os.write(self._fd, view):]
        return len(data)

    def flush(self):
        pass

    def close(self):
        if self._fd >= 0:
            _serpent_os.close(self._fd)
            self._fd = -1

_serpent_writer = _SerpentWriter(_serpent_os.dup(_serpent_envelope['fd']))
try:
    run(input, _serpent_writer)
finally:
    _serpent_writer.close()
";

/// Calling convention, selected by the host-declared output type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Convention {
    /// The program's value is encoded into the sentinel binding.
    Value,
    /// The program writes bytes to a writer handle; completion is signalled
    /// by the absence of the sentinel.
    Stream,
}

impl Convention {
    #[must_use]
    pub const fn template(self) -> &'static CStr {
        match self {
            Self::Value => VALUE_TEMPLATE,
            Self::Stream => STREAM_TEMPLATE,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Stream => "stream",
        }
    }
}

/// Everything a worker needs to run one call.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub convention: Convention,
    pub source: Arc<str>,
    pub input: String,
}

impl Invocation {
    /// Value-return call with an encoded input.
    ///
    /// # Errors
    /// Returns an error if the input cannot be serialized.
    pub fn value<T: Serialize + ?Sized>(source: Arc<str>, input: &T) -> Result<Self> {
        Ok(Self {
            convention: Convention::Value,
            source,
            input: encode(input)?,
        })
    }

    /// Streaming call writing to the native descriptor `fd`.
    ///
    /// # Errors
    /// Returns an error if the input cannot be serialized.
    pub fn stream<T: Serialize + ?Sized>(source: Arc<str>, input: &T, fd: i32) -> Result<Self> {
        Ok(Self {
            convention: Convention::Stream,
            source,
            input: encode(&StreamEnvelope { input, fd })?,
        })
    }
}

#[derive(Serialize)]
struct StreamEnvelope<'a, T: ?Sized> {
    input: &'a T,
    fd: i32,
}

/// Serialize a host value into the boundary format.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a sentinel payload into a host value.
///
/// # Errors
/// Returns an error if the payload is not valid for `T`.
pub fn decode<T: DeserializeOwned>(payload: &str) -> Result<T> {
    Ok(serde_json::from_str(payload)?)
}
