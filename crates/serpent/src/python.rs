//! CPython backend loaded from a shared library at runtime.
//!
//! Entry points are resolved once with `libloading`; the library handle
//! lives as long as the [`Python`] backend (and therefore the pool).
//! Isolated contexts are sub-interpreters with their own GIL.

use std::{
    ffi::{CStr, c_char, c_int},
    path::Path,
    ptr::{self, NonNull},
    sync::Arc,
};

use libloading::Library;
use tracing::{debug, info};

use crate::{
    TRACE_TARGET,
    backend::{Backend, Context, ContextMode},
    codec::{INPUT_BINDING, Invocation, SENTINEL_C, SOURCE_BINDING},
    error::{Error, Result},
    probe::{Capabilities, PLATFORM_SUPPORTS_ISOLATION},
};

#[repr(C)]
struct PyObject {
    _private: [u8; 0],
}

#[repr(C)]
struct PyThreadState {
    _private: [u8; 0],
}

/// Mirrors `PyInterpreterConfig` (3.12+).
#[allow(dead_code)]
#[repr(C)]
struct InterpreterConfig {
    use_main_obmalloc: c_int,
    allow_fork: c_int,
    allow_exec: c_int,
    allow_threads: c_int,
    allow_daemon_threads: c_int,
    check_multi_interp_extensions: c_int,
    gil: c_int,
}

/// Mirrors `PyStatus`.
#[repr(C)]
struct Status {
    kind: c_int,
    func: *const c_char,
    err_msg: *const c_char,
    exitcode: c_int,
}

const FILE_INPUT: c_int = 257;
const OWN_GIL: c_int = 2;

type Obj = *mut PyObject;

struct Api {
    initialize_ex: unsafe extern "C" fn(c_int),
    finalize: unsafe extern "C" fn(),
    get_version: unsafe extern "C" fn() -> *const c_char,
    eval_get_builtins: unsafe extern "C" fn() -> Obj,
    eval_save_thread: unsafe extern "C" fn() -> *mut PyThreadState,
    eval_restore_thread: unsafe extern "C" fn(*mut PyThreadState),
    run_string: unsafe extern "C" fn(*const c_char, c_int, Obj, Obj) -> Obj,
    err_occurred: unsafe extern "C" fn() -> Obj,
    err_fetch: unsafe extern "C" fn(*mut Obj, *mut Obj, *mut Obj),
    err_normalize: unsafe extern "C" fn(*mut Obj, *mut Obj, *mut Obj),
    err_clear: unsafe extern "C" fn(),
    object_str: unsafe extern "C" fn(Obj) -> Obj,
    object_get_attr_string: unsafe extern "C" fn(Obj, *const c_char) -> Obj,
    dict_new: unsafe extern "C" fn() -> Obj,
    dict_get_item_string: unsafe extern "C" fn(Obj, *const c_char) -> Obj,
    dict_set_item_string: unsafe extern "C" fn(Obj, *const c_char, Obj) -> c_int,
    unicode_from_string_and_size: unsafe extern "C" fn(*const c_char, isize) -> Obj,
    unicode_as_utf8_and_size: unsafe extern "C" fn(Obj, *mut isize) -> *const c_char,
    dec_ref: unsafe extern "C" fn(Obj),
    isolation: Option<IsolationApi>,
    _library: Library,
}

struct IsolationApi {
    new_interpreter_from_config:
        unsafe extern "C" fn(*mut *mut PyThreadState, *const InterpreterConfig) -> Status,
    end_interpreter: unsafe extern "C" fn(*mut PyThreadState),
}

/// Resolve `name` and copy the function pointer out of the library.
///
/// # Safety
/// `T` must be the exact C prototype of `name`.
unsafe fn symbol<T: Copy>(library: &Library, name: &'static str) -> Result<T> {
    // SAFETY: forwarded to the caller.
    let symbol = unsafe { library.get::<T>(name.as_bytes()) }
        .map_err(|source| Error::Symbol { name, source })?;
    Ok(*symbol)
}

#[cfg(unix)]
fn open_library(path: &Path) -> Result<Library> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};

    // Extension modules resolve interpreter symbols globally.
    // SAFETY: libpython has no load-time initializers beyond the C runtime's.
    let library =
        unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_GLOBAL) }.map_err(Error::Library)?;
    Ok(library.into())
}

#[cfg(not(unix))]
fn open_library(path: &Path) -> Result<Library> {
    // SAFETY: libpython has no load-time initializers beyond the C runtime's.
    unsafe { Library::new(path) }.map_err(Error::Library)
}

impl Api {
    fn load(path: &Path) -> Result<Self> {
        let library = open_library(path)?;
        // SAFETY: every prototype below matches the CPython C API.
        unsafe {
            Ok(Self {
                initialize_ex: symbol(&library, "Py_InitializeEx")?,
                finalize: symbol(&library, "Py_Finalize")?,
                get_version: symbol(&library, "Py_GetVersion")?,
                eval_get_builtins: symbol(&library, "PyEval_GetBuiltins")?,
                eval_save_thread: symbol(&library, "PyEval_SaveThread")?,
                eval_restore_thread: symbol(&library, "PyEval_RestoreThread")?,
                run_string: symbol(&library, "PyRun_String")?,
                err_occurred: symbol(&library, "PyErr_Occurred")?,
                err_fetch: symbol(&library, "PyErr_Fetch")?,
                err_normalize: symbol(&library, "PyErr_NormalizeException")?,
                err_clear: symbol(&library, "PyErr_Clear")?,
                object_str: symbol(&library, "PyObject_Str")?,
                object_get_attr_string: symbol(&library, "PyObject_GetAttrString")?,
                dict_new: symbol(&library, "PyDict_New")?,
                dict_get_item_string: symbol(&library, "PyDict_GetItemString")?,
                dict_set_item_string: symbol(&library, "PyDict_SetItemString")?,
                unicode_from_string_and_size: symbol(&library, "PyUnicode_FromStringAndSize")?,
                unicode_as_utf8_and_size: symbol(&library, "PyUnicode_AsUTF8AndSize")?,
                dec_ref: symbol(&library, "Py_DecRef")?,
                isolation: Self::load_isolation(&library),
                _library: library,
            })
        }
    }

    /// Sub-interpreter entry points only exist on newer runtimes.
    unsafe fn load_isolation(library: &Library) -> Option<IsolationApi> {
        // SAFETY: prototypes match the 3.12+ C API.
        unsafe {
            Some(IsolationApi {
                new_interpreter_from_config: symbol(library, "Py_NewInterpreterFromConfig").ok()?,
                end_interpreter: symbol(library, "Py_EndInterpreter").ok()?,
            })
        }
    }

    /// Throwaway bring-up that reads the version banner, on its own thread so
    /// no thread state leaks into the caller.
    fn probe(&self) -> Capabilities {
        let banner = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    // SAFETY: the runtime is not initialized yet; this thread
                    // initializes and finalizes it without running any code.
                    unsafe {
                        (self.initialize_ex)(0);
                        let banner = CStr::from_ptr((self.get_version)())
                            .to_string_lossy()
                            .into_owned();
                        (self.finalize)();
                        banner
                    }
                })
                .join()
                .unwrap_or_default()
        });

        let mut capabilities = Capabilities::from_banner(&banner, PLATFORM_SUPPORTS_ISOLATION);
        capabilities.isolation &= self.isolation.is_some();
        capabilities
    }
}

/// Owned (strong) reference, released on drop. Only dropped with the
/// context lock held.
struct Owned {
    ptr: NonNull<PyObject>,
    api: Arc<Api>,
}

impl Owned {
    fn new(api: &Arc<Api>, ptr: Obj) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self {
            ptr,
            api: Arc::clone(api),
        })
    }

    const fn as_ptr(&self) -> Obj {
        self.ptr.as_ptr()
    }
}

impl Drop for Owned {
    fn drop(&mut self) {
        // SAFETY: we own one strong reference and the lock is held.
        unsafe { (self.api.dec_ref)(self.ptr.as_ptr()) };
    }
}

/// CPython loaded from a shared library.
pub struct Python {
    api: Arc<Api>,
    capabilities: Capabilities,
}

impl Python {
    /// Load the library at `path` and probe it.
    ///
    /// # Errors
    /// Returns an error if the library or a required entry point cannot be
    /// loaded.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let api = Api::load(path)?;
        let capabilities = api.probe();
        info!(
            target: TRACE_TARGET,
            library = %path.display(),
            version = ?capabilities.version,
            isolation = capabilities.isolation,
            "guest runtime loaded"
        );
        Ok(Self {
            api: Arc::new(api),
            capabilities,
        })
    }

    #[must_use]
    pub const fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

/// Main thread state parked by the custodian.
pub struct Custodian(*mut PyThreadState);

impl Backend for Python {
    type Context = PythonContext;
    type Custodian = Custodian;

    fn supports_isolation(&self) -> bool {
        self.capabilities.isolation
    }

    fn start_custodian(&self) -> Result<Custodian> {
        // SAFETY: called once per pool on the custodian thread.
        unsafe {
            (self.api.initialize_ex)(0);
            Ok(Custodian((self.api.eval_save_thread)()))
        }
    }

    fn stop_custodian(&self, custodian: Custodian) {
        // SAFETY: same thread that parked the state; all sub-interpreters
        // have ended.
        unsafe {
            (self.api.eval_restore_thread)(custodian.0);
            (self.api.finalize)();
        }
    }

    fn open_context(&self, worker: usize, mode: ContextMode) -> Result<PythonContext> {
        let thread_state = match mode {
            ContextMode::Shared => {
                // SAFETY: the only thread that ever initializes this runtime.
                unsafe { (self.api.initialize_ex)(0) };
                ptr::null_mut()
            }
            ContextMode::Isolated => self.new_interpreter(worker)?,
        };
        Ok(PythonContext {
            api: Arc::clone(&self.api),
            mode,
            thread_state,
        })
    }
}

impl Python {
    fn new_interpreter(&self, worker: usize) -> Result<*mut PyThreadState> {
        let failed = |message: String| Error::IsolationContextCreationFailed { worker, message };
        let isolation = self
            .api
            .isolation
            .as_ref()
            .ok_or_else(|| failed("entry points unavailable".to_string()))?;

        let config = InterpreterConfig {
            use_main_obmalloc: 0,
            allow_fork: 0,
            allow_exec: 0,
            allow_threads: 1,
            allow_daemon_threads: 0,
            check_multi_interp_extensions: 1,
            gil: OWN_GIL,
        };
        let mut thread_state = ptr::null_mut();
        // SAFETY: the custodian has initialized the runtime and parked its
        // lock; the new state becomes current on this thread.
        let status =
            unsafe { (isolation.new_interpreter_from_config)(&raw mut thread_state, &config) };
        if status.kind != 0 || thread_state.is_null() {
            let message = if status.err_msg.is_null() {
                format!("status {} (exit code {})", status.kind, status.exitcode)
            } else {
                // SAFETY: PyStatus messages are static C strings.
                let message = unsafe { CStr::from_ptr(status.err_msg) }.to_string_lossy();
                if status.func.is_null() {
                    message.into_owned()
                } else {
                    // SAFETY: as above.
                    let func = unsafe { CStr::from_ptr(status.func) }.to_string_lossy();
                    format!("{func}: {message}")
                }
            };
            return Err(failed(message));
        }
        Ok(thread_state)
    }
}

/// Execution context bound to one worker thread.
pub struct PythonContext {
    api: Arc<Api>,
    mode: ContextMode,
    thread_state: *mut PyThreadState,
}

/// Global namespace dict.
pub struct Namespace(Owned);

impl PythonContext {
    fn string(&self, value: &str) -> Result<Owned> {
        let len = isize::try_from(value.len())
            .map_err(|_| Error::RunFailed("value too large".to_string()))?;
        // SAFETY: pointer and length describe valid UTF-8; lock held.
        let ptr = unsafe {
            (self.api.unicode_from_string_and_size)(value.as_ptr().cast::<c_char>(), len)
        };
        Owned::new(&self.api, ptr).ok_or_else(|| Error::RunFailed(self.take_error()))
    }

    fn bind(&self, namespace: &Namespace, name: &CStr, value: &str) -> Result<()> {
        let value = self.string(value)?;
        // SAFETY: dict and value are live; SetItem takes its own reference.
        let status = unsafe {
            (self.api.dict_set_item_string)(namespace.0.as_ptr(), name.as_ptr(), value.as_ptr())
        };
        if status != 0 {
            return Err(Error::RunFailed(self.take_error()));
        }
        Ok(())
    }

    /// UTF-8 contents of a `str` object, clearing any conversion error.
    fn text(&self, object: Obj) -> Option<String> {
        let mut len: isize = 0;
        // SAFETY: object is live; lock held.
        let data = unsafe { (self.api.unicode_as_utf8_and_size)(object, &raw mut len) };
        if data.is_null() {
            // SAFETY: lock held.
            unsafe { (self.api.err_clear)() };
            return None;
        }
        let len = usize::try_from(len).ok()?;
        // SAFETY: CPython guarantees `len` bytes at `data` while `object` lives.
        let bytes = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) };
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Fetch the active exception as `"<Type>: <message>"` and clear it.
    fn take_error(&self) -> String {
        let mut kind = ptr::null_mut();
        let mut value = ptr::null_mut();
        let mut trace = ptr::null_mut();
        // SAFETY: lock held; Fetch transfers ownership of all three refs.
        unsafe {
            (self.api.err_fetch)(&raw mut kind, &raw mut value, &raw mut trace);
            (self.api.err_normalize)(&raw mut kind, &raw mut value, &raw mut trace);
        }
        let kind = Owned::new(&self.api, kind);
        let value = Owned::new(&self.api, value);
        let _trace = Owned::new(&self.api, trace);

        let name = kind.as_ref().and_then(|kind| {
            // SAFETY: kind is a live type object.
            let name = unsafe {
                (self.api.object_get_attr_string)(kind.as_ptr(), c"__name__".as_ptr())
            };
            Owned::new(&self.api, name).and_then(|name| self.text(name.as_ptr()))
        });
        let message = value.as_ref().and_then(|value| {
            // SAFETY: value is a live exception instance.
            let message = unsafe { (self.api.object_str)(value.as_ptr()) };
            Owned::new(&self.api, message).and_then(|message| self.text(message.as_ptr()))
        });
        // SAFETY: lock held; drops anything raised while formatting.
        unsafe { (self.api.err_clear)() };

        match (name, message) {
            (Some(name), Some(message)) if !message.is_empty() => format!("{name}: {message}"),
            (Some(name), _) => name,
            (None, Some(message)) => message,
            (None, None) => "unknown error".to_string(),
        }
    }
}

impl Context for PythonContext {
    type Namespace = Namespace;

    fn suspend(&mut self) {
        // SAFETY: this thread holds the context lock.
        self.thread_state = unsafe { (self.api.eval_save_thread)() };
    }

    fn resume(&mut self) {
        // SAFETY: state saved by `suspend` on this thread.
        unsafe { (self.api.eval_restore_thread)(self.thread_state) };
    }

    fn namespace(&mut self) -> Result<Namespace> {
        // SAFETY: lock held.
        let dict = unsafe { (self.api.dict_new)() };
        let dict = Owned::new(&self.api, dict).ok_or_else(|| Error::RunFailed(self.take_error()))?;
        // SAFETY: builtins is borrowed; SetItem takes its own reference.
        let status = unsafe {
            (self.api.dict_set_item_string)(
                dict.as_ptr(),
                c"__builtins__".as_ptr(),
                (self.api.eval_get_builtins)(),
            )
        };
        if status != 0 {
            return Err(Error::RunFailed(self.take_error()));
        }
        Ok(Namespace(dict))
    }

    fn execute(
        &mut self,
        namespace: &mut Namespace,
        invocation: &Invocation,
    ) -> Result<Option<String>> {
        self.bind(namespace, SOURCE_BINDING, &invocation.source)?;
        self.bind(namespace, INPUT_BINDING, &invocation.input)?;

        let dict = namespace.0.as_ptr();
        // SAFETY: template is a static C string; dict is live; lock held.
        let returned = unsafe {
            (self.api.run_string)(
                invocation.convention.template().as_ptr(),
                FILE_INPUT,
                dict,
                dict,
            )
        };
        let returned = Owned::new(&self.api, returned);
        // SAFETY: lock held.
        if returned.is_none() || !unsafe { (self.api.err_occurred)() }.is_null() {
            let detail = self.take_error();
            debug!(target: TRACE_TARGET, %detail, "guest raised");
            return Err(Error::RunFailed(detail));
        }

        // SAFETY: borrowed reference, valid while the dict holds it.
        let sentinel = unsafe { (self.api.dict_get_item_string)(dict, SENTINEL_C.as_ptr()) };
        if sentinel.is_null() {
            return Ok(None);
        }
        self.text(sentinel)
            .map(Some)
            .ok_or_else(|| Error::RunFailed("result is not a string".to_string()))
    }

    fn close(self) {
        // SAFETY: lock held by this thread; nothing else references the
        // context.
        unsafe {
            match self.mode {
                ContextMode::Shared => (self.api.finalize)(),
                ContextMode::Isolated => {
                    if let Some(isolation) = &self.api.isolation {
                        (isolation.end_interpreter)(self.thread_state);
                    }
                }
            }
        }
    }
}
