use std::sync::{Once, OnceLock};

use serpent::{Config, Runtime};

fn print_skip_once(message: String) {
    static SKIP_MESSAGE_ONCE: Once = Once::new();
    SKIP_MESSAGE_ONCE.call_once(|| {
        eprintln!("{message}");
    });
}

/// Process-wide runtime over the discovered libpython, or `None` (after
/// printing why) when no library is available.
///
/// CPython can only be brought up once per process, so every test in this
/// binary shares one runtime.
pub(crate) fn runtime() -> Option<&'static Runtime> {
    static RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();
    RUNTIME
        .get_or_init(|| {
            let library = match serpent::lib() {
                Ok(library) => library,
                Err(err) => {
                    print_skip_once(format!(
                        "skipping integration_python tests: {err}. Set LIBPYTHON_PATH to a libpython shared library."
                    ));
                    return None;
                }
            };
            let runtime = Runtime::with_config(library, Config::default().workers(4));
            let report = runtime.init().expect("failed to initialize runtime");
            assert!(report.workers > 0);
            Some(runtime)
        })
        .as_ref()
}
