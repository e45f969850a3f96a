use std::num::NonZeroUsize;

/// Pool sizing and mode selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of workers requested at `init`.
    pub workers: usize,
    /// Requests that may be queued on a single worker before callers block.
    pub queue_capacity: usize,
    /// Allow isolated execution contexts when the runtime supports them.
    pub isolation: bool,
}

impl Config {
    pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

    /// One worker owning the shared execution context directly.
    ///
    /// Some guest extension modules refuse to load inside isolated contexts;
    /// this mode keeps them usable.
    #[must_use]
    pub const fn single_worker() -> Self {
        Self {
            workers: 1,
            queue_capacity: Self::DEFAULT_QUEUE_CAPACITY,
            isolation: false,
        }
    }

    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = if workers == 0 { 1 } else { workers };
        self
    }

    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = if capacity == 0 { 1 } else { capacity };
        self
    }

    #[must_use]
    pub const fn isolation(mut self, isolation: bool) -> Self {
        self.isolation = isolation;
        self
    }

    /// Defaults overridden by `SERPENT_WORKERS`, `SERPENT_QUEUE_CAPACITY` and
    /// `SERPENT_DISABLE_ISOLATION`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(workers) = lookup("SERPENT_WORKERS").and_then(|v| v.parse().ok()) {
            config = config.workers(workers);
        }
        if let Some(capacity) = lookup("SERPENT_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
            config = config.queue_capacity(capacity);
        }
        if lookup("SERPENT_DISABLE_ISOLATION").is_some_and(|v| v == "1") {
            config = config.isolation(false);
        }
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            queue_capacity: Self::DEFAULT_QUEUE_CAPACITY,
            isolation: true,
        }
    }
}
