use std::{fmt, marker::PhantomData, sync::Arc};

/// Guest program source plus the host-side input and output shapes.
///
/// The types are only enforced on the host: `I` is serialized into the guest,
/// `O` is deserialized from the result binding. Programs with output type
/// [`Writer`] use the streaming convention instead.
pub struct Program<I, O> {
    source: Arc<str>,
    _marker: PhantomData<fn(I) -> O>,
}

/// Output marker for programs that stream bytes through a writer handle
/// rather than returning a value.
#[derive(Debug)]
pub enum Writer {}

impl<I, O> Program<I, O> {
    #[must_use]
    pub fn new(source: impl Into<Arc<str>>) -> Self {
        Self {
            source: source.into(),
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn shared_source(&self) -> Arc<str> {
        Arc::clone(&self.source)
    }
}

impl<I, O> Clone for Program<I, O> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            _marker: PhantomData,
        }
    }
}

impl<I, O> fmt::Debug for Program<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("source", &self.source)
            .finish()
    }
}

impl<I, O> From<&str> for Program<I, O> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<I, O> From<String> for Program<I, O> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
