use std::fmt;
use std::io;

use thiserror::Error;

/// An error recorded on a cache slot.
///
/// Every caller attached to a slot observes the same error, which is why it is cheap to
/// clone. It is only kept as long as the slot itself is alive, so the next obtain after the
/// slot was collected starts from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The requested object does not exist.
    #[error("not found")]
    NotFound,
    /// The object exists, but its stored parts cannot be assembled.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The backend failed to produce the object.
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    /// An invalidation gave up waiting for readers and closed the stable file under them.
    #[error("forced by timeout")]
    ForcedByTimeout,
    /// The slot turned moot too many times in a row.
    #[error("gave up after {0} restarts")]
    TooManyRestarts(usize),
    /// An unexpected error in the cache machinery itself, usually on the file system.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<io::Error> for CacheError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub(crate) fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError(e.to_string())
    }
}

/// A result of a cache operation.
pub type CacheEntry<T = ()> = Result<T, CacheError>;

/// The error returned by [`CacheDirectory::obtain`](super::CacheDirectory::obtain).
///
/// Shared failures of the slot are kept apart from errors that only the calling consumer
/// produced.
#[derive(Debug, Error)]
pub enum ObtainError {
    /// The object could not be produced or delivered. Shared by all callers of the slot.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// The consumer of this particular call failed.
    #[error("consumer failed: {0}")]
    Consumer(#[source] io::Error),
}

impl ObtainError {
    /// Classifies an error that came out of a consumer.
    ///
    /// Readers handed to consumers report slot failures as an [`io::Error`] wrapping the
    /// [`CacheError`], those are unwrapped again here.
    pub(crate) fn from_consumer(err: io::Error) -> Self {
        match err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<CacheError>())
        {
            Some(cache_err) => Self::Cache(cache_err.clone()),
            None => Self::Consumer(err),
        }
    }

    /// Returns the shared cache error, if this is one.
    pub fn as_cache_error(&self) -> Option<&CacheError> {
        match self {
            Self::Cache(err) => Some(err),
            Self::Consumer(_) => None,
        }
    }
}

/// Wraps a [`CacheError`] so it can travel through [`std::io::Read`].
pub(crate) fn into_io_error(err: CacheError) -> io::Error {
    io::Error::other(err)
}

/// Marker carried by the [`io::Error`] a stream reader returns once the backing file was
/// closed underneath it.
///
/// This is not a failure: the bytes are about to show up in stable storage and reading
/// resumes from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceClosed;

impl fmt::Display for ForceClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("generation stream was force-closed")
    }
}

impl std::error::Error for ForceClosed {}

impl ForceClosed {
    pub(crate) fn into_io_error(self) -> io::Error {
        io::Error::other(self)
    }
}

/// Checks whether a consumer stopped because the stream it was reading got force-closed.
///
/// Consumers must hand this error back unchanged so the cache can resume them.
pub fn is_force_closed(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<ForceClosed>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_error_classification() {
        let err = ObtainError::from_consumer(into_io_error(CacheError::NotFound));
        assert_eq!(err.as_cache_error(), Some(&CacheError::NotFound));

        let err = ObtainError::from_consumer(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(err, ObtainError::Consumer(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_force_closed() {
        assert!(is_force_closed(&ForceClosed.into_io_error()));
        assert!(!is_force_closed(&into_io_error(CacheError::ForcedByTimeout)));
        assert!(!is_force_closed(&io::ErrorKind::UnexpectedEof.into()));
    }

    #[test]
    fn test_io_errors_are_internal() {
        let err = CacheError::from(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(matches!(err, CacheError::InternalError(_)));
    }
}
