use thiserror::Error;

/// An error returned by [`MemoCache::get_or_compute`](super::MemoCache::get_or_compute).
///
/// Errors raised by the factory are never wrapped into anything generic: [`MemoError::Factory`]
/// holds the very error value the factory returned, also when it is replayed from the cache to a
/// different caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoError<E> {
    /// The key or policy passed to the cache were not usable.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The caller was cancelled while waiting for a concurrent computation of the same key.
    #[error("cancelled while waiting for the key lock")]
    Cancelled,
    /// The cache was closed while the caller was waiting for the key lock.
    #[error("the memo cache has been closed")]
    Disposed,
    /// The error returned by the factory, either freshly or replayed from the cache.
    #[error(transparent)]
    Factory(E),
}

impl<E> MemoError<E> {
    /// Returns the factory error, if this is one.
    pub fn factory_error(&self) -> Option<&E> {
        match self {
            Self::Factory(error) => Some(error),
            _ => None,
        }
    }

    /// Converts into the factory error, if this is one.
    pub fn into_factory_error(self) -> Option<E> {
        match self {
            Self::Factory(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// A short tag used for metrics and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Cancelled => "cancelled",
            Self::Disposed => "disposed",
            Self::Factory(_) => "factory",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn test_factory_errors_are_transparent() {
        let error: MemoError<io::Error> =
            MemoError::Factory(io::Error::new(io::ErrorKind::NotFound, "no such thing"));
        assert_eq!(error.to_string(), "no such thing");
        assert_eq!(error.kind(), "factory");
        assert_eq!(
            error.into_factory_error().map(|e| e.kind()),
            Some(io::ErrorKind::NotFound)
        );
    }

    #[test]
    fn test_cache_errors() {
        let error: MemoError<io::Error> = MemoError::Cancelled;
        assert!(error.is_cancelled());
        assert!(error.factory_error().is_none());
        assert_eq!(error.to_string(), "cancelled while waiting for the key lock");

        let error: MemoError<io::Error> = MemoError::InvalidArgument("empty origin");
        assert_eq!(error.to_string(), "invalid argument: empty origin");
    }
}
