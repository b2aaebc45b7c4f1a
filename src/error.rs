use std::sync::Arc;

use crate::render_session::RenderTag;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the content block engine.
///
/// Most of them never reach the UI layer: the engine absorbs fetch and measurement failures into
/// [`FetchOutcome`](crate::coordinator::FetchOutcome) values and treats them as "no content".
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Personalization payload could not be obtained or parsed.
    #[error("personalization fetch failed: {0}")]
    FetchFailed(String),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Height measurement did not finish in time. Treated as a zero-height result.
    #[error("render measurement timed out")]
    RenderMeasurementTimeout,

    /// Height measurement failed in the renderer.
    #[error("render measurement failed: {0}")]
    RenderMeasurementFailed(String),

    /// HTML failed normalization. The block is excluded and never shown partially.
    #[error("corrupted content: {0}")]
    CorruptedContent(String),

    /// The fetch queue reached its configured bound.
    #[error("fetch queue is full (capacity: {capacity})")]
    FetchQueueFull {
        /// Configured number of queued entries.
        capacity: usize,
    },

    /// The fetch worker is no longer running.
    #[error("fetch coordinator stopped")]
    CoordinatorStopped,

    /// A render tag refers to a session that was released and possibly recycled.
    #[error("stale render session {0}")]
    StaleRenderSession(RenderTag),

    /// Block id is not known to the registry.
    #[error("unknown content block {0:?}")]
    UnknownBlock(String),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),
}

impl Error {
    /// Return `true` for failures that belong to the "fetch failed" class: the block is excluded
    /// from selection until the next successful refresh.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            Error::FetchFailed(_)
                | Error::Network(_)
                | Error::Unauthorized
                | Error::InvalidBaseUrl(_)
                | Error::Serialization(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn classifies_fetch_failures() {
        assert!(Error::FetchFailed("boom".to_owned()).is_fetch_failure());
        assert!(Error::Unauthorized.is_fetch_failure());
        assert!(!Error::RenderMeasurementTimeout.is_fetch_failure());
        assert!(!Error::CorruptedContent("empty".to_owned()).is_fetch_failure());
    }

    #[test]
    fn io_errors_are_clonable() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
