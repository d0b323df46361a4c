use std::fmt;

/// Infrastructure errors raised by the funnel.
///
/// Policy outcomes (rate limited, already submitted, validation failures) are
/// not errors; they are reported through [`crate::models::SubmitOutcome`].
#[derive(Debug)]
pub enum FunnelError {
    /// Reading or writing a storage backend failed.
    StorageError(String),
    /// JSON (de)serialization failed.
    SerializationError(serde_json::Error),
    /// The lead API could not be reached or answered unexpectedly.
    TransportError(String),
    /// Invalid configuration or input at the library boundary.
    InvalidInput(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<FunnelError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for FunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunnelError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            FunnelError::SerializationError(e) => write!(f, "Serialization error: {}", e),
            FunnelError::TransportError(msg) => write!(f, "Transport error: {}", msg),
            FunnelError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            FunnelError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for FunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FunnelError::SerializationError(e) => Some(e),
            FunnelError::WithContext { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for FunnelError {
    fn from(err: serde_json::Error) -> Self {
        FunnelError::SerializationError(err)
    }
}

impl From<std::io::Error> for FunnelError {
    fn from(err: std::io::Error) -> Self {
        FunnelError::StorageError(err.to_string())
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `FunnelError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, FunnelError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, FunnelError>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<FunnelError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, FunnelError> {
        self.map_err(|e| FunnelError::WithContext {
            source: Box::new(e.into()),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, FunnelError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| FunnelError::WithContext {
            source: Box::new(e.into()),
            context: f(),
        })
    }
}
