//! Engine error types
//!
//! Errors reported synchronously by `StreamEngine::open`. Everything that goes wrong
//! after `open` returns is reported asynchronously through the session status and
//! `ErrorKind`.

/// Error type for engine operations
#[derive(Debug)]
pub enum EngineError {
    /// Every session slot is in use
    CapacityExceeded { capacity: usize },
    /// Empty stream URI
    EmptyUri,
    /// Requested frame size too large to allocate
    InvalidDimensions { width: u32, height: u32 },
    /// The worker thread could not be started
    Spawn(std::io::Error),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::CapacityExceeded { capacity } => {
                write!(f, "all {} session slots are in use", capacity)
            }
            EngineError::EmptyUri => write!(f, "stream URI is empty"),
            EngineError::InvalidDimensions { width, height } => {
                write!(f, "frame size {}x{} is too large", width, height)
            }
            EngineError::Spawn(err) => write!(f, "failed to start decode worker: {}", err),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Spawn(err)
    }
}
