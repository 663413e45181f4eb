// src/error.rs
use std::io;

/// Central error type for the connection engine.
///
/// Per-connection protocol and resource failures (bad request line, missing
/// file, permission denied) are not errors in this sense; they travel as a
/// [`crate::parser::RequestStatus`] classification and still produce a
/// response. This type covers I/O and startup failures only.
#[derive(Debug)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Bind, listen, epoll creation, or thread spawn failed at startup.
    Startup(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
            ServerError::Startup(msg) => write!(f, "startup failure: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
