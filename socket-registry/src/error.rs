use thiserror::Error;

use crate::SocketId;

#[derive(Error, Debug)]
pub enum Error {
    /// Empty or whitespace client id / topic. Always the caller's bug.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("No client ID found for socket {0}")]
    NotFound(SocketId),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Transient infrastructure failures that are logged and absorbed rather
    /// than surfaced into a connection's read/write loop.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Self::Redis(_) | Self::StoreUnavailable(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Rejects empty and whitespace-only identifiers before any store access.
pub(crate) fn ensure_present(value: &str, what: &'static str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidArgument(what));
    }
    Ok(())
}
