use std::io;
use crate::channel::RejectedBuffer;

/// Failures reported by channel operations. None of these are thrown across the channel's
///  public API: every operation returns them as values.
///
/// `Failure`, `WriteFlushFailed` and `Io` reported by a channel operation are terminal: the
///  channel is closed. Misuse is reported as `InvalidArgument` or `NotOwned` and leaves the
///  channel state unchanged.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("{0}")]
    Failure(String),
    #[error("{0}")]
    NoBuffers(String),
    #[error("{0}")]
    WriteFlushFailed(String),
    #[error("{0}")]
    InvalidArgument(String),
    /// A buffer was passed to a channel other than the one that handed it out. It is returned
    ///  untouched, so it can still go back to its owner.
    #[error("Application does not own this buffer.")]
    NotOwned(Box<RejectedBuffer>),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn failure(text: impl Into<String>) -> TransportError {
        TransportError::Failure(text.into())
    }

    pub fn text(&self) -> String {
        self.to_string()
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(e: anyhow::Error) -> Self {
        TransportError::Failure(format!("{:#}", e))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
