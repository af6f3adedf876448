use std::{io, time::Duration};

use thiserror::Error;

/// Everything that can go wrong between the caller and the broker socket.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("unable to reach message broker at {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {timeout:?} connecting to message broker at {address}")]
    DialTimeout { address: String, timeout: Duration },

    #[error("connection attempt to {address} was cancelled")]
    DialCancelled { address: String },

    #[error("unable to encode {kind} frame: {source}")]
    Serialization {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("connection to message broker was closed")]
    ConnectionClosed,

    #[error("unable to write to message broker: {0}")]
    Write(#[source] io::Error),

    #[error("unknown queue type '{0}', expected P2P or PUBSUB")]
    UnknownQueueType(String),

    #[error("stream {0} is not registered on this connection")]
    UnknownStream(String),

    #[error("connection already has {limit} open streams")]
    TooManyStreams { limit: usize },
}

pub type Result<T> = std::result::Result<T, ChannelError>;

impl ChannelError {
    /// Sort a transport write error into closed-connection vs. generic failure.
    pub(crate) fn from_write(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero => ChannelError::ConnectionClosed,
            _ => ChannelError::Write(err),
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, ChannelError::ConnectionClosed)
    }
}
