//! Error types for the dispatcher kernel.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuslineError {
    /// A packet's JSON payload did not match the shape its `type` tag
    /// promised.
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] serde_json::Error),

    /// The admission queue is full or closed.
    #[error("peer admission failed: {0}")]
    AdmissionFailed(String),

    /// A framed transport (HID) saw a header it could not make sense of.
    #[error("frame error: {0}")]
    Frame(String),
}

pub type Result<T> = std::result::Result<T, BuslineError>;

impl BuslineError {
    pub fn admission_failed(msg: impl Into<String>) -> Self {
        Self::AdmissionFailed(msg.into())
    }

    pub fn frame(msg: impl Into<String>) -> Self {
        Self::Frame(msg.into())
    }

    /// Whether the caller should drop the connection, versus just logging
    /// and continuing (a single malformed packet does not end a session).
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::AdmissionFailed(_))
    }
}
