//! Crate-wide error type.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A malformed message reported by a [`Protocol`](crate::protocol::Protocol).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("decode error: {0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Failures raised by a TLS record engine or the session's record loops.
///
/// Every variant is fatal to the session that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TlsError {
    #[error("bad record: {0}")]
    BadRecord(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("{which} buffer would exceed engine maximum of {max} bytes")]
    BufferLimit { which: &'static str, max: usize },
    #[error("engine is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("TLS Error: {0}")]
    Tls(#[from] TlsError),
    #[error("session is closed")]
    SessionClosed,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
