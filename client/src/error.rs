//! Failure taxonomy for every networking step.
//!
//! The `Display` text of a [`NetError`] is what the adapter exposes as its
//! failure reason, so variants carry whatever makes the reason diagnosable.

use shared::LinkError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("server refused: {0}")]
    Refused(String),

    #[error("{0}")]
    Unavailable(String),

    /// Refused locally, before anything was sent
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("link failed: {0}")]
    Link(LinkError),

    #[error("operation cancelled")]
    Cancelled,
}

impl NetError {
    /// Cancellation is an expected outcome of `reset()`, never a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, NetError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasons_are_readable() {
        let err = NetError::UnexpectedResponse("WHAT".to_string());
        assert_eq!(err.to_string(), "unexpected response: \"WHAT\"");

        let err = NetError::Timeout("handshake token");
        assert_eq!(err.to_string(), "timeout waiting for handshake token");

        let err = NetError::InvalidRequest("session data must fit on one line");
        assert_eq!(
            err.to_string(),
            "invalid request: session data must fit on one line"
        );

        let err = NetError::Link(LinkError::Busy);
        assert_eq!(err.to_string(), "link failed: peer is busy with another session");

        let err: NetError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.to_string().starts_with("I/O error"));
    }

    #[test]
    fn test_cancelled_flag() {
        assert!(NetError::Cancelled.is_cancelled());
        assert!(!NetError::Closed.is_cancelled());
    }
}
