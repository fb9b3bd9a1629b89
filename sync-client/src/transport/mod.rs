//! Transport abstraction for carelog sync.
//!
//! This module provides a pluggable request/response layer between the
//! [`SyncClient`](crate::SyncClient) and the server (HTTP, mock for testing).
//!
//! # Design
//!
//! The transport trait is async and stateless per call:
//! - `push()` submits one batch and returns one result per event
//! - `pull()` fetches one page of the family change log
//!
//! Failures are classified so the client can decide between backing off,
//! pausing for credentials and dropping a request.
//!
//! # Example
//!
//! ```ignore
//! let transport = HttpTransport::new(HttpTransportConfig::new(url, token))?;
//! let page = transport.pull(PullRequest { since: GlobalSeq::zero(), limit: 500 }).await?;
//! ```

mod http;
mod mock;
mod sse;

pub use http::{HttpTransport, HttpTransportConfig};
pub use mock::MockTransport;
pub use sse::{ChangeListener, Signal};

use async_trait::async_trait;
use sync_types::{PullRequest, PullResponse, PushRequest, PushResponse, SyncError};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No network connectivity is known to exist.
    #[error("offline")]
    Offline,

    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Request timed out.
    #[error("request timeout")]
    Timeout,

    /// The server rejected our credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// The server answered with an error status.
    #[error("server returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// A body could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[source] SyncError),

    /// Connection closed mid-request.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Offline
            | TransportError::ConnectionFailed(_)
            | TransportError::Timeout
            | TransportError::Closed => true,
            TransportError::Status { status, .. } => *status >= 500,
            TransportError::Unauthorized | TransportError::Codec(_) => false,
        }
    }

    /// Whether sync must pause until re-authentication.
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Unauthorized)
    }

    /// Whether the failure counts against the per-event attempt ceiling.
    ///
    /// Not reaching the server at all is not the events' fault, so offline
    /// retries stay unbounded.
    pub fn counts_attempt(&self) -> bool {
        !matches!(
            self,
            TransportError::Offline | TransportError::ConnectionFailed(_)
        )
    }
}

/// Transport trait for the push and pull exchanges.
///
/// Implementations handle the underlying connection mechanism
/// (HTTP, in-process loopback, mock).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit a batch of mutations.
    ///
    /// The response carries exactly one result per event, in request order.
    async fn push(&self, request: PushRequest) -> Result<PushResponse, TransportError>;

    /// Fetch change log entries after `request.since`.
    async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(TransportError::Offline.is_transient());
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Status {
            status: 503,
            message: "draining".into()
        }
        .is_transient());
        assert!(!TransportError::Status {
            status: 413,
            message: "too large".into()
        }
        .is_transient());
        assert!(!TransportError::Unauthorized.is_transient());
        assert!(TransportError::Unauthorized.is_auth());
    }

    #[test]
    fn connectivity_failures_do_not_count_attempts() {
        assert!(!TransportError::Offline.counts_attempt());
        assert!(!TransportError::ConnectionFailed("refused".into()).counts_attempt());
        assert!(TransportError::Timeout.counts_attempt());
    }
}
