//! Caller-visible failures.

use overlay_core::ItemError;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Why a sync operation did not succeed.
///
/// Transport failures and timeouts are retried silently; only the final
/// [`SyncError::RetriesExhausted`] reaches the caller. Business rejections
/// and terminal link failures are always surfaced.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("operation {action} failed after {attempts} attempts")]
    RetriesExhausted { action: &'static str, attempts: u32 },
    #[error("operation rejected: {reason}")]
    Rejected { reason: String },
    #[error("could not reconnect to server")]
    ReconnectFailed,
    #[error("disconnected by client")]
    Disconnected,
    #[error("not connected")]
    NotConnected,
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid property change: {0}")]
    InvalidProperty(#[from] ItemError),
    #[error("unknown item {0}")]
    UnknownItem(String),
    #[error("sync engine stopped")]
    EngineStopped,
}

impl SyncError {
    /// Whether the failure came from the authority's business logic.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// Whether the failure is final for the link, not just one operation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ReconnectFailed | Self::Disconnected)
    }
}
