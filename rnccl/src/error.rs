use crate::comm::Health;
use crate::status::NativeStatus;
use crate::types::Rank;

pub type Result<T> = std::result::Result<T, RncclError>;

#[derive(Debug, thiserror::Error)]
pub enum RncclError {
    /// Group formation failed. The attempted handle never existed; peers
    /// that reached the rendezvous must abandon theirs too.
    #[error("communicator initialization failed: {reason}")]
    Initialization {
        reason: String,
        #[source]
        status: Option<NativeStatus>,
    },

    /// Locally detectable misuse. The communicator stays healthy.
    #[error("invalid argument to {operation}: {reason}")]
    InvalidArgument {
        operation: &'static str,
        reason: String,
    },

    /// Batching-scope or handle-lifecycle misuse. Does not affect health.
    #[error("invalid state for {operation}: {reason}")]
    InvalidState {
        operation: &'static str,
        reason: String,
    },

    /// The communicator is no longer healthy and can only be abandoned.
    #[error("communicator for rank {rank} is {health}")]
    CommunicatorInvalid { rank: Rank, health: Health },

    /// The runtime reported a transport, protocol or remote fault. The
    /// communicator involved is now invalid.
    #[error("{operation} failed: {status}")]
    OperationFailed {
        operation: &'static str,
        #[source]
        status: NativeStatus,
    },
}

impl RncclError {
    /// Create an `Initialization` error with just a reason.
    pub fn initialization(reason: impl Into<String>) -> Self {
        Self::Initialization {
            reason: reason.into(),
            status: None,
        }
    }

    /// Create an `Initialization` error caused by a native status.
    pub fn initialization_with_status(reason: impl Into<String>, status: NativeStatus) -> Self {
        Self::Initialization {
            reason: reason.into(),
            status: Some(status),
        }
    }

    pub fn invalid_argument(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            operation,
            reason: reason.into(),
        }
    }

    pub fn invalid_state(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            operation,
            reason: reason.into(),
        }
    }

    /// True when the handle involved can never be used again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RncclError::Initialization { .. }
                | RncclError::CommunicatorInvalid { .. }
                | RncclError::OperationFailed { .. }
        )
    }
}
