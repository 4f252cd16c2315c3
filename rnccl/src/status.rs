//! Native result codes and their translation into [`RncclError`].
//!
//! The runtime reports three kinds of outcome: success (including "in
//! progress"), local misuse that leaves the communicator usable, and faults
//! after which the communicator must be abandoned.

use crate::error::RncclError;

/// Result of a call into the native runtime.
pub type NativeResult<T> = std::result::Result<T, NativeStatus>;

/// Failure codes of the native runtime (`ncclResult_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum NativeStatus {
    #[error("a call to a CUDA function failed")]
    UnhandledCudaError,
    #[error("a call to the system failed")]
    SystemError,
    #[error("an internal check failed; either a runtime bug or memory corruption")]
    InternalError,
    #[error("an argument has an invalid value")]
    InvalidArgument,
    #[error("a call to the runtime is incorrect, usually a programming error")]
    InvalidUsage,
    #[error("a network error occurred or a remote process exited prematurely")]
    RemoteError,
    #[error("unknown runtime result code {0}")]
    Unknown(i32),
}

/// How a failure affects the communicator that reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Bad arguments or bad state; the communicator stays healthy.
    Misuse,
    /// Transport, remote or internal failure; the communicator is dead.
    Fault,
}

const SUCCESS: i32 = 0;
const IN_PROGRESS: i32 = 7;

impl NativeStatus {
    /// Decode a raw result code. Success and in-progress both map to `Ok`.
    pub fn from_code(code: i32) -> NativeResult<()> {
        match code {
            SUCCESS | IN_PROGRESS => Ok(()),
            1 => Err(NativeStatus::UnhandledCudaError),
            2 => Err(NativeStatus::SystemError),
            3 => Err(NativeStatus::InternalError),
            4 => Err(NativeStatus::InvalidArgument),
            5 => Err(NativeStatus::InvalidUsage),
            6 => Err(NativeStatus::RemoteError),
            other => Err(NativeStatus::Unknown(other)),
        }
    }

    /// The raw result code.
    pub fn code(self) -> i32 {
        match self {
            NativeStatus::UnhandledCudaError => 1,
            NativeStatus::SystemError => 2,
            NativeStatus::InternalError => 3,
            NativeStatus::InvalidArgument => 4,
            NativeStatus::InvalidUsage => 5,
            NativeStatus::RemoteError => 6,
            NativeStatus::Unknown(code) => code,
        }
    }

    pub fn class(self) -> StatusClass {
        match self {
            NativeStatus::InvalidArgument | NativeStatus::InvalidUsage => StatusClass::Misuse,
            _ => StatusClass::Fault,
        }
    }

    pub fn is_fault(self) -> bool {
        self.class() == StatusClass::Fault
    }

    /// Translate into the public error taxonomy.
    ///
    /// Misuse becomes [`RncclError::InvalidArgument`]; faults become
    /// [`RncclError::OperationFailed`]. Flipping the communicator's health on
    /// a fault is the caller's job, since only it owns the handle.
    pub fn into_error(self, operation: &'static str) -> RncclError {
        match self.class() {
            StatusClass::Misuse => RncclError::InvalidArgument {
                operation,
                reason: self.to_string(),
            },
            StatusClass::Fault => RncclError::OperationFailed {
                operation,
                status: self,
            },
        }
    }
}
