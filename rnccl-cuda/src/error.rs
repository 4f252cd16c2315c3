use cudarc::driver::DriverError;
use cudarc::nccl::result::NcclError;
use cudarc::nccl::sys;
use rnccl::{NativeResult, NativeStatus};

/// Decode a raw `ncclResult_t` returned by a `sys` entry point.
pub(crate) fn check(result: sys::ncclResult_t) -> NativeResult<()> {
    NativeStatus::from_code(result as i32)
}

/// Map an error from cudarc's `result` layer onto the native status.
pub(crate) fn nccl_status(e: NcclError) -> NativeStatus {
    match check(e.0) {
        Err(status) => status,
        // NCCL never reports success through the error path.
        Ok(()) => NativeStatus::InternalError,
    }
}

/// CUDA driver failures surface the way NCCL reports them.
pub(crate) fn driver_status(e: DriverError) -> NativeStatus {
    tracing::debug!(error = %e, "CUDA driver call failed");
    NativeStatus::UnhandledCudaError
}
