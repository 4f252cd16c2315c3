//! NCCL runtime for rnccl.
//!
//! [`CudaRuntime`] implements [`rnccl::NativeRuntime`] over NCCL and the CUDA
//! driver, both loaded dynamically by `cudarc`. Hand it to
//! [`rnccl::CommContext::with_config`] to drive real GPUs.

mod error;
pub mod runtime;
pub mod types;

pub use runtime::CudaRuntime;
pub use types::{to_nccl_dtype, to_nccl_op};
