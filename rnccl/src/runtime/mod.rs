//! The seam between this crate and a native collective-communication runtime.
//!
//! rnccl never moves bytes itself. Everything that touches devices, streams
//! or the interconnect goes through [`NativeRuntime`]:
//!
//! - `CudaRuntime` (crate `rnccl-cuda`): NCCL over the CUDA driver.
//! - [`LoopbackRuntime`] (built-in): an in-process runtime whose devices are
//!   host memory and whose participants are threads of one process.
//!
//! Implementations are handed to [`CommContext`](crate::CommContext)
//! explicitly; there is no process-global runtime.

pub mod loopback;

use crate::buffer::BufferDesc;
use crate::status::NativeResult;
use crate::token::{GroupToken, TOKEN_BYTES};
use crate::types::{DataType, Rank, ReduceOp};

pub use loopback::{LoopbackFabric, LoopbackRuntime};

/// Opaque native communicator handle (`ncclComm_t` on NCCL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawComm(pub u64);

/// Opaque execution stream handle (`cudaStream_t` on CUDA).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream(0x{:x})", self.0)
    }
}

/// One primitive, fully marshalled and validated, ready for the runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CollectiveCall {
    Broadcast {
        send: BufferDesc,
        recv: BufferDesc,
        root: Rank,
    },
    Reduce {
        send: BufferDesc,
        recv: BufferDesc,
        op: ReduceOp,
        root: Rank,
    },
    AllReduce {
        send: BufferDesc,
        recv: BufferDesc,
        op: ReduceOp,
    },
    AllGather {
        send: BufferDesc,
        recv: BufferDesc,
    },
    ReduceScatter {
        send: BufferDesc,
        recv: BufferDesc,
        op: ReduceOp,
    },
    Send {
        buf: BufferDesc,
        peer: Rank,
    },
    Recv {
        buf: BufferDesc,
        peer: Rank,
    },
    AllToAll {
        send: BufferDesc,
        recv: BufferDesc,
    },
}

impl CollectiveCall {
    /// Operation name, as used in errors and log fields.
    pub fn name(&self) -> &'static str {
        match self {
            CollectiveCall::Broadcast { .. } => "broadcast",
            CollectiveCall::Reduce { .. } => "reduce",
            CollectiveCall::AllReduce { .. } => "all_reduce",
            CollectiveCall::AllGather { .. } => "all_gather",
            CollectiveCall::ReduceScatter { .. } => "reduce_scatter",
            CollectiveCall::Send { .. } => "send",
            CollectiveCall::Recv { .. } => "recv",
            CollectiveCall::AllToAll { .. } => "all_to_all",
        }
    }

    /// The reduction operator, for reducing primitives.
    pub fn reduce_op(&self) -> Option<ReduceOp> {
        match self {
            CollectiveCall::Reduce { op, .. }
            | CollectiveCall::AllReduce { op, .. }
            | CollectiveCall::ReduceScatter { op, .. } => Some(*op),
            _ => None,
        }
    }

    /// Element type of the call (send side for two-buffer primitives).
    pub fn dtype(&self) -> DataType {
        match self {
            CollectiveCall::Send { buf, .. } | CollectiveCall::Recv { buf, .. } => buf.dtype(),
            CollectiveCall::Broadcast { send, .. }
            | CollectiveCall::Reduce { send, .. }
            | CollectiveCall::AllReduce { send, .. }
            | CollectiveCall::AllGather { send, .. }
            | CollectiveCall::ReduceScatter { send, .. }
            | CollectiveCall::AllToAll { send, .. } => send.dtype(),
        }
    }
}

/// A native collective-communication runtime.
///
/// Every method mirrors one native entry point and reports failures as the
/// runtime's own [`NativeStatus`](crate::NativeStatus); translation into
/// [`RncclError`](crate::RncclError) and health bookkeeping happen above
/// this trait.
pub trait NativeRuntime: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Runtime version code (`ncclGetVersion`).
    fn version(&self) -> NativeResult<i32>;

    /// Number of devices visible to this process.
    fn device_count(&self) -> NativeResult<usize>;

    /// Fresh group identity bytes (`ncclGetUniqueId`).
    fn unique_id(&self) -> NativeResult<[u8; TOKEN_BYTES]>;

    /// Device that owns `stream`, or `None` if the runtime cannot tell
    /// (for example the legacy default stream).
    fn stream_device(&self, stream: StreamId) -> NativeResult<Option<usize>>;

    /// Join the group named by `token` as `rank` on `device`.
    ///
    /// Blocks until all `world_size` participants have joined. This is the
    /// only blocking entry point.
    fn comm_init_rank(
        &self,
        token: &GroupToken,
        world_size: u32,
        rank: Rank,
        device: usize,
    ) -> NativeResult<RawComm>;

    /// Free a communicator after its outstanding work has completed.
    fn comm_destroy(&self, comm: RawComm) -> NativeResult<()>;

    /// Free a communicator immediately, abandoning outstanding work.
    fn comm_abort(&self, comm: RawComm) -> NativeResult<()>;

    /// Asynchronous error recorded against `comm` by earlier work, if any
    /// (`ncclCommGetAsyncError`).
    fn comm_async_error(&self, comm: RawComm) -> NativeResult<()>;

    /// Open a native group: launches are deferred until `group_end`.
    fn group_start(&self) -> NativeResult<()>;

    /// Submit every launch deferred since `group_start` as one unit.
    fn group_end(&self) -> NativeResult<()>;

    /// Create a pre-multiplied sum operator on `comm`: each rank scales its
    /// input by `scalar` before summation. Returns the operator tag.
    fn redop_create_premul_sum(
        &self,
        comm: RawComm,
        scalar: f64,
        dtype: DataType,
    ) -> NativeResult<u32>;

    /// Destroy an operator created by `redop_create_premul_sum`.
    fn redop_destroy(&self, comm: RawComm, op: u32) -> NativeResult<()>;

    /// Enqueue one primitive on `stream` and return without waiting.
    ///
    /// # Safety
    /// Every buffer in `call` must describe device memory of `comm`'s device
    /// that stays valid until `stream` has completed the operation.
    unsafe fn launch(&self, comm: RawComm, stream: StreamId, call: &CollectiveCall)
    -> NativeResult<()>;

    /// Block until all work queued on `stream` has finished.
    fn stream_synchronize(&self, stream: StreamId) -> NativeResult<()>;
}
