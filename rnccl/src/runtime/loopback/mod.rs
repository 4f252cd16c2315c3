//! In-process runtime: host memory as device memory, threads as participants.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rnccl::{CommContext, LoopbackFabric, LoopbackRuntime};
//!
//! let fabric = LoopbackFabric::new(2).unwrap();
//! // One runtime (and context) per participant thread.
//! let runtime = Arc::new(LoopbackRuntime::new(Arc::clone(&fabric)));
//! let ctx = CommContext::new(runtime);
//! ```

mod fabric;
mod reduce;
mod stream;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;

use crate::config::RncclConfig;
use crate::error::{Result, RncclError};
use crate::runtime::{CollectiveCall, NativeRuntime, RawComm, StreamId};
use crate::status::{NativeResult, NativeStatus};
use crate::token::{GroupToken, TOKEN_BYTES};
use crate::types::{DataType, Rank};

pub use fabric::LoopbackFabric;
use fabric::{Launch, lock};
use stream::{PendingOp, StreamState};

/// Version code reported by the loopback runtime (`major * 10000 + minor * 100 + patch`).
pub const LOOPBACK_VERSION: i32 = 100;

impl LoopbackFabric {
    /// A fabric with `device_count` simulated devices and the bootstrap
    /// timeout from `RNCCL_BOOTSTRAP_TIMEOUT_SECS` (30 s when unset).
    pub fn new(device_count: usize) -> Result<Arc<Self>> {
        Self::with_config(device_count, &RncclConfig::from_env())
    }

    pub fn with_config(device_count: usize, config: &RncclConfig) -> Result<Arc<Self>> {
        Self::with_bootstrap_timeout(device_count, config.bootstrap_timeout)
    }

    pub fn with_bootstrap_timeout(device_count: usize, timeout: Duration) -> Result<Arc<Self>> {
        let fabric = LoopbackFabric::build(device_count, timeout).map_err(|e| {
            RncclError::initialization(format!("failed to start loopback executor: {e}"))
        })?;
        Ok(Arc::new(fabric))
    }
}

#[derive(Default)]
struct Batch {
    depth: usize,
    pending: Vec<(Arc<StreamState>, PendingOp)>,
    /// Failure the next outermost `group_end` reports instead of submitting.
    fail_next: Option<NativeStatus>,
}

/// One participant's view of a [`LoopbackFabric`].
///
/// Group-call state is per participant, so two threads simulating two
/// ranks must each own a `LoopbackRuntime`.
pub struct LoopbackRuntime {
    fabric: Arc<LoopbackFabric>,
    batch: Mutex<Batch>,
}

impl LoopbackRuntime {
    pub fn new(fabric: Arc<LoopbackFabric>) -> Self {
        Self {
            fabric,
            batch: Mutex::new(Batch::default()),
        }
    }

    pub fn fabric(&self) -> &Arc<LoopbackFabric> {
        &self.fabric
    }

    /// Create an execution stream on `device`.
    pub fn create_stream(&self, device: usize) -> NativeResult<StreamId> {
        self.fabric.create_stream(device)
    }

    /// Number of enqueue events `stream` has received. A fused group counts
    /// once per stream it touches.
    pub fn submissions(&self, stream: StreamId) -> NativeResult<u64> {
        Ok(self.fabric.stream(stream)?.submissions())
    }

    /// Make the next outermost `group_end` fail with `status`, as if the
    /// fused launch had been refused. The queued work is discarded.
    pub fn fail_next_group_end(&self, status: NativeStatus) -> NativeResult<()> {
        lock(&self.batch)?.fail_next = Some(status);
        Ok(())
    }

    /// Record `status` as the asynchronous error of `comm`, as if a kernel had
    /// failed on the device.
    pub fn inject_fault(&self, comm: RawComm, status: NativeStatus) -> NativeResult<()> {
        let comm = self.fabric.comm(comm.0)?;
        tracing::debug!(rank = comm.rank, %status, "injecting loopback fault");
        comm.record_async_error(status);
        Ok(())
    }
}

impl NativeRuntime for LoopbackRuntime {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn version(&self) -> NativeResult<i32> {
        Ok(LOOPBACK_VERSION)
    }

    fn device_count(&self) -> NativeResult<usize> {
        Ok(self.fabric.device_count())
    }

    fn unique_id(&self) -> NativeResult<[u8; TOKEN_BYTES]> {
        GroupToken::generate_random()
            .map(|t| *t.as_bytes())
            .map_err(|_| NativeStatus::SystemError)
    }

    fn stream_device(&self, stream: StreamId) -> NativeResult<Option<usize>> {
        Ok(Some(self.fabric.stream(stream)?.device()))
    }

    fn comm_init_rank(
        &self,
        token: &GroupToken,
        world_size: u32,
        rank: Rank,
        device: usize,
    ) -> NativeResult<RawComm> {
        match self.fabric.join(token, world_size, rank, device) {
            Ok(comm) => Ok(RawComm(comm.id)),
            Err(failure) => {
                tracing::debug!(token = %token.short_id(), rank, %failure, "loopback join failed");
                Err(failure.status())
            }
        }
    }

    fn comm_destroy(&self, comm: RawComm) -> NativeResult<()> {
        self.fabric.remove_comm(comm.0).map(|_| ())
    }

    fn comm_abort(&self, comm: RawComm) -> NativeResult<()> {
        let comm = self.fabric.remove_comm(comm.0)?;
        comm.group.break_with(NativeStatus::RemoteError);
        Ok(())
    }

    fn comm_async_error(&self, comm: RawComm) -> NativeResult<()> {
        self.fabric.comm(comm.0)?.async_error()
    }

    fn group_start(&self) -> NativeResult<()> {
        lock(&self.batch)?.depth += 1;
        Ok(())
    }

    fn group_end(&self) -> NativeResult<()> {
        let pending = {
            let mut batch = lock(&self.batch)?;
            if batch.depth == 0 {
                return Err(NativeStatus::InvalidUsage);
            }
            batch.depth -= 1;
            if batch.depth > 0 {
                return Ok(());
            }
            let pending = std::mem::take(&mut batch.pending);
            if let Some(status) = batch.fail_next.take() {
                tracing::debug!(ops = pending.len(), %status, "failing loopback group end");
                return Err(status);
            }
            pending
        };

        // One job per stream, in first-launch order.
        let mut per_stream: Vec<(Arc<StreamState>, Vec<PendingOp>)> = Vec::new();
        for (stream, op) in pending {
            match per_stream.iter_mut().find(|(s, _)| Arc::ptr_eq(s, &stream)) {
                Some((_, ops)) => ops.push(op),
                None => per_stream.push((stream, vec![op])),
            }
        }
        for (stream, ops) in per_stream {
            stream.submit(ops)?;
        }
        Ok(())
    }

    fn redop_create_premul_sum(
        &self,
        comm: RawComm,
        scalar: f64,
        dtype: DataType,
    ) -> NativeResult<u32> {
        if !dtype.is_float() {
            return Err(NativeStatus::InvalidArgument);
        }
        self.fabric.comm(comm.0)?.register_premul_sum(scalar, dtype)
    }

    fn redop_destroy(&self, comm: RawComm, op: u32) -> NativeResult<()> {
        self.fabric.comm(comm.0)?.unregister_op(op)
    }

    unsafe fn launch(
        &self,
        comm: RawComm,
        stream: StreamId,
        call: &CollectiveCall,
    ) -> NativeResult<()> {
        let comm = self.fabric.comm(comm.0)?;
        let stream = self.fabric.stream(stream)?;
        if stream.device() != comm.device {
            return Err(NativeStatus::InvalidArgument);
        }

        let (reduction, premul) = match call.reduce_op() {
            Some(op) => {
                let (reduction, premul) = comm.resolve(op, call.dtype())?;
                (Some(reduction), premul)
            }
            None => (None, None),
        };

        let world = comm.group.world_size();
        let seq = match *call {
            CollectiveCall::Send { peer, .. } if peer < world => comm.next_send(peer)?,
            CollectiveCall::Recv { peer, .. } if peer < world => comm.next_recv(peer)?,
            CollectiveCall::Send { .. } | CollectiveCall::Recv { .. } => {
                return Err(NativeStatus::InvalidArgument);
            }
            _ => comm.next_collective()?,
        };

        let launch = Launch {
            call: *call,
            seq,
            reduction,
            premul,
        };
        // SAFETY: the caller guarantees the buffers outlive the stream work.
        let work = unsafe { fabric::execute(Arc::clone(&comm), launch) }.boxed();
        let op = PendingOp {
            comm,
            name: call.name(),
            work,
        };

        let mut batch = lock(&self.batch)?;
        if batch.depth > 0 {
            batch.pending.push((stream, op));
            Ok(())
        } else {
            drop(batch);
            stream.submit(vec![op])
        }
    }

    fn stream_synchronize(&self, stream: StreamId) -> NativeResult<()> {
        self.fabric.stream(stream)?.fence()
    }
}
