//! Collective dispatch.
//!
//! Every primitive goes through the same pipeline: health check,
//! asynchronous error poll, local argument validation, then a single native
//! launch on the bound stream. Nothing here waits for the operation; callers
//! synchronize the stream before reading results.

mod allgather;
mod allreduce;
mod alltoall;
mod broadcast;
mod p2p;
mod reduce;
mod reduce_scatter;

use crate::buffer::BufferDesc;
use crate::comm::Communicator;
use crate::error::{Result, RncclError};
use crate::runtime::{CollectiveCall, StreamId};
use crate::types::{Rank, ReduceOp};

/// Completion record of a dispatched call: the operation was enqueued (or,
/// inside a batching scope, queued for the scope), not finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    operation: &'static str,
    stream: StreamId,
    batched: bool,
}

impl Submission {
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// True if the call was queued in a batching scope. Its failures, if any,
    /// surface at `end_group`.
    pub fn batched(&self) -> bool {
        self.batched
    }
}

/// A communicator paired with the stream its next calls run on.
///
/// Non-owning and cheap; re-create it whenever the stream changes.
pub struct StreamBinding<'c> {
    comm: &'c mut Communicator,
    stream: StreamId,
}

impl Communicator {
    /// Bind `stream` for the following calls. The stream must belong to this
    /// communicator's device; that is checked on every call.
    pub fn bind(&mut self, stream: StreamId) -> StreamBinding<'_> {
        StreamBinding { comm: self, stream }
    }

    /// Validate and launch one call, routing its outcome through the open
    /// batching scope, if any.
    ///
    /// # Safety
    /// The buffers in `call` must stay valid until the stream completes it.
    unsafe fn dispatch(&mut self, stream: StreamId, call: CollectiveCall) -> Result<Submission> {
        let operation = call.name();
        let outcome = unsafe { self.launch_checked(stream, &call) };
        let batched = match self.context().groups().absorb(self.health_cell(), outcome) {
            None => true,
            Some(outcome) => {
                outcome?;
                false
            }
        };
        tracing::debug!(
            rank = self.rank(),
            op = operation,
            %stream,
            batched,
            "submitted"
        );
        Ok(Submission {
            operation,
            stream,
            batched,
        })
    }

    unsafe fn launch_checked(&mut self, stream: StreamId, call: &CollectiveCall) -> Result<()> {
        let operation = call.name();
        let raw = self.ensure_healthy()?;
        if self.context().config().check_async_errors {
            self.poll_async_error(operation, raw)?;
        }
        validate(self, call)?;
        self.check_stream(operation, stream)?;
        unsafe { self.runtime().launch(raw, stream, call) }.map_err(|s| self.fault(operation, s))
    }

    fn check_stream(&self, operation: &'static str, stream: StreamId) -> Result<()> {
        match self.runtime().stream_device(stream) {
            Ok(Some(device)) if device != self.device() => Err(RncclError::invalid_argument(
                operation,
                format!(
                    "{stream} belongs to device {device}, communicator is bound to device {}",
                    self.device()
                ),
            )),
            Ok(_) => Ok(()),
            Err(status) => Err(RncclError::invalid_argument(
                operation,
                format!("{stream} is not usable: {status}"),
            )),
        }
    }
}

impl StreamBinding<'_> {
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn communicator(&self) -> &Communicator {
        self.comm
    }

    unsafe fn submit(&mut self, call: CollectiveCall) -> Result<Submission> {
        unsafe { self.comm.dispatch(self.stream, call) }
    }
}

/// Everything that can be checked without talking to peers.
fn validate(comm: &Communicator, call: &CollectiveCall) -> Result<()> {
    let operation = call.name();
    let world = comm.world_size();
    match call {
        CollectiveCall::Broadcast { send, recv, root } => {
            check_rank(operation, "root", *root, world)?;
            // Only the root's send buffer is read.
            check_rooted(operation, send, recv, comm.rank() == *root, true)?;
            broadcast::check_counts(send, recv)?;
        }
        CollectiveCall::Reduce {
            send, recv, root, ..
        } => {
            check_rank(operation, "root", *root, world)?;
            // Only the root's recv buffer is written.
            check_rooted(operation, send, recv, true, comm.rank() == *root)?;
            reduce::check_counts(send, recv)?;
        }
        CollectiveCall::AllReduce { send, recv, .. } => {
            check_pair(operation, send, recv)?;
            allreduce::check_counts(send, recv)?;
        }
        CollectiveCall::AllGather { send, recv } => {
            check_pair(operation, send, recv)?;
            allgather::check_counts(world, send, recv)?;
        }
        CollectiveCall::ReduceScatter { send, recv, .. } => {
            check_pair(operation, send, recv)?;
            reduce_scatter::check_counts(world, send, recv)?;
        }
        CollectiveCall::AllToAll { send, recv } => {
            check_pair(operation, send, recv)?;
            alltoall::check_counts(world, send, recv)?;
        }
        CollectiveCall::Send { buf, peer } | CollectiveCall::Recv { buf, peer } => {
            buf.check(operation, "data")?;
            check_rank(operation, "peer", *peer, world)?;
        }
    }
    if let Some(op) = call.reduce_op() {
        check_op(comm, operation, op, call)?;
    }
    Ok(())
}

fn check_pair(operation: &'static str, send: &BufferDesc, recv: &BufferDesc) -> Result<()> {
    check_rooted(operation, send, recv, true, true)
}

/// Like [`check_pair`], but a buffer this rank never touches may be null.
fn check_rooted(
    operation: &'static str,
    send: &BufferDesc,
    recv: &BufferDesc,
    send_used: bool,
    recv_used: bool,
) -> Result<()> {
    if send_used {
        send.check(operation, "send")?;
    }
    if recv_used {
        recv.check(operation, "recv")?;
    }
    if send.dtype() != recv.dtype() {
        return Err(RncclError::invalid_argument(
            operation,
            format!(
                "send type {} does not match recv type {}",
                send.dtype(),
                recv.dtype()
            ),
        ));
    }
    Ok(())
}

fn check_rank(operation: &'static str, role: &str, rank: Rank, world: u32) -> Result<()> {
    if rank >= world {
        return Err(RncclError::invalid_argument(
            operation,
            format!("{role} {rank} outside world of size {world}"),
        ));
    }
    Ok(())
}

fn check_op(
    comm: &Communicator,
    operation: &'static str,
    op: ReduceOp,
    call: &CollectiveCall,
) -> Result<()> {
    let dtype = call.dtype();
    match op {
        ReduceOp::Custom(custom) => match comm.custom_dtype(custom) {
            None => Err(RncclError::invalid_argument(
                operation,
                format!("{op} was not created on this communicator"),
            )),
            Some(created) if created != dtype => Err(RncclError::invalid_argument(
                operation,
                format!("{op} was created for {created}, call uses {dtype}"),
            )),
            Some(_) => Ok(()),
        },
        op if !op.supports(dtype) => Err(RncclError::invalid_argument(
            operation,
            format!("{op} is not defined for {dtype}"),
        )),
        _ => Ok(()),
    }
}

/// `count * factor`, rejecting overflow as an invalid argument.
fn scaled(operation: &'static str, count: usize, factor: u32) -> Result<usize> {
    count.checked_mul(factor as usize).ok_or_else(|| {
        RncclError::invalid_argument(operation, format!("{count} x {factor} elements overflows"))
    })
}

fn counts_equal(operation: &'static str, send: &BufferDesc, recv: &BufferDesc) -> Result<()> {
    if send.count() != recv.count() {
        return Err(RncclError::invalid_argument(
            operation,
            format!(
                "send count {} does not match recv count {}",
                send.count(),
                recv.count()
            ),
        ));
    }
    Ok(())
}
