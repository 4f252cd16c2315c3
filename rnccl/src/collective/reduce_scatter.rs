use crate::buffer::BufferDesc;
use crate::collective::{StreamBinding, Submission, scaled};
use crate::error::{Result, RncclError};
use crate::runtime::CollectiveCall;
use crate::types::ReduceOp;

impl StreamBinding<'_> {
    /// Combine every participant's `send` element-wise with `op`; rank `i`
    /// receives the `i`-th contiguous slice of the result in `recv`.
    /// `send` holds `recv.count() * world_size` elements.
    ///
    /// # Safety
    /// Both buffers must be device memory of the communicator's device and
    /// stay valid until the stream completes the call.
    pub unsafe fn reduce_scatter(
        &mut self,
        send: BufferDesc,
        recv: BufferDesc,
        op: ReduceOp,
    ) -> Result<Submission> {
        unsafe { self.submit(CollectiveCall::ReduceScatter { send, recv, op }) }
    }
}

pub(super) fn check_counts(world: u32, send: &BufferDesc, recv: &BufferDesc) -> Result<()> {
    let expected = scaled("reduce_scatter", recv.count(), world)?;
    if send.count() != expected {
        return Err(RncclError::invalid_argument(
            "reduce_scatter",
            format!(
                "send count {} != recv count {} * world size {world}",
                send.count(),
                recv.count()
            ),
        ));
    }
    Ok(())
}
