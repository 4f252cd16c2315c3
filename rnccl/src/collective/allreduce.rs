use crate::buffer::BufferDesc;
use crate::collective::{StreamBinding, Submission, counts_equal};
use crate::error::Result;
use crate::runtime::CollectiveCall;
use crate::types::ReduceOp;

impl StreamBinding<'_> {
    /// Combine every participant's `send` with `op` and deliver the identical
    /// result into every `recv`. `send` and `recv` may be the same buffer.
    ///
    /// # Safety
    /// Both buffers must be device memory of the communicator's device and
    /// stay valid until the stream completes the call.
    pub unsafe fn all_reduce(
        &mut self,
        send: BufferDesc,
        recv: BufferDesc,
        op: ReduceOp,
    ) -> Result<Submission> {
        unsafe { self.submit(CollectiveCall::AllReduce { send, recv, op }) }
    }
}

pub(super) fn check_counts(send: &BufferDesc, recv: &BufferDesc) -> Result<()> {
    counts_equal("all_reduce", send, recv)
}
