use crate::buffer::BufferDesc;
use crate::collective::{StreamBinding, Submission, counts_equal};
use crate::error::Result;
use crate::runtime::CollectiveCall;
use crate::types::{Rank, ReduceOp};

impl StreamBinding<'_> {
    /// Combine every participant's `send` with `op`; only `root`'s `recv`
    /// receives the result. Other ranks' `recv` is left untouched and may be
    /// null.
    ///
    /// # Safety
    /// Both buffers must be device memory of the communicator's device and
    /// stay valid until the stream completes the call.
    pub unsafe fn reduce(
        &mut self,
        root: Rank,
        send: BufferDesc,
        recv: BufferDesc,
        op: ReduceOp,
    ) -> Result<Submission> {
        unsafe {
            self.submit(CollectiveCall::Reduce {
                send,
                recv,
                op,
                root,
            })
        }
    }
}

pub(super) fn check_counts(send: &BufferDesc, recv: &BufferDesc) -> Result<()> {
    counts_equal("reduce", send, recv)
}
