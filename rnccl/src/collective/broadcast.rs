use crate::buffer::BufferDesc;
use crate::collective::{StreamBinding, Submission, counts_equal};
use crate::error::Result;
use crate::runtime::CollectiveCall;
use crate::types::Rank;

impl StreamBinding<'_> {
    /// Copy `root`'s `send` buffer into every participant's `recv`.
    ///
    /// On the root, passing the same buffer as `send` and `recv` broadcasts
    /// in place. Non-root ranks' `send` is not read and may be null.
    ///
    /// # Safety
    /// Both buffers must be device memory of the communicator's device, hold
    /// `count` elements, and stay valid until the stream completes the call.
    pub unsafe fn broadcast(
        &mut self,
        root: Rank,
        send: BufferDesc,
        recv: BufferDesc,
    ) -> Result<Submission> {
        unsafe { self.submit(CollectiveCall::Broadcast { send, recv, root }) }
    }
}

pub(super) fn check_counts(send: &BufferDesc, recv: &BufferDesc) -> Result<()> {
    counts_equal("broadcast", send, recv)
}
