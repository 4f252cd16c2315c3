use crate::buffer::BufferDesc;
use crate::collective::{StreamBinding, Submission, scaled};
use crate::error::{Result, RncclError};
use crate::runtime::CollectiveCall;

impl StreamBinding<'_> {
    /// Concatenate every participant's `send`, in rank order, into every
    /// `recv`. `recv` holds `send.count() * world_size` elements.
    ///
    /// # Safety
    /// Both buffers must be device memory of the communicator's device and
    /// stay valid until the stream completes the call.
    pub unsafe fn all_gather(&mut self, send: BufferDesc, recv: BufferDesc) -> Result<Submission> {
        unsafe { self.submit(CollectiveCall::AllGather { send, recv }) }
    }
}

pub(super) fn check_counts(world: u32, send: &BufferDesc, recv: &BufferDesc) -> Result<()> {
    let expected = scaled("all_gather", send.count(), world)?;
    if recv.count() != expected {
        return Err(RncclError::invalid_argument(
            "all_gather",
            format!(
                "recv count {} != send count {} * world size {world}",
                recv.count(),
                send.count()
            ),
        ));
    }
    Ok(())
}
