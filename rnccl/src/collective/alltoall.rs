use crate::buffer::BufferDesc;
use crate::collective::{StreamBinding, Submission, counts_equal};
use crate::error::{Result, RncclError};
use crate::runtime::CollectiveCall;

impl StreamBinding<'_> {
    /// Split `send` into `world_size` equal chunks; chunk `i` goes to rank
    /// `i`, and the chunk received from rank `j` lands at slot `j` of `recv`.
    ///
    /// # Safety
    /// Both buffers must be device memory of the communicator's device and
    /// stay valid until the stream completes the call. They must not overlap.
    pub unsafe fn all_to_all(&mut self, send: BufferDesc, recv: BufferDesc) -> Result<Submission> {
        unsafe { self.submit(CollectiveCall::AllToAll { send, recv }) }
    }
}

pub(super) fn check_counts(world: u32, send: &BufferDesc, recv: &BufferDesc) -> Result<()> {
    counts_equal("all_to_all", send, recv)?;
    if send.count() % world as usize != 0 {
        return Err(RncclError::invalid_argument(
            "all_to_all",
            format!(
                "count {} is not divisible by world size {world}",
                send.count()
            ),
        ));
    }
    Ok(())
}
