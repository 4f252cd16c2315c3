//! Point-to-point transfers.
//!
//! A send must be matched by a recv of the same size on the peer, issued in
//! the same order relative to other traffic between the pair. Unmatched
//! calls block on the stream; this layer cannot detect them.

use crate::buffer::BufferDesc;
use crate::collective::{StreamBinding, Submission};
use crate::error::Result;
use crate::runtime::CollectiveCall;
use crate::types::Rank;

impl StreamBinding<'_> {
    /// Send `buf` to `peer`.
    ///
    /// # Safety
    /// `buf` must be device memory of the communicator's device and stay
    /// valid until the stream completes the call.
    pub unsafe fn send(&mut self, peer: Rank, buf: BufferDesc) -> Result<Submission> {
        unsafe { self.submit(CollectiveCall::Send { buf, peer }) }
    }

    /// Receive into `buf` from `peer`.
    ///
    /// # Safety
    /// `buf` must be device memory of the communicator's device and stay
    /// valid until the stream completes the call.
    pub unsafe fn recv(&mut self, peer: Rank, buf: BufferDesc) -> Result<Submission> {
        unsafe { self.submit(CollectiveCall::Recv { buf, peer }) }
    }
}
