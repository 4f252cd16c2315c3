//! Flat call surface for a host interpreter.
//!
//! The host hands over plain integers: handle ids, stream ids, device
//! pointers, signed counts and ranks, and data-type / operator tags. They are
//! validated here and turned into the typed API. Released handles leave a
//! tombstone, so a second release or a call on a released handle fails with
//! `InvalidState` instead of touching freed state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer::BufferDesc;
use crate::comm::{Communicator, Health};
use crate::context::CommContext;
use crate::error::{Result, RncclError};
use crate::runtime::StreamId;
use crate::token::{GroupToken, TOKEN_BYTES};
use crate::types::{DataType, Rank, ReduceOp};

/// Identifier of a communicator registered with a [`HostApi`].
pub type HandleId = u64;

enum Slot {
    Live(Communicator),
    /// Reserved while `create` blocks in the rendezvous.
    Joining,
    Released,
}

struct Registry {
    next: HandleId,
    slots: HashMap<HandleId, Slot>,
}

/// Handle table plus the loosely typed entry points.
pub struct HostApi {
    ctx: Arc<CommContext>,
    registry: Mutex<Registry>,
}

fn to_rank(operation: &'static str, role: &str, value: i64) -> Result<Rank> {
    Rank::try_from(value).map_err(|_| {
        RncclError::invalid_argument(operation, format!("{role} {value} is not a valid rank"))
    })
}

fn to_count(operation: &'static str, value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| {
        RncclError::invalid_argument(operation, format!("element count {value} is negative"))
    })
}

fn to_dtype(operation: &'static str, tag: i32) -> Result<DataType> {
    DataType::from_tag(tag).ok_or_else(|| {
        RncclError::invalid_argument(operation, format!("unknown data type tag {tag}"))
    })
}

fn to_op(operation: &'static str, tag: i32) -> Result<ReduceOp> {
    ReduceOp::from_tag(tag).ok_or_else(|| {
        RncclError::invalid_argument(operation, format!("unknown reduction operator tag {tag}"))
    })
}

impl HostApi {
    pub fn new(ctx: Arc<CommContext>) -> Self {
        Self {
            ctx,
            registry: Mutex::new(Registry {
                next: 1,
                slots: HashMap::new(),
            }),
        }
    }

    pub fn context(&self) -> &Arc<CommContext> {
        &self.ctx
    }

    fn registry(&self, operation: &'static str) -> Result<MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| RncclError::invalid_state(operation, "handle table lock poisoned"))
    }

    /// Run `f` on a live communicator.
    fn with_comm<T>(
        &self,
        operation: &'static str,
        handle: HandleId,
        f: impl FnOnce(&mut Communicator) -> Result<T>,
    ) -> Result<T> {
        let mut registry = self.registry(operation)?;
        match registry.slots.get_mut(&handle) {
            Some(Slot::Live(comm)) => f(comm),
            Some(Slot::Released) => Err(RncclError::invalid_state(
                operation,
                format!("handle {handle} has been released"),
            )),
            Some(Slot::Joining) => Err(RncclError::invalid_state(
                operation,
                format!("handle {handle} is still being created"),
            )),
            None => Err(RncclError::invalid_argument(
                operation,
                format!("unknown handle {handle}"),
            )),
        }
    }

    /// Fresh 128-byte group token.
    pub fn generate_token(&self) -> Result<[u8; TOKEN_BYTES]> {
        self.ctx.generate_token().map(|t| *t.as_bytes())
    }

    /// Create a communicator and return its handle id. Blocks until the
    /// whole group has joined.
    pub fn create(
        &self,
        token_bytes: &[u8],
        rank: i64,
        world_size: i64,
        device: i64,
    ) -> Result<HandleId> {
        const OP: &str = "create";
        let token = GroupToken::from_bytes(token_bytes)?;
        let world_size = u32::try_from(world_size).map_err(|_| {
            RncclError::initialization(format!("world size {world_size} is out of range"))
        })?;
        let rank = Rank::try_from(rank)
            .map_err(|_| RncclError::initialization(format!("rank {rank} is out of range")))?;
        let device = usize::try_from(device)
            .map_err(|_| RncclError::initialization(format!("device {device} is out of range")))?;

        let id = {
            let mut registry = self.registry(OP)?;
            let id = registry.next;
            registry.next += 1;
            registry.slots.insert(id, Slot::Joining);
            id
        };

        // The rendezvous blocks; the table stays unlocked meanwhile.
        let created = Communicator::create(&self.ctx, &token, rank, world_size, device);

        let mut registry = self.registry(OP)?;
        match created {
            Ok(comm) => {
                registry.slots.insert(id, Slot::Live(comm));
                Ok(id)
            }
            Err(e) => {
                registry.slots.remove(&id);
                Err(e)
            }
        }
    }

    /// Release a handle. A second release fails with `InvalidState`.
    pub fn release(&self, handle: HandleId) -> Result<()> {
        const OP: &str = "release";
        let comm = {
            let mut registry = self.registry(OP)?;
            match registry.slots.get(&handle) {
                Some(Slot::Live(_)) => {}
                Some(Slot::Released) => {
                    return Err(RncclError::invalid_state(
                        OP,
                        format!("handle {handle} already released"),
                    ));
                }
                Some(Slot::Joining) => {
                    return Err(RncclError::invalid_state(
                        OP,
                        format!("handle {handle} is still being created"),
                    ));
                }
                None => {
                    return Err(RncclError::invalid_argument(
                        OP,
                        format!("unknown handle {handle}"),
                    ));
                }
            }
            match registry.slots.insert(handle, Slot::Released) {
                Some(Slot::Live(comm)) => comm,
                _ => return Err(RncclError::invalid_state(OP, "handle table changed")),
            }
        };
        comm.release()
    }

    pub fn begin_group(&self) -> Result<()> {
        self.ctx.begin_group()
    }

    pub fn end_group(&self) -> Result<()> {
        self.ctx.end_group()
    }

    pub fn health(&self, handle: HandleId) -> Result<Health> {
        self.with_comm("health", handle, |comm| Ok(comm.health()))
    }

    pub fn abort(&self, handle: HandleId) -> Result<()> {
        self.with_comm("abort", handle, |comm| comm.abort())
    }

    pub fn synchronize(&self, handle: HandleId, stream: u64) -> Result<()> {
        self.with_comm("synchronize", handle, |comm| {
            comm.synchronize(StreamId(stream))
        })
    }

    /// Register a pre-multiplied sum operator and return its tag.
    pub fn create_premul_sum(&self, handle: HandleId, scalar: f64, dtype: i32) -> Result<i32> {
        const OP: &str = "create_premul_sum";
        let dtype = to_dtype(OP, dtype)?;
        self.with_comm(OP, handle, |comm| {
            comm.create_premul_sum(scalar, dtype).map(|op| op.tag())
        })
    }

    pub fn destroy_reduce_op(&self, handle: HandleId, op: i32) -> Result<()> {
        const OP: &str = "destroy_reduce_op";
        let op = to_op(OP, op)?;
        self.with_comm(OP, handle, |comm| comm.destroy_reduce_op(op))
    }

    /// # Safety
    /// `send` and `recv` must be device pointers to `count` elements of
    /// `dtype`, valid until `stream` completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn broadcast(
        &self,
        handle: HandleId,
        stream: u64,
        send: u64,
        recv: u64,
        count: i64,
        dtype: i32,
        root: i64,
    ) -> Result<()> {
        const OP: &str = "broadcast";
        let (count, dtype) = (to_count(OP, count)?, to_dtype(OP, dtype)?);
        let root = to_rank(OP, "root", root)?;
        self.with_comm(OP, handle, |comm| unsafe {
            comm.bind(StreamId(stream))
                .broadcast(
                    root,
                    BufferDesc::new(send, count, dtype),
                    BufferDesc::new(recv, count, dtype),
                )
                .map(|_| ())
        })
    }

    /// # Safety
    /// `send` and `recv` must be device pointers to `count` elements of
    /// `dtype`, valid until `stream` completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn reduce(
        &self,
        handle: HandleId,
        stream: u64,
        send: u64,
        recv: u64,
        count: i64,
        dtype: i32,
        op: i32,
        root: i64,
    ) -> Result<()> {
        const OP: &str = "reduce";
        let (count, dtype) = (to_count(OP, count)?, to_dtype(OP, dtype)?);
        let op = to_op(OP, op)?;
        let root = to_rank(OP, "root", root)?;
        self.with_comm(OP, handle, |comm| unsafe {
            comm.bind(StreamId(stream))
                .reduce(
                    root,
                    BufferDesc::new(send, count, dtype),
                    BufferDesc::new(recv, count, dtype),
                    op,
                )
                .map(|_| ())
        })
    }

    /// # Safety
    /// `send` and `recv` must be device pointers to `count` elements of
    /// `dtype`, valid until `stream` completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn all_reduce(
        &self,
        handle: HandleId,
        stream: u64,
        send: u64,
        recv: u64,
        count: i64,
        dtype: i32,
        op: i32,
    ) -> Result<()> {
        const OP: &str = "all_reduce";
        let (count, dtype) = (to_count(OP, count)?, to_dtype(OP, dtype)?);
        let op = to_op(OP, op)?;
        self.with_comm(OP, handle, |comm| unsafe {
            comm.bind(StreamId(stream))
                .all_reduce(
                    BufferDesc::new(send, count, dtype),
                    BufferDesc::new(recv, count, dtype),
                    op,
                )
                .map(|_| ())
        })
    }

    /// `count` is the per-rank send count; `recv` holds `count * world_size`.
    ///
    /// # Safety
    /// Pointers must be valid device memory of the stated sizes until
    /// `stream` completes.
    pub unsafe fn all_gather(
        &self,
        handle: HandleId,
        stream: u64,
        send: u64,
        recv: u64,
        count: i64,
        dtype: i32,
    ) -> Result<()> {
        const OP: &str = "all_gather";
        let (count, dtype) = (to_count(OP, count)?, to_dtype(OP, dtype)?);
        self.with_comm(OP, handle, |comm| {
            let total = gathered(OP, count, comm.world_size())?;
            unsafe {
                comm.bind(StreamId(stream))
                    .all_gather(
                        BufferDesc::new(send, count, dtype),
                        BufferDesc::new(recv, total, dtype),
                    )
                    .map(|_| ())
            }
        })
    }

    /// `count` is the per-rank receive count; `send` holds `count * world_size`.
    ///
    /// # Safety
    /// Pointers must be valid device memory of the stated sizes until
    /// `stream` completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn reduce_scatter(
        &self,
        handle: HandleId,
        stream: u64,
        send: u64,
        recv: u64,
        count: i64,
        dtype: i32,
        op: i32,
    ) -> Result<()> {
        const OP: &str = "reduce_scatter";
        let (count, dtype) = (to_count(OP, count)?, to_dtype(OP, dtype)?);
        let op = to_op(OP, op)?;
        self.with_comm(OP, handle, |comm| {
            let total = gathered(OP, count, comm.world_size())?;
            unsafe {
                comm.bind(StreamId(stream))
                    .reduce_scatter(
                        BufferDesc::new(send, total, dtype),
                        BufferDesc::new(recv, count, dtype),
                        op,
                    )
                    .map(|_| ())
            }
        })
    }

    /// # Safety
    /// `buf` must point to `count` elements of `dtype`, valid until `stream`
    /// completes.
    pub unsafe fn send(
        &self,
        handle: HandleId,
        stream: u64,
        buf: u64,
        count: i64,
        dtype: i32,
        peer: i64,
    ) -> Result<()> {
        const OP: &str = "send";
        let (count, dtype) = (to_count(OP, count)?, to_dtype(OP, dtype)?);
        let peer = to_rank(OP, "peer", peer)?;
        self.with_comm(OP, handle, |comm| unsafe {
            comm.bind(StreamId(stream))
                .send(peer, BufferDesc::new(buf, count, dtype))
                .map(|_| ())
        })
    }

    /// # Safety
    /// `buf` must point to `count` elements of `dtype`, valid until `stream`
    /// completes.
    pub unsafe fn recv(
        &self,
        handle: HandleId,
        stream: u64,
        buf: u64,
        count: i64,
        dtype: i32,
        peer: i64,
    ) -> Result<()> {
        const OP: &str = "recv";
        let (count, dtype) = (to_count(OP, count)?, to_dtype(OP, dtype)?);
        let peer = to_rank(OP, "peer", peer)?;
        self.with_comm(OP, handle, |comm| unsafe {
            comm.bind(StreamId(stream))
                .recv(peer, BufferDesc::new(buf, count, dtype))
                .map(|_| ())
        })
    }

    /// `count` is the total element count of both `send` and `recv`.
    ///
    /// # Safety
    /// Pointers must be valid, non-overlapping device memory of `count`
    /// elements until `stream` completes.
    pub unsafe fn all_to_all(
        &self,
        handle: HandleId,
        stream: u64,
        send: u64,
        recv: u64,
        count: i64,
        dtype: i32,
    ) -> Result<()> {
        const OP: &str = "all_to_all";
        let (count, dtype) = (to_count(OP, count)?, to_dtype(OP, dtype)?);
        self.with_comm(OP, handle, |comm| unsafe {
            comm.bind(StreamId(stream))
                .all_to_all(
                    BufferDesc::new(send, count, dtype),
                    BufferDesc::new(recv, count, dtype),
                )
                .map(|_| ())
        })
    }
}

fn gathered(operation: &'static str, count: usize, world: u32) -> Result<usize> {
    count.checked_mul(world as usize).ok_or_else(|| {
        RncclError::invalid_argument(operation, format!("{count} x {world} elements overflows"))
    })
}

impl Drop for HostApi {
    fn drop(&mut self) {
        if let Ok(registry) = self.registry.get_mut() {
            let leaked = registry
                .slots
                .values()
                .filter(|s| matches!(s, Slot::Live(_)))
                .count();
            if leaked > 0 {
                tracing::warn!(leaked, "host surface dropped with unreleased communicators");
            }
        }
    }
}
