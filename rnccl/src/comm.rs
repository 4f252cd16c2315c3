//! Communicator handles: construction, health, teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::context::CommContext;
use crate::error::{Result, RncclError};
use crate::runtime::{NativeRuntime, RawComm, StreamId};
use crate::status::NativeStatus;
use crate::token::GroupToken;
use crate::types::{CustomReduce, DataType, Rank, ReduceOp};

/// Health of a communicator handle.
///
/// Only `Healthy` handles accept operations. `Invalid` is terminal: the
/// handle can only be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Health {
    Healthy = 0,
    Aborting = 1,
    Invalid = 2,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Health::Healthy => "healthy",
            Health::Aborting => "aborting",
            Health::Invalid => "invalid",
        })
    }
}

/// Shared health flag, so a batching scope can invalidate its members.
#[derive(Debug)]
pub(crate) struct HealthCell(AtomicU8);

impl HealthCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(Health::Healthy as u8)))
    }

    pub(crate) fn get(&self) -> Health {
        match self.0.load(Ordering::Acquire) {
            0 => Health::Healthy,
            1 => Health::Aborting,
            _ => Health::Invalid,
        }
    }

    pub(crate) fn set(&self, health: Health) {
        self.0.store(health as u8, Ordering::Release);
    }

    /// Flip to `Invalid`. Returns true if this call made the transition.
    pub(crate) fn invalidate(&self) -> bool {
        self.0.swap(Health::Invalid as u8, Ordering::AcqRel) != Health::Invalid as u8
    }
}

/// One participant's handle on a communication group.
///
/// Bound to a single device for its whole life. Exclusively owned: every
/// operation takes `&mut self`, and [`Communicator::release`] consumes it.
pub struct Communicator {
    ctx: Arc<CommContext>,
    token: GroupToken,
    rank: Rank,
    world_size: u32,
    device: usize,
    native: Option<RawComm>,
    health: Arc<HealthCell>,
    custom_ops: HashMap<u32, DataType>,
}

impl Communicator {
    /// Join the group named by `token` as `rank` of `world_size` on `device`.
    ///
    /// **This call blocks** until all `world_size` participants have called
    /// `create` with the same token, or the runtime gives up. It is the only
    /// blocking call of the API. Any failure is reported as
    /// [`RncclError::Initialization`]; no handle exists afterwards.
    pub fn create(
        ctx: &Arc<CommContext>,
        token: &GroupToken,
        rank: Rank,
        world_size: u32,
        device: usize,
    ) -> Result<Self> {
        if world_size == 0 {
            return Err(RncclError::initialization("world size must be at least 1"));
        }
        if rank >= world_size {
            return Err(RncclError::initialization(format!(
                "rank {rank} outside world of size {world_size}"
            )));
        }
        let device_count = ctx.runtime().device_count().map_err(|s| {
            RncclError::initialization_with_status("failed to query device count", s)
        })?;
        if device >= device_count {
            return Err(RncclError::initialization(format!(
                "device {device} not present ({device_count} devices)"
            )));
        }

        tracing::debug!(
            token = %token.short_id(),
            rank,
            world_size,
            device,
            runtime = ctx.runtime().name(),
            "joining communicator group"
        );
        let native = ctx
            .runtime()
            .comm_init_rank(token, world_size, rank, device)
            .map_err(|s| {
                RncclError::initialization_with_status(
                    format!(
                        "rank {rank} of {world_size} failed to join group {}",
                        token.short_id()
                    ),
                    s,
                )
            })?;
        tracing::info!(token = %token.short_id(), rank, world_size, device, "communicator created");

        Ok(Self {
            ctx: Arc::clone(ctx),
            token: token.clone(),
            rank,
            world_size,
            device,
            native: Some(native),
            health: HealthCell::new(),
            custom_ops: HashMap::new(),
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Device this communicator is bound to.
    pub fn device(&self) -> usize {
        self.device
    }

    pub fn token(&self) -> &GroupToken {
        &self.token
    }

    pub fn health(&self) -> Health {
        self.health.get()
    }

    pub fn context(&self) -> &Arc<CommContext> {
        &self.ctx
    }

    /// The native handle, or `None` once it has been aborted.
    pub fn raw(&self) -> Option<RawComm> {
        self.native
    }

    pub(crate) fn runtime(&self) -> &dyn NativeRuntime {
        self.ctx.runtime().as_ref()
    }

    pub(crate) fn health_cell(&self) -> &Arc<HealthCell> {
        &self.health
    }

    /// Native handle of a healthy communicator; otherwise `CommunicatorInvalid`.
    pub(crate) fn ensure_healthy(&self) -> Result<RawComm> {
        match (self.health.get(), self.native) {
            (Health::Healthy, Some(raw)) => Ok(raw),
            _ => Err(RncclError::CommunicatorInvalid {
                rank: self.rank,
                health: self.health.get(),
            }),
        }
    }

    fn invalidate(&self, operation: &'static str, status: NativeStatus) {
        if self.health.invalidate() {
            tracing::warn!(rank = self.rank, op = operation, %status, "communicator is now invalid");
        }
    }

    /// Translate a native failure, invalidating the handle on faults.
    pub(crate) fn fault(&self, operation: &'static str, status: NativeStatus) -> RncclError {
        if status.is_fault() {
            self.invalidate(operation, status);
        }
        status.into_error(operation)
    }

    /// An asynchronous error always means the communicator's work is lost.
    fn async_fault(&self, operation: &'static str, status: NativeStatus) -> RncclError {
        self.invalidate(operation, status);
        RncclError::OperationFailed { operation, status }
    }

    pub(crate) fn poll_async_error(&self, operation: &'static str, raw: RawComm) -> Result<()> {
        self.runtime()
            .comm_async_error(raw)
            .map_err(|s| self.async_fault(operation, s))
    }

    /// Poll the runtime for an asynchronous error on this communicator.
    ///
    /// A reported error invalidates the handle and is returned as
    /// [`RncclError::OperationFailed`].
    pub fn check_health(&mut self) -> Result<()> {
        let raw = self.ensure_healthy()?;
        self.poll_async_error("check_health", raw)
    }

    /// Wait for everything queued on `stream`, then poll for asynchronous
    /// errors. This is where on-device faults of earlier calls surface.
    pub fn synchronize(&mut self, stream: StreamId) -> Result<()> {
        let raw = self.ensure_healthy()?;
        self.runtime()
            .stream_synchronize(stream)
            .map_err(|s| self.fault("synchronize", s))?;
        self.poll_async_error("synchronize", raw)
    }

    /// Abandon the communicator without waiting for outstanding work.
    ///
    /// The handle goes through `Aborting` to `Invalid`. Peers blocked in a
    /// collective with this rank may fail or hang, depending on the runtime.
    pub fn abort(&mut self) -> Result<()> {
        let Some(raw) = self.native.take() else {
            return Ok(());
        };
        self.health.set(Health::Aborting);
        let outcome = self.runtime().comm_abort(raw);
        self.health.set(Health::Invalid);
        tracing::info!(rank = self.rank, "communicator aborted");
        outcome.map_err(|status| RncclError::OperationFailed {
            operation: "abort",
            status,
        })
    }

    /// Release the communicator.
    ///
    /// Must not be called while operations are outstanding on its streams.
    /// Releasing an invalid handle succeeds and only frees local resources.
    pub fn release(mut self) -> Result<()> {
        let Some(raw) = self.native.take() else {
            tracing::info!(rank = self.rank, "released aborted communicator");
            return Ok(());
        };
        match self.health.get() {
            Health::Healthy => {
                self.runtime()
                    .comm_destroy(raw)
                    .map_err(|status| RncclError::OperationFailed {
                        operation: "release",
                        status,
                    })?;
                tracing::info!(rank = self.rank, "communicator released");
            }
            health => {
                tracing::warn!(rank = self.rank, %health, "releasing unhealthy communicator");
                if let Err(status) = self.runtime().comm_abort(raw) {
                    tracing::debug!(rank = self.rank, %status, "abort during release failed");
                }
            }
        }
        Ok(())
    }

    /// Create a pre-multiplied sum operator: every rank scales its input by
    /// `scalar` (which may differ per rank) before summation.
    ///
    /// The returned operator is only valid on this communicator and only for
    /// `dtype`, which must be a floating-point type.
    pub fn create_premul_sum(&mut self, scalar: f64, dtype: DataType) -> Result<ReduceOp> {
        const OP: &str = "create_premul_sum";
        let raw = self.ensure_healthy()?;
        if !dtype.is_float() {
            return Err(RncclError::invalid_argument(
                OP,
                format!("pre-multiplied sum needs a floating-point type, got {dtype}"),
            ));
        }
        let tag = self
            .runtime()
            .redop_create_premul_sum(raw, scalar, dtype)
            .map_err(|s| self.fault(OP, s))?;
        let custom = CustomReduce::from_tag(tag).ok_or(RncclError::OperationFailed {
            operation: OP,
            status: NativeStatus::InternalError,
        })?;
        self.custom_ops.insert(tag, dtype);
        tracing::debug!(rank = self.rank, tag, %dtype, scalar, "custom reduction created");
        Ok(ReduceOp::Custom(custom))
    }

    /// Destroy an operator created by [`Communicator::create_premul_sum`].
    pub fn destroy_reduce_op(&mut self, op: ReduceOp) -> Result<()> {
        const OP: &str = "destroy_reduce_op";
        let raw = self.ensure_healthy()?;
        let ReduceOp::Custom(custom) = op else {
            return Err(RncclError::invalid_argument(
                OP,
                format!("{op} is built in and cannot be destroyed"),
            ));
        };
        if self.custom_ops.remove(&custom.tag()).is_none() {
            return Err(RncclError::invalid_argument(
                OP,
                format!("{op} was not created on this communicator"),
            ));
        }
        self.runtime()
            .redop_destroy(raw, custom.tag())
            .map_err(|s| self.fault(OP, s))
    }

    /// Data type a custom operator was created for, if it belongs here.
    pub(crate) fn custom_dtype(&self, custom: CustomReduce) -> Option<DataType> {
        self.custom_ops.get(&custom.tag()).copied()
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("token", &self.token.short_id())
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("device", &self.device)
            .field("health", &self.health.get())
            .finish()
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        let Some(raw) = self.native.take() else {
            return;
        };
        tracing::warn!(
            rank = self.rank,
            device = self.device,
            "communicator dropped without release"
        );
        if self.ctx.config().abort_on_drop
            && let Err(status) = self.runtime().comm_abort(raw)
        {
            tracing::debug!(rank = self.rank, %status, "abort on drop failed");
        }
    }
}
