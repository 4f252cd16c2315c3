//! Explicit process context: the native runtime plus configuration.

use std::sync::Arc;

use crate::config::RncclConfig;
use crate::error::{Result, RncclError};
use crate::group::GroupController;
use crate::runtime::NativeRuntime;
use crate::token::GroupToken;

/// Everything a communicator needs from its surroundings.
///
/// Holds the native runtime and this participant's batching scope. Create
/// one per participant thread and pass it to
/// [`Communicator::create`](crate::Communicator::create).
pub struct CommContext {
    runtime: Arc<dyn NativeRuntime>,
    config: RncclConfig,
    group: GroupController,
}

impl CommContext {
    /// Context with configuration read from `RNCCL_*` environment variables.
    pub fn new(runtime: Arc<dyn NativeRuntime>) -> Arc<Self> {
        Self::with_config(runtime, RncclConfig::from_env())
    }

    pub fn with_config(runtime: Arc<dyn NativeRuntime>, config: RncclConfig) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            config,
            group: GroupController::default(),
        })
    }

    pub fn runtime(&self) -> &Arc<dyn NativeRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &RncclConfig {
        &self.config
    }

    /// Generate a fresh group token. Exactly one participant does this and
    /// ships the bytes to the others.
    pub fn generate_token(&self) -> Result<GroupToken> {
        let bytes = self
            .runtime
            .unique_id()
            .map_err(|s| RncclError::initialization_with_status("failed to generate group token", s))?;
        Ok(GroupToken::from_array(bytes))
    }

    /// Version code of the native runtime.
    pub fn runtime_version(&self) -> Result<i32> {
        self.runtime
            .version()
            .map_err(|s| s.into_error("runtime_version"))
    }

    pub fn device_count(&self) -> Result<usize> {
        self.runtime
            .device_count()
            .map_err(|s| s.into_error("device_count"))
    }

    /// Open a batching scope. Calls issued until [`CommContext::end_group`]
    /// are validated and queued, then submitted together.
    ///
    /// Fails with `InvalidState` if a scope is already open.
    pub fn begin_group(&self) -> Result<()> {
        self.group.begin(self.runtime.as_ref())
    }

    /// Close the open batching scope and submit its calls as one unit.
    ///
    /// Failures of queued calls surface here. Fails with `InvalidState` if
    /// no scope is open.
    pub fn end_group(&self) -> Result<()> {
        self.group.end(self.runtime.as_ref())
    }

    /// Run `f` inside a batching scope. The scope is closed even when `f`
    /// fails; the first error wins.
    pub fn group<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.begin_group()?;
        let result = f();
        let closed = self.end_group();
        let value = result?;
        closed?;
        Ok(value)
    }

    /// True while a batching scope is open.
    pub fn in_group(&self) -> bool {
        self.group.is_open()
    }

    pub(crate) fn groups(&self) -> &GroupController {
        &self.group
    }
}

impl std::fmt::Debug for CommContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommContext")
            .field("runtime", &self.runtime.name())
            .field("config", &self.config)
            .field("in_group", &self.in_group())
            .finish()
    }
}
