//! Group batching: many calls, one fused submission.

use std::sync::{Arc, Mutex};

use crate::comm::HealthCell;
use crate::error::{Result, RncclError};
use crate::runtime::NativeRuntime;

#[derive(Default)]
struct OpenScope {
    calls: usize,
    members: Vec<Arc<HealthCell>>,
    /// First failure among the calls queued in this scope.
    deferred: Option<RncclError>,
}

/// Tracks the (at most one) open batching scope of a [`CommContext`](crate::CommContext).
#[derive(Default)]
pub(crate) struct GroupController {
    scope: Mutex<Option<OpenScope>>,
}

impl GroupController {
    fn scope(&self, operation: &'static str) -> Result<std::sync::MutexGuard<'_, Option<OpenScope>>> {
        self.scope
            .lock()
            .map_err(|_| RncclError::invalid_state(operation, "batching scope lock poisoned"))
    }

    pub(crate) fn begin(&self, runtime: &dyn NativeRuntime) -> Result<()> {
        const OP: &str = "begin_group";
        let mut scope = self.scope(OP)?;
        if scope.is_some() {
            return Err(RncclError::invalid_state(OP, "a batching scope is already open"));
        }
        runtime.group_start().map_err(|s| s.into_error(OP))?;
        *scope = Some(OpenScope::default());
        tracing::debug!(runtime = runtime.name(), "batching scope opened");
        Ok(())
    }

    /// Close the scope and submit everything queued in it.
    ///
    /// The first deferred call failure wins over a failure of the submission
    /// itself. A native fault while submitting invalidates every member.
    pub(crate) fn end(&self, runtime: &dyn NativeRuntime) -> Result<()> {
        const OP: &str = "end_group";
        let Some(scope) = self.scope(OP)?.take() else {
            return Err(RncclError::invalid_state(OP, "no batching scope is open"));
        };

        let submitted = runtime.group_end();
        tracing::debug!(
            calls = scope.calls,
            members = scope.members.len(),
            failed = scope.deferred.is_some(),
            "batching scope closed"
        );

        let native_err = match submitted {
            Ok(()) => None,
            Err(status) if status.is_fault() => {
                tracing::error!(%status, members = scope.members.len(), "fused submission failed");
                for member in &scope.members {
                    member.invalidate();
                }
                Some(RncclError::OperationFailed {
                    operation: OP,
                    status,
                })
            }
            Err(status) => Some(status.into_error(OP)),
        };

        match scope.deferred.or(native_err) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.scope.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Calls queued in a scope that is still open, if any.
    fn open_calls(&mut self) -> Option<usize> {
        match self.scope.get_mut() {
            Ok(scope) => scope.as_ref().map(|open| open.calls),
            Err(_) => None,
        }
    }

    /// Route the outcome of a call.
    ///
    /// Inside an open scope the outcome is recorded (a failure is kept for
    /// `end`) and `None` is returned. Outside, the outcome is handed back.
    pub(crate) fn absorb(&self, member: &Arc<HealthCell>, outcome: Result<()>) -> Option<Result<()>> {
        let mut guard = match self.scope.lock() {
            Ok(guard) => guard,
            Err(_) => return Some(outcome),
        };
        let Some(scope) = guard.as_mut() else {
            return Some(outcome);
        };
        scope.calls += 1;
        if !scope.members.iter().any(|m| Arc::ptr_eq(m, member)) {
            scope.members.push(Arc::clone(member));
        }
        if let Err(err) = outcome
            && scope.deferred.is_none()
        {
            scope.deferred = Some(err);
        }
        None
    }
}

impl Drop for GroupController {
    fn drop(&mut self) {
        if let Some(calls) = self.open_calls() {
            tracing::warn!(
                calls,
                "batching scope still open at teardown; queued calls were never submitted"
            );
        }
    }
}
