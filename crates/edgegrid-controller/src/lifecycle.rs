//! The tracked-state machine shared by every agent-managed object.
//!
//! Info reports from the agent only move an object along the edges of
//! [`transition_ok`]; anything else is stale or out of order and dropped.

use std::time::Duration;

use edgegrid_core::{InfoObject, ObjKey, TrackedObject, TrackedState};
use edgegrid_sync::{ObjectCache, Progress, WaitSpec};
use tracing::{debug, warn};

use crate::call_context::CallContext;
use crate::controller::Controller;
use crate::error::{ApiError, ApiResult};
use edgegrid_core::CrmOverride;

/// Repeated drops of the same report are raised to warn at this count.
const REPEAT_WARN_THRESHOLD: u32 = 3;

/// Whether the agent may move an object from `cur` to `next`.
pub fn transition_ok(cur: TrackedState, next: TrackedState) -> bool {
    use TrackedState::*;
    match cur {
        CreateRequested => matches!(next, Creating | Ready | CreateError),
        Creating => matches!(next, Ready | CreateError),
        UpdateRequested => matches!(next, Updating | Ready | UpdateError),
        Updating => matches!(next, Ready | UpdateError),
        DeleteRequested => matches!(next, Deleting | NotPresent | DeleteError),
        Deleting => matches!(next, NotPresent | DeleteError),
        _ => false,
    }
}

pub fn ignore_transient(cctx: &CallContext, state: TrackedState) -> bool {
    matches!(
        cctx.crm_override,
        CrmOverride::IgnoreTransientState | CrmOverride::IgnoreCrmAndTransientState
    ) && state.is_transient()
}

/// Whether the call bypasses the agent entirely.
pub fn ignore_crm(cctx: &CallContext) -> bool {
    cctx.undo
        || matches!(
            cctx.crm_override,
            CrmOverride::IgnoreCrm | CrmOverride::IgnoreCrmAndTransientState
        )
}

pub fn ignore_crm_errors(cctx: &CallContext) -> bool {
    cctx.crm_override == CrmOverride::IgnoreCrmErrors
}

/// Refuse a delete while an operation is in flight.
pub(crate) fn check_deletable(
    cctx: &CallContext,
    kind: &str,
    state: TrackedState,
) -> ApiResult<()> {
    use TrackedState::*;
    if cctx.undo
        || matches!(state, Ready | CreateError | UpdateError | DeletePrepare)
        || ignore_transient(cctx, state)
    {
        return Ok(());
    }
    Err(ApiError::Busy(format!("{kind} busy ({state}), cannot delete")))
}

/// The kind of agent operation being waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Update,
    Delete,
}

impl Op {
    fn wait_spec(self, kind: &str, timeout: Duration) -> WaitSpec<'static> {
        use TrackedState::*;
        let (target, transitional, error_state, verb): (_, &'static [TrackedState], _, _) =
            match self {
                Op::Create => (Ready, &[CreateRequested, Creating], CreateError, "Created"),
                Op::Update => (Ready, &[UpdateRequested, Updating], UpdateError, "Updated"),
                Op::Delete => (NotPresent, &[DeleteRequested, Deleting], DeleteError, "Deleted"),
            };
        WaitSpec {
            target,
            transitional,
            error_state,
            timeout,
            success_msg: format!("{verb} {kind} successfully"),
        }
    }
}

/// Wait for the agent to finish `op` on the object at `key`.
pub(crate) async fn await_agent<T: TrackedObject>(
    cache: &ObjectCache<T>,
    key: &T::Key,
    op: Op,
    timeout: Duration,
    progress: &dyn Progress,
) -> ApiResult<()> {
    let spec = op.wait_spec(T::TYPE_NAME, timeout);
    cache.wait_for_state(key, &spec, progress).await?;
    Ok(())
}

/// What an info report did to the tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoOutcome {
    /// No tracked object for the key.
    Missing,
    Unchanged,
    StatusOnly,
    Applied,
    Deleted,
    /// Dropped as an illegal transition from the given state.
    Ignored { from: TrackedState },
}

impl Controller {
    /// Apply an agent report to its tracked object.
    pub(crate) async fn tracked_update_from_info<T, I>(&self, info: &I) -> ApiResult<InfoOutcome>
    where
        T: TrackedObject,
        I: InfoObject<Key = T::Key>,
    {
        let key = info.key().clone();
        let next = InfoObject::state(info);
        let status = InfoObject::status(info).to_string();
        let errors = InfoObject::errors(info).to_vec();

        let mut outcome = InfoOutcome::Missing;
        self.sync()
            .apply_stm_wait(|stm| {
                outcome = InfoOutcome::Missing;
                let Some(mut cur) = stm.get::<T>(&key)? else {
                    return Ok::<_, ApiError>(());
                };
                let state = cur.state();
                if state == next {
                    if cur.status() != status {
                        cur.set_status(status.clone());
                        stm.put(&cur)?;
                        outcome = InfoOutcome::StatusOnly;
                    } else {
                        outcome = InfoOutcome::Unchanged;
                    }
                    return Ok(());
                }
                if !transition_ok(state, next) {
                    outcome = InfoOutcome::Ignored { from: state };
                    return Ok(());
                }
                if next == TrackedState::NotPresent {
                    stm.delete::<T>(&key);
                    outcome = InfoOutcome::Deleted;
                    return Ok(());
                }
                cur.set_state(next);
                cur.set_status(status.clone());
                cur.set_errors(if next.is_error() { errors.clone() } else { Vec::new() });
                stm.put(&cur)?;
                outcome = InfoOutcome::Applied;
                Ok(())
            })
            .await?;

        match outcome {
            InfoOutcome::Ignored { from } => self.note_ignored_transition::<T>(&key, from, next),
            InfoOutcome::Applied | InfoOutcome::Deleted => self.clear_ignored_transitions::<T>(&key),
            _ => {}
        }
        Ok(outcome)
    }

    /// Move an object out of an error state. Objects in any other state
    /// are left alone.
    pub(crate) async fn tracked_replace_error_state<T: TrackedObject>(
        &self,
        key: &T::Key,
        new_state: TrackedState,
    ) -> ApiResult<()> {
        self.sync()
            .apply_stm_wait(|stm| {
                let Some(mut cur) = stm.get::<T>(key)? else {
                    return Ok::<_, ApiError>(());
                };
                if !cur.state().is_error() {
                    return Ok(());
                }
                if new_state == TrackedState::NotPresent {
                    stm.delete::<T>(key);
                } else {
                    cur.set_state(new_state);
                    cur.set_errors(Vec::new());
                    stm.put(&cur)?;
                }
                Ok(())
            })
            .await?;
        if new_state == TrackedState::NotPresent {
            self.clear_ignored_transitions::<T>(key);
        }
        Ok(())
    }

    fn note_ignored_transition<T: TrackedObject>(
        &self,
        key: &T::Key,
        from: TrackedState,
        to: TrackedState,
    ) {
        let repeats = self.record_ignored(format!("{}/{}", T::TYPE_NAME, key.key_string()), to);
        if repeats >= REPEAT_WARN_THRESHOLD {
            warn!(kind = T::TYPE_NAME, %key, %from, %to, repeats, "agent keeps reporting an invalid transition");
        } else {
            debug!(kind = T::TYPE_NAME, %key, %from, %to, "ignoring invalid state transition");
        }
    }

    pub(crate) fn clear_ignored_transitions<T: TrackedObject>(&self, key: &T::Key) {
        self.forget_ignored(&format!("{}/{}", T::TYPE_NAME, key.key_string()));
    }
}
