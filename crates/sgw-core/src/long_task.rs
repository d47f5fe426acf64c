//! Long-running task handles.
//!
//! A task outlives the reply that created it. Its state only moves forward
//! (INIT, PENDING, RUNNING, then DONE or ERROR); cancellation forces ERROR
//! and a terminal task may be purged. Each transition is broadcast as a
//! [`StateChange`] both on the task's own channel and on the facade bus.

use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sgw_events::{topics, Bus};
use sgw_protocol::{LongRunningState, StateChange, TaskParams};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Facade hooks a task uses to reach the remote side. Kept as a seam so the
/// task never owns the registry it lives in.
pub trait TaskControl: Send + Sync {
    /// Ask the gateway to stop the job behind `task_id`.
    fn stop_remote_job(&self, task_id: &str);
    /// Drop `task_id` from the registry and discard its remote record.
    fn purge_task(&self, task_id: &str);
}

struct TaskInner {
    state: LongRunningState,
    remote_status: Option<String>,
    raw: Option<Value>,
    params: Option<TaskParams>,
    updated_at: DateTime<Utc>,
}

pub struct LongRunningTask {
    id: String,
    inner: Mutex<TaskInner>,
    events: broadcast::Sender<StateChange>,
    bus: Option<Bus>,
    control: Option<Weak<dyn TaskControl>>,
}

impl LongRunningTask {
    /// Detached task in INIT; nothing but its own channel observes it.
    pub fn new(id: impl Into<String>, params: Option<TaskParams>) -> Self {
        let (events, _rx) = broadcast::channel(32);
        Self {
            id: id.into(),
            inner: Mutex::new(TaskInner {
                state: LongRunningState::Init,
                remote_status: None,
                raw: None,
                params,
                updated_at: Utc::now(),
            }),
            events,
            bus: None,
            control: None,
        }
    }

    pub(crate) fn attached(
        id: impl Into<String>,
        params: Option<TaskParams>,
        bus: Bus,
        control: Weak<dyn TaskControl>,
    ) -> Self {
        let mut task = Self::new(id, params);
        task.bus = Some(bus);
        task.control = Some(control);
        task
    }

    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LongRunningState {
        self.lock().state
    }

    /// Last status string the gateway reported, verbatim.
    pub fn remote_status(&self) -> Option<String> {
        self.lock().remote_status.clone()
    }

    pub fn raw_data(&self) -> Option<Value> {
        self.lock().raw.clone()
    }

    pub fn raw_data_str(&self) -> Option<String> {
        self.lock().raw.as_ref().map(Value::to_string)
    }

    /// Parameters the job was submitted with; gone after a purge.
    pub fn task_params(&self) -> Option<TaskParams> {
        self.lock().params.clone()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.lock().updated_at
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Server acknowledged the job: INIT moves to PENDING.
    pub fn mark_accepted(&self) -> bool {
        self.advance(LongRunningState::Pending)
    }

    /// Applies one status observation from the gateway. Returns whether the
    /// state changed. Observations on a settled task are dropped, so a late
    /// answer cannot revive a cancelled or purged job.
    pub fn observe_remote(&self, remote_status: Option<&str>, raw: Value) -> bool {
        let next = {
            let mut inner = self.lock();
            if inner.state.is_settled() {
                debug!(
                    task_id = %self.id,
                    state = %inner.state,
                    "discarding status for settled task"
                );
                return false;
            }
            inner.raw = Some(raw);
            inner.updated_at = Utc::now();
            if let Some(status) = remote_status {
                inner.remote_status = Some(status.to_string());
            }
            remote_status.and_then(LongRunningState::from_remote_status)
        };
        let Some(state) = next else {
            return false;
        };
        // A job the gateway reports on has been accepted.
        let accepted = self.mark_accepted();
        self.advance(state) || accepted
    }

    fn advance(&self, next: LongRunningState) -> bool {
        let change = {
            let mut inner = self.lock();
            if !inner.state.can_advance_to(next) {
                return false;
            }
            Self::swap_state(&mut inner, next)
        };
        self.emit(change);
        true
    }

    /// Forces ERROR on a non-terminal task and asks the gateway to stop it.
    /// A no-op (no event) on DONE, ERROR or PURGING.
    pub fn cancel_task(&self) -> bool {
        let change = {
            let mut inner = self.lock();
            if inner.state.is_settled() {
                return false;
            }
            Self::swap_state(&mut inner, LongRunningState::Error)
        };
        info!(task_id = %self.id, from = %change.0, "cancelling long-running task");
        self.emit(change);
        if let Some(control) = self.control.as_ref().and_then(Weak::upgrade) {
            control.stop_remote_job(&self.id);
        }
        true
    }

    /// DONE/ERROR to PURGING: cached response and parameters are dropped, the
    /// id and state stay readable, and the facade removes the task from its
    /// registry and the job record from the gateway. Anything else is left
    /// alone.
    pub fn purge_task_data(&self) -> bool {
        if !self.discard_local_data() {
            return false;
        }
        if let Some(control) = self.control.as_ref().and_then(Weak::upgrade) {
            control.purge_task(&self.id);
        }
        true
    }

    /// Local half of a purge, with no remote side effect.
    pub(crate) fn discard_local_data(&self) -> bool {
        let change = {
            let mut inner = self.lock();
            if !inner.state.is_terminal() {
                return false;
            }
            inner.raw = None;
            inner.params = None;
            Self::swap_state(&mut inner, LongRunningState::Purging)
        };
        self.emit(change);
        true
    }

    fn swap_state(
        inner: &mut TaskInner,
        next: LongRunningState,
    ) -> (LongRunningState, LongRunningState) {
        let old = inner.state;
        inner.state = next;
        inner.updated_at = Utc::now();
        (old, next)
    }

    fn emit(&self, (old, new): (LongRunningState, LongRunningState)) {
        debug!(task_id = %self.id, %old, %new, "task state change");
        let change = StateChange {
            task_id: self.id.clone(),
            old,
            new,
        };
        if let Some(bus) = &self.bus {
            bus.publish(topics::TOPIC_TASK_STATE_CHANGED, &change);
        }
        let _ = self.events.send(change);
    }

    /// Snapshot for display.
    pub fn summary(&self) -> Value {
        let inner = self.lock();
        json!({
            "id": self.id,
            "state": inner.state,
            "remote_status": inner.remote_status,
            "updated_at": inner.updated_at.to_rfc3339(),
        })
    }
}

impl std::fmt::Debug for LongRunningTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongRunningTask")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
