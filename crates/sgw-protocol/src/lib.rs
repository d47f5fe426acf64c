//! Shared data model for remote gateway operations.
//!
//! These types cross the boundary between the request machinery in
//! `sgw-core` and whatever consumes completions (CLI, UI, pollers), so they
//! stay plain data with serde derives.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod file_meta;
mod params;

pub use file_meta::{FileMetaData, FileType, MetaDataError};
pub use params::TaskParams;

/// Outcome class attached to every reply completion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// The remote service accepted and processed the request.
    Good,
    /// The service was reached but rejected the request, or answered with
    /// something we could not make sense of.
    Fail,
    /// The request never reached the service.
    NoConnect,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Good => "good",
            RequestState::Fail => "fail",
            RequestState::NoConnect => "no_connect",
        }
    }

    pub fn is_good(&self) -> bool {
        matches!(self, RequestState::Good)
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a tracked remote job.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum LongRunningState {
    #[default]
    Init,
    Pending,
    Running,
    Done,
    Error,
    Purging,
}

impl LongRunningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LongRunningState::Init => "init",
            LongRunningState::Pending => "pending",
            LongRunningState::Running => "running",
            LongRunningState::Done => "done",
            LongRunningState::Error => "error",
            LongRunningState::Purging => "purging",
        }
    }

    /// DONE or ERROR.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LongRunningState::Done | LongRunningState::Error)
    }

    /// True once the task can no longer be driven by remote observations or
    /// cancellation: terminal, or already being purged.
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || matches!(self, LongRunningState::Purging)
    }

    /// Maps a gateway job status string onto the local lifecycle. Unknown
    /// strings yield `None` so callers can keep the current state.
    pub fn from_remote_status(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_uppercase();
        let state = match normalized.as_str() {
            "PENDING" | "PROCESSING_INPUTS" | "STAGING_INPUTS" | "STAGED" | "STAGING_JOB"
            | "SUBMITTING" | "QUEUED" | "PAUSED" | "BLOCKED" => LongRunningState::Pending,
            "RUNNING" | "CLEANING_UP" | "ARCHIVING" => LongRunningState::Running,
            "FINISHED" => LongRunningState::Done,
            "FAILED" | "STOPPED" | "KILLED" | "ARCHIVING_FAILED" => LongRunningState::Error,
            _ => return None,
        };
        Some(state)
    }

    /// Ordering used to reject backwards moves reported by stale refreshes.
    pub(crate) fn progress_rank(&self) -> u8 {
        match self {
            LongRunningState::Init => 0,
            LongRunningState::Pending => 1,
            LongRunningState::Running => 2,
            LongRunningState::Done | LongRunningState::Error => 3,
            LongRunningState::Purging => 4,
        }
    }

    /// Whether an observation-driven move from `self` to `next` is allowed.
    /// INIT only leaves through acceptance (PENDING). Cancellation and purge
    /// have their own entry points and do not go through this check.
    pub fn can_advance_to(&self, next: LongRunningState) -> bool {
        if self.is_settled() || next == LongRunningState::Purging || next == LongRunningState::Init
        {
            return false;
        }
        if *self == LongRunningState::Init {
            return next == LongRunningState::Pending;
        }
        next.progress_rank() > self.progress_rank()
    }
}

impl std::fmt::Display for LongRunningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted on every long-running task transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct StateChange {
    pub task_id: String,
    pub old: LongRunningState,
    pub new: LongRunningState,
}
