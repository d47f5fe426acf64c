//! Canonical event topic constants.
//!
//! Keep this list alphabetized within sections and favor dot.case names.

// Facade
pub const TOPIC_FATAL_ERROR: &str = "remote.fatal.error";
pub const TOPIC_REPLY_COMPLETED: &str = "remote.reply.completed";

// Long-running tasks
pub const TOPIC_LONG_TASKS_UPDATED: &str = "remote.long_tasks.updated";
pub const TOPIC_TASK_STATE_CHANGED: &str = "remote.task.state.changed";
