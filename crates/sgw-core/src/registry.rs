use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde_json::json;
use sgw_events::{topics, Bus};
use sgw_protocol::TaskParams;
use tracing::debug;

use crate::long_task::{LongRunningTask, TaskControl};

/// Long-running tasks keyed by gateway job id.
///
/// Readers get snapshots; only the facade (and replies it created) insert or
/// remove entries.
pub struct TaskRegistry {
    tasks: RwLock<BTreeMap<String, Arc<LongRunningTask>>>,
    bus: Bus,
    control: Weak<dyn TaskControl>,
}

impl TaskRegistry {
    pub(crate) fn new(bus: Bus, control: Weak<dyn TaskControl>) -> Self {
        Self {
            tasks: RwLock::new(BTreeMap::new()),
            bus,
            control,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<LongRunningTask>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<LongRunningTask>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Tasks a refresh can still move.
    pub fn active(&self) -> Vec<Arc<LongRunningTask>> {
        self.list()
            .into_iter()
            .filter(|t| !t.state().is_settled())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the task for `id`, creating it (INIT, owning `params`) when it
    /// is not tracked yet. The flag tells whether a new entry was made; when
    /// the task already existed `params` is handed back untouched.
    pub(crate) fn create_or_lookup(
        &self,
        id: &str,
        params: Option<TaskParams>,
    ) -> (Arc<LongRunningTask>, Option<TaskParams>, bool) {
        let created = {
            let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = tasks.get(id) {
                return (existing.clone(), params, false);
            }
            let task = Arc::new(LongRunningTask::attached(
                id,
                params,
                self.bus.clone(),
                self.control.clone(),
            ));
            tasks.insert(id.to_string(), task.clone());
            task
        };
        debug!(task_id = id, "tracking long-running task");
        self.announce("added", id);
        (created, None, true)
    }

    pub(crate) fn release(&self, id: &str) -> Option<Arc<LongRunningTask>> {
        let removed = self
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed.is_some() {
            debug!(task_id = id, "released long-running task");
            self.announce("removed", id);
        }
        removed
    }

    fn announce(&self, change: &str, id: &str) {
        self.bus.publish(
            topics::TOPIC_LONG_TASKS_UPDATED,
            &json!({"change": change, "task_id": id, "count": self.len()}),
        );
    }
}
