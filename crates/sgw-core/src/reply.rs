//! One-shot replies.
//!
//! A [`RemoteReply`] is handed to the caller as soon as an operation is
//! dispatched and completes exactly once. Completion is observable through
//! [`RemoteReply::wait`], [`RemoteReply::on_complete`] callbacks, or a peek
//! with [`RemoteReply::completion`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use serde_json::Value;
use sgw_protocol::{FileMetaData, FileType, RequestState, TaskParams};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::classify::{classify_outcome, dig_for_str, dig_for_value, Classification};
use crate::guide::{
    Decode, TaskGuide, TaskKind, JOB_ID_KEY, JOB_STATUS_KEY, PARAM_PATH, PARAM_TARGET_PATH,
    RESULT_KEY,
};
use crate::long_task::LongRunningTask;
use crate::registry::TaskRegistry;
use crate::transport::TransportOutcome;

static NEXT_REPLY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ReplyPayload {
    None,
    CurrentDir(String),
    FileList(Vec<FileMetaData>),
    File(FileMetaData),
    Buffer(Vec<u8>),
    Job(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub kind: TaskKind,
    pub state: RequestState,
    pub payload: ReplyPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl Completion {
    fn bare(kind: TaskKind, state: RequestState, error_text: Option<String>) -> Self {
        Self {
            kind,
            state,
            payload: ReplyPayload::None,
            error_text,
        }
    }

    pub fn is_good(&self) -> bool {
        self.state.is_good()
    }

    pub fn file_list(&self) -> Option<&[FileMetaData]> {
        match &self.payload {
            ReplyPayload::FileList(list) => Some(list),
            _ => None,
        }
    }

    pub fn file(&self) -> Option<&FileMetaData> {
        match &self.payload {
            ReplyPayload::File(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn buffer(&self) -> Option<&[u8]> {
        match &self.payload {
            ReplyPayload::Buffer(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn job(&self) -> Option<&Value> {
        match &self.payload {
            ReplyPayload::Job(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn current_dir(&self) -> Option<&str> {
        match &self.payload {
            ReplyPayload::CurrentDir(dir) => Some(dir),
            _ => None,
        }
    }
}

type CompletionCallback = Box<dyn FnOnce(&Completion) + Send>;

struct ReplyInner {
    params: Option<TaskParams>,
    long_run: Option<Arc<LongRunningTask>>,
    long_run_claimed: bool,
    pass_thru: Option<Arc<RemoteReply>>,
    pending: Option<(RequestState, Option<String>)>,
    callbacks: Vec<CompletionCallback>,
    completed: Option<Completion>,
}

pub struct RemoteReply {
    id: u64,
    guide: &'static TaskGuide,
    registry: Weak<TaskRegistry>,
    inner: Mutex<ReplyInner>,
    done: watch::Sender<Option<Completion>>,
}

impl RemoteReply {
    pub(crate) fn new(
        kind: TaskKind,
        params: TaskParams,
        registry: Weak<TaskRegistry>,
        pass_thru: Option<Arc<RemoteReply>>,
    ) -> Arc<Self> {
        let (done, _rx) = watch::channel(None);
        Arc::new(Self {
            id: NEXT_REPLY_ID.fetch_add(1, Ordering::Relaxed),
            guide: kind.guide(),
            registry,
            inner: Mutex::new(ReplyInner {
                params: Some(params),
                long_run: None,
                long_run_claimed: false,
                pass_thru,
                pending: None,
                callbacks: Vec::new(),
                completed: None,
            }),
            done,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ReplyInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.guide.kind
    }

    pub fn task_guide(&self) -> &'static TaskGuide {
        self.guide
    }

    /// Parameters while this reply still owns them; `None` once they moved
    /// into a long-running task.
    pub fn task_params(&self) -> Option<TaskParams> {
        self.lock().params.clone()
    }

    pub(crate) fn param(&self, name: &str) -> Option<String> {
        self.lock()
            .params
            .as_ref()
            .and_then(|p| p.first(name))
            .map(str::to_string)
    }

    /// The task this operation spawned, if any. Claiming hands cleanup
    /// responsibility to the caller; it happens at most once and later calls
    /// (claiming or not) return the same handle.
    pub fn long_running_ref(&self, claim: bool) -> Option<Arc<LongRunningTask>> {
        let mut inner = self.lock();
        let task = inner.long_run.clone()?;
        if claim && !inner.long_run_claimed {
            inner.long_run_claimed = true;
            debug!(reply = self.id, task_id = task.id(), "long-running task claimed");
        }
        Some(task)
    }

    /// True while a task is attached and nobody has claimed it.
    pub fn owns_long_running_cleanup(&self) -> bool {
        let inner = self.lock();
        inner.long_run.is_some() && !inner.long_run_claimed
    }

    pub fn pass_thru_target(&self) -> Option<Arc<RemoteReply>> {
        self.lock().pass_thru.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.done.borrow().is_some()
    }

    pub fn completion(&self) -> Option<Completion> {
        self.done.borrow().clone()
    }

    /// Resolves with the single completion. Any number of waiters see the
    /// same value.
    pub async fn wait(&self) -> Completion {
        let mut rx = self.done.subscribe();
        loop {
            if let Some(done) = rx.borrow_and_update().as_ref() {
                return done.clone();
            }
            // `self` keeps the sender alive, so this only returns on a change.
            let _ = rx.changed().await;
        }
    }

    /// Registers a callback run once on completion; runs immediately when
    /// the reply already completed.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Completion) + Send + 'static,
    {
        let done = {
            let mut inner = self.lock();
            match &inner.completed {
                Some(done) => done.clone(),
                None => {
                    inner.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&done);
    }

    /// Publishes `completion` unless one was already delivered. The stored
    /// completion and the watch value are set under the lock that guards the
    /// callback queue.
    fn deliver(&self, completion: Completion) -> bool {
        let callbacks = {
            let mut inner = self.lock();
            if inner.completed.is_some() {
                warn!(
                    reply = self.id,
                    kind = self.guide.name,
                    "dropping second completion for reply"
                );
                return false;
            }
            inner.completed = Some(completion.clone());
            self.done.send_replace(Some(completion.clone()));
            std::mem::take(&mut inner.callbacks)
        };
        debug!(
            reply = self.id,
            kind = self.guide.name,
            state = %completion.state,
            "reply complete"
        );
        for callback in callbacks {
            callback(&completion);
        }
        true
    }

    pub(crate) fn process_failure_reply(&self, error_text: impl Into<String>) -> bool {
        self.deliver(Completion::bare(
            self.kind(),
            RequestState::Fail,
            Some(error_text.into()),
        ))
    }

    /// Parks a result to be delivered later by [`Self::invoke_pass_thru`].
    /// For a GOOD result `param` is payload (e.g. the new working
    /// directory); otherwise it is the error text.
    pub fn delayed_pass_thru(&self, state: RequestState, param: Option<String>) {
        let mut inner = self.lock();
        if inner.completed.is_some() {
            warn!(reply = self.id, "pass-through parked on a completed reply");
            return;
        }
        inner.pending = Some((state, param));
    }

    /// Releases the parked result. False when nothing was parked or the
    /// reply already completed.
    pub fn invoke_pass_thru(&self) -> bool {
        let Some((state, param)) = self.lock().pending.take() else {
            return false;
        };
        let completion = if state.is_good() {
            let payload = match (self.guide.decode, param) {
                (Decode::CurrentDir, Some(dir)) => ReplyPayload::CurrentDir(dir),
                _ => ReplyPayload::None,
            };
            Completion {
                kind: self.kind(),
                state,
                payload,
                error_text: None,
            }
        } else {
            Completion::bare(self.kind(), state, param)
        };
        self.deliver(completion)
    }

    /// Runs classification on a transport result. Ordinary replies deliver
    /// and return `None`; internal replies deliver to themselves as well and
    /// return the classification so the facade can continue the workflow.
    pub(crate) fn raw_task_complete(
        self: &Arc<Self>,
        outcome: TransportOutcome,
    ) -> Option<Classification> {
        if self.is_complete() {
            warn!(
                reply = self.id,
                kind = self.guide.name,
                "late transport result discarded"
            );
            return None;
        }
        let mut classified = classify_outcome(outcome, self.guide);
        let payload = if classified.is_good() {
            match self.decode(&classified) {
                Ok(payload) => payload,
                Err(reason) => {
                    debug!(reply = self.id, kind = self.guide.name, %reason, "decode failed");
                    classified.state = RequestState::Fail;
                    classified.error_text = Some(reason);
                    ReplyPayload::None
                }
            }
        } else {
            ReplyPayload::None
        };

        if classified.is_good() && self.guide.long_running {
            if let Err(reason) = self.attach_long_running(&classified) {
                classified.state = RequestState::Fail;
                classified.error_text = Some(reason);
            }
        }

        let completion = Completion {
            kind: self.kind(),
            state: classified.state,
            payload: if classified.is_good() {
                payload
            } else {
                ReplyPayload::None
            },
            error_text: classified.error_text.clone(),
        };
        self.deliver(completion);

        if self.guide.internal {
            Some(classified)
        } else {
            None
        }
    }

    fn decode(&self, classified: &Classification) -> Result<ReplyPayload, String> {
        let doc = classified.doc.as_ref();
        match self.guide.decode {
            Decode::Nothing => Ok(ReplyPayload::None),
            Decode::Buffer => Ok(ReplyPayload::Buffer(classified.body.clone())),
            Decode::Job => doc
                .cloned()
                .map(ReplyPayload::Job)
                .ok_or_else(|| "job response was not JSON".to_string()),
            Decode::CurrentDir => Ok(ReplyPayload::CurrentDir(
                self.param(PARAM_PATH).unwrap_or_else(|| "/".to_string()),
            )),
            Decode::FileList => {
                let entries = doc
                    .and_then(|d| dig_for_value(d, RESULT_KEY))
                    .and_then(Value::as_array)
                    .ok_or_else(|| "listing response carried no result array".to_string())?;
                let parent = self.param(PARAM_PATH).unwrap_or_else(|| "/".to_string());
                entries
                    .iter()
                    .map(|entry| FileMetaData::from_json(entry, &parent))
                    .collect::<Result<Vec<_>, _>>()
                    .map(ReplyPayload::FileList)
                    .map_err(|err| err.to_string())
            }
            Decode::File(default_type) => {
                let path = self
                    .param(PARAM_TARGET_PATH)
                    .or_else(|| self.param(PARAM_PATH))
                    .ok_or_else(|| "reply lost the path it was issued for".to_string())?;
                let result = doc.and_then(|d| dig_for_value(d, RESULT_KEY));
                let file_type = result
                    .and_then(|r| dig_for_str(r, &["type"]))
                    .and_then(FileType::from_slug)
                    .unwrap_or(default_type);
                let mut meta = FileMetaData::new(path, file_type);
                if let Some(result) = result {
                    meta.merge_result(result);
                }
                Ok(ReplyPayload::File(meta))
            }
        }
    }

    fn attach_long_running(&self, classified: &Classification) -> Result<(), String> {
        let doc = classified
            .doc
            .as_ref()
            .ok_or_else(|| "job response was not JSON".to_string())?;
        let job_id = dig_for_str(doc, JOB_ID_KEY)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| "job submission response carried no job id".to_string())?;
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| "task registry is gone".to_string())?;

        let params = self.lock().params.take();
        let (task, leftover, created) = registry.create_or_lookup(job_id, params);
        if let Some(params) = leftover {
            self.lock().params = Some(params);
        }
        if created {
            task.mark_accepted();
        }
        task.observe_remote(dig_for_str(doc, JOB_STATUS_KEY), doc.clone());
        self.lock().long_run = Some(task);
        Ok(())
    }
}

impl Drop for RemoteReply {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.long_run_claimed {
            return;
        }
        let Some(task) = inner.long_run.take() else {
            return;
        };
        // Local release only; the job record on the gateway is left alone.
        if task.discard_local_data() {
            debug!(reply = self.id, task_id = task.id(), "releasing unclaimed finished task");
            if let Some(registry) = self.registry.upgrade() {
                registry.release(task.id());
            }
        }
    }
}

impl std::fmt::Debug for RemoteReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteReply")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("complete", &self.is_complete())
            .finish()
    }
}
