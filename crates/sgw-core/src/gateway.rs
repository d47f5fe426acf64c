//! The concrete facade over an Agave-style gateway.
//!
//! Every operation builds a [`RemoteReply`], spawns the transport call on the
//! ambient tokio runtime and returns the reply at once. Multi-step workflows
//! (authentication, working-directory changes, closing) run through internal
//! replies whose results are passed through to the reply the caller holds.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::{json, Map, Value};
use sgw_events::{topics, Envelope, Bus};
use sgw_protocol::{RequestState, TaskParams};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classify::{dig_for_str, Classification, GENERIC_FAILURE};
use crate::config::Config;
use crate::guide::{
    AuthMode, Endpoint, TaskKind, ACCESS_TOKEN_KEY, CONSUMER_KEY_KEY, CONSUMER_SECRET_KEY,
    JOB_STATUS_KEY, PARAM_JOB_ID, PARAM_LOCAL_PATH, PARAM_PATH, PARAM_TARGET_PATH, PARAM_USERNAME,
    REFRESH_TOKEN_KEY,
};
use crate::interface::{DispatchError, DispatchResult, RemoteDataInterface};
use crate::long_task::{LongRunningTask, TaskControl};
use crate::paths;
use crate::registry::TaskRegistry;
use crate::reply::RemoteReply;
use crate::transport::{RequestAuth, RequestBody, Transport, TransportOutcome, TransportRequest};

const UPLOAD_FIELD: &str = "fileToUpload";

#[derive(Clone)]
struct Credentials {
    consumer_key: String,
    consumer_secret: String,
    access_token: String,
    refresh_token: Option<String>,
}

struct Session {
    cwd: String,
    credentials: Option<Credentials>,
}

/// Credentials a workflow step signs its request with and hands on to the
/// next step. Kept off the reply so they never show in its parameters.
enum StepSecrets {
    None,
    User {
        username: String,
        password: String,
    },
    Client {
        key: String,
        secret: String,
    },
}

/// An internal workflow step ready to be sent.
struct Step {
    reply: Arc<RemoteReply>,
    request: TransportRequest,
    carry: StepSecrets,
}

/// Local file work done around the transport call.
enum LocalIo {
    None,
    /// Read the file at send time and attach it as the multipart body.
    ReadUpload { path: PathBuf, file_name: String },
    /// Write a 2xx body to disk before the reply completes.
    WriteDownload(PathBuf),
}

struct Shared {
    config: Config,
    transport: Arc<dyn Transport>,
    registry: Arc<TaskRegistry>,
    bus: Bus,
    session: Mutex<Session>,
    me: Weak<Shared>,
}

/// Handle to one gateway session. Cloning shares the session.
#[derive(Clone)]
pub struct GatewayClient {
    shared: Arc<Shared>,
}

impl GatewayClient {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        let bus = Bus::default();
        let cwd = paths::normalize(&config.gateway.home_dir);
        let shared = Arc::new_cyclic(|me: &Weak<Shared>| {
            let control: Weak<dyn TaskControl> = me.clone();
            Shared {
                registry: Arc::new(TaskRegistry::new(bus.clone(), control)),
                config,
                transport,
                bus,
                session: Mutex::new(Session {
                    cwd,
                    credentials: None,
                }),
                me: me.clone(),
            }
        });
        Self { shared }
    }

    /// Builds the reqwest transport from `config.gateway`.
    pub fn connect(config: Config) -> anyhow::Result<Self> {
        let transport = crate::http::HttpTransport::from_config(&config.gateway)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.shared.registry
    }

    pub fn bus(&self) -> &Bus {
        &self.shared.bus
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Envelope> {
        self.shared.bus.subscribe()
    }

    pub fn current_working_directory(&self) -> String {
        self.shared.session().cwd.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.session().credentials.is_some()
    }

    /// Session state without secrets.
    pub fn session_snapshot(&self) -> Value {
        let session = self.shared.session();
        json!({
            "cwd": session.cwd,
            "authenticated": session.credentials.is_some(),
            "refreshable": session
                .credentials
                .as_ref()
                .is_some_and(|c| c.refresh_token.is_some()),
            "storage_system": self.shared.config.gateway.storage_system,
            "long_tasks": self.shared.registry.len(),
        })
    }

    /// Raw job document for any job id, tracked or not.
    pub fn job_details(&self, job_id: &str) -> DispatchResult {
        let job_id = job_id.trim();
        if job_id.is_empty() {
            return Err(DispatchError::InvalidArgument("empty job id".into()));
        }
        let reply = self
            .shared
            .new_reply(TaskKind::JobDetails, TaskParams::new().with(PARAM_JOB_ID, job_id), None);
        let request = self.shared.request(TaskKind::JobDetails, job_id)?;
        self.shared.dispatch(&reply, request, LocalIo::None)?;
        Ok(reply)
    }

    /// Re-polls unsettled tasks every `interval` (config default when
    /// `None`). The loop ends once every client handle is dropped.
    pub fn start_task_polling(
        &self,
        interval: Option<Duration>,
    ) -> Result<JoinHandle<()>, DispatchError> {
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        let period = interval.unwrap_or_else(|| self.shared.config.tasks.poll_interval());
        let weak = Arc::downgrade(&self.shared);
        info!(period_ms = period.as_millis() as u64, "starting task polling");
        Ok(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    debug!("client gone; task polling stops");
                    break;
                };
                shared.refresh_long_tasks();
            }
        }))
    }

    fn resolve(&self, path: &str) -> Result<String, DispatchError> {
        paths::resolve(&self.shared.session().cwd, path)
    }

    fn file_op(
        &self,
        kind: TaskKind,
        remote: &str,
        params: TaskParams,
        body: RequestBody,
        local: LocalIo,
    ) -> DispatchResult {
        let reply = self.shared.new_reply(kind, params, None);
        let request = self.shared.request(kind, remote)?.with_body(body);
        self.shared.dispatch(&reply, request, local)?;
        Ok(reply)
    }

    fn transfer(&self, action: &str, kind: TaskKind, from: &str, to: &str) -> DispatchResult {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        let params = TaskParams::new()
            .with(PARAM_PATH, from.as_str())
            .with(PARAM_TARGET_PATH, to.as_str());
        self.file_op(
            kind,
            &from,
            params,
            form([("action", action), ("path", to.as_str())]),
            LocalIo::None,
        )
    }
}

impl RemoteDataInterface for GatewayClient {
    fn set_current_working_directory(&self, path: &str) -> DispatchResult {
        let target = self.resolve(path)?;
        let reply = self.shared.new_reply(
            TaskKind::SetWorkingDirectory,
            TaskParams::new().with(PARAM_PATH, target.as_str()),
            None,
        );
        let check = self.shared.new_reply(
            TaskKind::DirectoryCheck,
            TaskParams::new().with(PARAM_PATH, target.as_str()),
            Some(reply.clone()),
        );
        let request = self.shared.request(TaskKind::DirectoryCheck, &target)?;
        self.shared.dispatch(&check, request, LocalIo::None)?;
        Ok(reply)
    }

    fn close_all_connections(&self) -> DispatchResult {
        let reply = self
            .shared
            .new_reply(TaskKind::CloseConnections, TaskParams::new(), None);
        let Some(creds) = self.shared.session().credentials.take() else {
            reply.delayed_pass_thru(RequestState::Good, None);
            reply.invoke_pass_thru();
            return Ok(reply);
        };
        info!("closing gateway session");
        let revoke = self
            .shared
            .new_reply(TaskKind::RevokeToken, TaskParams::new(), Some(reply.clone()));
        let client = StepSecrets::Client {
            key: creds.consumer_key,
            secret: creds.consumer_secret,
        };
        let request = self
            .shared
            .request_with(TaskKind::RevokeToken, "", &client)?
            .with_body(form([("token", creds.access_token.as_str())]));
        self.shared.dispatch(&revoke, request, LocalIo::None)?;
        Ok(reply)
    }

    fn authenticate(&self, username: &str, password: &str) -> DispatchResult {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "username and password are required".into(),
            ));
        }
        let reply = self
            .shared
            .new_reply(TaskKind::Authenticate, TaskParams::new(), None);
        let step = self
            .shared
            .registration_step(username, password, reply.clone())?;
        self.shared.send_step(step)?;
        Ok(reply)
    }

    fn list_directory(&self, path: &str) -> DispatchResult {
        let dir = self.resolve(path)?;
        self.file_op(
            TaskKind::ListDirectory,
            &dir,
            TaskParams::new().with(PARAM_PATH, dir.as_str()),
            RequestBody::Empty,
            LocalIo::None,
        )
    }

    fn delete_entry(&self, path: &str) -> DispatchResult {
        let target = self.resolve(path)?;
        if target == "/" {
            return Err(DispatchError::InvalidArgument(
                "refusing to delete the root directory".into(),
            ));
        }
        self.file_op(
            TaskKind::Delete,
            &target,
            TaskParams::new().with(PARAM_PATH, target.as_str()),
            RequestBody::Empty,
            LocalIo::None,
        )
    }

    fn move_entry(&self, from: &str, to: &str) -> DispatchResult {
        self.transfer("move", TaskKind::Move, from, to)
    }

    fn copy_entry(&self, from: &str, to: &str) -> DispatchResult {
        self.transfer("copy", TaskKind::Copy, from, to)
    }

    fn rename_entry(&self, path: &str, new_name: &str) -> DispatchResult {
        let source = self.resolve(path)?;
        let new_name = paths::check_name(new_name)?;
        let (parent, _) = paths::split_parent(&source).ok_or_else(|| {
            DispatchError::InvalidArgument("the root directory cannot be renamed".into())
        })?;
        let params = TaskParams::new()
            .with(PARAM_PATH, source.as_str())
            .with(PARAM_TARGET_PATH, paths::join(&parent, new_name));
        self.file_op(
            TaskKind::Rename,
            &source,
            params,
            form([("action", "rename"), ("path", new_name)]),
            LocalIo::None,
        )
    }

    fn make_directory(&self, parent: &str, name: &str) -> DispatchResult {
        let parent = self.resolve(parent)?;
        let name = paths::check_name(name)?;
        let params = TaskParams::new()
            .with(PARAM_PATH, parent.as_str())
            .with(PARAM_TARGET_PATH, paths::join(&parent, name));
        self.file_op(
            TaskKind::MakeDirectory,
            &parent,
            params,
            form([("action", "mkdir"), ("path", name)]),
            LocalIo::None,
        )
    }

    fn upload_file(&self, remote_dir: &str, local_path: &str) -> DispatchResult {
        let dir = self.resolve(remote_dir)?;
        let local = Path::new(local_path);
        if !local.is_file() {
            return Err(DispatchError::LocalFile(format!(
                "{local_path} is not a readable file"
            )));
        }
        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DispatchError::LocalFile(format!("{local_path} has no file name")))?;
        let params = TaskParams::new()
            .with(PARAM_PATH, dir.as_str())
            .with(PARAM_TARGET_PATH, paths::join(&dir, &file_name))
            .with(PARAM_LOCAL_PATH, local_path);
        self.file_op(
            TaskKind::UploadFile,
            &dir,
            params,
            RequestBody::Empty,
            LocalIo::ReadUpload {
                path: local.to_path_buf(),
                file_name,
            },
        )
    }

    fn upload_buffer(&self, remote_path: &str, bytes: Vec<u8>) -> DispatchResult {
        let target = self.resolve(remote_path)?;
        let (dir, name) = paths::split_parent(&target).ok_or_else(|| {
            DispatchError::InvalidArgument("upload target needs a file name".into())
        })?;
        let params = TaskParams::new()
            .with(PARAM_PATH, dir.as_str())
            .with(PARAM_TARGET_PATH, target.as_str());
        let body = RequestBody::Multipart {
            field: UPLOAD_FIELD.to_string(),
            file_name: name.to_string(),
            bytes,
        };
        self.file_op(TaskKind::UploadBuffer, &dir, params, body, LocalIo::None)
    }

    fn download_file(&self, local_dest: &str, remote_path: &str) -> DispatchResult {
        if local_dest.trim().is_empty() {
            return Err(DispatchError::LocalFile("empty local destination".into()));
        }
        let source = self.resolve(remote_path)?;
        let params = TaskParams::new()
            .with(PARAM_PATH, source.as_str())
            .with(PARAM_LOCAL_PATH, local_dest);
        self.file_op(
            TaskKind::DownloadFile,
            &source,
            params,
            RequestBody::Empty,
            LocalIo::WriteDownload(PathBuf::from(local_dest)),
        )
    }

    fn download_buffer(&self, remote_path: &str) -> DispatchResult {
        let source = self.resolve(remote_path)?;
        self.file_op(
            TaskKind::DownloadBuffer,
            &source,
            TaskParams::new().with(PARAM_PATH, source.as_str()),
            RequestBody::Empty,
            LocalIo::None,
        )
    }

    fn run_job(&self, name: &str, params: TaskParams, remote_working_dir: &str) -> DispatchResult {
        let app = name.trim();
        if app.is_empty() {
            return Err(DispatchError::InvalidArgument("empty job name".into()));
        }
        let dir = self.resolve(remote_working_dir)?;
        let body = self.shared.job_body(app, &params, &dir);
        let reply = self.shared.new_reply(TaskKind::RunJob, params, None);
        let request = self
            .shared
            .request(TaskKind::RunJob, "")?
            .with_body(RequestBody::Json(body));
        info!(app, workdir = %dir, "submitting job");
        self.shared.dispatch(&reply, request, LocalIo::None)?;
        Ok(reply)
    }

    fn force_refresh_of_long_tasks(&self) {
        self.shared.refresh_long_tasks();
    }

    fn list_of_long_tasks(&self) -> Vec<Arc<LongRunningTask>> {
        self.shared.registry.list()
    }

    fn long_task_by_ref(&self, id: &str) -> Option<Arc<LongRunningTask>> {
        self.shared.registry.get(id)
    }
}

fn form<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> RequestBody {
    RequestBody::Form(
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_reply(
        &self,
        kind: TaskKind,
        params: TaskParams,
        pass_thru: Option<Arc<RemoteReply>>,
    ) -> Arc<RemoteReply> {
        let reply = RemoteReply::new(kind, params, Arc::downgrade(&self.registry), pass_thru);
        if !kind.guide().internal {
            let bus = self.bus.clone();
            let id = reply.id();
            reply.on_complete(move |done| {
                bus.publish(
                    topics::TOPIC_REPLY_COMPLETED,
                    &json!({
                        "reply": id,
                        "kind": done.kind,
                        "state": done.state,
                        "error": done.error_text,
                    }),
                );
            });
        }
        reply
    }

    /// Request for `kind` signed as its guide says; `target` is the remote
    /// path or job id the endpoint needs. Bearer requests need a session.
    fn request(&self, kind: TaskKind, target: &str) -> Result<TransportRequest, DispatchError> {
        self.request_with(kind, target, &StepSecrets::None)
    }

    fn request_with(
        &self,
        kind: TaskKind,
        target: &str,
        secrets: &StepSecrets,
    ) -> Result<TransportRequest, DispatchError> {
        let guide = kind.guide();
        let auth = match (guide.auth, secrets) {
            (AuthMode::None, _) => RequestAuth::None,
            (AuthMode::UserBasic, StepSecrets::User { username, password }) => RequestAuth::Basic {
                user: username.clone(),
                password: password.clone(),
            },
            (AuthMode::ClientBasic, StepSecrets::Client { key, secret }) => RequestAuth::Basic {
                user: key.clone(),
                password: secret.clone(),
            },
            (AuthMode::Bearer, _) => RequestAuth::Bearer(
                self.session()
                    .credentials
                    .as_ref()
                    .map(|c| c.access_token.clone())
                    .ok_or(DispatchError::NotAuthenticated)?,
            ),
            (AuthMode::UserBasic | AuthMode::ClientBasic, _) => {
                return Err(DispatchError::NotAuthenticated)
            }
        };
        let system = self.config.gateway.storage_system.as_str();
        let owned = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let segments = match guide.endpoint {
            Endpoint::Relay => Vec::new(),
            Endpoint::Fixed(parts) => owned(parts),
            Endpoint::FileListing | Endpoint::FileMedia => {
                let prefix = if guide.endpoint == Endpoint::FileListing {
                    Endpoint::FILE_LISTING_PREFIX
                } else {
                    Endpoint::FILE_MEDIA_PREFIX
                };
                let mut segs = owned(prefix);
                segs.push(system.to_string());
                segs.extend(paths::components(target).map(str::to_string));
                segs
            }
            Endpoint::Jobs => owned(Endpoint::JOBS_PREFIX),
            Endpoint::JobById => {
                let mut segs = owned(Endpoint::JOBS_PREFIX);
                segs.push(target.to_string());
                segs
            }
        };
        Ok(TransportRequest::new(guide.method, segments).with_auth(auth))
    }

    /// Client registration, first step of sign-in.
    fn registration_step(
        &self,
        username: &str,
        password: &str,
        target: Arc<RemoteReply>,
    ) -> Result<Step, DispatchError> {
        let reply = self.new_reply(
            TaskKind::AuthClientCreate,
            TaskParams::new().with(PARAM_USERNAME, username),
            Some(target),
        );
        let carry = StepSecrets::User {
            username: username.to_string(),
            password: password.to_string(),
        };
        // Gateways refuse duplicate client names per user.
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let client_name = format!("{}-{}", self.config.gateway.client_name, &suffix[..8]);
        let request = self
            .request_with(TaskKind::AuthClientCreate, "", &carry)?
            .with_body(form([
                ("clientName", client_name.as_str()),
                ("tier", "UNLIMITED"),
                ("description", "science gateway remote data client"),
            ]));
        info!(user = username, client = %client_name, "registering gateway client");
        Ok(Step {
            reply,
            request,
            carry,
        })
    }

    /// Password grant signed with the freshly registered client.
    fn token_step(
        &self,
        username: &str,
        password: &str,
        client: StepSecrets,
        target: Option<Arc<RemoteReply>>,
    ) -> Result<Step, DispatchError> {
        let reply = self.new_reply(
            TaskKind::AuthToken,
            TaskParams::new().with(PARAM_USERNAME, username),
            target,
        );
        let request = self
            .request_with(TaskKind::AuthToken, "", &client)?
            .with_body(form([
                ("grant_type", "password"),
                ("username", username),
                ("password", password),
                ("scope", self.config.gateway.token_scope.as_str()),
            ]));
        Ok(Step {
            reply,
            request,
            carry: client,
        })
    }

    fn send_step(&self, step: Step) -> Result<(), DispatchError> {
        self.dispatch_with(&step.reply, step.request, LocalIo::None, step.carry)
    }

    fn job_body(&self, app: &str, params: &TaskParams, dir: &str) -> Value {
        let mut parameters = Map::new();
        for (key, values) in params.iter() {
            let value = match values {
                [single] => Value::String(single.clone()),
                many => Value::Array(many.iter().cloned().map(Value::String).collect()),
            };
            parameters.insert(key.to_string(), value);
        }
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let mut inputs = Map::new();
        inputs.insert(
            self.config.tasks.job_input_name.clone(),
            Value::String(format!("agave://{}{}", self.config.gateway.storage_system, dir)),
        );
        json!({
            "name": format!("{app}-{stamp}"),
            "appId": app,
            "archive": self.config.tasks.archive,
            "parameters": parameters,
            "inputs": inputs,
        })
    }

    /// Spawns the transport call for `reply` on the ambient runtime.
    fn dispatch(
        &self,
        reply: &Arc<RemoteReply>,
        request: TransportRequest,
        local: LocalIo,
    ) -> Result<(), DispatchError> {
        self.dispatch_with(reply, request, local, StepSecrets::None)
    }

    /// Like [`Self::dispatch`]; `carry` goes to the workflow continuation.
    fn dispatch_with(
        &self,
        reply: &Arc<RemoteReply>,
        mut request: TransportRequest,
        local: LocalIo,
        carry: StepSecrets,
    ) -> Result<(), DispatchError> {
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        let shared = self.me.upgrade().ok_or(DispatchError::NoRuntime)?;
        let reply = reply.clone();
        debug!(
            reply = reply.id(),
            kind = reply.task_guide().name,
            method = request.method.as_str(),
            path = %request.path(),
            "dispatching"
        );
        runtime.spawn(async move {
            let download_to = match local {
                LocalIo::None => None,
                LocalIo::WriteDownload(path) => Some(path),
                LocalIo::ReadUpload { path, file_name } => {
                    match tokio::fs::read(&path).await {
                        Ok(bytes) => {
                            request.body = RequestBody::Multipart {
                                field: UPLOAD_FIELD.to_string(),
                                file_name,
                                bytes,
                            };
                        }
                        Err(err) => {
                            reply.process_failure_reply(format!(
                                "reading {}: {err}",
                                path.display()
                            ));
                            return;
                        }
                    }
                    None
                }
            };

            let outcome = shared.transport.send(request).await;

            let outcome = match (download_to, outcome) {
                (Some(path), TransportOutcome::Delivered { status, body })
                    if (200..300).contains(&status) =>
                {
                    if let Err(err) = tokio::fs::write(&path, &body).await {
                        reply.process_failure_reply(format!("writing {}: {err}", path.display()));
                        return;
                    }
                    TransportOutcome::Delivered { status, body }
                }
                (_, outcome) => outcome,
            };

            if let Some(classified) = reply.raw_task_complete(outcome) {
                shared.handle_internal_reply(&reply, classified, carry);
            }
        });
        Ok(())
    }

    fn fatal(&self, message: &str) {
        error!(message, "fatal facade error");
        self.bus
            .publish(topics::TOPIC_FATAL_ERROR, &json!({ "message": message }));
    }

    fn pass_through(target: &RemoteReply, state: RequestState, param: Option<String>) {
        target.delayed_pass_thru(state, param);
        target.invoke_pass_thru();
    }

    fn failure_text(classified: &Classification) -> Option<String> {
        Some(
            classified
                .error_text
                .clone()
                .unwrap_or_else(|| GENERIC_FAILURE.to_string()),
        )
    }

    /// Continues a workflow after one of its internal steps completed.
    fn handle_internal_reply(
        &self,
        reply: &Arc<RemoteReply>,
        classified: Classification,
        carry: StepSecrets,
    ) {
        let kind = reply.kind();
        match kind {
            TaskKind::JobStatus => self.apply_job_status(reply, &classified),
            TaskKind::JobStop | TaskKind::JobDelete => {
                let job_id = reply.param(PARAM_JOB_ID).unwrap_or_default();
                if classified.is_good() {
                    debug!(job_id = %job_id, kind = %kind, "job action acknowledged");
                } else {
                    warn!(
                        job_id = %job_id,
                        kind = %kind,
                        error = classified.error_text.as_deref().unwrap_or(GENERIC_FAILURE),
                        "job action rejected"
                    );
                }
            }
            TaskKind::AuthClientCreate
            | TaskKind::AuthToken
            | TaskKind::DirectoryCheck
            | TaskKind::RevokeToken => {
                let Some(target) = reply.pass_thru_target() else {
                    self.fatal(&format!("{kind} step finished without a reply to resolve"));
                    return;
                };
                match kind {
                    TaskKind::AuthClientCreate => {
                        self.after_client_create(reply, &target, &classified, carry)
                    }
                    TaskKind::AuthToken => self.after_token(reply, &target, &classified, carry),
                    TaskKind::DirectoryCheck => self.after_directory_check(reply, &target, &classified),
                    _ => {
                        let error = (!classified.is_good())
                            .then(|| Self::failure_text(&classified))
                            .flatten();
                        if let Some(error) = error.as_deref() {
                            warn!(error, "token revocation failed; local credentials already cleared");
                        }
                        Self::pass_through(&target, classified.state, error);
                    }
                }
            }
            other => self.fatal(&format!("no workflow continues after {other}")),
        }
    }

    fn after_client_create(
        &self,
        reply: &RemoteReply,
        target: &RemoteReply,
        classified: &Classification,
        carry: StepSecrets,
    ) {
        if !classified.is_good() {
            Self::pass_through(target, classified.state, Self::failure_text(classified));
            return;
        }
        let doc = classified.doc.as_ref();
        let key = doc.and_then(|d| dig_for_str(d, CONSUMER_KEY_KEY));
        let secret = doc.and_then(|d| dig_for_str(d, CONSUMER_SECRET_KEY));
        let (Some(key), Some(secret)) = (key, secret) else {
            Self::pass_through(
                target,
                RequestState::Fail,
                Some("client registration returned no consumer key".into()),
            );
            return;
        };
        let StepSecrets::User { username, password } = carry else {
            self.fatal("client registration lost the user credentials");
            Self::pass_through(target, RequestState::Fail, Some(GENERIC_FAILURE.into()));
            return;
        };
        debug!(user = %username, "client registered; requesting token");
        let client = StepSecrets::Client {
            key: key.to_string(),
            secret: secret.to_string(),
        };
        let sent = self
            .token_step(&username, &password, client, reply.pass_thru_target())
            .and_then(|step| self.send_step(step));
        if let Err(err) = sent {
            Self::pass_through(target, RequestState::Fail, Some(err.to_string()));
        }
    }

    fn after_token(
        &self,
        reply: &RemoteReply,
        target: &RemoteReply,
        classified: &Classification,
        carry: StepSecrets,
    ) {
        if !classified.is_good() {
            Self::pass_through(target, classified.state, Self::failure_text(classified));
            return;
        }
        let doc = classified.doc.as_ref();
        let access = doc.and_then(|d| dig_for_str(d, ACCESS_TOKEN_KEY));
        let (Some(access), StepSecrets::Client { key, secret }) = (access, carry) else {
            Self::pass_through(
                target,
                RequestState::Fail,
                Some("token response carried no access token".into()),
            );
            return;
        };
        self.session().credentials = Some(Credentials {
            consumer_key: key,
            consumer_secret: secret,
            access_token: access.to_string(),
            refresh_token: doc
                .and_then(|d| dig_for_str(d, REFRESH_TOKEN_KEY))
                .map(str::to_string),
        });
        let user = reply.param(PARAM_USERNAME).unwrap_or_default();
        info!(user = %user, "authenticated");
        Self::pass_through(target, RequestState::Good, None);
    }

    fn after_directory_check(
        &self,
        reply: &RemoteReply,
        target: &RemoteReply,
        classified: &Classification,
    ) {
        if !classified.is_good() {
            Self::pass_through(target, classified.state, Self::failure_text(classified));
            return;
        }
        let Some(dir) = reply.param(PARAM_PATH) else {
            self.fatal("directory check lost its path");
            Self::pass_through(target, RequestState::Fail, Some(GENERIC_FAILURE.into()));
            return;
        };
        // Listing a plain file answers with that file alone.
        let is_file = reply
            .completion()
            .and_then(|done| done.file_list().map(|list| list.to_vec()))
            .is_some_and(|list| {
                list.iter()
                    .any(|entry| paths::normalize(&entry.path) == dir && !entry.is_dir())
            });
        if is_file {
            Self::pass_through(
                target,
                RequestState::Fail,
                Some(format!("{dir} is not a directory")),
            );
            return;
        }
        self.session().cwd = dir.clone();
        info!(cwd = %dir, "working directory changed");
        Self::pass_through(target, RequestState::Good, Some(dir));
    }

    fn apply_job_status(&self, reply: &RemoteReply, classified: &Classification) {
        let Some(job_id) = reply.param(PARAM_JOB_ID) else {
            self.fatal("status poll lost its job id");
            return;
        };
        let Some(task) = self.registry.get(&job_id) else {
            debug!(job_id = %job_id, "status for untracked job dropped");
            return;
        };
        match (&classified.state, classified.doc.as_ref()) {
            (RequestState::Good, Some(doc)) => {
                task.observe_remote(dig_for_str(doc, JOB_STATUS_KEY), doc.clone());
            }
            (state, _) => debug!(
                job_id = %job_id,
                %state,
                error = classified.error_text.as_deref().unwrap_or_default(),
                "status poll failed; task left as is"
            ),
        }
    }

    fn refresh_long_tasks(&self) {
        for task in self.registry.active() {
            let job_id = task.id().to_string();
            if let Err(err) = self.job_action(TaskKind::JobStatus, &job_id, RequestBody::Empty) {
                warn!(job_id = %job_id, error = %err, "cannot refresh long-running tasks");
                return;
            }
        }
    }

    fn job_action(&self, kind: TaskKind, job_id: &str, body: RequestBody) -> Result<(), DispatchError> {
        let reply = self.new_reply(kind, TaskParams::new().with(PARAM_JOB_ID, job_id), None);
        let request = self.request(kind, job_id)?.with_body(body);
        self.dispatch(&reply, request, LocalIo::None)
    }
}

impl TaskControl for Shared {
    fn stop_remote_job(&self, task_id: &str) {
        if let Err(err) = self.job_action(TaskKind::JobStop, task_id, form([("action", "stop")])) {
            warn!(task_id, error = %err, "cannot ask gateway to stop job");
        }
    }

    fn purge_task(&self, task_id: &str) {
        self.registry.release(task_id);
        if let Err(err) = self.job_action(TaskKind::JobDelete, task_id, RequestBody::Empty) {
            debug!(task_id, error = %err, "job record not deleted remotely");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedTransport;

    fn client() -> GatewayClient {
        let mut config = Config::default();
        config.gateway.storage_system = "data".into();
        GatewayClient::new(config, Arc::new(ScriptedTransport::new()))
    }

    fn target(client: &GatewayClient) -> Arc<RemoteReply> {
        client
            .shared
            .new_reply(TaskKind::Authenticate, TaskParams::new(), None)
    }

    #[test]
    fn registration_signs_with_user_credentials_without_keeping_them() {
        let client = client();
        let step = client
            .shared
            .registration_step("alice", "s3cret", target(&client))
            .unwrap();
        assert_eq!(
            step.request.auth,
            RequestAuth::Basic {
                user: "alice".into(),
                password: "s3cret".into()
            }
        );
        let params = step.reply.task_params().unwrap();
        assert_eq!(params.first(PARAM_USERNAME), Some("alice"));
        assert!(!format!("{params:?}").contains("s3cret"));
        assert!(matches!(step.carry, StepSecrets::User { ref password, .. } if password == "s3cret"));
    }

    #[test]
    fn token_step_signs_with_client_secret_without_keeping_it() {
        let client = client();
        let secrets = StepSecrets::Client {
            key: "ck".into(),
            secret: "cs-hidden".into(),
        };
        let step = client
            .shared
            .token_step("alice", "pw-hidden", secrets, Some(target(&client)))
            .unwrap();
        assert_eq!(
            step.request.auth,
            RequestAuth::Basic {
                user: "ck".into(),
                password: "cs-hidden".into()
            }
        );
        assert_eq!(step.request.form_value("password"), Some("pw-hidden"));
        let params = format!("{:?}", step.reply.task_params());
        assert!(!params.contains("cs-hidden"));
        assert!(!params.contains("pw-hidden"));
    }

    #[test]
    fn auth_follows_the_guide() {
        let client = client();
        assert_eq!(
            client.shared.request(TaskKind::ListDirectory, "/").unwrap_err(),
            DispatchError::NotAuthenticated
        );
        assert_eq!(
            client.shared.request(TaskKind::RevokeToken, "").unwrap_err(),
            DispatchError::NotAuthenticated
        );
        let relay = client.shared.request(TaskKind::Authenticate, "").unwrap();
        assert_eq!(relay.auth, RequestAuth::None);

        client.shared.session().credentials = Some(Credentials {
            consumer_key: "ck".into(),
            consumer_secret: "cs".into(),
            access_token: "tok".into(),
            refresh_token: None,
        });
        let listing = client.shared.request(TaskKind::ListDirectory, "/a b").unwrap();
        assert_eq!(listing.auth, RequestAuth::Bearer("tok".into()));
        assert_eq!(listing.segments, ["files", "v2", "listings", "system", "data", "a b"]);
    }
}
