//! Per-operation task guides.
//!
//! A guide says how to address the gateway for one kind of operation and how
//! to judge and decode its answer. Guides are plain statics; every reply
//! borrows the one for its kind.

use serde::{Deserialize, Serialize};
use sgw_protocol::FileType;

/// Key path of the status marker carried by every gateway envelope.
pub const STATUS_KEY: &[&str] = &["status"];
/// Key paths tried, in order, for human-readable error text.
pub const MESSAGE_KEYS: &[&[&str]] = &[&["message"], &["error_description"], &["fault", "message"]];
pub const RESULT_KEY: &[&str] = &["result"];
pub const JOB_ID_KEY: &[&str] = &["result", "id"];
pub const JOB_STATUS_KEY: &[&str] = &["result", "status"];
pub const CONSUMER_KEY_KEY: &[&str] = &["result", "consumerKey"];
pub const CONSUMER_SECRET_KEY: &[&str] = &["result", "consumerSecret"];
pub const ACCESS_TOKEN_KEY: &[&str] = &["access_token"];
pub const REFRESH_TOKEN_KEY: &[&str] = &["refresh_token"];

// Names under which a reply keeps what its request was about.
pub const PARAM_PATH: &str = "path";
pub const PARAM_TARGET_PATH: &str = "target_path";
pub const PARAM_LOCAL_PATH: &str = "local_path";
pub const PARAM_JOB_ID: &str = "job_id";
pub const PARAM_USERNAME: &str = "username";

pub const STATUS_SUCCESS: &[&str] = &["success"];
pub const STATUS_FAILURE: &[&str] = &["error", "fail", "failure"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    AuthClientCreate,
    AuthToken,
    Authenticate,
    RevokeToken,
    CloseConnections,
    DirectoryCheck,
    SetWorkingDirectory,
    ListDirectory,
    Delete,
    Move,
    Copy,
    Rename,
    MakeDirectory,
    UploadFile,
    UploadBuffer,
    DownloadFile,
    DownloadBuffer,
    RunJob,
    JobStatus,
    JobStop,
    JobDelete,
    JobDetails,
}

impl TaskKind {
    pub const ALL: [TaskKind; 22] = [
        TaskKind::AuthClientCreate,
        TaskKind::AuthToken,
        TaskKind::Authenticate,
        TaskKind::RevokeToken,
        TaskKind::CloseConnections,
        TaskKind::DirectoryCheck,
        TaskKind::SetWorkingDirectory,
        TaskKind::ListDirectory,
        TaskKind::Delete,
        TaskKind::Move,
        TaskKind::Copy,
        TaskKind::Rename,
        TaskKind::MakeDirectory,
        TaskKind::UploadFile,
        TaskKind::UploadBuffer,
        TaskKind::DownloadFile,
        TaskKind::DownloadBuffer,
        TaskKind::RunJob,
        TaskKind::JobStatus,
        TaskKind::JobStop,
        TaskKind::JobDelete,
        TaskKind::JobDetails,
    ];

    pub fn as_str(&self) -> &'static str {
        self.guide().name
    }

    pub fn guide(self) -> &'static TaskGuide {
        match self {
            TaskKind::AuthClientCreate => &AUTH_CLIENT_CREATE,
            TaskKind::AuthToken => &AUTH_TOKEN,
            TaskKind::Authenticate => &AUTHENTICATE,
            TaskKind::RevokeToken => &REVOKE_TOKEN,
            TaskKind::CloseConnections => &CLOSE_CONNECTIONS,
            TaskKind::DirectoryCheck => &DIRECTORY_CHECK,
            TaskKind::SetWorkingDirectory => &SET_WORKING_DIRECTORY,
            TaskKind::ListDirectory => &LIST_DIRECTORY,
            TaskKind::Delete => &DELETE,
            TaskKind::Move => &MOVE,
            TaskKind::Copy => &COPY,
            TaskKind::Rename => &RENAME,
            TaskKind::MakeDirectory => &MAKE_DIRECTORY,
            TaskKind::UploadFile => &UPLOAD_FILE,
            TaskKind::UploadBuffer => &UPLOAD_BUFFER,
            TaskKind::DownloadFile => &DOWNLOAD_FILE,
            TaskKind::DownloadBuffer => &DOWNLOAD_BUFFER,
            TaskKind::RunJob => &RUN_JOB,
            TaskKind::JobStatus => &JOB_STATUS,
            TaskKind::JobStop => &JOB_STOP,
            TaskKind::JobDelete => &JOB_DELETE,
            TaskKind::JobDetails => &JOB_DETAILS,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Where a request goes, before the storage system / remote path / job id
/// are filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Never sent; the reply is resolved through pass-through.
    Relay,
    Fixed(&'static [&'static str]),
    FileListing,
    FileMedia,
    Jobs,
    JobById,
}

impl Endpoint {
    pub const FILE_LISTING_PREFIX: &'static [&'static str] = &["files", "v2", "listings", "system"];
    pub const FILE_MEDIA_PREFIX: &'static [&'static str] = &["files", "v2", "media", "system"];
    pub const JOBS_PREFIX: &'static [&'static str] = &["jobs", "v2"];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    /// HTTP basic with the end user's credentials.
    UserBasic,
    /// HTTP basic with the registered client's key and secret.
    ClientBasic,
    Bearer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessCheck {
    /// Gateway envelope: `status` must read `success`.
    StatusMarker,
    /// OAuth-style documents: success iff the key path holds a non-null value.
    KeyPresent(&'static [&'static str]),
    /// Raw bodies (downloads, revocation): any 2xx.
    HttpStatus,
    /// Pass-through targets are never classified from the wire.
    Relayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decode {
    Nothing,
    CurrentDir,
    FileList,
    /// Entry synthesized from the request (`target_path`), typed from the
    /// result when it says, else from the default given here.
    File(FileType),
    Buffer,
    Job,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskGuide {
    pub kind: TaskKind,
    pub name: &'static str,
    pub method: HttpMethod,
    pub endpoint: Endpoint,
    pub auth: AuthMode,
    pub success: SuccessCheck,
    pub decode: Decode,
    /// Successful completion spawns or refreshes a long-running task.
    pub long_running: bool,
    /// Completion is routed back to the facade instead of to a caller.
    pub internal: bool,
}

const fn bearer(
    kind: TaskKind,
    name: &'static str,
    method: HttpMethod,
    endpoint: Endpoint,
    decode: Decode,
) -> TaskGuide {
    TaskGuide {
        kind,
        name,
        method,
        endpoint,
        auth: AuthMode::Bearer,
        success: SuccessCheck::StatusMarker,
        decode,
        long_running: false,
        internal: false,
    }
}

const fn relay(kind: TaskKind, name: &'static str, decode: Decode) -> TaskGuide {
    TaskGuide {
        kind,
        name,
        method: HttpMethod::Get,
        endpoint: Endpoint::Relay,
        auth: AuthMode::None,
        success: SuccessCheck::Relayed,
        decode,
        long_running: false,
        internal: false,
    }
}

const fn internal(guide: TaskGuide) -> TaskGuide {
    TaskGuide {
        internal: true,
        ..guide
    }
}

static AUTH_CLIENT_CREATE: TaskGuide = internal(TaskGuide {
    kind: TaskKind::AuthClientCreate,
    name: "auth.client.create",
    method: HttpMethod::Post,
    endpoint: Endpoint::Fixed(&["clients", "v2"]),
    auth: AuthMode::UserBasic,
    success: SuccessCheck::StatusMarker,
    decode: Decode::Nothing,
    long_running: false,
    internal: false,
});
static AUTH_TOKEN: TaskGuide = internal(TaskGuide {
    kind: TaskKind::AuthToken,
    name: "auth.token",
    method: HttpMethod::Post,
    endpoint: Endpoint::Fixed(&["token"]),
    auth: AuthMode::ClientBasic,
    success: SuccessCheck::KeyPresent(ACCESS_TOKEN_KEY),
    decode: Decode::Nothing,
    long_running: false,
    internal: false,
});
static AUTHENTICATE: TaskGuide = relay(TaskKind::Authenticate, "authenticate", Decode::Nothing);
static REVOKE_TOKEN: TaskGuide = internal(TaskGuide {
    kind: TaskKind::RevokeToken,
    name: "auth.revoke",
    method: HttpMethod::Post,
    endpoint: Endpoint::Fixed(&["revoke"]),
    auth: AuthMode::ClientBasic,
    success: SuccessCheck::HttpStatus,
    decode: Decode::Nothing,
    long_running: false,
    internal: false,
});
static CLOSE_CONNECTIONS: TaskGuide =
    relay(TaskKind::CloseConnections, "connections.close", Decode::Nothing);
static DIRECTORY_CHECK: TaskGuide = internal(bearer(
    TaskKind::DirectoryCheck,
    "files.cwd.check",
    HttpMethod::Get,
    Endpoint::FileListing,
    Decode::FileList,
));
static SET_WORKING_DIRECTORY: TaskGuide =
    relay(TaskKind::SetWorkingDirectory, "files.cwd", Decode::CurrentDir);
static LIST_DIRECTORY: TaskGuide = bearer(
    TaskKind::ListDirectory,
    "files.list",
    HttpMethod::Get,
    Endpoint::FileListing,
    Decode::FileList,
);
static DELETE: TaskGuide = bearer(
    TaskKind::Delete,
    "files.delete",
    HttpMethod::Delete,
    Endpoint::FileMedia,
    Decode::Nothing,
);
static MOVE: TaskGuide = bearer(
    TaskKind::Move,
    "files.move",
    HttpMethod::Put,
    Endpoint::FileMedia,
    Decode::File(FileType::File),
);
static COPY: TaskGuide = bearer(
    TaskKind::Copy,
    "files.copy",
    HttpMethod::Put,
    Endpoint::FileMedia,
    Decode::File(FileType::File),
);
static RENAME: TaskGuide = bearer(
    TaskKind::Rename,
    "files.rename",
    HttpMethod::Put,
    Endpoint::FileMedia,
    Decode::File(FileType::File),
);
static MAKE_DIRECTORY: TaskGuide = bearer(
    TaskKind::MakeDirectory,
    "files.mkdir",
    HttpMethod::Put,
    Endpoint::FileMedia,
    Decode::File(FileType::Dir),
);
static UPLOAD_FILE: TaskGuide = bearer(
    TaskKind::UploadFile,
    "files.upload",
    HttpMethod::Post,
    Endpoint::FileMedia,
    Decode::File(FileType::File),
);
static UPLOAD_BUFFER: TaskGuide = bearer(
    TaskKind::UploadBuffer,
    "files.upload.buffer",
    HttpMethod::Post,
    Endpoint::FileMedia,
    Decode::File(FileType::File),
);
static DOWNLOAD_FILE: TaskGuide = TaskGuide {
    success: SuccessCheck::HttpStatus,
    ..bearer(
        TaskKind::DownloadFile,
        "files.download",
        HttpMethod::Get,
        Endpoint::FileMedia,
        Decode::Nothing,
    )
};
static DOWNLOAD_BUFFER: TaskGuide = TaskGuide {
    success: SuccessCheck::HttpStatus,
    ..bearer(
        TaskKind::DownloadBuffer,
        "files.download.buffer",
        HttpMethod::Get,
        Endpoint::FileMedia,
        Decode::Buffer,
    )
};
static RUN_JOB: TaskGuide = TaskGuide {
    long_running: true,
    ..bearer(
        TaskKind::RunJob,
        "jobs.submit",
        HttpMethod::Post,
        Endpoint::Jobs,
        Decode::Job,
    )
};
static JOB_STATUS: TaskGuide = internal(bearer(
    TaskKind::JobStatus,
    "jobs.status",
    HttpMethod::Get,
    Endpoint::JobById,
    Decode::Job,
));
static JOB_STOP: TaskGuide = internal(bearer(
    TaskKind::JobStop,
    "jobs.stop",
    HttpMethod::Post,
    Endpoint::JobById,
    Decode::Job,
));
static JOB_DELETE: TaskGuide = internal(bearer(
    TaskKind::JobDelete,
    "jobs.delete",
    HttpMethod::Delete,
    Endpoint::JobById,
    Decode::Nothing,
));
static JOB_DETAILS: TaskGuide = bearer(
    TaskKind::JobDetails,
    "jobs.details",
    HttpMethod::Get,
    Endpoint::JobById,
    Decode::Job,
);
