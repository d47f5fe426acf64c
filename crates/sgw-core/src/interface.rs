//! The remote data facade contract.

use std::sync::Arc;

use sgw_protocol::TaskParams;

use crate::long_task::LongRunningTask;
use crate::reply::RemoteReply;

/// Local pre-flight failures. Nothing was sent and no reply exists.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("local file unusable: {0}")]
    LocalFile(String),
    #[error("no async runtime available to drive the request")]
    NoRuntime,
}

pub type DispatchResult = Result<Arc<RemoteReply>, DispatchError>;

/// One method per remote operation. Each returns at once; an `Ok` reply
/// completes exactly once with GOOD, FAIL or NO_CONNECT.
pub trait RemoteDataInterface: Send + Sync {
    /// Completes with the resolved directory once the gateway confirms it.
    fn set_current_working_directory(&self, path: &str) -> DispatchResult;
    fn close_all_connections(&self) -> DispatchResult;
    fn authenticate(&self, username: &str, password: &str) -> DispatchResult;

    fn list_directory(&self, path: &str) -> DispatchResult;
    fn delete_entry(&self, path: &str) -> DispatchResult;
    fn move_entry(&self, from: &str, to: &str) -> DispatchResult;
    fn copy_entry(&self, from: &str, to: &str) -> DispatchResult;
    fn rename_entry(&self, path: &str, new_name: &str) -> DispatchResult;
    fn make_directory(&self, parent: &str, name: &str) -> DispatchResult;

    /// Uploads `local_path` into the remote directory `remote_dir`.
    fn upload_file(&self, remote_dir: &str, local_path: &str) -> DispatchResult;
    /// Stores `bytes` as the remote file `remote_path`.
    fn upload_buffer(&self, remote_path: &str, bytes: Vec<u8>) -> DispatchResult;
    fn download_file(&self, local_dest: &str, remote_path: &str) -> DispatchResult;
    fn download_buffer(&self, remote_path: &str) -> DispatchResult;

    /// Submits a job; a GOOD completion carries the raw job document and a
    /// long-running task reachable via [`RemoteReply::long_running_ref`].
    fn run_job(&self, name: &str, params: TaskParams, remote_working_dir: &str) -> DispatchResult;

    /// Re-polls every task that has not settled.
    fn force_refresh_of_long_tasks(&self);
    fn list_of_long_tasks(&self) -> Vec<Arc<LongRunningTask>>;
    fn long_task_by_ref(&self, id: &str) -> Option<Arc<LongRunningTask>>;
}
