//! Remote filesystem and job execution over a science-gateway REST API.
//!
//! Operations return a [`RemoteReply`] immediately; each reply completes
//! exactly once with GOOD, FAIL or NO_CONNECT. Job submissions hand out a
//! [`LongRunningTask`] that is tracked in the facade's [`TaskRegistry`].

pub mod classify;
pub mod config;
pub use config::{
    config_schema_json, load_config, parse_config, Config, GatewayConfig, TaskConfig,
};
pub mod gateway;
pub mod guide;
pub mod http;
pub mod interface;
pub mod long_task;
pub mod paths;
pub mod registry;
pub mod reply;
pub mod transport;

#[cfg(any(test, feature = "test_support"))]
pub mod test_support;

pub use classify::{classify, classify_outcome, dig_for_str, dig_for_value, Classification};
pub use gateway::GatewayClient;
pub use guide::{TaskGuide, TaskKind};
pub use http::HttpTransport;
pub use interface::{DispatchError, DispatchResult, RemoteDataInterface};
pub use long_task::{LongRunningTask, TaskControl};
pub use registry::TaskRegistry;
pub use reply::{Completion, RemoteReply, ReplyPayload};
pub use transport::{RequestAuth, RequestBody, Transport, TransportOutcome, TransportRequest};

pub use sgw_events::{topics, Bus, Envelope};
pub use sgw_protocol::{
    FileMetaData, FileType, LongRunningState, MetaDataError, RequestState, StateChange, TaskParams,
};
