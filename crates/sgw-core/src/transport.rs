use std::fmt;

use serde_json::Value;

use crate::guide::HttpMethod;

#[derive(Clone, PartialEq, Eq)]
pub enum RequestAuth {
    None,
    Basic { user: String, password: String },
    Bearer(String),
}

impl fmt::Debug for RequestAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestAuth::None => f.write_str("None"),
            RequestAuth::Basic { user, .. } => write!(f, "Basic({user}, <redacted>)"),
            RequestAuth::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

#[derive(Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Form(Vec<(String, String)>),
    Json(Value),
    Multipart {
        field: String,
        file_name: String,
        bytes: Vec<u8>,
    },
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Form(pairs) => {
                let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
                f.debug_tuple("Form").field(&keys).finish()
            }
            RequestBody::Json(value) => f.debug_tuple("Json").field(value).finish(),
            RequestBody::Multipart {
                field,
                file_name,
                bytes,
            } => f
                .debug_struct("Multipart")
                .field("field", field)
                .field("file_name", file_name)
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

/// One call against the gateway. `segments` are unescaped path components
/// relative to the transport's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: HttpMethod,
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
    pub auth: RequestAuth,
    pub body: RequestBody,
}

impl TransportRequest {
    pub fn new(method: HttpMethod, segments: Vec<String>) -> Self {
        Self {
            method,
            segments,
            query: Vec::new(),
            auth: RequestAuth::None,
            body: RequestBody::Empty,
        }
    }

    pub fn with_auth(mut self, auth: RequestAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        match &self.body {
            RequestBody::Form(pairs) => pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

/// What the transport hands back. Transport failures are values so they can
/// be classified like any other answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    Delivered { status: u16, body: Vec<u8> },
    NoContact { error: String },
}

impl TransportOutcome {
    pub fn json(status: u16, value: &Value) -> Self {
        TransportOutcome::Delivered {
            status,
            body: value.to_string().into_bytes(),
        }
    }

    pub fn is_success_status(&self) -> bool {
        matches!(self, TransportOutcome::Delivered { status, .. } if (200..300).contains(status))
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> TransportOutcome;
}
