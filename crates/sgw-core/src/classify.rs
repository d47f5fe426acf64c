//! Response classification.
//!
//! Turns whatever the transport handed back into one of the three request
//! states. Nothing in here panics or returns an error: odd input is FAIL.

use serde_json::Value;
use sgw_protocol::RequestState;
use tracing::{debug, warn};

use crate::guide::{
    SuccessCheck, TaskGuide, MESSAGE_KEYS, STATUS_FAILURE, STATUS_KEY, STATUS_SUCCESS,
};
use crate::transport::TransportOutcome;

pub const GENERIC_FAILURE: &str = "remote service rejected the request";
pub const MALFORMED_RESPONSE: &str = "remote service returned a malformed response";

/// Walks `key_path` from `root`, one object lookup per key. Any step that is
/// not an object holding the next key ends the walk with `None`; an empty
/// path yields `root` itself. Iterative, so document depth never matters.
pub fn dig_for_value<'a, S: AsRef<str>>(root: &'a Value, key_path: &[S]) -> Option<&'a Value> {
    let mut current = root;
    for key in key_path {
        current = current.as_object()?.get(key.as_ref())?;
    }
    Some(current)
}

/// String at `key_path`; a value of any other type counts as absent.
pub fn dig_for_str<'a, S: AsRef<str>>(root: &'a Value, key_path: &[S]) -> Option<&'a str> {
    dig_for_value(root, key_path).and_then(Value::as_str)
}

/// Classifies a parsed document against a guide. `None` stands for a body
/// that was empty, `null`, or not JSON at all; the transport already got
/// through, so that is FAIL.
pub fn classify(doc: Option<&Value>, guide: &TaskGuide) -> RequestState {
    let Some(doc) = doc.filter(|d| !d.is_null()) else {
        return RequestState::Fail;
    };
    match guide.success {
        SuccessCheck::StatusMarker => match dig_for_str(doc, STATUS_KEY) {
            Some(marker) if STATUS_SUCCESS.contains(&marker) => RequestState::Good,
            Some(marker) if STATUS_FAILURE.contains(&marker) => RequestState::Fail,
            other => {
                warn!(
                    kind = guide.name,
                    marker = other.unwrap_or("<absent>"),
                    "unrecognized status marker"
                );
                RequestState::Fail
            }
        },
        SuccessCheck::KeyPresent(path) => match dig_for_value(doc, path) {
            Some(v) if !v.is_null() => RequestState::Good,
            _ => RequestState::Fail,
        },
        // These two never look at a document.
        SuccessCheck::HttpStatus | SuccessCheck::Relayed => RequestState::Fail,
    }
}

/// Error text a failed document carries, if any.
pub fn error_text(doc: &Value) -> Option<String> {
    MESSAGE_KEYS
        .iter()
        .filter_map(|path| dig_for_str(doc, path))
        .map(str::trim)
        .find(|msg| !msg.is_empty())
        .map(str::to_string)
}

/// Transport outcome after classification.
#[derive(Debug, Clone)]
pub struct Classification {
    pub state: RequestState,
    pub http_status: Option<u16>,
    pub doc: Option<Value>,
    pub body: Vec<u8>,
    pub error_text: Option<String>,
}

impl Classification {
    pub fn no_connect(error: impl Into<String>) -> Self {
        Self {
            state: RequestState::NoConnect,
            http_status: None,
            doc: None,
            body: Vec::new(),
            error_text: Some(error.into()),
        }
    }

    pub fn is_good(&self) -> bool {
        self.state.is_good()
    }
}

/// Full pipeline: transport failure first, then status/JSON per the guide.
pub fn classify_outcome(outcome: TransportOutcome, guide: &TaskGuide) -> Classification {
    let (status, body) = match outcome {
        TransportOutcome::NoContact { error } => {
            debug!(kind = guide.name, %error, "no contact with remote service");
            return Classification::no_connect(error);
        }
        TransportOutcome::Delivered { status, body } => (status, body),
    };

    let doc = serde_json::from_slice::<Value>(&body).ok();

    if guide.success == SuccessCheck::HttpStatus {
        let ok = (200..300).contains(&status);
        let error_text = if ok {
            None
        } else {
            Some(
                doc.as_ref()
                    .and_then(error_text)
                    .unwrap_or_else(|| format!("{GENERIC_FAILURE} (HTTP {status})")),
            )
        };
        return Classification {
            state: if ok {
                RequestState::Good
            } else {
                RequestState::Fail
            },
            http_status: Some(status),
            doc,
            body,
            error_text,
        };
    }

    let state = classify(doc.as_ref(), guide);
    let error_text = match (&state, &doc) {
        (RequestState::Good, _) => None,
        (_, Some(d)) => Some(error_text(d).unwrap_or_else(|| GENERIC_FAILURE.to_string())),
        (_, None) => Some(MALFORMED_RESPONSE.to_string()),
    };
    Classification {
        state,
        http_status: Some(status),
        doc,
        body,
        error_text,
    }
}
