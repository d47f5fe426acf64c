//! Helpers for tests in this crate and its dependents.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use crate::transport::{Transport, TransportOutcome, TransportRequest};

/// In-memory [`Transport`] answering from a queue of canned outcomes and
/// recording every request it sees. An empty queue answers NO_CONNECT.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Scripted>,
}

#[derive(Default)]
struct Scripted {
    outcomes: Mutex<VecDeque<TransportOutcome>>,
    seen: Mutex<Vec<TransportRequest>>,
    sent: Notify,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: TransportOutcome) -> &Self {
        lock(&self.inner.outcomes).push_back(outcome);
        self
    }

    pub fn push_json(&self, status: u16, body: Value) -> &Self {
        self.push(TransportOutcome::json(status, &body))
    }

    pub fn push_no_contact(&self, error: &str) -> &Self {
        self.push(TransportOutcome::NoContact {
            error: error.to_string(),
        })
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        lock(&self.inner.seen).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.inner.seen).len()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.inner.outcomes).len()
    }

    /// Waits until at least `count` requests were sent.
    pub async fn wait_for_requests(&self, count: usize) {
        loop {
            let notified = self.inner.sent.notified();
            if self.request_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> TransportOutcome {
        lock(&self.inner.seen).push(request);
        self.inner.sent.notify_waiters();
        lock(&self.inner.outcomes)
            .pop_front()
            .unwrap_or_else(|| TransportOutcome::NoContact {
                error: "scripted transport has no answer left".into(),
            })
    }
}

pub mod env {
    use once_cell::sync::Lazy;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    /// Serializes env-mutating tests and restores every touched key on drop.
    pub struct EnvGuard {
        _lock: MutexGuard<'static, ()>,
        saved: Vec<(&'static str, Option<String>)>,
    }

    pub fn guard() -> EnvGuard {
        EnvGuard {
            _lock: ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner),
            saved: Vec::new(),
        }
    }

    impl EnvGuard {
        fn remember(&mut self, key: &'static str) {
            if self.saved.iter().any(|(k, _)| *k == key) {
                return;
            }
            self.saved.push((key, std::env::var(key).ok()));
        }

        pub fn set(&mut self, key: &'static str, value: &str) {
            self.remember(key);
            std::env::set_var(key, value);
        }

        pub fn remove(&mut self, key: &'static str) {
            self.remember(key);
            std::env::remove_var(key);
        }

        pub fn clear_keys(&mut self, keys: &[&'static str]) {
            for &k in keys {
                self.remove(k);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, val) in self.saved.drain(..) {
                match val {
                    Some(v) => std::env::set_var(key, v),
                    None => std::env::remove_var(key),
                }
            }
        }
    }
}
