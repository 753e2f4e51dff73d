//! Scripted transport for tests.
//!
//! Responses are registered per URL. One-shot responses queued with
//! [`ScriptedTransport::push`] are served first, in order; after that the
//! sticky response set with [`ScriptedTransport::set`] is served on every
//! call. A URL with nothing registered fails with `Error::Transport`.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use synccache_core::{CachedResponse, Error};

use super::{HttpTransport, OutgoingRequest};

type Outcome = Result<CachedResponse, Error>;

#[derive(Debug, Default)]
struct Script {
    queued: HashMap<String, VecDeque<Outcome>>,
    sticky: HashMap<String, CachedResponse>,
    log: Vec<OutgoingRequest>,
}

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Serve `response` for `url` whenever no one-shot outcome is queued.
    pub fn set(&self, url: &str, response: CachedResponse) {
        self.lock().sticky.insert(url.to_string(), response);
    }

    /// Shorthand for a sticky `200 OK` with a JSON body.
    pub fn set_json(&self, url: &str, body: &serde_json::Value) {
        self.set(url, CachedResponse::new(200, "OK", body.to_string()));
    }

    /// Queue a one-shot outcome for `url`.
    pub fn push(&self, url: &str, outcome: Outcome) {
        self.lock().queued.entry(url.to_string()).or_default().push_back(outcome);
    }

    /// Queue a one-shot transport failure for `url`.
    pub fn push_failure(&self, url: &str) {
        self.push(url, Err(Error::Transport(format!("connection refused: {url}"))));
    }

    /// Forget the sticky response and any queued outcomes for `url`.
    pub fn clear(&self, url: &str) {
        let mut script = self.lock();
        script.sticky.remove(url);
        script.queued.remove(url);
    }

    /// Every request sent so far, oldest first.
    pub fn requests(&self) -> Vec<OutgoingRequest> {
        self.lock().log.clone()
    }

    /// Number of requests sent to `url`.
    pub fn request_count(&self, url: &str) -> usize {
        self.lock().log.iter().filter(|r| r.url == url).count()
    }

    /// Number of requests sent overall.
    pub fn total_requests(&self) -> usize {
        self.lock().log.len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &OutgoingRequest) -> Result<CachedResponse, Error> {
        let mut script = self.lock();
        script.log.push(request.clone());

        if let Some(outcome) = script.queued.get_mut(&request.url).and_then(VecDeque::pop_front) {
            return outcome;
        }

        script
            .sticky
            .get(&request.url)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("no scripted response for {}", request.url)))
    }
}
