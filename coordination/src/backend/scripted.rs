//! Deterministic scripted backend for tests and offline dry runs.
//!
//! Replies are consumed per role in call order. When a role's script runs
//! out, the role's default reply is used. Every request is recorded, and the
//! backend tracks how many calls per role were in flight at once so tests can
//! check admission behaviour from the server's point of view.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{BackendError, BackendRequest, BackendRole, ChunkStream, InferenceBackend, ERROR_MARKER};

/// One scripted reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    /// Plain reply text.
    Text(String),
    /// Reply text carrying the error marker.
    Marker(String),
    /// Transport-level failure.
    Unavailable(String),
    /// Reply after a delay.
    Delayed(Duration, String),
    /// Never answers; only a timeout ends the call.
    Hang,
    /// Streams the text, then the connection drops. Non-streaming calls
    /// fail outright.
    Truncated(String),
}

#[derive(Default)]
struct InFlight {
    current: usize,
    peak: usize,
}

/// Backend that replays per-role scripts.
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<BackendRole, VecDeque<ScriptedReply>>>,
    defaults: HashMap<BackendRole, String>,
    calls: Mutex<Vec<BackendRequest>>,
    in_flight: Mutex<HashMap<BackendRole, InFlight>>,
    latency: Option<Duration>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decrements the in-flight counter when the call ends or is dropped.
struct InFlightGuard<'a> {
    backend: &'a ScriptedBackend,
    role: BackendRole,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut map = lock(&self.backend.in_flight);
        if let Some(entry) = map.get_mut(&self.role) {
            entry.current = entry.current.saturating_sub(1);
        }
    }
}

impl ScriptedBackend {
    /// A backend whose every role answers with a sensible default.
    pub fn new() -> Self {
        let defaults = HashMap::from([
            (BackendRole::Preprocessor, "Clarified request.".to_string()),
            (BackendRole::Planner, "1. Implement the requested function.".to_string()),
            (BackendRole::Coder, "fn solution() {}".to_string()),
            (BackendRole::Voter, "VOTE: A".to_string()),
            (BackendRole::Reviewer, "APPROVED".to_string()),
            (BackendRole::Summarizer, "Summary of earlier turns.".to_string()),
        ]);
        Self {
            scripts: Mutex::new(HashMap::new()),
            defaults,
            calls: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            latency: None,
        }
    }

    /// Queue plain text replies for `role`.
    pub fn with_replies<I, S>(self, role: BackendRole, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let script = replies.into_iter().map(|r| ScriptedReply::Text(r.into())).collect();
        self.with_script(role, script)
    }

    /// Queue arbitrary scripted replies for `role`.
    pub fn with_script(self, role: BackendRole, script: Vec<ScriptedReply>) -> Self {
        lock(&self.scripts).entry(role).or_default().extend(script);
        self
    }

    /// Reply used once `role`'s script is exhausted.
    pub fn with_default(mut self, role: BackendRole, reply: impl Into<String>) -> Self {
        self.defaults.insert(role, reply.into());
        self
    }

    /// Add a fixed latency to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Every request received so far, in arrival order.
    pub fn calls(&self) -> Vec<BackendRequest> {
        lock(&self.calls).clone()
    }

    /// Requests received for one role.
    pub fn calls_for(&self, role: BackendRole) -> Vec<BackendRequest> {
        lock(&self.calls)
            .iter()
            .filter(|r| r.role == role)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, role: BackendRole) -> usize {
        lock(&self.calls).iter().filter(|r| r.role == role).count()
    }

    /// Highest number of simultaneous calls seen for `role`.
    pub fn peak_in_flight(&self, role: BackendRole) -> usize {
        lock(&self.in_flight).get(&role).map(|f| f.peak).unwrap_or(0)
    }

    fn next_reply(&self, role: BackendRole) -> ScriptedReply {
        if let Some(reply) = lock(&self.scripts).get_mut(&role).and_then(|q| q.pop_front()) {
            return reply;
        }
        match self.defaults.get(&role) {
            Some(text) => ScriptedReply::Text(text.clone()),
            None => ScriptedReply::Marker(format!("no script for role {role}")),
        }
    }

    fn enter(&self, role: BackendRole) -> InFlightGuard<'_> {
        let mut map = lock(&self.in_flight);
        let entry = map.entry(role).or_default();
        entry.current += 1;
        entry.peak = entry.peak.max(entry.current);
        InFlightGuard { backend: self, role }
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn connection_reset(role: BackendRole) -> BackendError {
    BackendError::Unavailable {
        role,
        detail: "connection reset mid-reply".into(),
    }
}

impl ScriptedBackend {
    /// Record the call and play its reply. `Truncated` text comes back with
    /// the flag set so each mode can fail in its own way.
    async fn play(&self, request: &BackendRequest) -> Result<(String, bool), BackendError> {
        lock(&self.calls).push(request.clone());
        let reply = self.next_reply(request.role);
        let _guard = self.enter(request.role);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match reply {
            ScriptedReply::Text(text) => Ok((text, false)),
            ScriptedReply::Marker(detail) => Ok((format!("{ERROR_MARKER} {detail}"), false)),
            ScriptedReply::Unavailable(detail) => Err(BackendError::Unavailable {
                role: request.role,
                detail,
            }),
            ScriptedReply::Delayed(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok((text, false))
            }
            ScriptedReply::Hang => futures::future::pending().await,
            ScriptedReply::Truncated(text) => Ok((text, true)),
        }
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn complete(&self, request: &BackendRequest) -> Result<String, BackendError> {
        match self.play(request).await? {
            (_, true) => Err(connection_reset(request.role)),
            (text, false) => Ok(text),
        }
    }

    async fn stream(&self, request: &BackendRequest) -> Result<ChunkStream, BackendError> {
        let (text, truncated) = self.play(request).await?;
        let mut chunks: Vec<Result<String, BackendError>> = text
            .split_inclusive(' ')
            .map(|c| Ok(c.to_string()))
            .collect();
        if truncated {
            chunks.push(Err(connection_reset(request.role)));
        }
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
