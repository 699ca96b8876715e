//! Backend inference interface.
//!
//! A backend turns a [`BackendRequest`] into reply text (or a stream of text
//! chunks). All calls go through [`BackendCaller`], which queues on the
//! per-role admission gate and enforces the call timeout.
//!
//! # Error marker
//!
//! Inference servers and proxies sometimes answer with a 200 and an error
//! string in the body. A reply starting with [`ERROR_MARKER`] is treated as a
//! failed call, so every failure reaches callers as a [`BackendError`]
//! regardless of how the transport reported it.

pub mod caller;
pub mod http;
pub mod role;
pub mod scripted;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use caller::BackendCaller;
pub use http::HttpBackend;
pub use role::{BackendRole, RoleEndpoint, RoleTable};
pub use scripted::{ScriptedBackend, ScriptedReply};

/// Prefix marking a reply text as a failed backend call.
pub const ERROR_MARKER: &str = "[BACKEND_ERROR]";

/// One request/response exchange with a backend role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRequest {
    pub role: BackendRole,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

impl BackendRequest {
    pub fn new(role: BackendRole, system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            role,
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            temperature: 0.3,
            max_tokens: 2048,
            stream: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Failure of a single backend call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// Connection refused, DNS failure, or the server went away.
    #[error("backend {role} unavailable: {detail}")]
    Unavailable { role: BackendRole, detail: String },

    /// The call exceeded its deadline.
    #[error("backend {role} timed out after {secs}s")]
    Timeout { role: BackendRole, secs: u64 },

    /// Malformed response, non-success status, or an error-marker reply.
    #[error("backend {role} error: {detail}")]
    Malformed { role: BackendRole, detail: String },

    /// The admission gate was closed or the queue wait timed out.
    #[error("backend {role} admission refused: {detail}")]
    Admission { role: BackendRole, detail: String },
}

impl BackendError {
    pub fn role(&self) -> BackendRole {
        match self {
            Self::Unavailable { role, .. }
            | Self::Timeout { role, .. }
            | Self::Malformed { role, .. }
            | Self::Admission { role, .. } => *role,
        }
    }

    /// Connect/timeout failures; the server may recover on its own.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }

    /// Render as a marker string, the inverse of [`BackendError::from_marker`].
    pub fn to_marker_string(&self) -> String {
        format!("{ERROR_MARKER} {self}")
    }

    /// Detect an error-marker reply. Returns `None` for ordinary text.
    pub fn from_marker(role: BackendRole, text: &str) -> Option<Self> {
        let rest = text.trim_start().strip_prefix(ERROR_MARKER)?;
        Some(Self::Malformed {
            role,
            detail: rest.trim().to_string(),
        })
    }
}

/// Stream of reply chunks from a streaming call.
pub type ChunkStream = BoxStream<'static, Result<String, BackendError>>;

/// A text-generation service reachable for every [`BackendRole`].
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Run one non-streaming exchange and return the full reply text.
    async fn complete(&self, request: &BackendRequest) -> Result<String, BackendError>;

    /// Run one streaming exchange; chunks concatenate to the full reply.
    ///
    /// The default implementation yields the non-streamed reply as one chunk.
    async fn stream(&self, request: &BackendRequest) -> Result<ChunkStream, BackendError> {
        let text = self.complete(request).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(text) })))
    }

    /// Backend name for logging.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_round_trip() {
        let err = BackendError::Malformed {
            role: BackendRole::Coder,
            detail: "slot busy".into(),
        };
        let text = err.to_marker_string();
        assert!(text.starts_with(ERROR_MARKER));

        let parsed = BackendError::from_marker(BackendRole::Coder, &text).unwrap();
        assert_eq!(parsed.role(), BackendRole::Coder);
        assert!(parsed.to_string().contains("slot busy"));
    }

    #[test]
    fn test_plain_text_is_not_marker() {
        assert!(BackendError::from_marker(BackendRole::Voter, "VOTE: A").is_none());
        assert!(BackendError::from_marker(BackendRole::Voter, "mentions [BACKEND_ERROR] late").is_none());
    }

    #[test]
    fn test_unavailable_classification() {
        let timeout = BackendError::Timeout {
            role: BackendRole::Planner,
            secs: 30,
        };
        assert!(timeout.is_unavailable());
        let malformed = BackendError::Malformed {
            role: BackendRole::Planner,
            detail: "bad json".into(),
        };
        assert!(!malformed.is_unavailable());
    }

    #[test]
    fn test_request_builder() {
        let req = BackendRequest::new(BackendRole::Coder, "sys", "user")
            .with_temperature(0.8)
            .with_max_tokens(512)
            .streaming();
        assert_eq!(req.temperature, 0.8);
        assert_eq!(req.max_tokens, 512);
        assert!(req.stream);
    }
}
