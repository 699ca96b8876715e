//! Backend caller. Every inference exchange goes through here.
//!
//! The caller acquires the role's admission permit, runs the exchange under
//! the call timeout and normalizes error-marker replies into
//! [`BackendError`]s. The permit lives exactly as long as the exchange.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{BackendError, BackendRequest, BackendRole, InferenceBackend};
use crate::admission::{AdmissionController, AdmissionError};

/// Issues gated, time-bounded calls to a backend.
pub struct BackendCaller {
    backend: Arc<dyn InferenceBackend>,
    admission: Arc<AdmissionController>,
    timeout: Duration,
}

impl BackendCaller {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        admission: Arc<AdmissionController>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            admission,
            timeout,
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn admission_error(role: BackendRole, err: AdmissionError) -> BackendError {
        BackendError::Admission {
            role,
            detail: err.to_string(),
        }
    }

    /// Run one non-streaming exchange.
    pub async fn call(&self, request: &BackendRequest) -> Result<String, BackendError> {
        let role = request.role;
        let _permit = self
            .admission
            .acquire(role)
            .await
            .map_err(|e| Self::admission_error(role, e))?;

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.backend.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                role,
                secs: self.timeout.as_secs(),
            }),
        };

        let result = result.and_then(|text| match BackendError::from_marker(role, &text) {
            Some(err) => Err(err),
            None => Ok(text),
        });

        match &result {
            Ok(text) => debug!(
                role = %role,
                backend = self.backend.name(),
                latency_ms = started.elapsed().as_millis() as u64,
                chars = text.len(),
                "backend call complete"
            ),
            Err(e) => warn!(
                role = %role,
                backend = self.backend.name(),
                latency_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "backend call failed"
            ),
        }

        result
    }

    /// Run one streaming exchange, forwarding chunks to `sink` as they arrive.
    ///
    /// Returns the concatenated reply. The timeout covers the whole exchange,
    /// including the time spent draining the stream. A closed `sink` does not
    /// abort the call.
    pub async fn call_streaming(
        &self,
        request: &BackendRequest,
        sink: mpsc::UnboundedSender<String>,
    ) -> Result<String, BackendError> {
        let role = request.role;
        let _permit = self
            .admission
            .acquire(role)
            .await
            .map_err(|e| Self::admission_error(role, e))?;

        let exchange = async {
            let mut stream = self.backend.stream(request).await?;
            let mut full = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if full.is_empty() {
                    if let Some(err) = BackendError::from_marker(role, &chunk) {
                        return Err(err);
                    }
                }
                let _ = sink.send(chunk.clone());
                full.push_str(&chunk);
            }
            match BackendError::from_marker(role, &full) {
                Some(err) => Err(err),
                None => Ok(full),
            }
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(role = %role, "streaming backend call timed out");
                Err(BackendError::Timeout {
                    role,
                    secs: self.timeout.as_secs(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ScriptedBackend, ScriptedReply};

    fn caller_with(backend: ScriptedBackend, timeout: Duration) -> (BackendCaller, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        let caller = BackendCaller::new(
            backend.clone(),
            Arc::new(AdmissionController::new(1)),
            timeout,
        );
        (caller, backend)
    }

    #[tokio::test]
    async fn test_call_returns_text_and_releases_permit() {
        let backend = ScriptedBackend::new().with_replies(BackendRole::Planner, ["step 1"]);
        let (caller, _) = caller_with(backend, Duration::from_secs(5));

        let req = BackendRequest::new(BackendRole::Planner, "sys", "plan it");
        assert_eq!(caller.call(&req).await.unwrap(), "step 1");

        let stats = caller.admission().role_stats(BackendRole::Planner);
        assert_eq!(stats.active_request_count, 0);
        assert_eq!(stats.total_request_count, 1);
    }

    #[tokio::test]
    async fn test_marker_reply_becomes_error() {
        let backend = ScriptedBackend::new().with_script(
            BackendRole::Coder,
            vec![ScriptedReply::Marker("out of KV slots".into())],
        );
        let (caller, _) = caller_with(backend, Duration::from_secs(5));

        let req = BackendRequest::new(BackendRole::Coder, "sys", "code");
        let err = caller.call(&req).await.unwrap_err();
        assert!(matches!(err, BackendError::Malformed { .. }));
        assert!(err.to_string().contains("out of KV slots"));
        assert_eq!(caller.admission().role_stats(BackendRole::Coder).active_request_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_permit() {
        let backend = ScriptedBackend::new().with_script(BackendRole::Reviewer, vec![ScriptedReply::Hang]);
        let (caller, _) = caller_with(backend, Duration::from_secs(3));

        let req = BackendRequest::new(BackendRole::Reviewer, "sys", "review");
        let err = caller.call(&req).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { secs: 3, .. }));
        assert_eq!(caller.admission().role_stats(BackendRole::Reviewer).active_request_count, 0);
    }

    #[tokio::test]
    async fn test_streaming_forwards_chunks() {
        let backend = ScriptedBackend::new().with_replies(BackendRole::Planner, ["alpha beta gamma"]);
        let (caller, _) = caller_with(backend, Duration::from_secs(5));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = BackendRequest::new(BackendRole::Planner, "sys", "plan").streaming();
        let full = caller.call_streaming(&req, tx).await.unwrap();
        assert_eq!(full, "alpha beta gamma");

        let mut seen = String::new();
        while let Ok(chunk) = rx.try_recv() {
            seen.push_str(&chunk);
        }
        assert_eq!(seen, full);
    }
}
