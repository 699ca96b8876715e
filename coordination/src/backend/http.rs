//! OpenAI-compatible HTTP backend (llama.cpp, vLLM, SGLang, proxies).

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BackendError, BackendRequest, BackendRole, ChunkStream, InferenceBackend, RoleTable};

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

/// Routes each role to its endpoint over HTTP.
pub struct HttpBackend {
    http: reqwest::Client,
    roles: RoleTable,
}

impl HttpBackend {
    pub fn new(roles: RoleTable) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::Unavailable {
                role: BackendRole::Coder,
                detail: format!("http client build failed: {e}"),
            })?;
        Ok(Self { http, roles })
    }

    pub fn roles(&self) -> &RoleTable {
        &self.roles
    }

    async fn send(&self, request: &BackendRequest, stream: bool) -> Result<reqwest::Response, BackendError> {
        let role = request.role;
        let endpoint = self.roles.get(role).ok_or_else(|| BackendError::Unavailable {
            role,
            detail: "no endpoint configured".to_string(),
        })?;

        let mut messages = Vec::with_capacity(2);
        if !request.system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &request.system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.user_prompt,
        });

        let body = ChatRequest {
            model: &endpoint.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
        };

        debug!(role = %role, url = %endpoint.completions_url(), stream, "POST chat/completions");

        let response = self
            .http
            .post(endpoint.completions_url())
            .bearer_auth(&endpoint.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable {
                role,
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Malformed {
                role,
                detail: format!("HTTP {status}: {body}"),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn complete(&self, request: &BackendRequest) -> Result<String, BackendError> {
        let role = request.role;
        let response = self.send(request, false).await?;
        let chat: ChatResponse = response.json().await.map_err(|e| BackendError::Malformed {
            role,
            detail: format!("invalid response body: {e}"),
        })?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::Malformed {
                role,
                detail: "response had no content".to_string(),
            })
    }

    async fn stream(&self, request: &BackendRequest) -> Result<ChunkStream, BackendError> {
        let role = request.role;
        let response = self.send(request, true).await?;

        let mut buffer = String::new();
        let chunks = response
            .bytes_stream()
            .map(move |item| match item {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    drain_sse_lines(&mut buffer, role)
                }
                Err(e) => vec![Err(BackendError::Unavailable {
                    role,
                    detail: e.to_string(),
                })],
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(chunks))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Pull every complete `data:` line out of `buffer` and decode its delta.
fn drain_sse_lines(buffer: &mut String, role: BackendRole) -> Vec<Result<String, BackendError>> {
    let mut out = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => {
                if let Some(text) = chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
                    if !text.is_empty() {
                        out.push(Ok(text));
                    }
                }
            }
            Err(e) => out.push(Err(BackendError::Malformed {
                role,
                detail: format!("bad stream chunk: {e}"),
            })),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_sse_lines_handles_partial_input() {
        let mut buffer = String::from(
            "data: {\"choices\":[{\"delta\":{\"content\":\"fn \"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ma",
        );
        let first = drain_sse_lines(&mut buffer, BackendRole::Coder);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].as_ref().unwrap(), "fn ");

        buffer.push_str("in\"}}]}\ndata: [DONE]\n");
        let second = drain_sse_lines(&mut buffer, BackendRole::Coder);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].as_ref().unwrap(), "main");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_sse_lines_reports_bad_json() {
        let mut buffer = String::from("data: {not json}\n");
        let out = drain_sse_lines(&mut buffer, BackendRole::Planner);
        assert!(matches!(out[0], Err(BackendError::Malformed { .. })));
    }

    #[test]
    fn test_drain_sse_lines_skips_role_only_deltas() {
        let mut buffer = String::from(
            ": keep-alive\ndata: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n",
        );
        assert!(drain_sse_lines(&mut buffer, BackendRole::Planner).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        let roles = RoleTable::uniform(crate::backend::RoleEndpoint::new("http://127.0.0.1:9/v1", "m"));
        let backend = HttpBackend::new(roles).unwrap();
        let req = BackendRequest::new(BackendRole::Coder, "", "hi");
        let err = backend.complete(&req).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
