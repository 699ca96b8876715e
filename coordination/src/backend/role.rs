//! Backend roles and the role → endpoint table.
//!
//! Every inference call names a [`BackendRole`]. The role decides which
//! endpoint serves the request and which admission gate it queues on.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default OpenAI-compatible base URL for a local llama.cpp / vLLM server.
const DEFAULT_BASE_URL: &str = "http://localhost:8080/v1";
/// Default model alias when a role has no explicit model.
const DEFAULT_MODEL: &str = "local-model";
/// Shared base URL override applied to every role without its own URL.
const ENV_SHARED_BASE_URL: &str = "MAKER_BASE_URL";
/// Shared model override applied to every role without its own model.
const ENV_SHARED_MODEL: &str = "MAKER_MODEL";

/// One specialized text-generation service identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendRole {
    /// Normalizes and clarifies the raw user request.
    Preprocessor,
    /// Produces the implementation plan.
    Planner,
    /// Generates code candidates.
    Coder,
    /// Picks one candidate out of a candidate set.
    Voter,
    /// Approves or rejects the winning candidate.
    Reviewer,
    /// Lightweight model used by the context compressor.
    Summarizer,
}

impl BackendRole {
    /// All roles, in pipeline order.
    pub const ALL: [BackendRole; 6] = [
        Self::Preprocessor,
        Self::Planner,
        Self::Coder,
        Self::Voter,
        Self::Reviewer,
        Self::Summarizer,
    ];

    /// Stable lowercase name used in logs, config keys and env vars.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preprocessor => "preprocessor",
            Self::Planner => "planner",
            Self::Coder => "coder",
            Self::Voter => "voter",
            Self::Reviewer => "reviewer",
            Self::Summarizer => "summarizer",
        }
    }

    fn env_prefix(self) -> String {
        format!("MAKER_{}", self.as_str().to_ascii_uppercase())
    }
}

impl fmt::Display for BackendRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown backend role: {s}"))
    }
}

/// Where a role's requests go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleEndpoint {
    /// Base URL of the OpenAI-compatible API (e.g. `http://gpu-01:8080/v1`).
    pub base_url: String,
    /// Model name sent in the request body.
    pub model: String,
    /// API key. Most local servers accept any non-empty value.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

fn default_api_key() -> String {
    "local".to_string()
}

impl RoleEndpoint {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: default_api_key(),
        }
    }

    /// Full chat-completions URL for this endpoint.
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Role → endpoint configuration table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleTable {
    endpoints: BTreeMap<BackendRole, RoleEndpoint>,
}

impl RoleTable {
    /// Every role mapped to the same endpoint.
    pub fn uniform(endpoint: RoleEndpoint) -> Self {
        let endpoints = BackendRole::ALL
            .iter()
            .map(|role| (*role, endpoint.clone()))
            .collect();
        Self { endpoints }
    }

    /// Build the table from environment variables.
    ///
    /// Precedence per role: `MAKER_<ROLE>_URL` / `_MODEL` / `_API_KEY`, then the
    /// shared `MAKER_BASE_URL` / `MAKER_MODEL`, then built-in defaults.
    pub fn from_env() -> Self {
        let shared_url =
            env::var(ENV_SHARED_BASE_URL).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let shared_model = env::var(ENV_SHARED_MODEL).unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let endpoints = BackendRole::ALL
            .iter()
            .map(|role| {
                let prefix = role.env_prefix();
                let endpoint = RoleEndpoint {
                    base_url: env::var(format!("{prefix}_URL"))
                        .unwrap_or_else(|_| shared_url.clone()),
                    model: env::var(format!("{prefix}_MODEL"))
                        .unwrap_or_else(|_| shared_model.clone()),
                    api_key: env::var(format!("{prefix}_API_KEY"))
                        .unwrap_or_else(|_| default_api_key()),
                };
                (*role, endpoint)
            })
            .collect();

        Self { endpoints }
    }

    /// Override one role's endpoint.
    pub fn with_endpoint(mut self, role: BackendRole, endpoint: RoleEndpoint) -> Self {
        self.endpoints.insert(role, endpoint);
        self
    }

    /// Merge `other` over `self`; roles present in `other` win.
    pub fn merged(mut self, other: RoleTable) -> Self {
        self.endpoints.extend(other.endpoints);
        self
    }

    pub fn get(&self, role: BackendRole) -> Option<&RoleEndpoint> {
        self.endpoints.get(&role)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BackendRole, &RoleEndpoint)> {
        self.endpoints.iter().map(|(role, ep)| (*role, ep))
    }
}

impl Default for RoleTable {
    fn default() -> Self {
        Self::uniform(RoleEndpoint::new(DEFAULT_BASE_URL, DEFAULT_MODEL))
    }
}
