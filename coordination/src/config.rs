//! Orchestrator configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variables (`MAX_ITERATIONS`, `MAKER_NUM_CANDIDATES`, ...)
//! 2. TOML file
//! 3. Built-in defaults
//!
//! | Option                          | Env var                         | Default |
//! |---------------------------------|---------------------------------|---------|
//! | `max_iterations`                | `MAX_ITERATIONS`                | 3       |
//! | `num_candidates`                | `MAKER_NUM_CANDIDATES`          | 5       |
//! | `vote_k`                        | `MAKER_VOTE_K`                  | 3       |
//! | `max_context_tokens`            | `MAX_CONTEXT_TOKENS`            | 32768   |
//! | `recent_window_tokens`          | `RECENT_WINDOW_TOKENS`          | 16384   |
//! | `summary_chunk_size`            | `SUMMARY_CHUNK_SIZE`            | 4096    |
//! | `max_concurrent_per_backend`    | `MAX_CONCURRENT_PER_BACKEND`    | 1       |
//! | `compression_trigger_threshold` | `COMPRESSION_TRIGGER_THRESHOLD` | 0.95    |
//! | `max_compressed_ratio`          | `MAX_COMPRESSED_RATIO`          | 0.25    |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionController;
use crate::backend::BackendRole;
use crate::context::CompressorConfig;

const DEFAULT_MAX_ITERATIONS: u32 = 3;
const DEFAULT_NUM_CANDIDATES: usize = 5;
const DEFAULT_VOTE_K: u32 = 3;
const DEFAULT_MAX_CONTEXT_TOKENS: u32 = 32_768;
const DEFAULT_RECENT_WINDOW_TOKENS: u32 = 16_384;
const DEFAULT_SUMMARY_CHUNK_SIZE: u32 = 4_096;
const DEFAULT_MAX_CONCURRENT_PER_BACKEND: usize = 1;
const DEFAULT_TRIGGER_THRESHOLD: f64 = 0.95;
const DEFAULT_MAX_COMPRESSED_RATIO: f64 = 0.25;

/// Letters available for candidate labels.
const MAX_CANDIDATES: usize = 26;
/// Upper bound on K; 2K−1 voters must stay a sane number of calls.
const MAX_VOTE_K: u32 = 1 << 15;

/// Error type for configuration loading and validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable {name}={value:?} is not valid")]
    InvalidEnv { name: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine-wide tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Review rejections absorbed before the task fails.
    pub max_iterations: u32,
    /// Candidates sampled per GENERATE stage (N).
    pub num_candidates: usize,
    /// Votes needed to win outright (K); up to 2K−1 voters run.
    pub vote_k: u32,
    pub max_context_tokens: u32,
    pub recent_window_tokens: u32,
    pub summary_chunk_size: u32,
    /// Default per-role admission capacity.
    pub max_concurrent_per_backend: usize,
    pub compression_trigger_threshold: f64,
    pub max_compressed_ratio: f64,
    pub max_summary_tokens: u32,
    /// Sampling temperatures for candidates A, B, C, ...
    pub candidate_temperatures: Vec<f32>,
    /// Prompt cap applied before candidate generation.
    pub max_prompt_chars: usize,
    pub backend_timeout_secs: u64,
    /// Bound on admission queueing; unbounded when unset.
    pub admission_wait_timeout_secs: Option<u64>,
    pub task_ttl_secs: u64,
    /// Extra attempts for the single-call stages (preprocess, plan, review).
    pub stage_retries: u32,
    /// Allow one replan before the final generate attempt.
    pub escalation_enabled: bool,
    /// Per-role capacity overrides.
    pub role_capacity: BTreeMap<BackendRole, usize>,
    /// Standing instructions (house style, toolchain, constraints) placed at
    /// the top of every stage prompt. Not counted against the token budget.
    pub project_instructions: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            num_candidates: DEFAULT_NUM_CANDIDATES,
            vote_k: DEFAULT_VOTE_K,
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            recent_window_tokens: DEFAULT_RECENT_WINDOW_TOKENS,
            summary_chunk_size: DEFAULT_SUMMARY_CHUNK_SIZE,
            max_concurrent_per_backend: DEFAULT_MAX_CONCURRENT_PER_BACKEND,
            compression_trigger_threshold: DEFAULT_TRIGGER_THRESHOLD,
            max_compressed_ratio: DEFAULT_MAX_COMPRESSED_RATIO,
            max_summary_tokens: 1_024,
            candidate_temperatures: vec![0.2, 0.4, 0.6, 0.8, 1.0],
            max_prompt_chars: 24_000,
            backend_timeout_secs: 300,
            admission_wait_timeout_secs: None,
            task_ttl_secs: 86_400,
            stage_retries: 1,
            escalation_enabled: true,
            role_capacity: BTreeMap::new(),
            project_instructions: None,
        }
    }
}

fn parse_env<T: FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value,
    })
}

impl OrchestratorConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Defaults, then the TOML file if given, then environment overrides.
    /// The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! override_from {
            ($name:literal => $field:ident) => {
                if let Some(value) = lookup($name) {
                    self.$field = parse_env($name, value)?;
                }
            };
        }

        override_from!("MAX_ITERATIONS" => max_iterations);
        override_from!("MAKER_NUM_CANDIDATES" => num_candidates);
        override_from!("MAKER_VOTE_K" => vote_k);
        override_from!("MAX_CONTEXT_TOKENS" => max_context_tokens);
        override_from!("RECENT_WINDOW_TOKENS" => recent_window_tokens);
        override_from!("SUMMARY_CHUNK_SIZE" => summary_chunk_size);
        override_from!("MAX_CONCURRENT_PER_BACKEND" => max_concurrent_per_backend);
        override_from!("COMPRESSION_TRIGGER_THRESHOLD" => compression_trigger_threshold);
        override_from!("MAX_COMPRESSED_RATIO" => max_compressed_ratio);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.vote_k == 0 || self.vote_k > MAX_VOTE_K {
            return invalid(format!("MAKER_VOTE_K must be between 1 and {MAX_VOTE_K}, got {}", self.vote_k));
        }
        if self.num_candidates == 0 || self.num_candidates > MAX_CANDIDATES {
            return invalid(format!(
                "MAKER_NUM_CANDIDATES must be between 1 and {MAX_CANDIDATES}, got {}",
                self.num_candidates
            ));
        }
        for (name, value) in [
            ("COMPRESSION_TRIGGER_THRESHOLD", self.compression_trigger_threshold),
            ("MAX_COMPRESSED_RATIO", self.max_compressed_ratio),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return invalid(format!("{name} must be in (0, 1], got {value}"));
            }
        }
        if self.summary_chunk_size == 0 {
            return invalid("SUMMARY_CHUNK_SIZE must be positive".into());
        }
        if self.max_concurrent_per_backend == 0 || self.role_capacity.values().any(|c| *c == 0) {
            return invalid("backend capacity must be at least 1".into());
        }
        let compressed_budget = self.compressor_config().compressed_budget();
        if self.recent_window_tokens as u64 + compressed_budget as u64 > self.max_context_tokens as u64 {
            return invalid(format!(
                "RECENT_WINDOW_TOKENS ({}) plus the compressed budget ({compressed_budget}) exceeds \
                 MAX_CONTEXT_TOKENS ({})",
                self.recent_window_tokens, self.max_context_tokens
            ));
        }
        if self.max_prompt_chars == 0 || self.backend_timeout_secs == 0 {
            return invalid("max_prompt_chars and backend_timeout_secs must be positive".into());
        }
        Ok(())
    }

    pub fn compressor_config(&self) -> CompressorConfig {
        CompressorConfig {
            max_context_tokens: self.max_context_tokens,
            recent_window_tokens: self.recent_window_tokens,
            summary_chunk_size: self.summary_chunk_size,
            trigger_threshold: self.compression_trigger_threshold,
            max_compressed_ratio: self.max_compressed_ratio,
            max_summary_tokens: self.max_summary_tokens,
        }
    }

    /// Admission controller sized from this config.
    pub fn admission_controller(&self) -> AdmissionController {
        AdmissionController::with_overrides(self.max_concurrent_per_backend, &self.role_capacity)
            .with_wait_timeout(self.admission_wait_timeout_secs.map(Duration::from_secs))
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.num_candidates, 5);
        assert_eq!(config.vote_k, 3);
        assert_eq!(config.compressor_config().compressed_budget(), 8_192);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            num_candidates = 3
            vote_k = 2
            [role_capacity]
            coder = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.num_candidates, 3);
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.role_capacity.get(&BackendRole::Coder), Some(&3));
        assert_eq!(config.admission_controller().capacity(BackendRole::Coder), 3);
        assert_eq!(config.admission_controller().capacity(BackendRole::Voter), 1);
    }

    #[test]
    fn test_env_overrides_take_precedence() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MAX_ITERATIONS", "5"),
            ("MAKER_VOTE_K", "2"),
            ("COMPRESSION_TRIGGER_THRESHOLD", "0.9"),
        ]);
        let mut config = OrchestratorConfig::from_toml_str("max_iterations = 1").unwrap();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.vote_k, 2);
        assert!((config.compression_trigger_threshold - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = OrchestratorConfig::default();
        let err = config
            .apply_overrides(|name| (name == "MAKER_NUM_CANDIDATES").then(|| "five".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("MAKER_NUM_CANDIDATES"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = OrchestratorConfig {
            vote_k: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config = OrchestratorConfig {
            vote_k: 2_147_483_648,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("MAKER_VOTE_K"));

        config = OrchestratorConfig {
            num_candidates: 27,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config = OrchestratorConfig {
            max_compressed_ratio: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // Window plus compressed budget must fit the context.
        config = OrchestratorConfig {
            max_context_tokens: 1_000,
            recent_window_tokens: 900,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.role_capacity.insert(BackendRole::Voter, 0);
        config.recent_window_tokens = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maker.toml");
        std::fs::write(&path, "max_context_tokens = 1000\nrecent_window_tokens = 600\n").unwrap();
        let config = OrchestratorConfig::load(Some(&path)).unwrap();
        assert_eq!(config.max_context_tokens, 1000);

        assert!(matches!(
            OrchestratorConfig::load(Some(&dir.path().join("missing.toml"))),
            Err(ConfigError::Io { .. })
        ));
    }
}
