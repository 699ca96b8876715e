use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use maker_coordination::{OrchestratorConfig, RoleTable};
use serde::Deserialize;

/// Default directory for persisted task state.
const DEFAULT_STATE_DIR: &str = ".maker-state";

/// Workspace exposed to the tool server.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    /// Program and arguments for `run_tests`; `cargo test` when empty.
    #[serde(default)]
    pub test_command: Vec<String>,
    #[serde(default)]
    pub test_timeout_secs: Option<u64>,
}

/// Config file contents as written on disk.
#[derive(Debug, Default, Deserialize)]
struct SwarmConfigFile {
    #[serde(flatten)]
    orchestrator: OrchestratorConfig,
    #[serde(default)]
    roles: Option<RoleTable>,
    #[serde(default)]
    state_dir: Option<PathBuf>,
    #[serde(default)]
    workspace: Option<WorkspaceConfig>,
}

/// Top-level CLI configuration.
///
/// | Setting | Source (lowest → highest) |
/// |---|---|
/// | Orchestrator options | defaults → TOML → env (`MAX_ITERATIONS`, ...) |
/// | Role endpoints | defaults → env (`MAKER_<ROLE>_URL`, ...) → TOML `[roles]` |
/// | State directory | default → TOML `state_dir` → `--state-dir` |
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub orchestrator: OrchestratorConfig,
    pub roles: RoleTable,
    pub state_dir: PathBuf,
    pub workspace: Option<WorkspaceConfig>,
}

impl SwarmConfig {
    pub fn load(path: Option<&Path>, state_dir: Option<PathBuf>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))?
            }
            None => SwarmConfigFile::default(),
        };

        let mut orchestrator = file.orchestrator;
        orchestrator
            .apply_env_overrides()
            .context("Invalid environment override")?;
        orchestrator.validate().context("Invalid orchestrator configuration")?;

        let roles = match file.roles {
            Some(roles) => RoleTable::from_env().merged(roles),
            None => RoleTable::from_env(),
        };

        Ok(Self {
            orchestrator,
            roles,
            state_dir: state_dir
                .or(file.state_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR)),
            workspace: file.workspace,
        })
    }

    fn parse(text: &str) -> Result<SwarmConfigFile> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maker_coordination::BackendRole;

    #[test]
    fn test_parse_full_file() {
        let file = SwarmConfig::parse(
            r#"
            max_iterations = 5
            num_candidates = 3
            state_dir = "/tmp/maker"

            [role_capacity]
            coder = 2

            [roles.voter]
            base_url = "http://gpu-02:8081/v1"
            model = "voter-7b"

            [workspace]
            root = "."
            test_command = ["cargo", "test", "--quiet"]
            "#,
        )
        .unwrap();

        assert_eq!(file.orchestrator.max_iterations, 5);
        assert_eq!(file.orchestrator.num_candidates, 3);
        assert_eq!(file.orchestrator.role_capacity.get(&BackendRole::Coder), Some(&2));
        let roles = file.roles.unwrap();
        assert_eq!(roles.get(BackendRole::Voter).unwrap().model, "voter-7b");
        assert!(roles.get(BackendRole::Coder).is_none());
        assert_eq!(file.state_dir, Some(PathBuf::from("/tmp/maker")));
        assert_eq!(file.workspace.unwrap().test_command.len(), 3);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = SwarmConfig::parse("").unwrap();
        assert_eq!(file.orchestrator.vote_k, OrchestratorConfig::default().vote_k);
        assert!(file.roles.is_none());
        assert!(file.workspace.is_none());
    }

    #[test]
    fn test_cli_state_dir_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maker.toml");
        std::fs::write(&path, "state_dir = \"from-file\"\n").unwrap();

        let config = SwarmConfig::load(Some(&path), Some(PathBuf::from("from-cli"))).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("from-cli"));

        let config = SwarmConfig::load(Some(&path), None).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("from-file"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(SwarmConfig::load(Some(Path::new("/nonexistent/maker.toml")), None).is_err());
    }
}
