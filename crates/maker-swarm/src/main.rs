mod config;
mod telemetry;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::SwarmConfig;
use maker_coordination::{
    FileTaskStore, HttpBackend, LocalToolServer, StageEvent, TaskOutcome, WorkflowEngine,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "maker-swarm", about = "MAKER coding workflow over local inference backends")]
struct Cli {
    /// TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for persisted task state.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a new task to completion.
    Run {
        /// The coding request.
        input: String,
        /// Task id; a random one is generated when omitted.
        #[arg(long)]
        task_id: Option<String>,
    },
    /// Print the persisted state of a task.
    Status { task_id: String },
    /// Continue a task from its last persisted stage.
    Resume { task_id: String },
    /// Check that every role endpoint answers.
    Health,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    telemetry::init(cli.log_json);

    let config = SwarmConfig::load(cli.config.as_deref(), cli.state_dir)?;
    info!(state_dir = %config.state_dir.display(), "maker-swarm starting");

    match cli.command {
        Command::Health => health(&config).await,
        Command::Status { task_id } => {
            let engine = build_engine(&config).await?;
            let state = engine
                .get_status(&task_id)
                .await
                .with_context(|| format!("No status for task {task_id}"))?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { input, task_id } => {
            let engine = build_engine(&config).await?;
            let task_id = task_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            info!(task_id = %task_id, "submitting task");
            let events = engine.submit(task_id.clone(), input)?;
            follow(&engine, &task_id, events).await
        }
        Command::Resume { task_id } => {
            let engine = build_engine(&config).await?;
            let events = engine
                .resume(&task_id)
                .await
                .with_context(|| format!("Cannot resume task {task_id}"))?;
            follow(&engine, &task_id, events).await
        }
    }
}

async fn build_engine(config: &SwarmConfig) -> Result<Arc<WorkflowEngine>> {
    let backend = HttpBackend::new(config.roles.clone()).context("Failed to build HTTP backend")?;
    let store = FileTaskStore::open(config.state_dir.clone())
        .await
        .with_context(|| format!("Failed to open state dir {}", config.state_dir.display()))?;

    let mut engine = WorkflowEngine::new(config.orchestrator.clone(), Arc::new(backend), store.shared())
        .context("Failed to build workflow engine")?;

    if let Some(workspace) = &config.workspace {
        let mut tools = LocalToolServer::new(&workspace.root);
        if !workspace.test_command.is_empty() {
            tools = tools.with_test_command(workspace.test_command.clone());
        }
        if let Some(secs) = workspace.test_timeout_secs {
            tools = tools.with_test_timeout(Duration::from_secs(secs));
        }
        info!(root = %workspace.root.display(), "tool server enabled");
        engine = engine.with_tools(Arc::new(tools));
    }

    Ok(engine.shared())
}

/// Stream a task's events until it finishes. Ctrl-C cancels the task.
async fn follow(
    engine: &Arc<WorkflowEngine>,
    task_id: &str,
    mut events: mpsc::Receiver<StageEvent>,
) -> Result<ExitCode> {
    let mut outcome: Option<TaskOutcome> = None;
    let mut interrupted = false;

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                warn!(task_id, "interrupt received, cancelling task");
                interrupted = true;
                engine.cancel(task_id)?;
                continue;
            }
        };
        let Some(event) = event else { break };
        if let StageEvent::Finished(done) = event {
            outcome = Some(done);
            break;
        }
        print_event(&event)?;
    }

    let outcome = outcome.context("Event stream closed before the task finished")?;
    println!();
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    let stats = serde_json::json!({
        "admission": engine.admission_stats(),
        "compressor": engine.compressor_stats(task_id).ok(),
    });
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_event(event: &StageEvent) -> Result<()> {
    match event {
        StageEvent::Token { text, .. } => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
        }
        StageEvent::StreamRestarted { stage, attempt, .. } => {
            println!();
            warn!(stage = %stage, attempt, "stream failed, output above is discarded and restarts below");
        }
        StageEvent::StageStarted { stage, iteration, .. } => {
            info!(stage = %stage, iteration, "stage started");
        }
        StageEvent::CandidateDropped { slot, error, .. } => {
            warn!(slot, error = %error, "candidate dropped");
        }
        StageEvent::ConsensusReached {
            winner_id,
            decision,
            votes,
            ..
        } => {
            info!(winner = %winner_id, ?decision, ?votes, "consensus reached");
        }
        StageEvent::ReviewVerdict {
            iteration,
            approved,
            feedback,
            ..
        } => {
            info!(iteration, approved, feedback = %feedback, "review verdict");
        }
        StageEvent::Escalated { reason, .. } => info!(reason = %reason, "escalated to planner"),
        StageEvent::Degraded { reason, .. } => warn!(reason = %reason, "persistence degraded"),
        other => tracing::debug!(event = other.event_type(), "event"),
    }
    Ok(())
}

/// Hit `GET {base_url}/models` once per distinct endpoint.
async fn health(config: &SwarmConfig) -> Result<ExitCode> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("Failed to build HTTP client")?;

    let mut healthy = true;
    let mut checked: Vec<(String, bool)> = Vec::new();

    for (role, endpoint) in config.roles.iter() {
        let url = format!("{}/models", endpoint.base_url.trim_end_matches('/'));
        let ok = match checked.iter().find(|(u, _)| *u == url) {
            Some((_, ok)) => *ok,
            None => {
                let ok = match client.get(&url).bearer_auth(&endpoint.api_key).send().await {
                    Ok(resp) if resp.status().is_success() => true,
                    Ok(resp) => {
                        warn!(role = %role, url = %url, status = %resp.status(), "endpoint unhealthy");
                        false
                    }
                    Err(e) => {
                        warn!(role = %role, url = %url, error = %e, "endpoint unreachable");
                        false
                    }
                };
                checked.push((url.clone(), ok));
                ok
            }
        };
        healthy &= ok;
        println!(
            "{:<13} {:<5} {} ({})",
            role.as_str(),
            if ok { "ok" } else { "DOWN" },
            url,
            endpoint.model
        );
    }

    Ok(if healthy { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_with_globals() {
        let cli = Cli::try_parse_from([
            "maker-swarm",
            "run",
            "add a parser",
            "--task-id",
            "t1",
            "--state-dir",
            "/tmp/s",
            "--log-json",
        ])
        .unwrap();
        assert!(cli.log_json);
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/s")));
        match cli.command {
            Command::Run { input, task_id } => {
                assert_eq!(input, "add a parser");
                assert_eq!(task_id.as_deref(), Some("t1"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["maker-swarm"]).is_err());
        assert!(Cli::try_parse_from(["maker-swarm", "status"]).is_err());
    }
}
