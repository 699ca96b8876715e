//! Workflow engine: drives tasks through the stage graph.
//!
//! # Ownership
//!
//! The engine owns a registry of task handles keyed by task id. Each handle
//! holds the task's working state and context compressor behind one async
//! mutex. A driver holds that mutex for the whole run, so only one execution
//! touches a task at a time; `submit`/`resume` on a busy task fail with
//! [`OrchestratorError::TaskBusy`]. Readers use the committed snapshot that
//! the driver publishes after every stage, so status queries never wait on a
//! running stage.
//!
//! A finished run stamps its handle with the task TTL. Idle handles past it
//! are dropped from the registry on the next lookup, after which queries fall
//! through to the store and its own TTL.
//!
//! # Persistence
//!
//! The snapshot is written to the task store after every stage. A store
//! failure flips the engine into degraded mode: a warning and a
//! [`StageEvent::Degraded`] are emitted once, and tasks keep running from
//! memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::events::{EventSink, StageEvent, TaskOutcome};
use super::prompts;
use super::review::parse_review;
use super::stage::advance;
use super::tools::{referenced_paths, referenced_symbols, NoopToolServer, ToolServer};
use crate::admission::{AdmissionController, RoleAdmissionStats};
use crate::backend::{BackendCaller, BackendError, BackendRequest, BackendRole, InferenceBackend};
use crate::config::OrchestratorConfig;
use crate::context::{
    default_estimator, BackendSummarizer, CompressionReport, CompressorStats, ContextCompressor, MessageRole,
    Summarizer, TokenEstimator,
};
use crate::errors::OrchestratorError;
use crate::maker::{Ballot, CandidateGenerator, MakerVoter};
use crate::state::{CodeIteration, ReviewResult, SharedTaskStore, Stage, TaskId, TaskState};

/// Files and symbols resolved from the plan for the GENERATE prompt.
const MAX_TOOL_LOOKUPS: usize = 4;
/// Tail of test output attached to the review prompt.
const MAX_TEST_OUTPUT_CHARS: usize = 4_000;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T: Clone>(l: &RwLock<T>) -> T {
    l.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
}

fn write<T>(l: &RwLock<T>, value: T) {
    *l.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

fn is_retriable(err: &BackendError) -> bool {
    OrchestratorError::from(err.clone()).is_retriable()
}

fn evict_expired(registry: &mut Registry) {
    let before = registry.len();
    registry.retain(|_, handle| !handle.is_expired());
    let evicted = before - registry.len();
    if evicted > 0 {
        debug!(evicted, remaining = registry.len(), "expired tasks dropped from memory");
    }
}

/// Working state of one task; only the driver holding the slot lock sees it.
struct TaskSlot {
    state: TaskState,
    compressor: ContextCompressor,
}

struct TaskHandle {
    slot: Arc<AsyncMutex<TaskSlot>>,
    snapshot: RwLock<TaskState>,
    compressor_stats: RwLock<CompressorStats>,
    cancel: Mutex<CancellationToken>,
    /// When the last run ended, and the TTL it was given.
    finished: Mutex<Option<(Instant, Duration)>>,
}

type Registry = HashMap<TaskId, Arc<TaskHandle>>;

impl TaskHandle {
    fn new(slot: TaskSlot) -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(slot.state.clone()),
            compressor_stats: RwLock::new(slot.compressor.get_stats()),
            slot: Arc::new(AsyncMutex::new(slot)),
            cancel: Mutex::new(CancellationToken::new()),
            finished: Mutex::new(None),
        })
    }

    /// Take the slot for a new run. Call with the registry locked.
    fn claim(self: Arc<Self>, task_id: &str) -> Result<(Arc<Self>, OwnedMutexGuard<TaskSlot>), OrchestratorError> {
        let guard = self
            .slot
            .clone()
            .try_lock_owned()
            .map_err(|_| OrchestratorError::TaskBusy(task_id.to_string()))?;
        *lock(&self.finished) = None;
        Ok((self, guard))
    }

    fn finish(&self, ttl: Duration) {
        *lock(&self.finished) = Some((Instant::now(), ttl));
    }

    /// Idle and past the TTL of its last run.
    fn is_expired(&self) -> bool {
        let expired = matches!(*lock(&self.finished), Some((at, ttl)) if at.elapsed() >= ttl);
        expired && self.slot.try_lock().is_ok()
    }

    /// Fresh token for a new run.
    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *lock(&self.cancel) = token.clone();
        token
    }
}

/// Orchestrates tasks through PREPROCESS → PLAN → GENERATE → VOTE → REVIEW.
pub struct WorkflowEngine {
    config: OrchestratorConfig,
    caller: Arc<BackendCaller>,
    generator: CandidateGenerator,
    voter: MakerVoter,
    summarizer: Arc<dyn Summarizer>,
    estimator: Arc<dyn TokenEstimator>,
    store: SharedTaskStore,
    tools: Arc<dyn ToolServer>,
    registry: Mutex<Registry>,
    degraded: AtomicBool,
}

impl WorkflowEngine {
    /// Build an engine over `backend`, persisting to `store`.
    ///
    /// The config is validated. Summaries go through the summarizer role and
    /// tokens are counted with the BPE estimator unless overridden.
    pub fn new(
        config: OrchestratorConfig,
        backend: Arc<dyn InferenceBackend>,
        store: SharedTaskStore,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let admission = Arc::new(config.admission_controller());
        let caller = Arc::new(BackendCaller::new(backend, admission, config.backend_timeout()));
        Ok(Self {
            generator: CandidateGenerator::new(caller.clone(), config.max_prompt_chars),
            voter: MakerVoter::new(caller.clone(), config.max_prompt_chars),
            summarizer: Arc::new(BackendSummarizer::new(caller.clone())),
            estimator: default_estimator(),
            caller,
            store,
            tools: Arc::new(NoopToolServer),
            registry: Mutex::new(HashMap::new()),
            degraded: AtomicBool::new(false),
            config,
        })
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolServer>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        self.caller.admission()
    }

    /// Whether a store write has failed and tasks run from memory.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn new_compressor(&self, task_id: &str) -> ContextCompressor {
        let compressor = ContextCompressor::new(
            task_id,
            self.config.compressor_config(),
            self.estimator.clone(),
            self.summarizer.clone(),
        );
        match &self.config.project_instructions {
            Some(instructions) => compressor.with_system_prompt(format!("## Project instructions\n{instructions}")),
            None => compressor,
        }
    }

    /// Rebuild conversation context from persisted state.
    fn rehydrate_compressor(&self, state: &TaskState) -> ContextCompressor {
        let mut compressor = self.new_compressor(&state.task_id);
        compressor.add_message(MessageRole::User, state.user_input.as_str());
        if let Some(text) = &state.preprocessed_text {
            compressor.add_message(MessageRole::Assistant, format!("Clarified request:\n{text}"));
        }
        if let Some(plan) = &state.plan {
            compressor.add_message(MessageRole::Assistant, format!("Plan:\n{plan}"));
        }
        for review in state.review_results.iter().filter(|r| !r.approved) {
            compressor.add_message(
                MessageRole::User,
                format!("Reviewer feedback (iteration {}):\n{}", review.iteration, review.feedback),
            );
        }
        if let Some(code) = state.last_code() {
            compressor.add_message(MessageRole::Assistant, format!("Latest selected code:\n{code}"));
        }
        compressor
    }

    // ------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------

    /// Start a new task and stream its stage events.
    ///
    /// Reusing the id of an idle task replaces it; a running task is busy.
    pub fn submit(
        self: &Arc<Self>,
        task_id: impl Into<TaskId>,
        input: impl Into<String>,
    ) -> Result<mpsc::Receiver<StageEvent>, OrchestratorError> {
        let task_id = task_id.into();
        let state = TaskState::new(task_id.clone(), input);
        let mut compressor = self.new_compressor(&task_id);
        compressor.add_message(MessageRole::User, state.user_input.as_str());
        let handle = TaskHandle::new(TaskSlot { state, compressor });

        let (handle, guard) = {
            let mut registry = lock(&self.registry);
            evict_expired(&mut registry);
            if let Some(existing) = registry.get(&task_id) {
                if existing.slot.try_lock().is_err() {
                    return Err(OrchestratorError::TaskBusy(task_id));
                }
            }
            let claimed = handle.claim(&task_id)?;
            registry.insert(task_id.clone(), claimed.0.clone());
            claimed
        };

        info!(task_id = %task_id, "task submitted");
        Ok(self.spawn_driver(handle, guard))
    }

    /// Continue a task from its last committed stage.
    ///
    /// Tasks not in memory are loaded from the store. Terminal tasks yield
    /// only their `Finished` event.
    pub async fn resume(self: &Arc<Self>, task_id: &str) -> Result<mpsc::Receiver<StageEvent>, OrchestratorError> {
        let claimed = {
            let mut registry = lock(&self.registry);
            evict_expired(&mut registry);
            match registry.get(task_id) {
                Some(handle) => Some(handle.clone().claim(task_id)?),
                None => None,
            }
        };
        let (handle, guard) = match claimed {
            Some(claimed) => claimed,
            None => {
                let state = self
                    .store
                    .get(task_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
                let compressor = self.rehydrate_compressor(&state);
                let loaded = TaskHandle::new(TaskSlot { state, compressor });
                // A submit or resume may have raced us here; keep whichever got in first.
                let mut registry = lock(&self.registry);
                let handle = registry.entry(task_id.to_string()).or_insert(loaded).clone();
                handle.claim(task_id)?
            }
        };

        info!(task_id, stage = %guard.state.current_stage, "task resumed");
        Ok(self.spawn_driver(handle, guard))
    }

    /// Stop a running task. The in-flight stage is abandoned and the task
    /// rests at its last committed stage, ready for [`resume`](Self::resume).
    pub fn cancel(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let handle = self
            .live_handle(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        lock(&handle.cancel).cancel();
        info!(task_id, "task cancellation requested");
        Ok(())
    }

    /// Last committed state of a task.
    pub async fn get_status(&self, task_id: &str) -> Result<TaskState, OrchestratorError> {
        if let Some(handle) = self.live_handle(task_id) {
            return Ok(read(&handle.snapshot));
        }
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))
    }

    pub fn admission_stats(&self) -> BTreeMap<BackendRole, RoleAdmissionStats> {
        self.caller.admission().get_stats()
    }

    /// Compressor counters as of the task's last committed stage.
    pub fn compressor_stats(&self, task_id: &str) -> Result<CompressorStats, OrchestratorError> {
        self.live_handle(task_id)
            .map(|handle| read(&handle.compressor_stats))
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))
    }

    /// Number of task handles held in memory.
    pub fn resident_tasks(&self) -> usize {
        let mut registry = lock(&self.registry);
        evict_expired(&mut registry);
        registry.len()
    }

    fn live_handle(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        let mut registry = lock(&self.registry);
        evict_expired(&mut registry);
        registry.get(task_id).cloned()
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    fn spawn_driver(self: &Arc<Self>, handle: Arc<TaskHandle>, guard: OwnedMutexGuard<TaskSlot>) -> mpsc::Receiver<StageEvent> {
        let (sink, receiver) = EventSink::channel();
        let token = handle.arm();
        let span = info_span!("task", task_id = %guard.state.task_id);
        let engine = self.clone();
        tokio::spawn(async move { engine.drive(handle, guard, token, sink).await }.instrument(span));
        receiver
    }

    async fn drive(
        self: Arc<Self>,
        handle: Arc<TaskHandle>,
        mut slot: OwnedMutexGuard<TaskSlot>,
        cancel: CancellationToken,
        sink: EventSink,
    ) {
        let task_id = slot.state.task_id.clone();
        let mut cancelled = false;

        if !slot.state.is_terminal() {
            self.commit(&handle, &slot, &sink).await;
        }

        while !slot.state.is_terminal() {
            let stage = slot.state.current_stage;
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            sink.emit(StageEvent::StageStarted {
                task_id: task_id.clone(),
                stage,
                iteration: slot.state.iteration_count,
            })
            .await;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.run_stage(stage, &mut slot, &sink) => Some(result),
            };

            match result {
                None => {
                    // Drop the half-finished stage; the committed snapshot stands.
                    slot.state = read(&handle.snapshot);
                    slot.compressor = self.rehydrate_compressor(&slot.state);
                    cancelled = true;
                    break;
                }
                Some(Err(e)) => {
                    error!(stage = %stage, error = %e, "stage failed unexpectedly");
                    slot.state.error_message = Some(e.to_string());
                    slot.state.final_output = slot.state.best_partial_output();
                    if let Err(e) = advance(&mut slot.state, Stage::Failed, Some("internal error".into())) {
                        error!(error = %e, "cannot mark task failed");
                        break;
                    }
                }
                Some(Ok(())) => {}
            }

            sink.emit(StageEvent::StageCompleted {
                task_id: task_id.clone(),
                stage,
                next: slot.state.current_stage,
            })
            .await;
            self.commit(&handle, &slot, &sink).await;
        }

        if cancelled {
            info!(stage = %slot.state.current_stage, "task cancelled");
            sink.emit(StageEvent::Cancelled {
                task_id: task_id.clone(),
                stage: slot.state.current_stage,
            })
            .await;
        }

        let mut outcome = TaskOutcome::from_state(&slot.state, cancelled);
        if cancelled {
            outcome.error = Some(OrchestratorError::Cancelled(task_id.clone()).to_string());
        }
        // Free the slot before announcing the end, so a follow-up resume is never busy.
        handle.finish(self.config.task_ttl());
        drop(slot);
        evict_expired(&mut lock(&self.registry));
        info!(
            status = %outcome.status,
            iterations = outcome.iterations,
            generate_attempts = outcome.generate_attempts,
            "task finished"
        );
        sink.emit(StageEvent::Finished(outcome)).await;
    }

    /// Publish the snapshot and write it to the store.
    async fn commit(&self, handle: &TaskHandle, slot: &TaskSlot, sink: &EventSink) {
        write(&handle.snapshot, slot.state.clone());
        write(&handle.compressor_stats, slot.compressor.get_stats());

        let task_id = &slot.state.task_id;
        match self.store.set(task_id, &slot.state, self.config.task_ttl()).await {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!(store = self.store.name(), "task store recovered");
                }
            }
            Err(e) => {
                let err = OrchestratorError::from(e);
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    warn!(store = self.store.name(), error = %err, "task store unavailable, continuing in memory");
                } else {
                    debug!(error = %err, "task store still unavailable");
                }
                sink.emit(StageEvent::Degraded {
                    task_id: task_id.clone(),
                    reason: err.to_string(),
                })
                .await;
            }
        }
    }

    async fn run_stage(&self, stage: Stage, slot: &mut TaskSlot, sink: &EventSink) -> Result<(), OrchestratorError> {
        match stage {
            Stage::Created => advance(&mut slot.state, Stage::Preprocess, None),
            Stage::Preprocess => self.preprocess(slot, sink).await,
            Stage::Plan => self.plan(slot, sink).await,
            Stage::Generate => self.generate(slot, sink).await,
            Stage::Vote => self.vote(slot, sink).await,
            Stage::Review => self.review(slot, sink).await,
            Stage::Complete | Stage::Failed => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Stage handlers
    // ------------------------------------------------------------------

    async fn compress(&self, slot: &mut TaskSlot, sink: &EventSink) {
        if let CompressionReport::Compressed(summary) = slot.compressor.compress_if_needed(false).await {
            sink.emit(StageEvent::Compressed {
                task_id: slot.state.task_id.clone(),
                summary,
            })
            .await;
        }
    }

    /// Single-call stage with up to `stage_retries` extra attempts for
    /// retriable failures.
    async fn call_with_retries(&self, request: &BackendRequest) -> Result<String, BackendError> {
        let attempts = self.config.stage_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            let err = match self.caller.call(request).await {
                Ok(text) if !text.trim().is_empty() => return Ok(text),
                Ok(_) => BackendError::Malformed {
                    role: request.role,
                    detail: "empty reply".into(),
                },
                Err(e) => e,
            };
            if attempt >= attempts || !is_retriable(&err) {
                return Err(err);
            }
            warn!(role = %request.role, attempt, error = %err, "stage call failed, retrying");
            attempt += 1;
        }
    }

    /// Streaming variant forwarding chunks as `Token` events.
    async fn stream_with_retries(
        &self,
        request: &BackendRequest,
        stage: Stage,
        task_id: &str,
        sink: &EventSink,
    ) -> Result<String, BackendError> {
        let attempts = self.config.stage_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let forward = async {
                while let Some(text) = rx.recv().await {
                    sink.emit(StageEvent::Token {
                        task_id: task_id.to_string(),
                        stage,
                        text,
                    })
                    .await;
                }
            };
            let (result, ()) = tokio::join!(self.caller.call_streaming(request, tx), forward);

            let err = match result {
                Ok(text) if !text.trim().is_empty() => return Ok(text),
                Ok(_) => BackendError::Malformed {
                    role: request.role,
                    detail: "empty reply".into(),
                },
                Err(e) => e,
            };
            if attempt >= attempts || !is_retriable(&err) {
                return Err(err);
            }
            warn!(role = %request.role, attempt, error = %err, "streamed call failed, retrying");
            attempt += 1;
            // Tokens of the abandoned attempt were already sent.
            sink.emit(StageEvent::StreamRestarted {
                task_id: task_id.to_string(),
                stage,
                attempt,
            })
            .await;
        }
    }

    fn fail(state: &mut TaskState, message: String) -> Result<(), OrchestratorError> {
        warn!(task_id = %state.task_id, stage = %state.current_stage, error = %message, "task failed");
        state.error_message = Some(message.clone());
        state.final_output = state.best_partial_output();
        advance(state, Stage::Failed, Some(message))
    }

    async fn preprocess(&self, slot: &mut TaskSlot, sink: &EventSink) -> Result<(), OrchestratorError> {
        self.compress(slot, sink).await;
        let context = slot.compressor.get_context(true);
        let request = BackendRequest::new(BackendRole::Preprocessor, prompts::PREPROCESS_SYSTEM, prompts::preprocess(&context))
            .with_temperature(0.2);

        match self.call_with_retries(&request).await {
            Ok(text) => {
                let text = text.trim().to_string();
                slot.compressor
                    .add_message(MessageRole::Assistant, format!("Clarified request:\n{text}"));
                slot.state.preprocessed_text = Some(text);
            }
            Err(e) => {
                // The raw request is still a usable task description.
                warn!(error = %e, "preprocessing failed, using raw input");
            }
        }
        advance(&mut slot.state, Stage::Plan, None)
    }

    async fn plan(&self, slot: &mut TaskSlot, sink: &EventSink) -> Result<(), OrchestratorError> {
        self.compress(slot, sink).await;
        let context = slot.compressor.get_context(true);

        let codebase = match self.tools.analyze_codebase().await {
            Ok(summary) => Some(summary),
            Err(e) => {
                debug!(tool = self.tools.name(), error = %e, "analyze_codebase unavailable");
                None
            }
        };
        let feedback = slot.state.escalated.then(|| {
            slot.state
                .review_results
                .iter()
                .filter(|r| !r.approved)
                .map(|r| format!("- (iteration {}) {}", r.iteration, r.feedback))
                .collect::<Vec<_>>()
                .join("\n")
        });
        let feedback = feedback.filter(|f| !f.is_empty());

        let request = BackendRequest::new(
            BackendRole::Planner,
            prompts::PLANNER_SYSTEM,
            prompts::plan(&context, codebase.as_deref(), feedback.as_deref()),
        )
        .with_temperature(0.3)
        .streaming();

        let task_id = slot.state.task_id.clone();
        match self.stream_with_retries(&request, Stage::Plan, &task_id, sink).await {
            Ok(plan) => {
                let plan = plan.trim().to_string();
                slot.compressor.add_message(MessageRole::Assistant, format!("Plan:\n{plan}"));
                slot.state.plan = Some(plan);
                advance(&mut slot.state, Stage::Generate, None)
            }
            Err(e) => Self::fail(&mut slot.state, format!("planning failed: {e}")),
        }
    }

    /// File contents and symbol references named in the plan.
    async fn tool_context(&self, plan: &str) -> String {
        let mut sections = Vec::new();
        for path in referenced_paths(plan, MAX_TOOL_LOOKUPS) {
            match self.tools.read_file(&path).await {
                Ok(text) => sections.push(format!("### {path}\n```\n{text}\n```")),
                Err(e) => debug!(path, error = %e, "read_file skipped"),
            }
        }
        for symbol in referenced_symbols(plan, MAX_TOOL_LOOKUPS) {
            match self.tools.find_references(&symbol).await {
                Ok(hits) if !hits.is_empty() => {
                    sections.push(format!("### References to `{symbol}`\n{}", hits.join("\n")))
                }
                Ok(_) => {}
                Err(e) => debug!(symbol, error = %e, "find_references skipped"),
            }
        }
        sections.join("\n\n")
    }

    async fn generate(&self, slot: &mut TaskSlot, sink: &EventSink) -> Result<(), OrchestratorError> {
        self.compress(slot, sink).await;
        let context = slot.compressor.get_context(true);
        let plan = slot.state.plan.clone().unwrap_or_default();
        let tool_context = self.tool_context(&plan).await;
        let prompt = prompts::generate(&context, &plan, &tool_context);

        slot.state.generate_attempts += 1;
        let task_id = slot.state.task_id.clone();
        let n = self.config.num_candidates;
        let temps = &self.config.candidate_temperatures;

        let mut batch = self.generator.generate_candidates(prompts::CODER_SYSTEM, &prompt, n, temps).await;
        if batch.is_empty() {
            warn!(dropped = batch.dropped.len(), "no candidates survived, retrying generation once");
            for dropped in &batch.dropped {
                sink.emit(StageEvent::CandidateDropped {
                    task_id: task_id.clone(),
                    slot: dropped.slot,
                    error: dropped.error.to_string(),
                })
                .await;
            }
            batch = self.generator.generate_candidates(prompts::CODER_SYSTEM, &prompt, n, temps).await;
        }

        for dropped in &batch.dropped {
            sink.emit(StageEvent::CandidateDropped {
                task_id: task_id.clone(),
                slot: dropped.slot,
                error: dropped.error.to_string(),
            })
            .await;
        }

        if batch.is_empty() {
            let reason = "every candidate generation failed".to_string();
            if self.config.escalation_enabled && !slot.state.escalated {
                slot.state.escalated = true;
                slot.compressor.add_message(
                    MessageRole::User,
                    "Code generation failed for every candidate. Replan with a simpler approach.",
                );
                sink.emit(StageEvent::Escalated {
                    task_id,
                    reason: reason.clone(),
                })
                .await;
                return advance(&mut slot.state, Stage::Plan, Some(reason));
            }
            return Self::fail(&mut slot.state, reason);
        }

        sink.emit(StageEvent::CandidatesGenerated {
            task_id,
            count: batch.candidates.len(),
            dropped: batch.dropped.len(),
        })
        .await;
        slot.state.pending_candidates = batch.candidates;
        advance(&mut slot.state, Stage::Vote, None)
    }

    async fn vote(&self, slot: &mut TaskSlot, sink: &EventSink) -> Result<(), OrchestratorError> {
        if slot.state.pending_candidates.is_empty() {
            return advance(&mut slot.state, Stage::Generate, Some("no pending candidates".into()));
        }

        let task = prompts::vote_task(slot.state.effective_input(), slot.state.plan.as_deref());
        let candidates = std::mem::take(&mut slot.state.pending_candidates);
        let outcome = match self.voter.maker_vote(&task, &candidates, self.config.vote_k).await {
            Ok(outcome) => outcome,
            Err(e) => {
                slot.state.pending_candidates = candidates;
                return Self::fail(&mut slot.state, format!("voting failed: {e}"));
            }
        };

        let task_id = slot.state.task_id.clone();
        for ballot in &outcome.ballots {
            let event = match ballot {
                Ballot::Counted { voter, candidate_id } => StageEvent::VoteCast {
                    task_id: task_id.clone(),
                    voter: *voter,
                    candidate_id: candidate_id.clone(),
                },
                Ballot::Discarded { voter, reply } => StageEvent::VoteDiscarded {
                    task_id: task_id.clone(),
                    voter: *voter,
                    reason: OrchestratorError::VoteParseFailure(reply.clone()).to_string(),
                },
                Ballot::Failed { voter, error } => StageEvent::VoteDiscarded {
                    task_id: task_id.clone(),
                    voter: *voter,
                    reason: error.clone(),
                },
            };
            sink.emit(event).await;
        }
        sink.emit(StageEvent::ConsensusReached {
            task_id,
            winner_id: outcome.winner_id.clone(),
            decision: outcome.decision,
            votes: outcome.votes.clone(),
        })
        .await;

        let winner = &candidates[outcome.winner_index];
        slot.compressor.add_message(
            MessageRole::Assistant,
            format!("Selected candidate {} (iteration {}):\n{}", winner.id, slot.state.iteration_count, winner.text),
        );
        slot.state.code_iterations.push(CodeIteration {
            iteration: slot.state.iteration_count,
            candidate_id: winner.id.clone(),
            code: winner.text.clone(),
            candidates_considered: candidates.len(),
            votes: outcome.votes,
            created_at: chrono::Utc::now(),
        });
        advance(&mut slot.state, Stage::Review, None)
    }

    async fn review(&self, slot: &mut TaskSlot, sink: &EventSink) -> Result<(), OrchestratorError> {
        self.compress(slot, sink).await;
        let context = slot.compressor.get_context(true);
        let Some(code) = slot.state.last_code().map(str::to_string) else {
            return advance(&mut slot.state, Stage::Generate, Some("nothing to review".into()));
        };
        let plan = slot.state.plan.clone().unwrap_or_default();

        let test_output = match self.tools.run_tests().await {
            Ok(report) => Some(report.summary(MAX_TEST_OUTPUT_CHARS)),
            Err(e) => {
                debug!(tool = self.tools.name(), error = %e, "run_tests unavailable");
                None
            }
        };

        let request = BackendRequest::new(
            BackendRole::Reviewer,
            prompts::REVIEWER_SYSTEM,
            prompts::review(&context, &plan, &code, test_output.as_deref()),
        )
        .with_temperature(0.1);

        let reply = match self.call_with_retries(&request).await {
            Ok(reply) => reply,
            Err(e) => return Self::fail(&mut slot.state, format!("review failed: {e}")),
        };

        let verdict = parse_review(&reply);
        let iteration = slot.state.iteration_count;
        slot.state.review_results.push(ReviewResult {
            iteration,
            approved: verdict.approved,
            feedback: verdict.feedback.clone(),
            test_output,
            created_at: chrono::Utc::now(),
        });
        sink.emit(StageEvent::ReviewVerdict {
            task_id: slot.state.task_id.clone(),
            iteration,
            approved: verdict.approved,
            feedback: verdict.feedback.clone(),
        })
        .await;

        if verdict.approved {
            slot.state.final_output = Some(code);
            return advance(&mut slot.state, Stage::Complete, None);
        }

        slot.compressor.add_message(
            MessageRole::User,
            format!("Reviewer feedback (iteration {iteration}):\n{}", verdict.feedback),
        );

        let max = self.config.max_iterations;
        if slot.state.iteration_count >= max {
            let message = OrchestratorError::IterationExhausted(max).to_string();
            return Self::fail(&mut slot.state, message);
        }

        slot.state.iteration_count += 1;
        // The replan takes the last slot of the budget, before the final attempt.
        if slot.state.iteration_count == max && self.config.escalation_enabled && !slot.state.escalated {
            slot.state.escalated = true;
            let reason = format!("rejected {} times, replanning", slot.state.iteration_count);
            sink.emit(StageEvent::Escalated {
                task_id: slot.state.task_id.clone(),
                reason: reason.clone(),
            })
            .await;
            return advance(&mut slot.state, Stage::Plan, Some(reason));
        }
        advance(&mut slot.state, Stage::Generate, Some("review rejected".into()))
    }
}
