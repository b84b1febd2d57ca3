//! Workflow execution engine
//!
//! Executes workflows with:
//! - Conditional steps, bounded loops and concurrent parallel groups
//! - Typed output extraction and schema validation
//! - Human review gates that can suspend the run and resume later
//! - Embedding of other workflows' prompt fragments
//!
//! Run state is persisted to `<runs_dir>/<workflow>/<run_id>/state.json` after
//! every status transition.

mod control;
mod embed;
mod run;

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::agent::AgentTransport;
use crate::config::EngineConfig;
use crate::error::{ExecutionError, ValidationError, WorkflowError};
use crate::extract::{OutputExtractor, StructuredExtractor};
use crate::hitl::{HitlHandler, HitlRequest, HitlResponse, HitlResult, InteractiveHitlHandler};
use crate::loader::WorkflowRegistry;
use crate::markers::{FileMarkerSink, MarkerSink, StepMarker};
use crate::reference::bind_values;
use crate::runner::{SubprocessRunner, TokioRunner};
use crate::state::{
    Context, PendingHitl, RunStatus, StateStore, StepStatus, WorkflowRunState,
};
use crate::template::{MiniJinjaRenderer, TemplateRenderer};
use crate::validator::Validator;
use crate::workflow::{Step, Workflow};

/// Maximum nesting of embedded workflows and local prompts
pub const MAX_EMBED_DEPTH: usize = 8;

/// Log file appended to when `log_workflow` is on
pub const WORKFLOW_LOG: &str = "workflow.log";

/// Directory created when `create_artifacts` is on
pub const ARTIFACTS_DIR: &str = "artifacts";

/// How a run ended (or paused)
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(WorkflowRunState),
    /// Waiting for a review decision; pass the state file to `resume`
    Suspended(WorkflowRunState),
    /// A reviewer rejected a step
    Rejected(WorkflowRunState),
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    pub fn state(&self) -> &WorkflowRunState {
        match self {
            RunOutcome::Completed(s) | RunOutcome::Suspended(s) | RunOutcome::Rejected(s) => s,
        }
    }

    pub fn into_state(self) -> WorkflowRunState {
        match self {
            RunOutcome::Completed(s) | RunOutcome::Suspended(s) | RunOutcome::Rejected(s) => s,
        }
    }
}

/// External collaborator guarding a shared workspace
#[async_trait]
pub trait WorkspaceClaimer: Send + Sync {
    async fn claim(&self, workflow: &str, run_id: &str) -> AnyResult<()>;
    async fn release(&self, workflow: &str, run_id: &str) -> AnyResult<()>;
}

/// Claimer that does nothing
pub struct NoopClaimer;

#[async_trait]
impl WorkspaceClaimer for NoopClaimer {
    async fn claim(&self, _workflow: &str, _run_id: &str) -> AnyResult<()> {
        Ok(())
    }

    async fn release(&self, _workflow: &str, _run_id: &str) -> AnyResult<()> {
        Ok(())
    }
}

/// Workflow execution engine
pub struct Executor {
    registry: Arc<WorkflowRegistry>,
    agent: Arc<dyn AgentTransport>,
    runner: Arc<dyn SubprocessRunner>,
    renderer: Arc<dyn TemplateRenderer>,
    extractor: Arc<dyn OutputExtractor>,
    hitl: Arc<dyn HitlHandler>,
    observers: Vec<Arc<dyn MarkerSink>>,
    claimer: Arc<dyn WorkspaceClaimer>,
    config: EngineConfig,
    workdir: PathBuf,
    /// `name@source` of workflows that passed validation
    validated: Mutex<HashSet<String>>,
}

impl Executor {
    /// Create an executor with default collaborators
    pub fn new(registry: Arc<WorkflowRegistry>, agent: Arc<dyn AgentTransport>) -> Self {
        let config = EngineConfig::default();
        Self {
            registry,
            agent,
            runner: Arc::new(TokioRunner::new(config.max_output_bytes)),
            renderer: Arc::new(MiniJinjaRenderer::new()),
            extractor: Arc::new(StructuredExtractor::new()),
            hitl: Arc::new(InteractiveHitlHandler),
            observers: Vec::new(),
            claimer: Arc::new(NoopClaimer),
            config,
            workdir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            validated: Mutex::new(HashSet::new()),
        }
    }

    /// Set engine settings; the default runner picks up the output limit
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.runner = Arc::new(TokioRunner::new(config.max_output_bytes));
        self.config = config;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn SubprocessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn OutputExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Set a custom review handler
    pub fn with_hitl_handler(mut self, handler: Arc<dyn HitlHandler>) -> Self {
        self.hitl = handler;
        self
    }

    /// Add a marker observer
    pub fn with_observer(mut self, sink: Arc<dyn MarkerSink>) -> Self {
        self.observers.push(sink);
        self
    }

    pub fn with_claimer(mut self, claimer: Arc<dyn WorkspaceClaimer>) -> Self {
        self.claimer = claimer;
        self
    }

    /// Working directory for subprocesses and relative run directories
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = dir.into();
        self
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Root under which run directories are created
    pub fn runs_root(&self) -> PathBuf {
        self.workdir.join(&self.config.runs_dir)
    }

    /// Validate once per definition; later calls hit the cache
    pub fn ensure_valid(&self, workflow: &Workflow) -> Result<(), ValidationError> {
        let key = format!("{}@{}", workflow.name, workflow.source);
        if self
            .validated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&key)
        {
            return Ok(());
        }
        Validator::new(&self.registry).validate(workflow)?;
        self.validated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);
        Ok(())
    }

    /// Run a registered workflow by name
    pub async fn run(&self, name: &str, args: Map<String, Value>) -> Result<RunOutcome, WorkflowError> {
        let workflow = self
            .registry
            .get(name)
            .ok_or_else(|| WorkflowError::NotFound(name.to_string()))?;
        self.execute(&workflow, args).await
    }

    /// Execute a workflow from its first step
    pub async fn execute(&self, workflow: &Workflow, args: Map<String, Value>) -> Result<RunOutcome, WorkflowError> {
        self.ensure_valid(workflow)?;

        let inputs = bind_values(&workflow.inputs, args).map_err(|e| ValidationError {
            workflow: workflow.name.clone(),
            problems: vec![e.to_string()],
        })?;

        let mut state = WorkflowRunState::new(&workflow.name, PathBuf::new());
        state.run_dir = self.runs_root().join(&workflow.name).join(&state.run_id);
        std::fs::create_dir_all(&state.run_dir).map_err(|e| WorkflowError::IoError(e.to_string()))?;

        state.context.extend(inputs);
        state.context.insert("run_id", Value::String(state.run_id.clone()));
        state.context.insert("workflow_name", Value::String(workflow.name.clone()));
        if workflow.config.create_artifacts {
            let artifacts = state.run_dir.join(ARTIFACTS_DIR);
            std::fs::create_dir_all(&artifacts).map_err(|e| WorkflowError::IoError(e.to_string()))?;
            state
                .context
                .insert("artifacts_dir", Value::String(artifacts.display().to_string()));
        }
        for step in &workflow.steps {
            state.record(&step.name, StepStatus::Pending, None, None);
        }

        tracing::info!(
            "Starting workflow '{}' (run {}) in {:?}",
            workflow.name,
            state.run_id,
            state.run_dir
        );

        let run = self.run_ctx(workflow, state);
        run.save()?;
        run.log_line(&format!("run started: {}", workflow.name));

        let workflow = Arc::new(workflow.clone());
        self.with_claim(&workflow, &run, self.drive(&run, &workflow, 0)).await
    }

    /// Continue a persisted run
    ///
    /// A run waiting for review applies `decision`, or asks the configured
    /// handler again when none is given. A run that was interrupted while
    /// `running` restarts at its current step.
    pub async fn resume(&self, state_path: &Path, decision: Option<HitlResult>) -> Result<RunOutcome, WorkflowError> {
        let state = StateStore::load(state_path)?;
        match state.status {
            RunStatus::WaitingHitl | RunStatus::Running => {}
            RunStatus::Completed | RunStatus::Failed => {
                return Err(WorkflowError::State(format!(
                    "run {} has already finished ({:?})",
                    state.run_id, state.status
                )))
            }
        }

        let workflow = self
            .registry
            .get(&state.workflow_name)
            .ok_or_else(|| WorkflowError::NotFound(state.workflow_name.clone()))?;
        self.ensure_valid(&workflow)?;

        tracing::info!("Resuming workflow '{}' (run {})", state.workflow_name, state.run_id);
        let run = self.run_ctx(&workflow, state);
        run.log_line("run resumed");

        let fut = async {
            let pending = run.update(|s| s.pending_hitl.take());
            let start = match pending {
                Some(pending) => match self.settle_pending(&run, &workflow, pending, decision).await? {
                    Settled::Continue(next) => next,
                    Settled::Done(outcome) => return Ok(outcome),
                },
                None if decision.is_some() => {
                    return Err(WorkflowError::State(
                        "run has no pending review to decide".to_string(),
                    ))
                }
                None => run.snapshot().current_step_index,
            };
            self.drive(&run, &workflow, start).await
        };
        self.with_claim(&workflow, &run, fut).await
    }

    async fn with_claim<F>(&self, workflow: &Workflow, run: &RunCtx, fut: F) -> Result<RunOutcome, WorkflowError>
    where
        F: std::future::Future<Output = Result<RunOutcome, WorkflowError>>,
    {
        if !workflow.config.claim_workspace {
            return fut.await;
        }
        self.claimer
            .claim(&workflow.name, &run.run_id)
            .await
            .map_err(|e| WorkflowError::State(format!("failed to claim workspace: {}", e)))?;
        let outcome = fut.await;
        if let Err(e) = self.claimer.release(&workflow.name, &run.run_id).await {
            tracing::warn!("Failed to release workspace for run {}: {}", run.run_id, e);
        }
        outcome
    }

    fn run_ctx(&self, workflow: &Workflow, state: WorkflowRunState) -> RunCtx {
        let mut sinks: Vec<Arc<dyn MarkerSink>> = vec![Arc::new(FileMarkerSink::new(&state.run_dir))];
        sinks.extend(self.observers.iter().cloned());
        RunCtx {
            run_id: state.run_id.clone(),
            run_dir: state.run_dir.clone(),
            workflow_name: state.workflow_name.clone(),
            log_path: workflow
                .config
                .log_workflow
                .then(|| state.run_dir.join(WORKFLOW_LOG)),
            state: Mutex::new(state),
            sinks,
        }
    }

    /// Apply a review decision to a suspended gate
    async fn settle_pending(
        &self,
        run: &RunCtx,
        workflow: &Arc<Workflow>,
        pending: PendingHitl,
        decision: Option<HitlResult>,
    ) -> Result<Settled, WorkflowError> {
        let decision = match decision {
            Some(decision) => decision,
            None => {
                let request = HitlRequest {
                    workflow_name: workflow.name.clone(),
                    step_name: pending.step_name.clone(),
                    step_type: pending.step_type,
                    output: pending.output.clone(),
                    raw_output: pending.raw_output.clone(),
                    validation_error: pending.validation_error.clone(),
                    can_suspend: true,
                };
                match self.hitl.prompt(&request).await {
                    HitlResponse::Decided(decision) => decision,
                    HitlResponse::Suspend => {
                        run.update(|s| {
                            s.status = RunStatus::WaitingHitl;
                            s.pending_hitl = Some(pending);
                        });
                        run.save()?;
                        return Ok(Settled::Done(RunOutcome::Suspended(run.snapshot())));
                    }
                }
            }
        };

        let step = workflow
            .steps
            .get(pending.step_index)
            .ok_or_else(|| WorkflowError::State(format!("step index {} out of range", pending.step_index)))?;
        let scope = Scope::top(workflow.clone(), pending.step_index);

        let value = match decision {
            HitlResult::Reject => {
                tracing::info!("Step '{}' rejected", pending.step_name);
                return Ok(Settled::Done(self.finish_rejected(run, &pending.step_name)?));
            }
            HitlResult::Accept => accepted_value(&pending.output, &pending.raw_output, pending.validation_error.is_some()),
            HitlResult::Edit(map) => Value::Object(map),
        };

        run.update(|s| s.status = RunStatus::Running);
        self.transition(run, &scope, step, &pending.step_name, StepStatus::Completed, Some(value.clone()), None)?;
        run.update(|s| s.context.insert(step.name.clone(), value));

        if let Err(e) = self.run_post_batches(run, &scope, &pending.step_name, pending.post).await {
            return Err(self.finish_failed(run, step, &scope, e));
        }
        run.update(|s| s.current_step_index = pending.step_index + 1);
        run.save()?;
        Ok(Settled::Continue(pending.step_index + 1))
    }

    /// Drive top-level steps from `start` until completion, suspension,
    /// rejection or failure
    async fn drive(&self, run: &RunCtx, workflow: &Arc<Workflow>, start: usize) -> Result<RunOutcome, WorkflowError> {
        for index in start..workflow.steps.len() {
            let step = &workflow.steps[index];
            run.update(|s| {
                s.current_step_index = index;
                s.status = RunStatus::Running;
            });
            run.save()?;

            let scope = Scope::top(workflow.clone(), index);
            let view = run.snapshot().context.view();
            tracing::info!("[Step {}/{}] {}", index + 1, workflow.steps.len(), step.name);

            match self.run_step(run, &scope, step, view).await {
                Ok(StepFlow::Completed(value)) => {
                    run.update(|s| {
                        for (name, member) in value.members {
                            s.context.insert(name, member);
                        }
                        s.context.insert(step.name.clone(), value.value);
                    });
                    run.save()?;
                }
                Ok(StepFlow::Skipped) => {}
                Ok(StepFlow::Rejected(name)) => {
                    return self.finish_rejected(run, &name);
                }
                Ok(StepFlow::Suspend(pending)) => {
                    tracing::info!("Run {} suspended at '{}'", run.run_id, pending.step_name);
                    run.update(|s| {
                        s.status = RunStatus::WaitingHitl;
                        s.pending_hitl = Some(pending);
                    });
                    run.save()?;
                    run.log_line("run suspended");
                    return Ok(RunOutcome::Suspended(run.snapshot()));
                }
                Err(e) => {
                    return Err(self.finish_failed(run, step, &scope, e));
                }
            }
        }

        run.update(|s| {
            s.status = RunStatus::Completed;
            s.current_step_index = workflow.steps.len();
        });
        run.save()?;
        run.log_line("run completed");
        tracing::info!("Workflow '{}' completed (run {})", workflow.name, run.run_id);
        Ok(RunOutcome::Completed(run.snapshot()))
    }

    fn finish_rejected(&self, run: &RunCtx, step_name: &str) -> Result<RunOutcome, WorkflowError> {
        run.update(|s| {
            s.status = RunStatus::Failed;
            s.rejected_step = Some(step_name.to_string());
            s.pending_hitl = None;
        });
        run.save()?;
        run.log_line(&format!("run rejected at {}", step_name));
        tracing::info!("Run {} stopped: '{}' rejected", run.run_id, step_name);
        Ok(RunOutcome::Rejected(run.snapshot()))
    }

    fn finish_failed(&self, run: &RunCtx, step: &Step, scope: &Scope, err: ExecutionError) -> WorkflowError {
        tracing::error!("Workflow '{}' failed: {}", run.workflow_name, err);
        let already_failed = run
            .snapshot()
            .step(&step.name)
            .is_some_and(|s| s.status == StepStatus::Failed);
        if !already_failed {
            if let Err(e) = self.transition(
                run,
                scope,
                step,
                &step.name,
                StepStatus::Failed,
                None,
                Some(err.to_string()),
            ) {
                tracing::warn!("Failed to record failure of '{}': {}", step.name, e);
            }
        }
        run.update(|s| {
            s.status = RunStatus::Failed;
            s.error = Some(err.to_string());
        });
        if let Err(e) = run.save() {
            tracing::warn!("Failed to persist failed run {}: {}", run.run_id, e);
        }
        run.log_line("run failed");
        WorkflowError::Execution(err)
    }

    /// Record a step status, persist and notify observers
    fn transition(
        &self,
        run: &RunCtx,
        scope: &Scope,
        step: &Step,
        record_name: &str,
        status: StepStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<(), ExecutionError> {
        run.update(|s| s.record(record_name, status, output.clone(), error.clone()));
        run.save()?;
        run.log_line(&format!("{} {}", record_name, status));

        let marker = StepMarker {
            workflow_name: run.workflow_name.clone(),
            step_name: record_name.to_string(),
            status,
            output,
            step_index: scope.index,
            total_steps: scope.workflow.steps.len(),
            is_pre_prompt_step: scope.is_pre,
            step_type: step.step_type(),
            step_source: scope.workflow.source.to_string(),
            error,
            hidden: step.hidden,
            embedded_workflow_name: scope.embedded.clone(),
        };
        for sink in &run.sinks {
            sink.emit(&marker);
        }
        Ok(())
    }
}

fn accepted_value(output: &Value, raw: &str, failed_extraction: bool) -> Value {
    if failed_extraction || output.is_null() {
        Value::String(raw.trim().to_string())
    } else {
        output.clone()
    }
}

enum Settled {
    Continue(usize),
    Done(RunOutcome),
}

/// Per-run mutable state shared by the steps of one execution
pub(crate) struct RunCtx {
    run_id: String,
    run_dir: PathBuf,
    workflow_name: String,
    log_path: Option<PathBuf>,
    state: Mutex<WorkflowRunState>,
    sinks: Vec<Arc<dyn MarkerSink>>,
}

impl RunCtx {
    fn update<R>(&self, f: impl FnOnce(&mut WorkflowRunState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    fn snapshot(&self) -> WorkflowRunState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn save(&self) -> Result<(), ExecutionError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        StateStore::save(&state)
            .map(|_| ())
            .map_err(|e| ExecutionError::Persistence(e.to_string()))
    }

    fn log_line(&self, line: &str) {
        let Some(path) = &self.log_path else {
            return;
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{} {}", chrono::Utc::now().to_rfc3339(), line));
        if let Err(e) = result {
            tracing::warn!("Failed to append to {:?}: {}", path, e);
        }
    }

    fn artifacts_dir(&self) -> Option<PathBuf> {
        let dir = self.run_dir.join(ARTIFACTS_DIR);
        dir.is_dir().then_some(dir)
    }
}

/// Where a step runs: which workflow, at which index, and what it may do
#[derive(Clone)]
pub(crate) struct Scope {
    workflow: Arc<Workflow>,
    /// Name of the embedded workflow, `None` at top level
    embedded: Option<String>,
    index: usize,
    is_pre: bool,
    /// Why suspension is impossible here (`None` at top level)
    nested: Option<&'static str>,
    allow_hitl: bool,
    depth: usize,
}

impl Scope {
    fn top(workflow: Arc<Workflow>, index: usize) -> Self {
        Self {
            workflow,
            embedded: None,
            index,
            is_pre: false,
            nested: None,
            allow_hitl: true,
            depth: 0,
        }
    }

    fn embedded(workflow: Arc<Workflow>, is_pre: bool, depth: usize) -> Self {
        Self {
            embedded: Some(workflow.name.clone()),
            workflow,
            index: 0,
            is_pre,
            nested: Some("an embedded workflow"),
            allow_hitl: false,
            depth,
        }
    }

    fn at(&self, index: usize) -> Self {
        Self {
            index,
            ..self.clone()
        }
    }

    fn nested(&self, reason: &'static str) -> Self {
        Self {
            nested: self.nested.or(Some(reason)),
            ..self.clone()
        }
    }

    /// Name under which a step is recorded
    fn qualified(&self, step: &str) -> String {
        match &self.embedded {
            Some(sub) => format!("{}/{}", sub, step),
            None => step.to_string(),
        }
    }
}

/// Result value of a step
#[derive(Debug, Clone)]
pub(crate) struct StepValue {
    value: Value,
    /// Outputs of parallel members, merged into context under their names
    members: Vec<(String, Value)>,
}

impl StepValue {
    fn single(value: Value) -> Self {
        Self {
            value,
            members: Vec::new(),
        }
    }
}

/// What happened to a step
pub(crate) enum StepFlow {
    Completed(StepValue),
    Skipped,
    /// Carries the name of the rejected step
    Rejected(String),
    Suspend(PendingHitl),
}

/// Environment passed to subprocess steps
fn subprocess_env(run: &RunCtx) -> Vec<(String, String)> {
    let mut env = vec![
        ("STEPFLOW_RUN_ID".to_string(), run.run_id.clone()),
        ("STEPFLOW_RUN_DIR".to_string(), run.run_dir.display().to_string()),
    ];
    if let Some(dir) = run.artifacts_dir() {
        env.push(("STEPFLOW_ARTIFACTS_DIR".to_string(), dir.display().to_string()));
    }
    env
}

/// Base context of an embedded workflow: bound arguments plus reserved names
fn embedded_context(run: &RunCtx, workflow: &Workflow, bound: Map<String, Value>) -> Context {
    let mut ctx = Context::from_map(bound);
    ctx.insert("run_id", Value::String(run.run_id.clone()));
    ctx.insert("workflow_name", Value::String(workflow.name.clone()));
    if let Some(dir) = run.artifacts_dir() {
        ctx.insert("artifacts_dir", Value::String(dir.display().to_string()));
    }
    ctx
}
