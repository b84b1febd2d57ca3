//! Run state
//!
//! [`Context`] is the executor-owned map of step and input values. Steps only
//! ever see a [`ContextView`], a cheap read-only snapshot; new values are merged
//! back by the executor.
//!
//! [`WorkflowRunState`] is the persisted record of one execution. It is written
//! through [`StateStore`] after every status transition so that a suspended or
//! crashed run can be picked up by a later process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::workflow::StepType;

/// Mutable mapping of names to values; append/overwrite only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: Map<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Merge every entry of `other`, overwriting existing names
    pub fn extend(&mut self, other: Map<String, Value>) {
        for (k, v) in other {
            self.values.insert(k, v);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Snapshot for template evaluation and concurrent readers
    pub fn view(&self) -> ContextView {
        ContextView {
            values: Arc::new(self.values.clone()),
        }
    }
}

/// Read-only snapshot of a [`Context`]
#[derive(Debug, Clone, Default)]
pub struct ContextView {
    values: Arc<Map<String, Value>>,
}

impl ContextView {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// New view with extra bindings layered on top (loop variables, own output)
    pub fn with_bindings<I>(&self, bindings: I) -> ContextView
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut values = (*self.values).clone();
        for (k, v) in bindings {
            values.insert(k, v);
        }
        ContextView {
            values: Arc::new(values),
        }
    }
}

/// Status of an individual step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    InProgress,
    WaitingHitl,
    Completed,
    Skipped,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "PENDING",
            StepStatus::InProgress => "IN_PROGRESS",
            StepStatus::WaitingHitl => "WAITING_HITL",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Skipped => "SKIPPED",
            StepStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Recorded state of one step (or loop iteration `name[i]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepState {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            output: None,
            error: None,
        }
    }
}

/// Status of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    WaitingHitl,
    Completed,
    Failed,
}

/// Embedded post-fragment steps still owed once the outer step finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostBatch {
    /// Name of the embedded workflow
    pub workflow: String,
    /// Index of the first post step inside that workflow
    pub first_index: usize,
    /// Isolated context of the embedding
    pub context: Context,
}

/// A HITL gate that was suspended and awaits an external decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingHitl {
    pub step_index: usize,
    pub step_name: String,
    pub step_type: StepType,
    /// Extracted output; `null` when extraction failed
    pub output: Value,
    pub raw_output: String,
    #[serde(default)]
    pub validation_error: Option<String>,
    #[serde(default)]
    pub post: Vec<PostBatch>,
}

/// Persisted record of one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunState {
    pub run_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub current_step_index: usize,
    pub context: Context,
    pub steps: Vec<StepState>,
    #[serde(default)]
    pub pending_hitl: Option<PendingHitl>,
    #[serde(default)]
    pub rejected_step: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub run_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRunState {
    /// Create a fresh state with a new run id
    pub fn new(workflow_name: impl Into<String>, run_dir: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            workflow_name: workflow_name.into(),
            status: RunStatus::Running,
            current_step_index: 0,
            context: Context::new(),
            steps: Vec::new(),
            pending_hitl: None,
            rejected_step: None,
            error: None,
            run_dir: run_dir.into(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn state_path(&self) -> PathBuf {
        self.run_dir.join(STATE_FILE)
    }

    /// Record (or overwrite) the state of a named step
    pub fn record(&mut self, name: &str, status: StepStatus, output: Option<Value>, error: Option<String>) {
        let entry = StepState {
            name: name.to_string(),
            status,
            output,
            error,
        };
        match self.steps.iter_mut().find(|s| s.name == name) {
            Some(existing) => *existing = entry,
            None => self.steps.push(entry),
        }
        self.updated_at = Utc::now();
    }

    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Count of recorded steps per status
    pub fn summary(&self) -> HashMap<StepStatus, usize> {
        let mut counts = HashMap::new();
        for step in &self.steps {
            *counts.entry(step.status).or_insert(0) += 1;
        }
        counts
    }
}

/// File name of the persisted state inside a run directory
pub const STATE_FILE: &str = "state.json";

/// Atomic JSON persistence of [`WorkflowRunState`]
pub struct StateStore;

impl StateStore {
    /// Write the state to `<run_dir>/state.json` via a temp file and rename
    pub fn save(state: &WorkflowRunState) -> Result<PathBuf, WorkflowError> {
        let path = state.state_path();
        Self::save_to(state, &path)?;
        Ok(path)
    }

    pub fn save_to(state: &WorkflowRunState, path: &Path) -> Result<(), WorkflowError> {
        use std::io::Write;

        let dir = path
            .parent()
            .ok_or_else(|| WorkflowError::State(format!("no parent directory for {:?}", path)))?;
        std::fs::create_dir_all(dir).map_err(|e| WorkflowError::IoError(e.to_string()))?;

        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| WorkflowError::State(format!("failed to serialize state: {}", e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| WorkflowError::IoError(e.to_string()))?;
        tmp.write_all(&json)
            .map_err(|e| WorkflowError::IoError(e.to_string()))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| WorkflowError::IoError(e.to_string()))?;
        tmp.persist(path)
            .map_err(|e| WorkflowError::IoError(e.error.to_string()))?;

        tracing::debug!("Saved run state to {:?}", path);
        Ok(())
    }

    pub fn load(path: &Path) -> Result<WorkflowRunState, WorkflowError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WorkflowError::IoError(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content).map_err(|e| WorkflowError::ParseError {
            source_name: path.display().to_string(),
            message: e.to_string(),
        })
    }
}
