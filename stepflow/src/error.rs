//! Error types for loading, validating and executing workflows

use std::fmt;

/// Errors surfaced by the public API
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error in {source_name}: {message}")]
    ParseError {
        source_name: String,
        message: String,
    },

    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("State error: {0}")]
    State(String),
}

impl WorkflowError {
    /// True when the failure was a subprocess exceeding its time bound
    pub fn is_timeout(&self) -> bool {
        matches!(self, WorkflowError::Execution(e) if e.is_timeout())
    }
}

/// Static problems found before a run; always the full list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub workflow: String,
    pub problems: Vec<String>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "workflow '{}' failed validation ({} problem{}):",
            self.workflow,
            self.problems.len(),
            if self.problems.len() == 1 { "" } else { "s" }
        )?;
        for problem in &self.problems {
            write!(f, "\n  - {}", problem)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Fatal runtime failures. Every variant names the step that failed.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Malformed step discovered only at run time, or an engine-level failure
    #[error("step '{step}': {message}")]
    Step { step: String, message: String },

    #[error("step '{step}': template error: {message}")]
    Template { step: String, message: String },

    #[error("step '{step}': agent invocation failed: {message}")]
    Agent { step: String, message: String },

    #[error("step '{step}': command exited with status {code}: {detail}")]
    NonZeroExit {
        step: String,
        code: i32,
        detail: String,
        stdout: String,
        stderr: String,
    },

    #[error("step '{step}': output validation failed: {reason}\n--- raw output ---\n{raw_output}")]
    OutputValidation {
        step: String,
        reason: String,
        raw_output: String,
    },

    #[error("step '{step}': loop did not converge after {max} iterations")]
    LoopDidNotConverge { step: String, max: u32 },

    #[error("step '{step}': timed out after {secs}s")]
    Timeout { step: String, secs: u64 },

    #[error("embedded workflow '{workflow}' failed: {source}")]
    Embedded {
        workflow: String,
        #[source]
        source: Box<ExecutionError>,
    },

    #[error("step '{step}': embedded workflow is invalid: {source}")]
    InvalidEmbedded {
        step: String,
        #[source]
        source: ValidationError,
    },

    #[error("step '{step}': human review cannot be suspended inside {scope}")]
    SuspensionNotAllowed { step: String, scope: String },

    #[error("failed to persist run state: {0}")]
    Persistence(String),
}

impl ExecutionError {
    pub fn step(step: &str, message: impl Into<String>) -> Self {
        Self::Step {
            step: step.to_string(),
            message: message.into(),
        }
    }

    pub fn template(step: &str, err: impl fmt::Display) -> Self {
        Self::Template {
            step: step.to_string(),
            message: err.to_string(),
        }
    }

    /// True for subprocess timeouts, including ones raised by embedded steps
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Embedded { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Name of the step that failed, if the error is tied to one
    pub fn step_name(&self) -> Option<&str> {
        match self {
            Self::Step { step, .. }
            | Self::Template { step, .. }
            | Self::Agent { step, .. }
            | Self::NonZeroExit { step, .. }
            | Self::OutputValidation { step, .. }
            | Self::LoopDidNotConverge { step, .. }
            | Self::Timeout { step, .. }
            | Self::InvalidEmbedded { step, .. }
            | Self::SuspensionNotAllowed { step, .. } => Some(step),
            Self::Embedded { source, .. } => source.step_name(),
            Self::Persistence(_) => None,
        }
    }
}
