//! Workflow definitions and primitives
//!
//! A workflow is an ordered list of steps. Each step does one kind of work
//! (agent prompt, shell command, python script, reusable prompt fragment or a
//! parallel group) and may carry control flow around it:
//! - `if` conditions
//! - bounded loops (`for`, `repeat`, `while`) whose outputs are combined by a [`JoinMode`]
//! - typed output validation
//! - human review gates (`hitl`)
//!
//! Workflows are built once by the loader and never mutated afterwards.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Names of local prompts must start with this marker
pub const LOCAL_PROMPT_PREFIX: char = '_';

/// Loop cap used when a definition omits `max`
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Context names the executor binds on its own
pub const RESERVED_NAMES: &[&str] = &["run_id", "workflow_name", "artifacts_dir"];

/// Independent switches from the `config` block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Claim the external workspace before the first step
    #[serde(default)]
    pub claim_workspace: bool,

    /// Create an `artifacts/` directory in the run directory
    #[serde(default)]
    pub create_artifacts: bool,

    /// Append a line to `workflow.log` on every step transition
    #[serde(default)]
    pub log_workflow: bool,
}

/// Semantic type of a declared input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    String,
    /// Single line of text
    Line,
    /// Multi-line text
    Text,
    Path,
    Int,
    Float,
    Bool,
    /// Arbitrary structured value given as JSON
    Json,
}

impl InputType {
    /// Coerce a supplied value into this type
    pub fn coerce(&self, value: Value) -> Result<Value, String> {
        match (self, value) {
            (InputType::Int, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("expected an integer, got '{}'", s)),
            (InputType::Int, v @ Value::Number(_)) if v.is_i64() || v.is_u64() => Ok(v),
            (InputType::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| format!("expected a number, got '{}'", s)),
            (InputType::Float, v @ Value::Number(_)) => Ok(v),
            (InputType::Bool, Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(Value::Bool(true)),
                "false" | "no" | "0" | "off" => Ok(Value::Bool(false)),
                _ => Err(format!("expected a boolean, got '{}'", s)),
            },
            (InputType::Bool, v @ Value::Bool(_)) => Ok(v),
            (InputType::Json, Value::String(s)) => {
                serde_json::from_str(&s).map_err(|e| format!("expected JSON: {}", e))
            }
            (InputType::Json, v) => Ok(v),
            (InputType::Line, Value::String(s)) if s.contains('\n') => {
                Err("expected a single line of text".to_string())
            }
            (InputType::String | InputType::Line | InputType::Text | InputType::Path, v) => {
                Ok(match v {
                    Value::String(s) => Value::String(s),
                    other => Value::String(other.to_string()),
                })
            }
            (ty, v) => Err(format!("expected {:?}, got {}", ty, v)),
        }
    }
}

/// A declared input of a workflow or local prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDecl {
    pub name: String,

    #[serde(rename = "type", default)]
    pub ty: InputType,

    #[serde(default)]
    pub default: Option<Value>,
}

impl InputDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: InputType::default(),
            default: None,
        }
    }

    pub fn with_type(mut self, ty: InputType) -> Self {
        self.ty = ty;
        self
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// A reusable fragment scoped to one workflow, referenced as `#_name(...)`
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPrompt {
    pub name: String,
    pub inputs: Vec<InputDecl>,
    pub content: String,
}

/// How the raw result of a step is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// A structured payload must be extractable from the raw text
    #[default]
    Json,
    /// The raw text itself is the output
    Text,
}

/// Expected shape of a step's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(rename = "type", default)]
    pub ty: OutputType,

    /// JSON Schema the output must satisfy
    #[serde(default)]
    pub schema: Option<Value>,
}

impl OutputSpec {
    pub fn json(schema: Value) -> Self {
        Self {
            ty: OutputType::Json,
            schema: Some(schema),
        }
    }
}

/// How per-iteration outputs of a loop are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinMode {
    /// Ordered list of iteration outputs
    #[default]
    #[serde(rename = "array")]
    Array,
    /// Iteration outputs concatenated as text
    #[serde(rename = "text")]
    Text,
    /// Shallow merge of iteration output maps
    #[serde(rename = "object")]
    Object,
    /// Only the final iteration's output
    #[serde(rename = "lastOf")]
    LastOf,
}

/// Where the values of a `for` variable come from
#[derive(Debug, Clone, PartialEq)]
pub enum IterSource {
    /// A list written in the definition
    Literal(Vec<Value>),
    /// An expression (or template) evaluated against the context
    Expr(String),
}

/// Loop configuration of a step
#[derive(Debug, Clone, PartialEq)]
pub enum LoopSpec {
    /// Lockstep iteration over one or more lists
    For { vars: Vec<(String, IterSource)> },
    /// Body first, then `until`; at least one iteration
    Repeat { until: String, max: u32 },
    /// `condition` checked before every iteration; zero iterations is legal
    While { condition: String, max: u32 },
}

impl LoopSpec {
    /// Keyword used in definitions
    pub fn keyword(&self) -> &'static str {
        match self {
            LoopSpec::For { .. } => "for",
            LoopSpec::Repeat { .. } => "repeat",
            LoopSpec::While { .. } => "while",
        }
    }

    /// Variables bound inside the loop body
    pub fn loop_vars(&self) -> Vec<&str> {
        match self {
            LoopSpec::For { vars } => vars.iter().map(|(v, _)| v.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

/// The work a step performs
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// Render a prompt and invoke the agent
    Agent { prompt: String },
    /// Run a shell command
    Bash { command: String },
    /// Run a python script
    Python { script: String },
    /// Reusable prompt fragment other workflows may embed
    Fragment { content: String },
    /// Members run concurrently against one context snapshot
    Parallel { steps: Vec<Step> },
}

/// Tag of a [`StepKind`], used in markers and review requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Agent,
    Bash,
    Python,
    PromptPart,
    Parallel,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepType::Agent => "agent",
            StepType::Bash => "bash",
            StepType::Python => "python",
            StepType::PromptPart => "prompt_part",
            StepType::Parallel => "parallel",
        };
        f.write_str(s)
    }
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Agent { .. } => StepType::Agent,
            StepKind::Bash { .. } => StepType::Bash,
            StepKind::Python { .. } => StepType::Python,
            StepKind::Fragment { .. } => StepType::PromptPart,
            StepKind::Parallel { .. } => StepType::Parallel,
        }
    }
}

/// A single step in a workflow
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    pub output: Option<OutputSpec>,
    pub hitl: bool,
    pub condition: Option<String>,
    pub looping: Option<LoopSpec>,
    pub join: JoinMode,
    /// Presentation hint for the UI only
    pub hidden: bool,
    /// Overrides the engine's subprocess timeout (seconds)
    pub timeout_secs: Option<u64>,
}

impl Step {
    fn with_kind(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            output: None,
            hitl: false,
            condition: None,
            looping: None,
            join: JoinMode::default(),
            hidden: false,
            timeout_secs: None,
        }
    }

    /// Create an agent step
    pub fn agent(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::with_kind(name, StepKind::Agent { prompt: prompt.into() })
    }

    /// Create a shell step
    pub fn bash(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_kind(name, StepKind::Bash { command: command.into() })
    }

    /// Create a python step
    pub fn python(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self::with_kind(name, StepKind::Python { script: script.into() })
    }

    /// Create a fragment step
    pub fn fragment(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_kind(name, StepKind::Fragment { content: content.into() })
    }

    /// Create a parallel group
    pub fn parallel(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self::with_kind(name, StepKind::Parallel { steps })
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_hitl(mut self) -> Self {
        self.hitl = true;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_for(mut self, var: impl Into<String>, values: Vec<Value>) -> Self {
        let entry = (var.into(), IterSource::Literal(values));
        match &mut self.looping {
            Some(LoopSpec::For { vars }) => vars.push(entry),
            _ => self.looping = Some(LoopSpec::For { vars: vec![entry] }),
        }
        self
    }

    pub fn with_repeat(mut self, until: impl Into<String>, max: u32) -> Self {
        self.looping = Some(LoopSpec::Repeat {
            until: until.into(),
            max,
        });
        self
    }

    pub fn with_while(mut self, condition: impl Into<String>, max: u32) -> Self {
        self.looping = Some(LoopSpec::While {
            condition: condition.into(),
            max,
        });
        self
    }

    pub fn with_join(mut self, join: JoinMode) -> Self {
        self.join = join;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    pub fn is_fragment(&self) -> bool {
        matches!(self.kind, StepKind::Fragment { .. })
    }

    /// The step's main template text, if it has one
    pub fn content(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Agent { prompt } => Some(prompt),
            StepKind::Bash { command } => Some(command),
            StepKind::Python { script } => Some(script),
            StepKind::Fragment { content } => Some(content),
            StepKind::Parallel { .. } => None,
        }
    }

    /// Members of a parallel group (empty for other kinds)
    pub fn members(&self) -> &[Step] {
        match &self.kind {
            StepKind::Parallel { steps } => steps,
            _ => &[],
        }
    }
}

/// Where a workflow definition came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowSource {
    /// Compiled into the binary
    Bundled(String),
    File(PathBuf),
    /// Constructed in code
    Inline,
}

impl fmt::Display for WorkflowSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowSource::Bundled(name) => write!(f, "bundled:{}", name),
            WorkflowSource::File(path) => write!(f, "{}", path.display()),
            WorkflowSource::Inline => f.write_str("inline"),
        }
    }
}

/// A complete workflow definition
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    /// Unique identifier for this workflow
    pub name: String,

    /// Human-readable description
    pub description: String,

    pub config: WorkflowConfig,

    pub inputs: Vec<InputDecl>,

    /// Workflow steps to execute
    pub steps: Vec<Step>,

    pub local_prompts: Vec<LocalPrompt>,

    pub source: WorkflowSource,
}

impl Workflow {
    /// Create a new workflow
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            config: WorkflowConfig::default(),
            inputs: Vec::new(),
            steps: Vec::new(),
            local_prompts: Vec::new(),
            source: WorkflowSource::Inline,
        }
    }

    /// Set the description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_input(mut self, input: InputDecl) -> Self {
        self.inputs.push(input);
        self
    }

    /// Add a step
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_local_prompt(
        mut self,
        name: impl Into<String>,
        inputs: Vec<InputDecl>,
        content: impl Into<String>,
    ) -> Self {
        self.local_prompts.push(LocalPrompt {
            name: name.into(),
            inputs,
            content: content.into(),
        });
        self
    }

    pub fn with_source(mut self, source: WorkflowSource) -> Self {
        self.source = source;
        self
    }

    /// Position of the fragment step in the top-level step list
    pub fn fragment_index(&self) -> Option<usize> {
        self.steps.iter().position(Step::is_fragment)
    }

    pub fn local_prompt(&self, name: &str) -> Option<&LocalPrompt> {
        self.local_prompts.iter().find(|p| p.name == name)
    }

    pub fn input(&self, name: &str) -> Option<&InputDecl> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// All steps, parallel members included, in declaration order
    pub fn all_steps(&self) -> Vec<&Step> {
        fn walk<'a>(steps: &'a [Step], out: &mut Vec<&'a Step>) {
            for step in steps {
                out.push(step);
                walk(step.members(), out);
            }
        }
        let mut out = Vec::new();
        walk(&self.steps, &mut out);
        out
    }
}
