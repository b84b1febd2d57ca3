//! Workflow loading
//!
//! Definitions are discovered in four places, highest priority first:
//! 1. `<project>/.stepflow/workflows`
//! 2. extra directories from configuration
//! 3. `<config_dir>/stepflow/workflows`
//! 4. workflows bundled into the binary
//!
//! The registry is built bottom-up: bundled workflows first, then each higher
//! priority source replaces whole entries by name. A file that fails to parse
//! is skipped with a warning so one broken definition never hides the rest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::WorkflowError;
use crate::extract::compile_schema;
use crate::workflow::{
    InputDecl, IterSource, JoinMode, LocalPrompt, LoopSpec, OutputSpec, Step, StepKind,
    Workflow, WorkflowConfig, WorkflowSource, DEFAULT_MAX_ITERATIONS,
};

/// Definition files compiled into the binary
const BUNDLED: &[(&str, &str)] = &[
    ("context.yml", include_str!("../workflows/context.yml")),
    ("review.yml", include_str!("../workflows/review.yml")),
];

// ============================================================================
// Definition file format
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawWorkflow {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    config: WorkflowConfig,
    #[serde(default, alias = "inputs")]
    input: Vec<InputDecl>,
    #[serde(default)]
    prompts: BTreeMap<String, RawPrompt>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPrompt {
    #[serde(default, alias = "inputs")]
    input: Vec<InputDecl>,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    name: String,
    #[serde(default, alias = "prompt")]
    agent: Option<String>,
    #[serde(default)]
    bash: Option<String>,
    #[serde(default)]
    python: Option<String>,
    #[serde(default)]
    prompt_part: Option<String>,
    #[serde(default)]
    parallel: Option<RawParallel>,
    #[serde(default)]
    output: Option<OutputSpec>,
    #[serde(default)]
    hitl: bool,
    #[serde(default, rename = "if")]
    condition: Option<String>,
    #[serde(default, rename = "for")]
    for_each: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    repeat: Option<RawRepeat>,
    #[serde(default, rename = "while")]
    while_loop: Option<RawWhile>,
    #[serde(default)]
    join: Option<JoinMode>,
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawParallel {
    Group { steps: Vec<RawStep> },
    List(Vec<RawStep>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRepeat {
    until: String,
    #[serde(default)]
    max: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawWhile {
    Condition(String),
    Full {
        condition: String,
        #[serde(default)]
        max: Option<u32>,
    },
}

/// Serialization format of a definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Toml,
}

impl Format {
    /// Format implied by a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yml" | "yaml" => Some(Format::Yaml),
            "toml" => Some(Format::Toml),
            _ => None,
        }
    }
}

fn normalize_step(raw: RawStep) -> Result<Step, String> {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        return Err("step name must not be empty".to_string());
    }

    let mut kinds = Vec::new();
    if let Some(prompt) = raw.agent {
        kinds.push(("agent", StepKind::Agent { prompt }));
    }
    if let Some(command) = raw.bash {
        kinds.push(("bash", StepKind::Bash { command }));
    }
    if let Some(script) = raw.python {
        kinds.push(("python", StepKind::Python { script }));
    }
    if let Some(content) = raw.prompt_part {
        kinds.push(("prompt_part", StepKind::Fragment { content }));
    }
    if let Some(parallel) = raw.parallel {
        let members = match parallel {
            RawParallel::Group { steps } | RawParallel::List(steps) => steps,
        };
        if members.is_empty() {
            return Err(format!("parallel group '{}' has no steps", name));
        }
        let steps = members
            .into_iter()
            .map(normalize_step)
            .collect::<Result<Vec<_>, _>>()?;
        kinds.push(("parallel", StepKind::Parallel { steps }));
    }
    let kind = match kinds.len() {
        1 => kinds.remove(0).1,
        0 => {
            return Err(format!(
                "step '{}' must declare one of agent, bash, python, prompt_part, parallel",
                name
            ))
        }
        _ => {
            let found: Vec<_> = kinds.iter().map(|(k, _)| *k).collect();
            return Err(format!(
                "step '{}' declares more than one kind: {}",
                name,
                found.join(", ")
            ));
        }
    };

    let mut loops = Vec::new();
    if let Some(vars) = raw.for_each {
        if vars.is_empty() {
            return Err(format!("step '{}': 'for' must bind at least one variable", name));
        }
        let mut parsed = Vec::new();
        for (var, source) in vars {
            let source = match source {
                Value::Array(items) => IterSource::Literal(items),
                Value::String(expr) => IterSource::Expr(expr),
                other => {
                    return Err(format!(
                        "step '{}': 'for' variable '{}' must be a list or an expression, got {}",
                        name, var, other
                    ))
                }
            };
            parsed.push((var, source));
        }
        loops.push(LoopSpec::For { vars: parsed });
    }
    if let Some(repeat) = raw.repeat {
        loops.push(LoopSpec::Repeat {
            until: repeat.until,
            max: repeat.max.unwrap_or(DEFAULT_MAX_ITERATIONS),
        });
    }
    if let Some(while_loop) = raw.while_loop {
        let (condition, max) = match while_loop {
            RawWhile::Condition(condition) => (condition, None),
            RawWhile::Full { condition, max } => (condition, max),
        };
        loops.push(LoopSpec::While {
            condition,
            max: max.unwrap_or(DEFAULT_MAX_ITERATIONS),
        });
    }
    if loops.len() > 1 {
        let found: Vec<_> = loops.iter().map(LoopSpec::keyword).collect();
        return Err(format!(
            "step '{}' declares more than one loop: {}",
            name,
            found.join(", ")
        ));
    }
    let looping = loops.pop();

    if raw.join.is_some() && looping.is_none() {
        return Err(format!("step '{}': 'join' requires a loop", name));
    }

    if matches!(kind, StepKind::Parallel { .. }) {
        if raw.output.is_some() {
            return Err(format!("parallel group '{}' cannot declare 'output'", name));
        }
        if raw.hitl {
            return Err(format!("parallel group '{}' cannot declare 'hitl'", name));
        }
    }

    if let Some(schema) = raw.output.as_ref().and_then(|o| o.schema.as_ref()) {
        compile_schema(schema).map_err(|e| format!("step '{}': {}", name, e))?;
    }

    Ok(Step {
        name,
        kind,
        output: raw.output,
        hitl: raw.hitl,
        condition: raw.condition,
        looping,
        join: raw.join.unwrap_or_default(),
        hidden: raw.hidden,
        timeout_secs: raw.timeout,
    })
}

/// Parse and normalise one definition
pub fn parse_workflow(
    content: &str,
    format: Format,
    default_name: &str,
    source: WorkflowSource,
) -> Result<Workflow, WorkflowError> {
    let parse_error = |message: String| WorkflowError::ParseError {
        source_name: source.to_string(),
        message,
    };

    let raw: RawWorkflow = match format {
        Format::Yaml => serde_yaml::from_str(content).map_err(|e| parse_error(e.to_string()))?,
        Format::Toml => toml::from_str(content).map_err(|e| parse_error(e.to_string()))?,
    };

    let steps = raw
        .steps
        .into_iter()
        .map(normalize_step)
        .collect::<Result<Vec<_>, _>>()
        .map_err(parse_error)?;

    let local_prompts = raw
        .prompts
        .into_iter()
        .map(|(name, prompt)| LocalPrompt {
            name,
            inputs: prompt.input,
            content: prompt.content,
        })
        .collect();

    let name = raw
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| default_name.to_string());

    Ok(Workflow {
        name,
        description: raw.description.unwrap_or_default(),
        config: raw.config,
        inputs: raw.input,
        steps,
        local_prompts,
        source,
    })
}

/// Load a single definition file
pub fn load_file(path: &Path) -> Result<Workflow, WorkflowError> {
    let format = Format::from_path(path).ok_or_else(|| WorkflowError::ParseError {
        source_name: path.display().to_string(),
        message: "unsupported file extension".to_string(),
    })?;
    let content = std::fs::read_to_string(path)
        .map_err(|e| WorkflowError::IoError(format!("{}: {}", path.display(), e)))?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    parse_workflow(&content, format, stem, WorkflowSource::File(path.to_path_buf()))
}

/// Load every definition in a directory
///
/// Files are read in name order; when two files define the same workflow the
/// first one is kept. Unparsable files are logged and skipped.
pub fn load_dir(dir: &Path) -> BTreeMap<String, Workflow> {
    let mut workflows = BTreeMap::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if dir.exists() {
                tracing::warn!("Failed to read workflow directory {:?}: {}", dir, e);
            }
            return workflows;
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && Format::from_path(p).is_some())
        .collect();
    paths.sort();

    for path in paths {
        match load_file(&path) {
            Ok(workflow) => {
                if let Some(existing) = workflows.get(&workflow.name) {
                    tracing::warn!(
                        "Workflow '{}' in {:?} ignored, already defined by {}",
                        workflow.name,
                        path,
                        existing.source
                    );
                    continue;
                }
                workflows.insert(workflow.name.clone(), workflow);
            }
            Err(e) => {
                tracing::warn!("Failed to load workflow from {:?}: {}", path, e);
            }
        }
    }

    workflows
}

/// Workflows compiled into the binary
pub fn bundled_workflows() -> Vec<Workflow> {
    let mut workflows = Vec::new();
    for (file, content) in BUNDLED {
        let path = Path::new(file);
        let Some(format) = Format::from_path(path) else {
            continue;
        };
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(file);
        match parse_workflow(content, format, stem, WorkflowSource::Bundled(file.to_string())) {
            Ok(workflow) => workflows.push(workflow),
            Err(e) => tracing::warn!("Failed to load bundled workflow {}: {}", file, e),
        }
    }
    workflows
}

// ============================================================================
// Registry
// ============================================================================

/// Immutable name → workflow map shared by the executor
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<String, Arc<Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list; later entries replace earlier ones with the same name
    pub fn from_workflows(workflows: impl IntoIterator<Item = Workflow>) -> Self {
        let mut registry = Self::new();
        for workflow in workflows {
            registry.insert(workflow);
        }
        registry
    }

    pub fn insert(&mut self, workflow: Workflow) {
        self.workflows
            .insert(workflow.name.clone(), Arc::new(workflow));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Workflow>> {
        self.workflows.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.workflows.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Workflow>> {
        self.workflows.values()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Discovers workflows over the prioritised sources
#[derive(Debug, Clone)]
pub struct WorkflowLoader {
    project_dir: Option<PathBuf>,
    extra_dirs: Vec<PathBuf>,
    user_dir: Option<PathBuf>,
    bundled: bool,
}

impl WorkflowLoader {
    /// Loader for a project rooted at `project_root`
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_dir: Some(project_root.join(".stepflow").join("workflows")),
            extra_dirs: Vec::new(),
            user_dir: dirs::config_dir().map(|d| d.join("stepflow").join("workflows")),
            bundled: true,
        }
    }

    /// Loader with no sources at all
    pub fn empty() -> Self {
        Self {
            project_dir: None,
            extra_dirs: Vec::new(),
            user_dir: None,
            bundled: false,
        }
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    /// Add an extra directory; earlier extra directories take precedence
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extra_dirs.push(dir.into());
        self
    }

    pub fn with_user_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.user_dir = dir;
        self
    }

    pub fn with_bundled(mut self, bundled: bool) -> Self {
        self.bundled = bundled;
        self
    }

    /// Directories in priority order (highest first)
    pub fn sources(&self) -> Vec<PathBuf> {
        self.project_dir
            .iter()
            .chain(self.extra_dirs.iter())
            .chain(self.user_dir.iter())
            .cloned()
            .collect()
    }

    /// Load every source into a registry
    pub fn discover(&self) -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();

        if self.bundled {
            for workflow in bundled_workflows() {
                registry.insert(workflow);
            }
        }

        // Lowest priority first so that higher ones replace entries
        for dir in self.sources().iter().rev() {
            let found = load_dir(dir);
            if !found.is_empty() {
                tracing::debug!("Loaded {} workflow(s) from {:?}", found.len(), dir);
            }
            for (_, workflow) in found {
                registry.insert(workflow);
            }
        }

        tracing::info!("Discovered {} workflow(s)", registry.len());
        registry
    }
}
