//! Declarative multi-step workflow engine
//!
//! This crate provides:
//! - YAML/TOML workflow definitions with agent, bash, python and prompt-fragment steps
//! - Layered workflow discovery (project, user, bundled)
//! - Static validation of variable flow and `#name(args)` references
//! - An executor with conditions, bounded loops, parallel groups and review gates
//! - Persisted, resumable run state and per-step markers
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stepflow::{Executor, OllamaAgent, WorkflowLoader};
//!
//! let registry = WorkflowLoader::new(&std::env::current_dir()?).discover();
//! let agent = OllamaAgent::new("http://localhost:11434", "llama3.1:8b");
//! let executor = Executor::new(Arc::new(registry), Arc::new(agent));
//!
//! let outcome = executor.run("review", serde_json::Map::new()).await?;
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod executor;
pub mod extract;
pub mod hitl;
pub mod loader;
pub mod markers;
pub mod reference;
pub mod runner;
pub mod state;
pub mod template;
pub mod validator;
pub mod workflow;

pub use agent::{AgentTransport, InvocationMetadata, OllamaAgent};
pub use config::StepflowConfig;
pub use error::{ExecutionError, ValidationError, WorkflowError};
pub use executor::{Executor, NoopClaimer, RunOutcome, WorkspaceClaimer};
pub use hitl::{HitlHandler, HitlRequest, HitlResponse, HitlResult};
pub use loader::{WorkflowLoader, WorkflowRegistry};
pub use markers::{MarkerSink, StepMarker};
pub use state::{RunStatus, StateStore, StepStatus, WorkflowRunState};
pub use validator::Validator;
pub use workflow::{Step, Workflow};
