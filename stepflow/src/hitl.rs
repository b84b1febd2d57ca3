//! Human-in-the-loop review gates
//!
//! A step with `hitl` pauses after producing its output and asks a
//! [`HitlHandler`] what to do with it. Handlers may accept, replace, reject or
//! (at top level only) suspend the run so the decision can be supplied later
//! through `resume`.

use std::io::{self, BufRead, Write};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::workflow::StepType;

/// Decision about a gated step's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "output", rename_all = "snake_case")]
pub enum HitlResult {
    /// Keep the output as produced
    Accept,
    /// Replace the output with this map
    Edit(Map<String, Value>),
    /// Stop the run
    Reject,
}

/// What a handler answered
#[derive(Debug, Clone, PartialEq)]
pub enum HitlResponse {
    Decided(HitlResult),
    /// Persist the run and return to the caller
    Suspend,
}

/// Everything a reviewer needs to decide
#[derive(Debug, Clone)]
pub struct HitlRequest {
    pub workflow_name: String,
    pub step_name: String,
    pub step_type: StepType,
    /// Extracted output (`null` when extraction failed)
    pub output: Value,
    pub raw_output: String,
    pub validation_error: Option<String>,
    /// False inside loops, parallel groups and embedded workflows
    pub can_suspend: bool,
}

impl HitlRequest {
    /// Text shown to a reviewer
    pub fn display(&self) -> String {
        let mut text = match &self.output {
            Value::Null => self.raw_output.clone(),
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        };
        if let Some(err) = &self.validation_error {
            text.push_str(&format!("\n\n[output validation failed: {}]", err));
        }
        text
    }
}

/// Trait for review strategies
#[async_trait]
pub trait HitlHandler: Send + Sync {
    async fn prompt(&self, request: &HitlRequest) -> HitlResponse;
}

/// Prompts on the terminal (default for interactive runs)
pub struct InteractiveHitlHandler;

impl InteractiveHitlHandler {
    fn ask(request: &HitlRequest) -> io::Result<HitlResponse> {
        let stdin = io::stdin();
        let mut stdout = io::stdout();

        println!("\n{}", "═".repeat(60));
        println!("  REVIEW: {}/{} ({})", request.workflow_name, request.step_name, request.step_type);
        println!("{}\n", "═".repeat(60));
        println!("{}\n", request.display());
        println!("{}", "─".repeat(60));

        println!("Options:");
        println!("  [y/yes]     - Accept and continue");
        println!("  [n/no]      - Reject and stop workflow");
        println!("  [e/edit]    - Replace the output with a JSON object");
        if request.can_suspend {
            println!("  [s/suspend] - Save the run and decide later");
        }
        println!();

        loop {
            print!("Your choice: ");
            stdout.flush()?;

            let mut input = String::new();
            stdin.lock().read_line(&mut input)?;
            let response = match input.trim().to_lowercase().as_str() {
                "y" | "yes" | "" => HitlResponse::Decided(HitlResult::Accept),
                "n" | "no" => HitlResponse::Decided(HitlResult::Reject),
                "s" | "suspend" if request.can_suspend => HitlResponse::Suspend,
                "e" | "edit" => {
                    println!("\nEnter a JSON object (end with empty line):");
                    let mut lines = Vec::new();
                    loop {
                        let mut line = String::new();
                        stdin.lock().read_line(&mut line)?;
                        if line.trim().is_empty() {
                            break;
                        }
                        lines.push(line);
                    }
                    match serde_json::from_str::<Map<String, Value>>(&lines.join("")) {
                        Ok(map) => HitlResponse::Decided(HitlResult::Edit(map)),
                        Err(e) => {
                            println!("Not a JSON object ({}), try again.", e);
                            continue;
                        }
                    }
                }
                _ => {
                    println!("Invalid input, treating as rejection for safety.");
                    HitlResponse::Decided(HitlResult::Reject)
                }
            };
            println!("\n{}", "═".repeat(60));
            return Ok(response);
        }
    }
}

#[async_trait]
impl HitlHandler for InteractiveHitlHandler {
    async fn prompt(&self, request: &HitlRequest) -> HitlResponse {
        let request = request.clone();
        match tokio::task::spawn_blocking(move || Self::ask(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!("Failed to read review decision: {}", e);
                HitlResponse::Decided(HitlResult::Reject)
            }
            Err(e) => {
                tracing::warn!("Review prompt task failed: {}", e);
                HitlResponse::Decided(HitlResult::Reject)
            }
        }
    }
}

/// Auto-accept handler (for CI)
pub struct AutoAcceptHitlHandler;

#[async_trait]
impl HitlHandler for AutoAcceptHitlHandler {
    async fn prompt(&self, request: &HitlRequest) -> HitlResponse {
        tracing::info!("[Review: {}] Auto-accepted", request.step_name);
        HitlResponse::Decided(HitlResult::Accept)
    }
}

/// Always reject handler
pub struct RejectHitlHandler;

#[async_trait]
impl HitlHandler for RejectHitlHandler {
    async fn prompt(&self, request: &HitlRequest) -> HitlResponse {
        tracing::info!("[Review: {}] Auto-rejected", request.step_name);
        HitlResponse::Decided(HitlResult::Reject)
    }
}

/// Suspends at every gate; decisions come through `resume`
pub struct SuspendHitlHandler;

#[async_trait]
impl HitlHandler for SuspendHitlHandler {
    async fn prompt(&self, request: &HitlRequest) -> HitlResponse {
        tracing::info!("[Review: {}] Suspending for external decision", request.step_name);
        HitlResponse::Suspend
    }
}
