//! Running one step body and the review gate around it

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;

use super::{accepted_value, subprocess_env, Executor, RunCtx, Scope, StepFlow, StepValue};
use crate::agent::InvocationMetadata;
use crate::error::ExecutionError;
use crate::hitl::{HitlRequest, HitlResponse, HitlResult};
use crate::runner::{Invocation, RunnerError};
use crate::state::{ContextView, PendingHitl, PostBatch, RunStatus, StepStatus};
use crate::workflow::{Step, StepKind};

/// Raw result of a step body, before extraction
struct Produced {
    raw: String,
    /// Failure shown to the reviewer instead of aborting the run
    failure: Option<String>,
    post: Vec<PostBatch>,
    /// Fragments yield their rendered text unchanged
    verbatim: bool,
}

impl Produced {
    fn text(raw: String, post: Vec<PostBatch>) -> Self {
        Self {
            raw,
            failure: None,
            post,
            verbatim: false,
        }
    }
}

impl Executor {
    /// Run a step: condition, loop or parallel dispatch, status bookkeeping
    pub(super) fn run_step<'a>(
        &'a self,
        run: &'a RunCtx,
        scope: &'a Scope,
        step: &'a Step,
        view: ContextView,
    ) -> BoxFuture<'a, Result<StepFlow, ExecutionError>> {
        Box::pin(async move {
            let name = scope.qualified(&step.name);

            if let Some(condition) = &step.condition {
                match self.renderer.evaluate(condition, &view) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::info!("Skipping '{}': condition is false", name);
                        self.transition(run, scope, step, &name, StepStatus::Skipped, None, None)?;
                        return Ok(StepFlow::Skipped);
                    }
                    Err(e) => {
                        return Err(self.fail(run, scope, step, &name, ExecutionError::template(&name, e)))
                    }
                }
            }

            let compound = step.looping.is_some() || matches!(step.kind, StepKind::Parallel { .. });
            if !compound {
                return self
                    .run_single(run, scope, step, &name, view)
                    .await
                    .map_err(|e| self.fail(run, scope, step, &name, e));
            }

            self.transition(run, scope, step, &name, StepStatus::InProgress, None, None)?;
            let result = match &step.kind {
                _ if step.looping.is_some() => self.run_loop(run, scope, step, &name, view).await,
                StepKind::Parallel { steps } => self.run_parallel(run, scope, steps, &name, view).await,
                _ => unreachable!("compound step is a loop or a parallel group"),
            };

            match result {
                Ok(StepFlow::Completed(value)) => {
                    self.transition(
                        run,
                        scope,
                        step,
                        &name,
                        StepStatus::Completed,
                        Some(value.value.clone()),
                        None,
                    )?;
                    Ok(StepFlow::Completed(value))
                }
                Ok(flow) => Ok(flow),
                Err(e) => Err(self.fail(run, scope, step, &name, e)),
            }
        })
    }

    /// One execution of a step body (a plain step or one loop iteration)
    pub(super) async fn run_single(
        &self,
        run: &RunCtx,
        scope: &Scope,
        step: &Step,
        record_name: &str,
        view: ContextView,
    ) -> Result<StepFlow, ExecutionError> {
        self.transition(run, scope, step, record_name, StepStatus::InProgress, None, None)?;

        let gated = step.hitl && scope.allow_hitl;
        let produced = self.produce(run, scope, step, record_name, &view, gated).await?;

        let (output, mut validation_error) = if produced.verbatim {
            (Value::String(produced.raw.clone()), None)
        } else {
            match self.extractor.extract(&produced.raw, step.output.as_ref()) {
                Ok(value) => (value, None),
                Err(e) if gated => (Value::Null, Some(e.to_string())),
                Err(e) => {
                    return Err(ExecutionError::OutputValidation {
                        step: record_name.to_string(),
                        reason: e.to_string(),
                        raw_output: produced.raw,
                    })
                }
            }
        };
        if produced.failure.is_some() {
            validation_error = produced.failure.clone();
        }

        let value = if gated {
            self.transition(
                run,
                scope,
                step,
                record_name,
                StepStatus::WaitingHitl,
                Some(output.clone()),
                validation_error.clone(),
            )?;
            run.update(|s| s.status = RunStatus::WaitingHitl);
            run.save()?;

            let request = HitlRequest {
                workflow_name: run.workflow_name.clone(),
                step_name: record_name.to_string(),
                step_type: step.step_type(),
                output: output.clone(),
                raw_output: produced.raw.clone(),
                validation_error: validation_error.clone(),
                can_suspend: scope.nested.is_none(),
            };

            match self.hitl.prompt(&request).await {
                HitlResponse::Decided(HitlResult::Accept) => {
                    accepted_value(&output, &produced.raw, validation_error.is_some())
                }
                HitlResponse::Decided(HitlResult::Edit(map)) => Value::Object(map),
                HitlResponse::Decided(HitlResult::Reject) => {
                    tracing::info!("Step '{}' rejected", record_name);
                    return Ok(StepFlow::Rejected(record_name.to_string()));
                }
                HitlResponse::Suspend => {
                    if let Some(reason) = scope.nested {
                        return Err(ExecutionError::SuspensionNotAllowed {
                            step: record_name.to_string(),
                            scope: reason.to_string(),
                        });
                    }
                    return Ok(StepFlow::Suspend(PendingHitl {
                        step_index: scope.index,
                        step_name: record_name.to_string(),
                        step_type: step.step_type(),
                        output,
                        raw_output: produced.raw,
                        validation_error,
                        post: produced.post,
                    }));
                }
            }
        } else {
            output
        };

        run.update(|s| s.status = RunStatus::Running);
        self.transition(
            run,
            scope,
            step,
            record_name,
            StepStatus::Completed,
            Some(value.clone()),
            None,
        )?;
        self.run_post_batches(run, scope, record_name, produced.post).await?;
        Ok(StepFlow::Completed(StepValue::single(value)))
    }

    /// Render and run the step body
    async fn produce(
        &self,
        run: &RunCtx,
        scope: &Scope,
        step: &Step,
        record_name: &str,
        view: &ContextView,
        gated: bool,
    ) -> Result<Produced, ExecutionError> {
        let render = |text: &str| {
            self.renderer
                .render(text, view)
                .map_err(|e| ExecutionError::template(record_name, e))
        };

        match &step.kind {
            StepKind::Agent { prompt } => {
                let (prompt, post) = self
                    .expand_references(run, scope, record_name, prompt, view)
                    .await?;
                let metadata = InvocationMetadata {
                    run_id: run.run_id.clone(),
                    workflow_name: scope.workflow.name.clone(),
                    step_name: record_name.to_string(),
                    run_dir: run.run_dir.clone(),
                };
                tracing::debug!("Invoking agent for '{}' ({} chars)", record_name, prompt.len());
                let raw = self
                    .agent
                    .invoke(&prompt, &metadata)
                    .await
                    .map_err(|e| ExecutionError::Agent {
                        step: record_name.to_string(),
                        message: format!("{:#}", e),
                    })?;
                Ok(Produced::text(raw, post))
            }
            StepKind::Bash { command } => {
                let invocation = Invocation::shell(&self.config.shell, &render(command)?);
                self.run_process(run, step, record_name, invocation, gated).await
            }
            StepKind::Python { script } => {
                let invocation = Invocation::python(&self.config.python, &render(script)?);
                self.run_process(run, step, record_name, invocation, gated).await
            }
            StepKind::Fragment { content } => {
                let (text, post) = self
                    .expand_references(run, scope, record_name, content, view)
                    .await?;
                Ok(Produced {
                    verbatim: true,
                    ..Produced::text(text, post)
                })
            }
            StepKind::Parallel { .. } => Err(ExecutionError::step(
                record_name,
                "parallel group cannot run as a single step",
            )),
        }
    }

    async fn run_process(
        &self,
        run: &RunCtx,
        step: &Step,
        record_name: &str,
        mut invocation: Invocation,
        gated: bool,
    ) -> Result<Produced, ExecutionError> {
        for (key, value) in subprocess_env(run) {
            invocation = invocation.with_env(key, value);
        }
        let secs = step.timeout_secs.unwrap_or(self.config.step_timeout_secs);

        tracing::debug!("Running {} for '{}'", invocation.program, record_name);
        let output = self
            .runner
            .run(&invocation, &self.workdir, Duration::from_secs(secs))
            .await
            .map_err(|e| match e {
                RunnerError::Timeout(secs) => ExecutionError::Timeout {
                    step: record_name.to_string(),
                    secs,
                },
                RunnerError::IoError(e) => ExecutionError::step(
                    record_name,
                    format!("failed to run {}: {}", invocation.program, e),
                ),
            })?;

        if output.success() {
            return Ok(Produced::text(output.stdout, Vec::new()));
        }

        let code = output.exit_code.unwrap_or(-1);
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        if !gated {
            return Err(ExecutionError::NonZeroExit {
                step: record_name.to_string(),
                code,
                detail,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        tracing::warn!("'{}' exited with status {}, asking for review", record_name, code);
        Ok(Produced {
            failure: Some(format!("command exited with status {}: {}", code, detail)),
            ..Produced::text(output.stdout, Vec::new())
        })
    }

    /// Record a failure for `name` and hand the error back
    pub(super) fn fail(
        &self,
        run: &RunCtx,
        scope: &Scope,
        step: &Step,
        name: &str,
        err: ExecutionError,
    ) -> ExecutionError {
        if let Err(e) = self.transition(
            run,
            scope,
            step,
            name,
            StepStatus::Failed,
            None,
            Some(err.to_string()),
        ) {
            tracing::warn!("Failed to record failure of '{}': {}", name, e);
        }
        err
    }
}
