//! Loops, parallel groups and joining loop outputs

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};

use super::{Executor, RunCtx, Scope, StepFlow, StepValue};
use crate::error::ExecutionError;
use crate::state::ContextView;
use crate::workflow::{IterSource, JoinMode, LoopSpec, Step};

/// What one loop iteration produced
enum Iteration {
    Value(Value),
    Stop(StepFlow),
}

impl Executor {
    pub(super) async fn run_loop(
        &self,
        run: &RunCtx,
        scope: &Scope,
        step: &Step,
        name: &str,
        view: ContextView,
    ) -> Result<StepFlow, ExecutionError> {
        let Some(spec) = &step.looping else {
            return Err(ExecutionError::step(name, "step has no loop"));
        };
        let inner = scope.nested("a loop");
        let mut outputs = Vec::new();

        match spec {
            LoopSpec::For { vars } => {
                let lists = self.for_lists(name, vars, &view)?;
                let len = lists.first().map_or(0, |(_, items)| items.len());
                tracing::debug!("'{}' iterates {} times", name, len);

                for i in 0..len {
                    let bindings = lists
                        .iter()
                        .map(|(var, items)| (var.clone(), items[i].clone()));
                    let iter_view = view.with_bindings(bindings);
                    match self.iterate(run, &inner, step, name, i, iter_view).await? {
                        Iteration::Value(v) => outputs.push(v),
                        Iteration::Stop(flow) => return Ok(flow),
                    }
                }
            }
            LoopSpec::Repeat { until, max } => {
                let mut last = Value::Null;
                let mut converged = false;
                for i in 0..*max as usize {
                    let iter_view = view.with_bindings([(step.name.clone(), last)]);
                    let value = match self.iterate(run, &inner, step, name, i, iter_view).await? {
                        Iteration::Value(v) => v,
                        Iteration::Stop(flow) => return Ok(flow),
                    };
                    outputs.push(value.clone());

                    let check = view.with_bindings([(step.name.clone(), value.clone())]);
                    let done = self
                        .renderer
                        .evaluate(until, &check)
                        .map_err(|e| ExecutionError::template(name, e))?;
                    last = value;
                    if done {
                        converged = true;
                        break;
                    }
                }
                if !converged {
                    return Err(ExecutionError::LoopDidNotConverge {
                        step: name.to_string(),
                        max: *max,
                    });
                }
            }
            LoopSpec::While { condition, max } => {
                let mut last = Value::Null;
                let mut i = 0usize;
                loop {
                    let check = view.with_bindings([(step.name.clone(), last.clone())]);
                    let go = self
                        .renderer
                        .evaluate(condition, &check)
                        .map_err(|e| ExecutionError::template(name, e))?;
                    if !go {
                        break;
                    }
                    if i >= *max as usize {
                        return Err(ExecutionError::LoopDidNotConverge {
                            step: name.to_string(),
                            max: *max,
                        });
                    }
                    let iter_view = view.with_bindings([(step.name.clone(), last)]);
                    last = match self.iterate(run, &inner, step, name, i, iter_view).await? {
                        Iteration::Value(v) => v,
                        Iteration::Stop(flow) => return Ok(flow),
                    };
                    outputs.push(last.clone());
                    i += 1;
                }
            }
        }

        let joined = join_outputs(name, step.join, outputs)?;
        Ok(StepFlow::Completed(StepValue::single(joined)))
    }

    async fn iterate(
        &self,
        run: &RunCtx,
        scope: &Scope,
        step: &Step,
        name: &str,
        i: usize,
        view: ContextView,
    ) -> Result<Iteration, ExecutionError> {
        let iter_name = format!("{}[{}]", name, i);
        match self.run_single(run, scope, step, &iter_name, view).await {
            Ok(StepFlow::Completed(v)) => Ok(Iteration::Value(v.value)),
            Ok(flow) => Ok(Iteration::Stop(flow)),
            Err(e) => Err(self.fail(run, scope, step, &iter_name, e)),
        }
    }

    /// Resolve `for` sources; every list must have the same length
    fn for_lists(
        &self,
        name: &str,
        vars: &[(String, IterSource)],
        view: &ContextView,
    ) -> Result<Vec<(String, Vec<Value>)>, ExecutionError> {
        let mut lists = Vec::with_capacity(vars.len());
        for (var, source) in vars {
            let items = match source {
                IterSource::Literal(items) => items.clone(),
                IterSource::Expr(expr) => {
                    match self
                        .renderer
                        .evaluate_value(expr, view)
                        .map_err(|e| ExecutionError::template(name, e))?
                    {
                        Value::Array(items) => items,
                        Value::Null => Vec::new(),
                        other => {
                            return Err(ExecutionError::step(
                                name,
                                format!("'for' variable '{}' must be a list, got {}", var, other),
                            ))
                        }
                    }
                }
            };
            lists.push((var.clone(), items));
        }

        if let Some((first_var, first)) = lists.first() {
            for (var, items) in &lists[1..] {
                if items.len() != first.len() {
                    return Err(ExecutionError::step(
                        name,
                        format!(
                            "'for' lists differ in length ({} has {}, {} has {})",
                            first_var,
                            first.len(),
                            var,
                            items.len()
                        ),
                    ));
                }
            }
        }
        Ok(lists)
    }

    /// Run group members concurrently against one snapshot
    ///
    /// At most `max_parallel` members are in flight. After the first failure
    /// no new member starts; members already running are awaited.
    pub(super) async fn run_parallel(
        &self,
        run: &RunCtx,
        scope: &Scope,
        members: &[Step],
        name: &str,
        view: ContextView,
    ) -> Result<StepFlow, ExecutionError> {
        let inner = scope.nested("a parallel group");
        let limit = self.config.max_parallel.max(1);
        tracing::debug!("'{}' runs {} members (limit {})", name, members.len(), limit);

        let mut pending = members.iter().enumerate();
        let mut in_flight = FuturesUnordered::new();
        let mut results: Vec<Option<Value>> = vec![None; members.len()];
        let mut failure: Option<ExecutionError> = None;
        let mut rejected: Option<String> = None;

        loop {
            while failure.is_none() && rejected.is_none() && in_flight.len() < limit {
                let Some((idx, member)) = pending.next() else {
                    break;
                };
                let fut = self.run_step(run, &inner, member, view.clone());
                in_flight.push(async move { (idx, fut.await) });
            }

            let Some((idx, result)) = in_flight.next().await else {
                break;
            };
            match result {
                Ok(StepFlow::Completed(value)) => results[idx] = Some(value.value),
                Ok(StepFlow::Skipped) => {}
                Ok(StepFlow::Rejected(step)) => {
                    rejected.get_or_insert(step);
                }
                Ok(StepFlow::Suspend(held)) => {
                    failure.get_or_insert(ExecutionError::SuspensionNotAllowed {
                        step: held.step_name,
                        scope: "a parallel group".to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!("Parallel member of '{}' failed: {}", name, e);
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if let Some(step) = rejected {
            return Ok(StepFlow::Rejected(step));
        }

        let mut group = Map::new();
        let mut merged = Vec::new();
        for (member, value) in members.iter().zip(results) {
            if let Some(value) = value {
                group.insert(member.name.clone(), value.clone());
                merged.push((member.name.clone(), value));
            }
        }
        Ok(StepFlow::Completed(StepValue {
            value: Value::Object(group),
            members: merged,
        }))
    }
}

/// Combine iteration outputs according to the join mode
pub(crate) fn join_outputs(name: &str, mode: JoinMode, outputs: Vec<Value>) -> Result<Value, ExecutionError> {
    match mode {
        JoinMode::Array => Ok(Value::Array(outputs)),
        JoinMode::LastOf => Ok(outputs.into_iter().last().unwrap_or(Value::Null)),
        JoinMode::Text => Ok(Value::String(
            outputs.iter().map(value_text).collect::<Vec<_>>().join("\n"),
        )),
        JoinMode::Object => {
            let mut merged = Map::new();
            for (i, output) in outputs.into_iter().enumerate() {
                match output {
                    Value::Object(map) => merged.extend(map),
                    other => {
                        return Err(ExecutionError::step(
                            name,
                            format!("join 'object' needs map outputs, iteration {} produced {}", i, other),
                        ))
                    }
                }
            }
            Ok(Value::Object(merged))
        }
    }
}

/// Strings as-is, everything else as JSON
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
