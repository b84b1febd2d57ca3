//! Expanding `#name(args)` references in prompt text
//!
//! A local prompt is rendered inline with its bound arguments. A workflow
//! reference runs that workflow's steps up to its fragment in an isolated
//! context, splices in the rendered fragment, and defers the steps after the
//! fragment until the referencing step has finished.

use std::ops::Range;
use std::sync::{Arc, LazyLock};

use futures_util::future::BoxFuture;
use regex::Regex;
use serde_json::Value;

use super::{embedded_context, Executor, RunCtx, Scope, StepFlow, MAX_EMBED_DEPTH};
use crate::error::ExecutionError;
use crate::reference::{bind_arguments, find_references, starts_line, Argument, Reference};
use crate::state::{Context, ContextView, PostBatch};
use crate::template::is_template;
use crate::workflow::Workflow;

impl Executor {
    /// Render `template` for step `owner`, expanding every reference in it
    pub(super) async fn expand_references(
        &self,
        run: &RunCtx,
        scope: &Scope,
        owner: &str,
        template: &str,
        view: &ContextView,
    ) -> Result<(String, Vec<PostBatch>), ExecutionError> {
        self.expand(run, scope.workflow.clone(), scope.depth, owner, template, view)
            .await
    }

    /// References are found in the template source, so rendered values never
    /// change how an argument list splits. Each one stands in as a placeholder
    /// while the template renders; those that survive rendering are expanded.
    fn expand<'a>(
        &'a self,
        run: &'a RunCtx,
        workflow: Arc<Workflow>,
        depth: usize,
        owner: &'a str,
        template: &'a str,
        view: &'a ContextView,
    ) -> BoxFuture<'a, Result<(String, Vec<PostBatch>), ExecutionError>> {
        Box::pin(async move {
            let refs = find_references(template, |name| {
                workflow.local_prompt(name).is_some() || self.registry.contains(name)
            });
            if refs.is_empty() {
                let text = self.render_for(owner, template, view)?;
                return Ok((text, Vec::new()));
            }
            if depth >= MAX_EMBED_DEPTH {
                return Err(ExecutionError::step(
                    owner,
                    format!("references nested deeper than {} levels", MAX_EMBED_DEPTH),
                ));
            }

            let mut masked = String::with_capacity(template.len());
            let mut cursor = 0;
            for (i, reference) in refs.iter().enumerate() {
                masked.push_str(&template[cursor..reference.start]);
                masked.push_str(&placeholder(i));
                cursor = reference.end;
            }
            masked.push_str(&template[cursor..]);
            let rendered = self.render_for(owner, &masked, view)?;

            let mut fragments = Vec::with_capacity(refs.len());
            let mut posts = Vec::new();
            for (i, reference) in refs.iter().enumerate() {
                if !rendered.contains(&placeholder(i)) {
                    fragments.push(None);
                    continue;
                }
                let args = self.render_arguments(owner, reference, view)?;
                let fragment = match workflow.local_prompt(&reference.name) {
                    Some(prompt) => {
                        let bound = bind_arguments(&prompt.inputs, &args).map_err(|e| {
                            ExecutionError::step(owner, format!("#{}: {}", reference.name, e))
                        })?;
                        let local = Context::from_map(bound).view();
                        let (text, nested) = self
                            .expand(run, workflow.clone(), depth + 1, owner, &prompt.content, &local)
                            .await?;
                        posts.extend(nested);
                        text
                    }
                    None => {
                        let (text, batches) = self
                            .embed_workflow(run, depth, owner, &reference.name, &args)
                            .await?;
                        posts.extend(batches);
                        text
                    }
                };
                fragments.push(Some(fragment));
            }

            Ok((splice(&rendered, &fragments), posts))
        })
    }

    fn render_for(&self, owner: &str, text: &str, view: &ContextView) -> Result<String, ExecutionError> {
        self.renderer
            .render(text, view)
            .map_err(|e| ExecutionError::template(owner, e))
    }

    /// Render each argument value on its own
    fn render_arguments(
        &self,
        owner: &str,
        reference: &Reference,
        view: &ContextView,
    ) -> Result<Vec<Argument>, ExecutionError> {
        let render = |value: &str| {
            if is_template(value) {
                self.render_for(owner, value, view)
            } else {
                Ok(value.to_string())
            }
        };
        reference
            .args
            .iter()
            .map(|arg| -> Result<Argument, ExecutionError> {
                Ok(match arg {
                    Argument::Positional(value) => Argument::Positional(render(value)?),
                    Argument::Named(key, value) => Argument::Named(key.clone(), render(value)?),
                })
            })
            .collect()
    }

    async fn embed_workflow(
        &self,
        run: &RunCtx,
        depth: usize,
        owner: &str,
        name: &str,
        args: &[Argument],
    ) -> Result<(String, Vec<PostBatch>), ExecutionError> {
        let target = self
            .registry
            .get(name)
            .ok_or_else(|| ExecutionError::step(owner, format!("unknown workflow '{}'", name)))?;
        self.ensure_valid(&target)
            .map_err(|source| ExecutionError::InvalidEmbedded {
                step: owner.to_string(),
                source,
            })?;
        let fragment_index = target.fragment_index().ok_or_else(|| {
            ExecutionError::step(
                owner,
                format!("workflow '{}' has no prompt_part step", target.name),
            )
        })?;
        let bound = bind_arguments(&target.inputs, args)
            .map_err(|e| ExecutionError::step(owner, format!("#{}: {}", target.name, e)))?;

        tracing::debug!("Embedding '{}' into '{}'", target.name, owner);
        let mut ctx = embedded_context(run, &target, bound);
        let pre = Scope::embedded(target.clone(), true, depth + 1);
        self.run_embedded_steps(run, &pre, &mut ctx, 0..fragment_index)
            .await
            .map_err(|e| ExecutionError::Embedded {
                workflow: target.name.clone(),
                source: Box::new(e),
            })?;

        let fragment = &target.steps[fragment_index];
        let fragment_name = pre.qualified(&fragment.name);
        let view = ctx.view();
        let (text, mut posts) = self
            .expand(
                run,
                target.clone(),
                depth + 1,
                &fragment_name,
                fragment.content().unwrap_or_default(),
                &view,
            )
            .await?;

        ctx.insert(fragment.name.clone(), Value::String(text.clone()));
        if fragment_index + 1 < target.steps.len() {
            posts.push(PostBatch {
                workflow: target.name.clone(),
                first_index: fragment_index + 1,
                context: ctx,
            });
        }
        Ok((text, posts))
    }

    /// Run deferred post-fragment steps once their owner has finished
    pub(super) async fn run_post_batches(
        &self,
        run: &RunCtx,
        scope: &Scope,
        owner: &str,
        batches: Vec<PostBatch>,
    ) -> Result<(), ExecutionError> {
        for batch in batches {
            let target = self.registry.get(&batch.workflow).ok_or_else(|| {
                ExecutionError::step(
                    owner,
                    format!("embedded workflow '{}' is no longer registered", batch.workflow),
                )
            })?;
            let post = Scope::embedded(target.clone(), false, scope.depth + 1);
            let mut ctx = batch.context;
            self.run_embedded_steps(run, &post, &mut ctx, batch.first_index..target.steps.len())
                .await
                .map_err(|e| ExecutionError::Embedded {
                    workflow: target.name.clone(),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    /// Run a range of an embedded workflow's steps against its own context
    async fn run_embedded_steps(
        &self,
        run: &RunCtx,
        scope: &Scope,
        ctx: &mut Context,
        range: Range<usize>,
    ) -> Result<(), ExecutionError> {
        for index in range {
            let step = &scope.workflow.steps[index];
            let at = scope.at(index);
            match self.run_step(run, &at, step, ctx.view()).await? {
                StepFlow::Completed(value) => {
                    for (name, member) in value.members {
                        ctx.insert(name, member);
                    }
                    ctx.insert(step.name.clone(), value.value);
                }
                StepFlow::Skipped => {}
                StepFlow::Rejected(name) => {
                    return Err(ExecutionError::step(&name, "rejected inside an embedded workflow"))
                }
                StepFlow::Suspend(held) => {
                    return Err(ExecutionError::SuspensionNotAllowed {
                        step: held.step_name,
                        scope: "an embedded workflow".to_string(),
                    })
                }
            }
        }
        Ok(())
    }
}

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("\u{1A}ref([0-9]+)\u{1A}").expect("Invalid placeholder regex"));

fn placeholder(index: usize) -> String {
    format!("\u{1A}ref{}\u{1A}", index)
}

/// Replace placeholders in rendered text with their expansions
fn splice(rendered: &str, fragments: &[Option<String>]) -> String {
    let mut out = String::with_capacity(rendered.len());
    let mut cursor = 0;
    for caps in PLACEHOLDER_RE.captures_iter(rendered) {
        let (Some(whole), Some(index)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let fragment = index
            .as_str()
            .parse::<usize>()
            .ok()
            .and_then(|i| fragments.get(i))
            .and_then(Option::as_deref);
        let Some(fragment) = fragment else {
            continue;
        };

        out.push_str(&rendered[cursor..whole.start()]);
        if needs_separation(fragment) && !starts_line(rendered, whole.start()) {
            out.push_str("\n\n");
            out.push_str(skip_blank_lines(fragment));
        } else {
            out.push_str(fragment);
        }
        cursor = whole.end();
    }
    out.push_str(&rendered[cursor..]);
    out
}

/// Fragments opening with a heading or rule need a blank line before them
/// when spliced mid-line
fn needs_separation(fragment: &str) -> bool {
    let first = skip_blank_lines(fragment).lines().next().unwrap_or_default().trim();
    first.starts_with('#') || is_rule(first)
}

fn skip_blank_lines(text: &str) -> &str {
    let mut rest = text;
    while let Some((line, tail)) = rest.split_once('\n') {
        if !line.trim().is_empty() {
            break;
        }
        rest = tail;
    }
    rest
}

fn is_rule(line: &str) -> bool {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    compact.len() >= 3
        && ['-', '*', '_']
            .iter()
            .any(|mark| compact.chars().all(|c| c == *mark))
}
