//! Static checks run before a workflow executes
//!
//! Every problem found is collected; the caller gets a single
//! [`ValidationError`] listing all of them rather than the first one.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::error::ValidationError;
use crate::loader::WorkflowRegistry;
use crate::reference::{check_arguments, find_references, Reference};
use crate::template::{referenced_variables, template_variables};
use crate::workflow::{
    IterSource, LoopSpec, Step, Workflow, LOCAL_PROMPT_PREFIX, RESERVED_NAMES,
};

/// Validates workflows, resolving `#name` references against a registry
pub struct Validator<'a> {
    registry: Option<&'a WorkflowRegistry>,
}

impl<'a> Validator<'a> {
    pub fn new(registry: &'a WorkflowRegistry) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    /// Validator that only knows local prompts
    pub fn standalone() -> Self {
        Self { registry: None }
    }

    /// Check `workflow` and every registry workflow it embeds
    pub fn validate(&self, workflow: &Workflow) -> Result<(), ValidationError> {
        let mut visited = HashSet::from([workflow.name.clone()]);
        let problems = self.problems(workflow, &mut visited);

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                workflow: workflow.name.clone(),
                problems,
            })
        }
    }

    fn problems(&self, workflow: &Workflow, visited: &mut HashSet<String>) -> Vec<String> {
        let mut checker = Checker {
            workflow,
            registry: self.registry,
            problems: Vec::new(),
            used: HashSet::new(),
            referenced_prompts: HashSet::new(),
            step_names: workflow.all_steps().iter().map(|s| s.name.clone()).collect(),
            embedded: Vec::new(),
        };
        checker.check_structure();
        checker.check_fragments();
        checker.check_steps();
        checker.check_unused_inputs();
        checker.check_local_prompts();

        let mut problems = checker.problems;
        for target in checker.embedded {
            if !visited.insert(target.name.clone()) {
                continue;
            }
            for problem in self.problems(&target, visited) {
                problems.push(format!("embedded workflow '{}': {}", target.name, problem));
            }
        }

        let mut seen = HashSet::new();
        problems.retain(|p| seen.insert(p.clone()));
        problems
    }
}

struct Checker<'w> {
    workflow: &'w Workflow,
    registry: Option<&'w WorkflowRegistry>,
    problems: Vec<String>,
    /// Every variable read by some step
    used: HashSet<String>,
    referenced_prompts: HashSet<String>,
    step_names: HashSet<String>,
    /// Registry workflows referenced from this one
    embedded: Vec<Arc<Workflow>>,
}

impl<'w> Checker<'w> {
    fn problem(&mut self, message: impl Into<String>) {
        self.problems.push(message.into());
    }

    fn check_structure(&mut self) {
        let workflow = self.workflow;
        let mut names = HashSet::new();
        for step in workflow.all_steps() {
            if !names.insert(step.name.as_str()) {
                self.problems.push(format!("duplicate step name '{}'", step.name));
            }
        }

        let mut inputs = HashSet::new();
        for input in &workflow.inputs {
            if !inputs.insert(input.name.as_str()) {
                self.problems.push(format!("duplicate input name '{}'", input.name));
            }
            if RESERVED_NAMES.contains(&input.name.as_str()) {
                self.problems.push(format!("input '{}' uses a reserved name", input.name));
            }
            if names.contains(input.name.as_str()) {
                self.problems.push(format!(
                    "input '{}' collides with a step of the same name",
                    input.name
                ));
            }
        }

        for step in workflow.all_steps() {
            let max = match &step.looping {
                Some(LoopSpec::Repeat { max, .. }) | Some(LoopSpec::While { max, .. }) => *max,
                _ => continue,
            };
            if max == 0 {
                self.problems
                    .push(format!("step '{}': loop max must be at least 1", step.name));
            }
        }
    }

    fn check_fragments(&mut self) {
        let workflow = self.workflow;
        let fragments: Vec<&Step> = workflow.steps.iter().filter(|s| s.is_fragment()).collect();
        if fragments.len() > 1 {
            let names: Vec<String> = fragments.iter().map(|s| format!("'{}'", s.name)).collect();
            self.problem(format!("more than one fragment step ({})", names.join(", ")));
        }

        for step in workflow.all_steps() {
            if !step.is_fragment() {
                continue;
            }
            let mut fields = Vec::new();
            if step.condition.is_some() {
                fields.push("if");
            }
            if let Some(looping) = &step.looping {
                fields.push(looping.keyword());
            }
            if step.output.is_some() {
                fields.push("output");
            }
            if step.hitl {
                fields.push("hitl");
            }
            for field in fields {
                self.problem(format!(
                    "fragment step '{}' cannot declare '{}'",
                    step.name, field
                ));
            }
        }

        for group in &workflow.steps {
            for member in group.members() {
                if member.is_fragment() {
                    self.problem(format!(
                        "fragment step '{}' cannot be part of parallel group '{}'",
                        member.name, group.name
                    ));
                }
            }
        }
    }

    fn check_steps(&mut self) {
        let workflow = self.workflow;
        let mut available: HashSet<String> = workflow
            .inputs
            .iter()
            .map(|i| i.name.clone())
            .collect();
        available.insert("run_id".to_string());
        available.insert("workflow_name".to_string());
        if workflow.config.create_artifacts {
            available.insert("artifacts_dir".to_string());
        }

        for step in &workflow.steps {
            self.check_step(step, &available);
            for member in step.members() {
                self.check_step(member, &available);
            }
            available.insert(step.name.clone());
            for member in step.members() {
                available.insert(member.name.clone());
            }
        }
    }

    fn check_step(&mut self, step: &Step, available: &HashSet<String>) {
        if let Some(condition) = &step.condition {
            self.check_vars(&step.name, referenced_variables(condition), available, &[]);
        }

        let mut body_vars: Vec<&str> = Vec::new();
        match &step.looping {
            Some(LoopSpec::For { vars }) => {
                for (var, source) in vars {
                    if let IterSource::Expr(expr) = source {
                        self.check_vars(&step.name, referenced_variables(expr), available, &[]);
                    }
                    body_vars.push(var);
                }
            }
            Some(LoopSpec::Repeat { until: expr, .. })
            | Some(LoopSpec::While { condition: expr, .. }) => {
                body_vars.push(&step.name);
                self.check_vars(&step.name, referenced_variables(expr), available, &[&step.name]);
            }
            None => {}
        }

        if let Some(content) = step.content() {
            self.check_vars(&step.name, template_variables(content), available, &body_vars);
            let owner = format!("step '{}'", step.name);
            self.check_references(&owner, content);
        }
    }

    fn check_vars(
        &mut self,
        step: &str,
        vars: BTreeSet<String>,
        available: &HashSet<String>,
        extra: &[&str],
    ) {
        for var in vars {
            self.used.insert(var.clone());
            if available.contains(&var) || extra.contains(&var.as_str()) {
                continue;
            }
            if var == "artifacts_dir" {
                self.problem(format!(
                    "step '{}' uses 'artifacts_dir' but config.create_artifacts is off",
                    step
                ));
            } else if self.step_names.contains(&var) {
                self.problem(format!("step '{}' references '{}' before it runs", step, var));
            } else {
                self.problem(format!("step '{}' references undefined variable '{}'", step, var));
            }
        }
    }

    fn is_known_reference(&self, name: &str) -> bool {
        self.workflow.local_prompt(name).is_some()
            || name == self.workflow.name
            || self.registry.is_some_and(|r| r.contains(name))
    }

    fn references(&self, text: &str) -> Vec<Reference> {
        find_references(text, |name| self.is_known_reference(name))
    }

    /// Resolution and argument checks for every reference in `text`
    fn check_references(&mut self, owner: &str, text: &str) {
        let workflow = self.workflow;
        for reference in self.references(text) {
            if let Some(prompt) = workflow.local_prompt(&reference.name) {
                self.referenced_prompts.insert(prompt.name.clone());
                for problem in check_arguments(&prompt.inputs, &reference.args) {
                    self.problems
                        .push(format!("{}: #{}: {}", owner, reference.name, problem));
                }
                continue;
            }

            if reference.name == workflow.name {
                self.problem(format!(
                    "{} embeds its own workflow '{}'",
                    owner, reference.name
                ));
                continue;
            }

            let Some(target) = self.registry.and_then(|r| r.get(&reference.name)) else {
                continue;
            };
            if target.fragment_index().is_none() {
                self.problem(format!(
                    "{} references workflow '{}' which has no prompt_part step",
                    owner, reference.name
                ));
                continue;
            }
            for problem in check_arguments(&target.inputs, &reference.args) {
                self.problems
                    .push(format!("{}: #{}: {}", owner, reference.name, problem));
            }
            if !self.embedded.iter().any(|w| w.name == target.name) {
                self.embedded.push(target);
            }
        }
    }

    fn check_unused_inputs(&mut self) {
        let workflow = self.workflow;
        for input in &workflow.inputs {
            if !self.used.contains(&input.name) {
                self.problems
                    .push(format!("input '{}' is declared but never used", input.name));
            }
        }
    }

    fn check_local_prompts(&mut self) {
        let workflow = self.workflow;
        for prompt in &workflow.local_prompts {
            if !prompt.name.starts_with(LOCAL_PROMPT_PREFIX) {
                self.problem(format!(
                    "local prompt '{}' must start with '{}'",
                    prompt.name, LOCAL_PROMPT_PREFIX
                ));
            }

            let owner = format!("local prompt '{}'", prompt.name);
            self.check_references(&owner, &prompt.content);

            let vars = template_variables(&prompt.content);
            for input in &prompt.inputs {
                if !vars.contains(&input.name) {
                    self.problem(format!(
                        "local prompt '{}' declares input '{}' but never uses it",
                        prompt.name, input.name
                    ));
                }
            }
            for var in &vars {
                if !prompt.inputs.iter().any(|i| &i.name == var) {
                    self.problem(format!(
                        "local prompt '{}' references '{}' which is not one of its inputs",
                        prompt.name, var
                    ));
                }
            }
        }

        for prompt in &workflow.local_prompts {
            if !self.referenced_prompts.contains(&prompt.name) {
                self.problem(format!("local prompt '{}' is never referenced", prompt.name));
            }
        }
    }
}
