//! Template rendering and expression evaluation
//!
//! Step text, conditions and loop sources are jinja templates evaluated against
//! a [`ContextView`]. The executor talks to the [`TemplateRenderer`] trait;
//! [`MiniJinjaRenderer`] is the default implementation.
//!
//! The module also offers a static, regex based scan of the variables a
//! template reads, used by the validator to check availability before a run.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use minijinja::{Environment, UndefinedBehavior};
use regex::Regex;
use serde_json::Value;

use crate::state::ContextView;

/// Rendering or evaluation failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TemplateError(pub String);

impl From<minijinja::Error> for TemplateError {
    fn from(err: minijinja::Error) -> Self {
        let mut message = err.to_string();
        if let Some(detail) = err.detail() {
            if !message.contains(detail) {
                message = format!("{} ({})", message, detail);
            }
        }
        TemplateError(message)
    }
}

/// Template collaborator used by the executor
pub trait TemplateRenderer: Send + Sync {
    /// Render a template to text
    fn render(&self, template: &str, ctx: &ContextView) -> Result<String, TemplateError>;

    /// Evaluate a condition to a boolean
    fn evaluate(&self, expr: &str, ctx: &ContextView) -> Result<bool, TemplateError>;

    /// Evaluate an expression to a structured value
    fn evaluate_value(&self, expr: &str, ctx: &ContextView) -> Result<Value, TemplateError>;
}

/// True when the text contains template markup rather than a bare expression
pub fn is_template(text: &str) -> bool {
    text.contains("{{") || text.contains("{%")
}

/// Truthiness of rendered text
pub fn text_is_truthy(text: &str) -> bool {
    !matches!(
        text.trim().to_lowercase().as_str(),
        "" | "false" | "0" | "no" | "off" | "none" | "null" | "[]" | "{}"
    )
}

/// [`TemplateRenderer`] backed by minijinja with strict undefined handling
pub struct MiniJinjaRenderer {
    env: Environment<'static>,
}

impl Default for MiniJinjaRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl MiniJinjaRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        Self { env }
    }
}

impl TemplateRenderer for MiniJinjaRenderer {
    fn render(&self, template: &str, ctx: &ContextView) -> Result<String, TemplateError> {
        Ok(self.env.render_str(template, ctx.as_map())?)
    }

    fn evaluate(&self, expr: &str, ctx: &ContextView) -> Result<bool, TemplateError> {
        if is_template(expr) {
            let rendered = self.render(expr, ctx)?;
            return Ok(text_is_truthy(&rendered));
        }
        let compiled = self.env.compile_expression(expr.trim())?;
        Ok(compiled.eval(ctx.as_map())?.is_true())
    }

    fn evaluate_value(&self, expr: &str, ctx: &ContextView) -> Result<Value, TemplateError> {
        if is_template(expr) {
            let rendered = self.render(expr, ctx)?;
            let trimmed = rendered.trim();
            return Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())));
        }
        let compiled = self.env.compile_expression(expr.trim())?;
        let value = compiled.eval(ctx.as_map())?;
        serde_json::to_value(&value).map_err(|e| TemplateError(e.to_string()))
    }
}

// ============================================================================
// Static variable extraction
// ============================================================================

static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{#.*?#\}").expect("Invalid comment regex"));

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{\{-?(.*?)-?\}\}|\{%-?(.*?)-?%\}").expect("Invalid block regex")
});

static STRING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'"#).expect("Invalid string regex")
});

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("Invalid identifier regex"));

static FOR_LOCALS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*for\s+([A-Za-z_][A-Za-z0-9_]*(?:\s*,\s*[A-Za-z_][A-Za-z0-9_]*)*)\s+in\s")
        .expect("Invalid for regex")
});

static SET_LOCAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*set\s+([A-Za-z_][A-Za-z0-9_]*)").expect("Invalid set regex")
});

const KEYWORDS: &[&str] = &[
    "and", "or", "not", "in", "is", "if", "else", "elif", "endif", "for", "endfor", "set",
    "endset", "true", "false", "none", "True", "False", "None", "loop", "recursive", "with",
    "endwith", "block", "endblock", "macro", "endmacro", "call", "endcall", "filter",
    "endfilter", "raw", "endraw", "include", "import", "from", "as", "extends", "autoescape",
    "endautoescape", "super", "self", "varargs", "kwargs", "caller", "break", "continue",
];

/// Top-level variables read by a condition or loop source
///
/// Text with template markup is scanned like a template, anything else is
/// treated as a bare expression.
pub fn referenced_variables(text: &str) -> BTreeSet<String> {
    if is_template(text) {
        return template_variables(text);
    }
    let mut out = BTreeSet::new();
    scan_expression(text, &HashSet::new(), &mut out);
    out
}

/// Top-level variables read by a template
///
/// Attribute accesses, filters, tests, function calls, keyword arguments and
/// names bound by `for`/`set` inside the template are not reported. Text
/// outside `{{ }}` and `{% %}` is never inspected.
pub fn template_variables(text: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let text = COMMENT_RE.replace_all(text, "");
    let blocks: Vec<&str> = BLOCK_RE
        .captures_iter(&text)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str())
        .collect();

    let mut locals = HashSet::new();
    for block in &blocks {
        if let Some(c) = FOR_LOCALS_RE.captures(block) {
            for name in c[1].split(',') {
                locals.insert(name.trim().to_string());
            }
        }
        if let Some(c) = SET_LOCAL_RE.captures(block) {
            locals.insert(c[1].to_string());
        }
    }

    for block in blocks {
        scan_expression(block, &locals, &mut out);
    }
    out
}

fn scan_expression(expr: &str, locals: &HashSet<String>, out: &mut BTreeSet<String>) {
    let expr = STRING_RE.replace_all(expr, "\"\"");
    for m in IDENT_RE.find_iter(&expr) {
        let name = m.as_str();
        if KEYWORDS.contains(&name) || locals.contains(name) {
            continue;
        }

        let before = expr[..m.start()].trim_end();
        if let Some(prev) = before.chars().last() {
            if prev == '.' || prev == '|' || prev.is_ascii_alphanumeric() && before_is_number(before) {
                continue;
            }
        }
        if ends_with_word(before, "is") || (ends_with_word(before, "not") && {
            let rest = before[..before.len() - 3].trim_end();
            ends_with_word(rest, "is")
        }) {
            continue;
        }

        let after = expr[m.end()..].trim_start();
        if after.starts_with('(') || (after.starts_with('=') && !after.starts_with("==")) {
            continue;
        }

        out.insert(name.to_string());
    }
}

fn ends_with_word(text: &str, word: &str) -> bool {
    text.ends_with(word)
        && text[..text.len() - word.len()]
            .chars()
            .last()
            .map_or(true, |c| !(c.is_ascii_alphanumeric() || c == '_'))
}

/// `1e5`-style tails are not identifiers
fn before_is_number(before: &str) -> bool {
    before
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '.')
        .all(|c| c.is_ascii_digit() || c == '.')
}
