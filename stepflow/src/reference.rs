//! Sub-call references
//!
//! Prompt text may reference a local prompt or another workflow's fragment as
//! `#name` or `#name(positional, key=value)`. Only names that resolve to
//! something are treated as references, so ordinary `#tags` in prose are left
//! alone.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::workflow::InputDecl;

static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[^A-Za-z0-9_#&])#([A-Za-z_][A-Za-z0-9_-]*)").expect("Invalid reference regex")
});

/// One argument of a reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    Positional(String),
    Named(String, String),
}

/// A parsed `#name(args)` occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    pub args: Vec<Argument>,
    /// Byte offset of the `#`
    pub start: usize,
    /// Byte offset one past the closing parenthesis (or the name)
    pub end: usize,
}

impl Reference {
    /// True when the reference begins a line (ignoring indentation)
    pub fn at_line_start(&self, text: &str) -> bool {
        starts_line(text, self.start)
    }
}

/// True when only indentation precedes byte `offset` on its line
pub fn starts_line(text: &str, offset: usize) -> bool {
    text[..offset]
        .rsplit('\n')
        .next()
        .map_or(true, |line| line.trim().is_empty())
}

/// Find every reference whose name satisfies `is_known`
///
/// The argument list may nest parentheses, and quoted strings or template
/// blocks inside it may contain any character.
pub fn find_references(text: &str, is_known: impl Fn(&str) -> bool) -> Vec<Reference> {
    let mut refs = Vec::new();
    let mut consumed = 0;
    for caps in REFERENCE_RE.captures_iter(text) {
        let (Some(name), Some(whole)) = (caps.get(2), caps.get(0)) else {
            continue;
        };
        let start = whole.start() + caps.get(1).map_or(0, |m| m.as_str().len());
        if start < consumed || !is_known(name.as_str()) {
            continue;
        }
        let (args, end) = match closing_paren(text, name.end()) {
            Some(close) => (parse_arguments(&text[name.end() + 1..close]), close + 1),
            None => (Vec::new(), name.end()),
        };
        consumed = end;
        refs.push(Reference {
            name: name.as_str().to_string(),
            args,
            start,
            end,
        });
    }
    refs
}

/// Byte offset of the `)` closing an argument list opening at `open`
fn closing_paren(text: &str, open: usize) -> Option<usize> {
    let rest = text.get(open..)?;
    if !rest.starts_with('(') {
        return None;
    }
    let mut depth = 0usize;
    let mut braces = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\n' {
                return None;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '{' => braces += 1,
            '}' => braces = braces.saturating_sub(1),
            '(' if braces == 0 => depth += 1,
            ')' if braces == 0 => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            '\n' if braces == 0 => return None,
            _ => {}
        }
    }
    None
}

/// Split an argument list on top-level commas
///
/// Commas inside quotes, brackets, parentheses and `{{ }}` / `{% %}` blocks
/// do not split.
pub fn parse_arguments(raw: &str) -> Vec<Argument> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            current.push(c);
            if c == '\\' {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                quote = Some(c);
                current.push(c);
            }
            '{' | '[' | '(' => {
                depth += 1;
                current.push(c);
            }
            '}' | ']' | ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() || !parts.is_empty() {
        parts.push(current);
    }

    parts
        .into_iter()
        .map(|part| split_named(part.trim()))
        .collect()
}

fn split_named(part: &str) -> Argument {
    if let Some(eq) = part.find('=') {
        let key = part[..eq].trim();
        let rest = &part[eq + 1..];
        let is_ident = !key.is_empty()
            && key.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if is_ident && !rest.starts_with('=') {
            return Argument::Named(key.to_string(), unquote(rest.trim()));
        }
    }
    Argument::Positional(unquote(part))
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

/// Problems binding arguments to declared inputs
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("{given} positional arguments given but only {max} inputs are declared")]
    TooManyPositional { given: usize, max: usize },

    #[error("unknown argument '{name}' (valid: {})", .valid.join(", "))]
    UnknownNamed { name: String, valid: Vec<String> },

    #[error("argument '{0}' is bound more than once")]
    Duplicate(String),

    #[error("missing required arguments: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("argument '{name}': {message}")]
    Coerce { name: String, message: String },
}

/// Static checks of an argument list against declared inputs
pub fn check_arguments(inputs: &[InputDecl], args: &[Argument]) -> Vec<BindError> {
    let mut problems = Vec::new();
    let positional = args
        .iter()
        .filter(|a| matches!(a, Argument::Positional(_)))
        .count();
    if positional > inputs.len() {
        problems.push(BindError::TooManyPositional {
            given: positional,
            max: inputs.len(),
        });
    }

    let mut bound: Vec<&str> = inputs.iter().take(positional).map(|i| i.name.as_str()).collect();
    for arg in args {
        if let Argument::Named(name, _) = arg {
            if !inputs.iter().any(|i| &i.name == name) {
                problems.push(BindError::UnknownNamed {
                    name: name.clone(),
                    valid: inputs.iter().map(|i| i.name.clone()).collect(),
                });
            } else if bound.contains(&name.as_str()) {
                problems.push(BindError::Duplicate(name.clone()));
            } else {
                bound.push(name);
            }
        }
    }

    let missing: Vec<String> = inputs
        .iter()
        .filter(|i| i.is_required() && !bound.contains(&i.name.as_str()))
        .map(|i| i.name.clone())
        .collect();
    if !missing.is_empty() {
        problems.push(BindError::Missing(missing));
    }
    problems
}

/// Bind arguments to inputs: positional in declaration order, then named,
/// then defaults. Values are coerced to the declared input types.
pub fn bind_arguments(inputs: &[InputDecl], args: &[Argument]) -> Result<Map<String, Value>, BindError> {
    if let Some(problem) = check_arguments(inputs, args).into_iter().next() {
        return Err(problem);
    }

    let mut raw: Map<String, Value> = Map::new();
    let mut positional = inputs.iter();
    for arg in args {
        match arg {
            Argument::Positional(value) => {
                if let Some(input) = positional.next() {
                    raw.insert(input.name.clone(), Value::String(value.clone()));
                }
            }
            Argument::Named(name, value) => {
                raw.insert(name.clone(), Value::String(value.clone()));
            }
        }
    }

    bind_values(inputs, raw)
}

/// Fill defaults and coerce an already keyed set of values
pub fn bind_values(inputs: &[InputDecl], mut supplied: Map<String, Value>) -> Result<Map<String, Value>, BindError> {
    let mut bound = Map::new();
    let mut missing = Vec::new();
    for input in inputs {
        let value = match supplied.remove(&input.name).or_else(|| input.default.clone()) {
            Some(value) => value,
            None => {
                missing.push(input.name.clone());
                continue;
            }
        };
        let value = input.ty.coerce(value).map_err(|message| BindError::Coerce {
            name: input.name.clone(),
            message,
        })?;
        bound.insert(input.name.clone(), value);
    }
    if !missing.is_empty() {
        return Err(BindError::Missing(missing));
    }
    if let Some(name) = supplied.keys().next() {
        return Err(BindError::UnknownNamed {
            name: name.clone(),
            valid: inputs.iter().map(|i| i.name.clone()).collect(),
        });
    }
    Ok(bound)
}
