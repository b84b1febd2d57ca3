//! Structured output extraction
//!
//! Agents and scripts answer with free text. This module pulls a structured
//! payload out of that text and checks it against the step's JSON Schema.
//!
//! Extraction goes through a registry of [`StructuredParser`]s tried in
//! priority order, so new answer formats can be added without touching the
//! executor.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::workflow::{OutputSpec, OutputType};

/// Extraction or validation failure; the message is the reason shown to users
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ExtractError(pub String);

/// Collaborator turning raw step output into a context value
pub trait OutputExtractor: Send + Sync {
    fn extract(&self, raw: &str, spec: Option<&OutputSpec>) -> Result<Value, ExtractError>;
}

// ============================================================================
// Parser Trait
// ============================================================================

/// Recognises one way of embedding structured data in text
pub trait StructuredParser: Send + Sync {
    /// Returns `Some` if the content contains a payload in this parser's format
    fn parse(&self, content: &str) -> Option<Value>;

    /// Parser name for logging/debugging
    fn name(&self) -> &'static str;

    /// Priority (higher = try first)
    fn priority(&self) -> u32;
}

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```([A-Za-z]*)[ \t]*\r?\n(.*?)```").expect("Invalid fence regex")
});

/// Markdown code fences tagged `json`, `yaml`/`yml` or untagged.
/// The last fence that parses wins.
pub struct FencedBlockParser;

impl StructuredParser for FencedBlockParser {
    fn parse(&self, content: &str) -> Option<Value> {
        let mut found = None;
        for caps in FENCE_RE.captures_iter(content) {
            let lang = caps.get(1).map_or("", |m| m.as_str()).to_lowercase();
            let body = caps.get(2).map_or("", |m| m.as_str());
            let parsed = match lang.as_str() {
                "json" | "" => serde_json::from_str::<Value>(body.trim()).ok(),
                "yaml" | "yml" => serde_yaml::from_str::<Value>(body)
                    .ok()
                    .filter(|v| v.is_object() || v.is_array()),
                _ => None,
            };
            if parsed.is_some() {
                found = parsed;
            }
        }
        found
    }

    fn name(&self) -> &'static str {
        "FencedBlockParser"
    }

    fn priority(&self) -> u32 {
        100
    }
}

/// Bare JSON: the whole text, or the outermost `{...}` / `[...]` span in it
pub struct BareJsonParser;

impl StructuredParser for BareJsonParser {
    fn parse(&self, content: &str) -> Option<Value> {
        let content = content.trim();
        if let Ok(value) = serde_json::from_str::<Value>(content) {
            return Some(value);
        }
        for (open, close) in [('{', '}'), ('[', ']')] {
            let (Some(start), Some(end)) = (content.find(open), content.rfind(close)) else {
                continue;
            };
            if end > start {
                if let Ok(value) = serde_json::from_str::<Value>(&content[start..=end]) {
                    return Some(value);
                }
            }
        }
        None
    }

    fn name(&self) -> &'static str {
        "BareJsonParser"
    }

    fn priority(&self) -> u32 {
        50
    }
}

// ============================================================================
// Extractor
// ============================================================================

/// [`OutputExtractor`] backed by a priority-ordered parser registry
pub struct StructuredExtractor {
    parsers: Vec<Box<dyn StructuredParser>>,
}

impl Default for StructuredExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl StructuredExtractor {
    /// Create an extractor with all built-in parsers
    pub fn new() -> Self {
        let mut parsers: Vec<Box<dyn StructuredParser>> =
            vec![Box::new(BareJsonParser), Box::new(FencedBlockParser)];
        parsers.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Self { parsers }
    }

    /// Add a parser, keeping priority order
    pub fn with_parser(mut self, parser: Box<dyn StructuredParser>) -> Self {
        self.parsers.push(parser);
        self.parsers.sort_by(|a, b| b.priority().cmp(&a.priority()));
        self
    }

    /// First payload found, with the name of the parser that found it
    pub fn parse(&self, content: &str) -> Option<(Value, &'static str)> {
        self.parsers
            .iter()
            .find_map(|p| p.parse(content).map(|v| (v, p.name())))
    }

    pub fn parser_names(&self) -> Vec<&'static str> {
        self.parsers.iter().map(|p| p.name()).collect()
    }
}

impl OutputExtractor for StructuredExtractor {
    fn extract(&self, raw: &str, spec: Option<&OutputSpec>) -> Result<Value, ExtractError> {
        let Some(spec) = spec else {
            return Ok(match self.parse(raw) {
                Some((value, _)) if value.is_object() || value.is_array() => value,
                _ => Value::String(raw.trim().to_string()),
            });
        };

        let value = match spec.ty {
            OutputType::Text => Value::String(raw.trim().to_string()),
            OutputType::Json => {
                let (value, parser) = self
                    .parse(raw)
                    .ok_or_else(|| ExtractError("no structured payload found in output".to_string()))?;
                tracing::debug!("Extracted structured output with {}", parser);
                value
            }
        };

        if let Some(schema) = &spec.schema {
            validate_schema(schema, &value)?;
        }
        Ok(value)
    }
}

/// Check that a schema compiles
pub fn compile_schema(schema: &Value) -> Result<(), ExtractError> {
    jsonschema::validator_for(schema)
        .map(|_| ())
        .map_err(|e| ExtractError(format!("invalid output schema: {}", e)))
}

/// Validate a value against a JSON Schema, listing every violation
pub fn validate_schema(schema: &Value, instance: &Value) -> Result<(), ExtractError> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| ExtractError(format!("invalid output schema: {}", e)))?;

    let errors: Vec<String> = validator
        .iter_errors(instance)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ExtractError(format!(
            "output does not match schema: {}",
            errors.join("; ")
        )))
    }
}
