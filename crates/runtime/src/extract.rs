//! Directive extraction from backend completions.
//!
//! Two tiers, kept apart on purpose so callers can tell trusted directives
//! from speculative ones:
//!
//! 1. [`structured`]: the backend's structured tool-call field, taken
//!    verbatim.
//! 2. [`fallback`]: a scan of the free text for exactly one embedded call
//!    blob. Anything less clear-cut is ambiguous and yields no directive.
//!
//! Extraction never touches history.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::backend::{Completion, StructuredCall};
use crate::types::{Confidence, ToolCallDirective};

const NAME_KEYS: [&str; 3] = ["name", "tool", "tool_name"];
const ARGUMENT_KEYS: [&str; 4] = ["arguments", "args", "parameters", "input"];
const WRAPPER_KEYS: [&str; 4] = ["tool_call", "function_call", "function", "tool"];

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n?(.*?)```").expect("fence pattern is valid")
});

static CALL_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(name|tool|tool_name|tool_call|function|function_call|arguments|args|parameters)"\s*:"#)
        .expect("call key pattern is valid")
});

/// Call syntax that may directly follow a tool name: `(`, or `key=value`
/// optionally introduced by "with" / "using arguments:".
const CALL_SYNTAX: &str = r"\s*(?:\(|(?:(?:with|using)(?:\s+(?:arguments|args|parameters))?\s*:?\s*)?[A-Za-z_][A-Za-z0-9_]*\s*=\s*[^\s,;=]+)";

/// What one backend turn asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// `None` for a plain final answer.
    pub confidence: Option<Confidence>,
    pub directives: Vec<ToolCallDirective>,
    pub raw_text: String,
    /// Why the turn was ambiguous, when it was.
    pub ambiguity: Option<String>,
}

impl Extraction {
    fn final_answer(text: &str) -> Self {
        Self {
            confidence: None,
            directives: Vec::new(),
            raw_text: text.to_string(),
            ambiguity: None,
        }
    }

    fn ambiguous(text: &str, reason: impl Into<String>) -> Self {
        Self {
            confidence: Some(Confidence::Ambiguous),
            directives: Vec::new(),
            raw_text: text.to_string(),
            ambiguity: Some(reason.into()),
        }
    }

    fn calls(text: &str, confidence: Confidence, directives: Vec<ToolCallDirective>) -> Self {
        Self {
            confidence: Some(confidence),
            directives,
            raw_text: text.to_string(),
            ambiguity: None,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        self.confidence == Some(Confidence::Ambiguous)
    }
}

/// Turns completions into directives.
#[derive(Debug, Clone, Copy)]
pub struct Extractor {
    allow_multi_call: bool,
}

impl Default for Extractor {
    fn default() -> Self {
        Self {
            allow_multi_call: true,
        }
    }
}

impl Extractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether one turn may carry several structured calls.
    pub fn allow_multi_call(mut self, allow: bool) -> Self {
        self.allow_multi_call = allow;
        self
    }

    /// Structured calls win; the text is only scanned when there are none.
    pub fn extract(&self, completion: &Completion, tool_names: &[&str]) -> Extraction {
        if completion.structured_calls.is_empty() {
            fallback(&completion.content, tool_names)
        } else {
            structured(
                &completion.content,
                &completion.structured_calls,
                self.allow_multi_call,
            )
        }
    }
}

fn new_call_id() -> String {
    Uuid::new_v4().to_string()
}

/// Directives from the backend's structured field, arguments untouched.
pub fn structured(text: &str, calls: &[StructuredCall], allow_multi_call: bool) -> Extraction {
    if calls.len() > 1 && !allow_multi_call {
        return Extraction::ambiguous(
            text,
            format!("{} tool calls in one turn but multi-call turns are disabled", calls.len()),
        );
    }

    let mut directives: Vec<ToolCallDirective> = Vec::with_capacity(calls.len());
    for call in calls {
        if call.name.trim().is_empty() {
            return Extraction::ambiguous(text, "structured call without a tool name");
        }
        let Value::Object(arguments) = &call.arguments else {
            return Extraction::ambiguous(
                text,
                format!("structured call to '{}' has non-object arguments", call.name),
            );
        };
        let call_id = match &call.id {
            Some(id) if !directives.iter().any(|d| &d.call_id == id) => id.clone(),
            _ => new_call_id(),
        };
        directives.push(ToolCallDirective {
            call_id,
            tool_name: call.name.clone(),
            arguments: arguments.clone(),
            raw_source_text: json!({"name": call.name, "arguments": call.arguments}).to_string(),
            confidence: Confidence::Structured,
        });
    }
    Extraction::calls(text, Confidence::Structured, directives)
}

#[derive(Debug, Clone, PartialEq)]
enum Candidate {
    Complete {
        name: String,
        arguments: Map<String, Value>,
        source: String,
    },
    Incomplete {
        reason: String,
    },
}

/// At most one directive recovered from free text.
pub fn fallback(text: &str, tool_names: &[&str]) -> Extraction {
    let mut candidates = scan(text, tool_names);
    match candidates.len() {
        0 if describes_call(text, tool_names) => {
            Extraction::ambiguous(text, "text describes a tool call without a parseable payload")
        }
        0 => Extraction::final_answer(text),
        1 => match candidates.remove(0) {
            Candidate::Complete {
                name,
                arguments,
                source,
            } => Extraction::calls(text, Confidence::Parsed, vec![ToolCallDirective {
                call_id: new_call_id(),
                tool_name: name,
                arguments,
                raw_source_text: source,
                confidence: Confidence::Parsed,
            }]),
            Candidate::Incomplete { reason } => Extraction::ambiguous(text, reason),
        },
        n => Extraction::ambiguous(text, format!("{n} tool call candidates in one response")),
    }
}

fn scan(text: &str, tool_names: &[&str]) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let mut fenced: Vec<Range<usize>> = Vec::new();

    for cap in FENCE.captures_iter(text) {
        let (Some(whole), Some(body)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        fenced.push(whole.range());
        let body = body.as_str().trim();
        match serde_json::from_str::<Value>(body) {
            Ok(value) => collect(&value, body, tool_names, &mut candidates),
            Err(_) if CALL_KEY.is_match(body) || mentions_tool(body, tool_names) => {
                candidates.push(Candidate::Incomplete {
                    reason: "code block looks like a tool call but is not valid JSON".into(),
                })
            }
            Err(_) => {}
        }
    }

    let mut pos = 0;
    while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        if let Some(fence) = fenced.iter().find(|r| r.contains(&start)) {
            pos = fence.end;
            continue;
        }
        let mut values = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => {
                let end = start + values.byte_offset();
                collect(&value, &text[start..end], tool_names, &mut candidates);
                pos = end;
            }
            _ => {
                let probe_end = text[start..].find('}').map_or(text.len(), |i| start + i + 1);
                if CALL_KEY.is_match(&text[start..probe_end]) {
                    candidates.push(Candidate::Incomplete {
                        reason: "inline object looks like a tool call but is not valid JSON".into(),
                    });
                }
                pos = start + 1;
            }
        }
    }

    candidates
}

fn collect(value: &Value, source: &str, tool_names: &[&str], out: &mut Vec<Candidate>) {
    match value {
        Value::Object(map) => out.extend(classify(map, source, tool_names)),
        Value::Array(items) => {
            for item in items {
                if let Value::Object(map) = item {
                    out.extend(classify(map, &item.to_string(), tool_names));
                }
            }
        }
        _ => {}
    }
}

fn classify(map: &Map<String, Value>, source: &str, tool_names: &[&str]) -> Option<Candidate> {
    for key in WRAPPER_KEYS {
        if let Some(Value::Object(inner)) = map.get(key) {
            return classify(inner, source, tool_names);
        }
    }

    match map.get("action").and_then(Value::as_str) {
        Some("call_tool") => {}
        Some(_) => return None,
        None => {}
    }

    let name = NAME_KEYS.iter().find_map(|key| map.get(*key));
    let arguments = ARGUMENT_KEYS.iter().find_map(|key| map.get(*key));

    let name = match (name, arguments) {
        (None, None) => return None,
        (None, Some(_)) => {
            return Some(Candidate::Incomplete {
                reason: "arguments without a tool name".into(),
            });
        }
        (Some(Value::String(name)), _) if !name.trim().is_empty() => name.clone(),
        (Some(_), _) => {
            return Some(Candidate::Incomplete {
                reason: "tool name is not a string".into(),
            });
        }
    };

    let arguments = match arguments {
        Some(Value::Object(arguments)) => arguments.clone(),
        Some(Value::String(encoded)) => match serde_json::from_str::<Value>(encoded) {
            Ok(Value::Object(arguments)) => arguments,
            _ => {
                return Some(Candidate::Incomplete {
                    reason: format!("arguments for '{name}' are not a JSON object"),
                });
            }
        },
        Some(_) => {
            return Some(Candidate::Incomplete {
                reason: format!("arguments for '{name}' are not a JSON object"),
            });
        }
        // A bare `{"name": ...}` is ordinary data unless it names a tool.
        None if tool_names.contains(&name.as_str()) => {
            return Some(Candidate::Incomplete {
                reason: format!("call to '{name}' has no arguments"),
            });
        }
        None => return None,
    };

    Some(Candidate::Complete {
        name,
        arguments,
        source: source.to_string(),
    })
}

fn tool_word(name: &str) -> Option<Regex> {
    Regex::new(&format!(r"\b{}\b", regex::escape(name))).ok()
}

fn mentions_tool(text: &str, tool_names: &[&str]) -> bool {
    tool_names
        .iter()
        .filter_map(|name| tool_word(name))
        .any(|re| re.is_match(text))
}

/// Prose that names a tool alongside call syntax: `add(3, 4)` or
/// `add with a=3, b=4`.
fn describes_call(text: &str, tool_names: &[&str]) -> bool {
    tool_names.iter().any(|name| {
        Regex::new(&format!(r"\b{}\b{CALL_SYNTAX}", regex::escape(name)))
            .is_ok_and(|re| re.is_match(text))
    })
}
