//! Recovery ladder: ordered strategies for locating one JSON object in model output.

use crate::error::ExtractionFailure;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, trace};

/// Which rung of the ladder produced the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStep {
    /// The trimmed text was the object itself.
    Direct,
    /// Interior of the first fence labelled `json`.
    LabeledFence,
    /// Interior of the first fence of any label.
    AnyFence,
    /// Span from the first `{` to the last `}`.
    BraceSpan,
    /// Truncated output cut back to its last complete `}` and re-closed.
    TruncationRepair,
}

/// A record recovered from raw text.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub record: Map<String, Value>,
    pub step: ExtractionStep,
}

/// A fenced block found in the text.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fence<'a> {
    label: &'a str,
    body: &'a str,
}

/// Run the ladder over `text`. `truncated` enables the repair rung for output that was cut
/// off by a token limit.
pub fn extract_record(text: &str, truncated: bool) -> Result<Extracted, ExtractionFailure> {
    let mut attempts = Attempts::default();
    let trimmed = text.trim();

    if let Some(record) = attempts.try_candidate(trimmed) {
        return Ok(found(record, ExtractionStep::Direct));
    }

    let fences = find_fences(text);
    if let Some(fence) = fences
        .iter()
        .find(|f| f.label.eq_ignore_ascii_case("json"))
    {
        if let Some(record) = attempts.try_candidate(fence.body.trim()) {
            return Ok(found(record, ExtractionStep::LabeledFence));
        }
    }

    if let Some(fence) = fences.first() {
        if let Some(record) = attempts.try_candidate(fence.body.trim()) {
            return Ok(found(record, ExtractionStep::AnyFence));
        }
    }

    if let Some(span) = brace_span(text) {
        if let Some(record) = attempts.try_candidate(span) {
            return Ok(found(record, ExtractionStep::BraceSpan));
        }
    }

    if truncated {
        if let Some(start) = text.find('{') {
            attempts.saw_candidate = true;
            let tail = text[start..].trim_end();
            let tail = tail.strip_suffix(',').unwrap_or(tail);
            if let Some(record) = repair_truncated(tail) {
                return Ok(found(record, ExtractionStep::TruncationRepair));
            }
            attempts.last_error = Some("no complete object survives truncation".to_string());
        }
    }

    Err(attempts.into_failure())
}

fn found(record: Map<String, Value>, step: ExtractionStep) -> Extracted {
    debug!(?step, fields = record.len(), "Structured record extracted");
    Extracted { record, step }
}

#[derive(Default)]
struct Attempts {
    saw_candidate: bool,
    last_error: Option<String>,
}

impl Attempts {
    /// Parse a candidate; only object-shaped text counts as having seen JSON.
    fn try_candidate(&mut self, candidate: &str) -> Option<Map<String, Value>> {
        if candidate.is_empty() {
            return None;
        }
        if candidate.contains('{') {
            self.saw_candidate = true;
        }
        match parse_object(candidate) {
            Ok(record) => Some(record),
            Err(err) => {
                trace!(error = %err, "Candidate rejected");
                self.last_error = Some(err);
                None
            }
        }
    }

    fn into_failure(self) -> ExtractionFailure {
        if self.saw_candidate {
            ExtractionFailure::MalformedJson(
                self.last_error
                    .unwrap_or_else(|| "unparseable structured output".to_string()),
            )
        } else {
            ExtractionFailure::NoJsonFound
        }
    }
}

fn parse_object(candidate: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected an object, found {}", json_type_name(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// All fenced blocks in order. An unterminated fence runs to the end of the text.
fn find_fences(text: &str) -> Vec<Fence<'_>> {
    const FENCE: &str = "```";
    let mut fences = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find(FENCE) {
        let after = &rest[open + FENCE.len()..];
        let label_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+')))
            .unwrap_or(after.len());
        let label = &after[..label_len];
        let mut body_start = &after[label_len..];
        let line_end = body_start.find('\n').unwrap_or(body_start.len());
        if body_start[..line_end].trim().is_empty() {
            body_start = &body_start[(line_end + 1).min(body_start.len())..];
        }

        match body_start.find(FENCE) {
            Some(close) => {
                fences.push(Fence {
                    label,
                    body: &body_start[..close],
                });
                rest = &body_start[close + FENCE.len()..];
            }
            None => {
                fences.push(Fence {
                    label,
                    body: body_start,
                });
                break;
            }
        }
    }

    fences
}

fn brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Walk back through every `}` that closes an object, re-closing whatever is still open
/// after it, until one prefix parses.
fn repair_truncated(candidate: &str) -> Option<Map<String, Value>> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut closings: Vec<(usize, Vec<char>)> = Vec::new();

    for (idx, ch) in candidate.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => stack.push(ch),
            '}' => {
                if stack.pop() != Some('{') {
                    break;
                }
                closings.push((idx + ch.len_utf8(), stack.clone()));
                if stack.is_empty() {
                    break;
                }
            }
            ']' => {
                if stack.pop() != Some('[') {
                    break;
                }
            }
            _ => {}
        }
    }

    for (end, open) in closings.iter().rev() {
        let mut repaired = String::with_capacity(end + open.len());
        repaired.push_str(&candidate[..*end]);
        for opener in open.iter().rev() {
            repaired.push(if *opener == '{' { '}' } else { ']' });
        }
        if let Ok(record) = parse_object(&repaired) {
            return Some(record);
        }
    }
    None
}
