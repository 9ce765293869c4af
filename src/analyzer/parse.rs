//! Lenient decoding of model output into raw findings.
//!
//! Responses are tried as-is first. If that fails, the repair passes run in
//! order, each applied to the output of the previous one, with a parse
//! attempt after every pass. Each pass is idempotent.
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// The model's reply could not be turned into findings.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("unparseable model response: {error}")]
pub struct ParseFailure {
    pub raw: String,
    pub error: String,
}

type Repair = fn(&str) -> String;

const REPAIRS: &[(&str, Repair)] = &[
    ("extract_body", extract_body),
    ("escape_control_chars", escape_control_chars),
    ("strip_trailing_commas", strip_trailing_commas),
    ("close_truncated", close_truncated),
];

/// Parse `raw` as JSON, repairing it if needed.
pub fn parse_json(raw: &str) -> Result<Value, ParseFailure> {
    let first_error = match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    let mut text = raw.to_string();
    for (name, repair) in REPAIRS {
        text = repair(&text);
        if let Ok(value) = serde_json::from_str::<Value>(&text) {
            debug!("Model response parsed after repair pass {name}");
            return Ok(value);
        }
    }

    Err(ParseFailure {
        raw: raw.to_string(),
        error: first_error.to_string(),
    })
}

/// A finding as the model reported it, before locating and normalizing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFinding {
    pub issue: Option<String>,
    pub reasoning: Option<String>,
    pub mitigation: Option<String>,
    pub severity: Option<String>,
    pub confidence: Option<f64>,
    pub code_snippet: Option<String>,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
    pub cwe_id: Option<String>,
    pub tags: Vec<String>,
}

fn text_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<i64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numeric confidence, accepting percentages and level words.
fn confidence_field(obj: &serde_json::Map<String, Value>) -> Option<f64> {
    match obj.get("confidence")? {
        Value::Number(n) => n.as_f64().map(|f| if f > 1.0 { f / 100.0 } else { f }),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "high" => Some(0.9),
            "medium" => Some(0.6),
            "low" => Some(0.3),
            other => other.trim_end_matches('%').parse::<f64>().ok().map(|f| {
                if f > 1.0 { f / 100.0 } else { f }
            }),
        },
        _ => None,
    }
}

impl RawFinding {
    fn from_object(obj: &serde_json::Map<String, Value>) -> Self {
        let tags = match obj.get("tags") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            _ => Vec::new(),
        };
        Self {
            issue: text_field(obj, "issue").or_else(|| text_field(obj, "title")),
            reasoning: text_field(obj, "reasoning"),
            mitigation: text_field(obj, "mitigation"),
            severity: text_field(obj, "severity"),
            confidence: confidence_field(obj),
            code_snippet: text_field(obj, "code_snippet"),
            line_start: int_field(obj, "line_start"),
            line_end: int_field(obj, "line_end"),
            cwe_id: text_field(obj, "cwe_id").or_else(|| text_field(obj, "cwe")),
            tags,
        }
    }
}

/// Findings from `{"reviews": [...]}`, `{"findings": [...]}` or a bare array.
pub fn parse_findings(raw: &str) -> Result<Vec<RawFinding>, ParseFailure> {
    let value = parse_json(raw)?;
    let items = match &value {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("reviews").or_else(|| obj.get("findings")) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) => return Ok(Vec::new()),
            None if obj.is_empty() => return Ok(Vec::new()),
            _ => {
                return Err(ParseFailure {
                    raw: raw.to_string(),
                    error: "response has no reviews or findings array".to_string(),
                });
            }
        },
        Value::Null => return Ok(Vec::new()),
        _ => {
            return Err(ParseFailure {
                raw: raw.to_string(),
                error: "response is neither an object nor an array".to_string(),
            });
        }
    };

    let findings: Vec<RawFinding> = items
        .iter()
        .filter_map(|item| match item {
            Value::Object(obj) => Some(RawFinding::from_object(obj)),
            other => {
                warn!("Skipping malformed finding entry: {other}");
                None
            }
        })
        .collect();
    Ok(findings)
}

// ── Repair passes ──────────────────────────────────────────────────────────

/// Strip markdown fences and surrounding prose.
pub fn extract_body(text: &str) -> String {
    let mut body = text.trim();

    if let Some(open) = body.find("```") {
        let after = &body[open + 3..];
        // Skip the info string (`json`, `JSON`, ...).
        let after = match after.find('\n') {
            Some(nl) if after[..nl].trim().chars().all(|c| c.is_ascii_alphanumeric()) => {
                &after[nl + 1..]
            }
            _ => after,
        };
        body = match after.find("```") {
            Some(close) => &after[..close],
            None => after,
        };
        body = body.trim();
    }

    let Some(start) = body.find(['{', '[']) else {
        return body.to_string();
    };
    let body = &body[start..];
    match value_end(body) {
        Some(end) => body[..end].to_string(),
        // Unterminated; closing handles it.
        None => body.to_string(),
    }
}

/// Byte offset just past the first complete top-level value of `text`.
fn value_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Escape raw control characters that appear inside string literals.
pub fn escape_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}

/// Drop commas (and runs of commas) directly before a closing bracket.
pub fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..]
                .iter()
                .find(|n| !n.is_whitespace() && **n != ',');
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Close a response cut off mid-stream: terminate the open string, give a
/// dangling key a null value and close every open bracket.
pub fn close_truncated(text: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut string_is_key = false;
    let mut last_string_was_key = false;
    let mut last_significant = '\0';

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                last_string_was_key = string_is_key;
                last_significant = '"';
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                string_is_key = stack.last() == Some(&'}') && matches!(last_significant, '{' | ',');
            }
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
        if !c.is_whitespace() {
            last_significant = c;
        }
    }

    if stack.is_empty() && !in_string {
        return text.to_string();
    }

    let mut out = text.to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
        if string_is_key {
            out.push_str(": null");
        }
    } else {
        let trimmed = out.trim_end().len();
        out.truncate(trimmed);
        if out.ends_with(',') {
            out.pop();
        } else if out.ends_with(':') {
            out.push_str(" null");
        } else if last_significant == '"' && last_string_was_key {
            out.push_str(": null");
        }
    }

    for closer in stack.iter().rev() {
        out.push(*closer);
    }
    out
}
