//! Best-effort recovery of JSON from model completions.
//!
//! Completions arrive wrapped in prose or markdown fences, cut off mid-array
//! when the token limit is reached, or with small syntax slips. The parser
//! tries progressively more forgiving strategies:
//!
//! 1. take the first fenced code block (optionally tagged `json`) if any,
//! 2. strict parse,
//! 3. strict parse of the first `[...]` span,
//! 4. for a truncated array, rebuild it from the complete `{...}` objects,
//! 5. only when there is no `[` at all, the first `{...}` span,
//! 6. for each span, quote bare keys and drop trailing commas, then one
//!    more strict parse.
//!
//! [`parse_object`] serves callers that expect an object and tries the
//! `{...}` span first.
//!
//! All bracket scanning skips string literals, so a `]` or `}` inside a
//! quoted value never desynchronizes the depth count. Values are never
//! invented: only incomplete trailing structure is discarded and only
//! syntax is repaired.

use std::sync::LazyLock;

use miette::Diagnostic;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

static RE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").unwrap());

/// No structured value could be recovered. Callers treat this as "no
/// results from this call".
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
#[error("could not recover structured data: {reason}")]
#[diagnostic(
    code(loom::salvage::parse_failure),
    help("The completion contained no recoverable JSON array or object.")
)]
pub struct ParseFailure {
    pub reason: String,
}

impl ParseFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Which step produced the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// The working text was valid JSON as-is.
    Direct,
    /// The first balanced `[...]` span parsed.
    BracketMatched,
    /// The array was truncated and rebuilt from its complete objects.
    Reconstructed,
    /// The first balanced `{...}` span parsed.
    ObjectMatched,
    /// Parsed only after bare keys were quoted and trailing commas dropped.
    Repaired,
}

/// A recovered value and how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Salvaged {
    pub value: Value,
    pub strategy: Strategy,
    /// Whether the value came from inside a fenced code block.
    pub fenced: bool,
}

/// Recover a JSON array or object from `text`.
pub fn parse(text: &str) -> Result<Value, ParseFailure> {
    parse_detailed(text).map(|s| s.value)
}

/// Like [`parse`], also reporting which strategy succeeded.
///
/// When the text holds any `[`, the first array wins, even inside a wrapper
/// object. A `{...}` span is only tried when no array is present.
pub fn parse_detailed(text: &str) -> Result<Salvaged, ParseFailure> {
    let (working, fenced) = working_text(text)?;
    let found = |(value, strategy): (Value, Strategy)| Salvaged {
        value,
        strategy,
        fenced,
    };

    if let Some(value) = strict(working) {
        return Ok(found((value, Strategy::Direct)));
    }

    match working.find('[') {
        Some(start) => array_at(working, start).map(found),
        None => object_at(working).map(found),
    }
}

/// Recover a JSON object, for replies that are expected to be one (such as
/// a label mapping whose values are arrays).
///
/// Unlike [`parse`], the first `{...}` span is preferred over any array.
pub fn parse_object(text: &str) -> Result<Salvaged, ParseFailure> {
    let (working, fenced) = working_text(text)?;
    let found = |(value, strategy): (Value, Strategy)| Salvaged {
        value,
        strategy,
        fenced,
    };

    if let Some(value) = strict(working).filter(Value::is_object) {
        return Ok(found((value, Strategy::Direct)));
    }
    object_at(working).map(found)
}

/// The first fenced block, or the whole text, trimmed.
fn working_text(text: &str) -> Result<(&str, bool), ParseFailure> {
    let fenced_block = RE_FENCE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str());
    let working = fenced_block.unwrap_or(text).trim();
    if working.is_empty() {
        return Err(ParseFailure::new("empty completion"));
    }
    Ok((working, fenced_block.is_some()))
}

/// The array opening at `start`: its balanced span, or a rebuild from the
/// complete objects when it was cut off.
fn array_at(working: &str, start: usize) -> Result<(Value, Strategy), ParseFailure> {
    match matching_close(working, start) {
        Some(end) => parse_span(&working[start..=end], Strategy::BracketMatched).ok_or_else(
            || ParseFailure::new("found JSON-like structure but could not parse it"),
        ),
        None => {
            let objects = complete_objects(working, start);
            if objects.is_empty() {
                return Err(ParseFailure::new(
                    "truncated array contains no complete object",
                ));
            }
            tracing::debug!(objects = objects.len(), "rebuilding truncated array");
            let rebuilt = format!("[{}]", objects.join(","));
            parse_span(&rebuilt, Strategy::Reconstructed).ok_or_else(|| {
                ParseFailure::new("found JSON-like structure but could not parse it")
            })
        }
    }
}

/// The first balanced `{...}` span.
fn object_at(working: &str) -> Result<(Value, Strategy), ParseFailure> {
    let Some(start) = working.find('{') else {
        return Err(ParseFailure::new("no JSON array or object found"));
    };
    matching_close(working, start)
        .and_then(|end| parse_span(&working[start..=end], Strategy::ObjectMatched))
        .ok_or_else(|| ParseFailure::new("found JSON-like structure but could not parse it"))
}

/// Strict parse of a candidate span, then one attempt after repair.
fn parse_span(candidate: &str, strategy: Strategy) -> Option<(Value, Strategy)> {
    if let Some(value) = strict(candidate) {
        return Some((value, strategy));
    }
    let value = strict(&repair(candidate))?;
    tracing::debug!("completion parsed after syntactic repair");
    Some((value, Strategy::Repaired))
}

/// Recover a list of records. An object becomes a one-element list; a
/// failure is logged and yields no records.
pub fn parse_array(text: &str) -> Vec<Value> {
    match parse(text) {
        Ok(Value::Array(items)) => items,
        Ok(other) => vec![other],
        Err(failure) => {
            tracing::warn!(reason = %failure.reason, "no records recovered from completion");
            Vec::new()
        }
    }
}

/// Strict parse accepting only arrays and objects.
fn strict(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(|v| v.is_array() || v.is_object())
}

// ---------------------------------------------------------------------------
// String-aware scanning
// ---------------------------------------------------------------------------

/// Tracks whether the scan position is inside a JSON string literal.
#[derive(Default)]
struct Lexer {
    in_string: bool,
    escaped: bool,
}

impl Lexer {
    /// Feed one character; returns `true` if it is structural (outside any
    /// string literal and not a quote).
    fn structural(&mut self, c: char) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == '"' {
                self.in_string = false;
            }
            false
        } else if c == '"' {
            self.in_string = true;
            false
        } else {
            true
        }
    }
}

/// Byte index of the bracket closing the one at `start`, if it is present.
fn matching_close(text: &str, start: usize) -> Option<usize> {
    let open = text[start..].chars().next()?;
    let close = match open {
        '[' => ']',
        '{' => '}',
        _ => return None,
    };

    let mut lexer = Lexer::default();
    let mut depth = 0usize;
    for (offset, c) in text[start..].char_indices() {
        if !lexer.structural(c) {
            continue;
        }
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(start + offset);
            }
        }
    }
    None
}

/// Every complete top-level `{...}` after the `[` at `start`.
fn complete_objects(text: &str, start: usize) -> Vec<&str> {
    let body_start = start + 1;
    let mut lexer = Lexer::default();
    let mut objects = Vec::new();
    let mut depth = 0usize;
    let mut object_start = 0;

    for (offset, c) in text[body_start..].char_indices() {
        if !lexer.structural(c) {
            continue;
        }
        match c {
            '{' => {
                if depth == 0 {
                    object_start = body_start + offset;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    objects.push(&text[object_start..=body_start + offset]);
                }
            }
            _ => {}
        }
    }
    objects
}

/// Quote bare object keys and drop commas that directly precede `]` or `}`.
fn repair(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut lexer = Lexer::default();
    // Last structural non-whitespace character emitted.
    let mut last = '\0';
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if !lexer.structural(c) {
            out.push(c);
            if c == '"' && !lexer.in_string {
                last = '"';
            }
            i += 1;
            continue;
        }

        if c == ',' {
            let next = next_non_whitespace(&chars, i + 1);
            if !matches!(next, Some(']') | Some('}')) {
                out.push(c);
                last = c;
            }
            i += 1;
            continue;
        }

        if is_key_char(c) && matches!(last, '{' | ',') {
            let end = chars[i..]
                .iter()
                .position(|ch| !is_key_char(*ch))
                .map_or(chars.len(), |p| i + p);
            let word: String = chars[i..end].iter().collect();
            if next_non_whitespace(&chars, end) == Some(':') {
                out.push('"');
                out.push_str(&word);
                out.push('"');
            } else {
                out.push_str(&word);
            }
            last = chars[end - 1];
            i = end;
            continue;
        }

        out.push(c);
        if !c.is_whitespace() {
            last = c;
        }
        i += 1;
    }
    out
}

fn is_key_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn next_non_whitespace(chars: &[char], from: usize) -> Option<char> {
    chars[from.min(chars.len())..]
        .iter()
        .copied()
        .find(|c| !c.is_whitespace())
}
