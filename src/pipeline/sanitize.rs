//! Response sanitizing: turn a raw model reply into validated structured data.
//!
//! ## Why is sanitizing necessary?
//!
//! Even when told to "return only JSON", models wrap replies in ```json
//! fences, prepend a sentence of prose, leave trailing commas, use
//! typographic quotes, or get cut off mid-object when they hit the token
//! limit. Rather than fail the document on every such quirk, the sanitizer
//! runs a fixed sequence of deterministic, string-aware repairs and keeps the
//! first one that makes the text parse.
//!
//! ## Steps
//!
//! 1. Normalise the text (CRLF, BOM, zero-width characters) and strip the
//!    first fenced code block, whatever its language tag.
//! 2. Strict parse. If it succeeds no repair is recorded.
//! 3. Otherwise apply each [`RepairStrategy`] of the [`RepairPolicy`] in
//!    order, cumulatively, re-parsing after every repair that changed the
//!    text. The strategies that changed the text are recorded.
//! 4. Conform the value to the contract's [`RecordShape`].
//! 5. Check fields and criteria. These issues are advisory only.
//!
//! Every function here is pure: no I/O, no clock, no randomness.

use crate::contract::{ExtractionContract, RecordShape};
use crate::document::normalise_text;
use crate::output::{ExtractionResult, IssueKind, ValidationIssue};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One deterministic text repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    /// Keep one balanced `{..}` / `[..]` span, dropping prose around it.
    /// With an expected shape, bracketed prose such as a `[12]` citation is
    /// skipped in favour of a span that fits.
    ExtractSpan,
    /// Replace typographic quotes used as JSON delimiters with ASCII quotes.
    NormalizeQuotes,
    /// Remove `//` and `/* */` comments outside strings.
    StripComments,
    /// Drop commas directly before `}` or `]`.
    TrailingCommas,
    /// Close an unterminated string and any open objects/arrays (truncated replies).
    CloseStructures,
}

impl RepairStrategy {
    pub fn default_order() -> Vec<Self> {
        vec![
            RepairStrategy::ExtractSpan,
            RepairStrategy::NormalizeQuotes,
            RepairStrategy::StripComments,
            RepairStrategy::TrailingCommas,
            RepairStrategy::CloseStructures,
        ]
    }

    /// Apply this repair. Returns the input unchanged when it does not apply.
    pub fn apply(self, input: &str) -> String {
        self.apply_for(input, None)
    }

    /// Apply this repair knowing which record shape the caller expects.
    pub fn apply_for(self, input: &str, shape: Option<RecordShape>) -> String {
        match self {
            RepairStrategy::ExtractSpan => extract_span(input, shape),
            RepairStrategy::NormalizeQuotes => normalize_quotes(input),
            RepairStrategy::StripComments => strip_comments(input),
            RepairStrategy::TrailingCommas => remove_trailing_commas(input),
            RepairStrategy::CloseStructures => close_structures(input),
        }
    }
}

impl fmt::Display for RepairStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RepairStrategy::ExtractSpan => "extract-span",
            RepairStrategy::NormalizeQuotes => "normalize-quotes",
            RepairStrategy::StripComments => "strip-comments",
            RepairStrategy::TrailingCommas => "trailing-commas",
            RepairStrategy::CloseStructures => "close-structures",
        };
        f.write_str(s)
    }
}

/// Ordered list of repairs to try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairPolicy {
    order: Vec<RepairStrategy>,
}

impl RepairPolicy {
    pub fn new(order: Vec<RepairStrategy>) -> Self {
        Self { order }
    }

    /// Strict parsing only.
    pub fn none() -> Self {
        Self { order: Vec::new() }
    }

    pub fn order(&self) -> &[RepairStrategy] {
        &self.order
    }
}

impl Default for RepairPolicy {
    fn default() -> Self {
        Self::new(RepairStrategy::default_order())
    }
}

/// Outcome of recovering a JSON value from reply text.
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    /// The recovered value, `None` when nothing parsed.
    pub value: Option<Value>,
    /// A single [`IssueKind::Parse`] issue when `value` is `None`.
    pub issues: Vec<ValidationIssue>,
    /// Repairs that changed the text, in the order applied.
    pub repairs: Vec<RepairStrategy>,
}

/// Recover a JSON value from a raw reply.
pub fn sanitize(raw: &str, policy: &RepairPolicy) -> Sanitized {
    sanitize_as(raw, policy, None)
}

/// Recover a JSON value from a raw reply that should hold `shape` records.
///
/// The shape only guides which span of a prose-wrapped reply is kept; the
/// recovered value is not conformed here.
pub fn sanitize_as(raw: &str, policy: &RepairPolicy, shape: Option<RecordShape>) -> Sanitized {
    let text = strip_fences(&normalise_text(raw));
    if text.is_empty() {
        return Sanitized {
            value: None,
            issues: vec![ValidationIssue::new(IssueKind::Parse, None, "reply is empty")],
            repairs: Vec::new(),
        };
    }

    let first_error = match serde_json::from_str::<Value>(&text) {
        Ok(value) => {
            return Sanitized {
                value: Some(value),
                issues: Vec::new(),
                repairs: Vec::new(),
            }
        }
        Err(e) => e,
    };

    let mut current = text;
    let mut repairs = Vec::new();
    for &strategy in policy.order() {
        let next = strategy.apply_for(&current, shape);
        if next == current {
            continue;
        }
        repairs.push(strategy);
        current = next;
        if let Ok(value) = serde_json::from_str::<Value>(&current) {
            return Sanitized {
                value: Some(value),
                issues: Vec::new(),
                repairs,
            };
        }
    }

    Sanitized {
        value: None,
        issues: vec![ValidationIssue::new(
            IssueKind::Parse,
            None,
            format!(
                "no JSON value could be recovered ({} repair(s) applied): {first_error}",
                repairs.len()
            ),
        )],
        repairs,
    }
}

/// Conform a parsed value to the declared record shape.
///
/// `Single` accepts an object, or a one-element array holding an object.
/// `Many` accepts an array of objects, or a lone object which is wrapped.
/// Anything else yields a [`IssueKind::Shape`] issue and no value.
pub fn conform_shape(value: Value, shape: RecordShape) -> Result<Value, ValidationIssue> {
    match (shape, value) {
        (RecordShape::Single, Value::Object(map)) => Ok(Value::Object(map)),
        (RecordShape::Single, Value::Array(mut items))
            if items.len() == 1 && items[0].is_object() =>
        {
            Ok(items.remove(0))
        }
        (RecordShape::Single, other) => Err(ValidationIssue::new(
            IssueKind::Shape,
            None,
            format!("expected a JSON object, found {}", json_type(&other)),
        )),
        (RecordShape::Many, Value::Object(map)) => Ok(Value::Array(vec![Value::Object(map)])),
        (RecordShape::Many, Value::Array(items)) => {
            match items.iter().position(|v| !v.is_object()) {
                None => Ok(Value::Array(items)),
                Some(i) => Err(ValidationIssue::new(
                    IssueKind::Shape,
                    Some(&i.to_string()),
                    format!("expected an array of objects, element is {}", json_type(&items[i])),
                )),
            }
        }
        (RecordShape::Many, other) => Err(ValidationIssue::new(
            IssueKind::Shape,
            None,
            format!("expected a JSON array of objects, found {}", json_type(&other)),
        )),
    }
}

/// Advisory field and criteria checks for a shaped value.
pub fn validate(value: &Value, contract: &ExtractionContract) -> Vec<ValidationIssue> {
    match value {
        Value::Array(records) if contract.record_shape() == RecordShape::Many => records
            .iter()
            .enumerate()
            .flat_map(|(i, record)| contract.validate_record(record, &i.to_string()))
            .collect(),
        record => contract.validate_record(record, ""),
    }
}

/// Full sanitizer: recover, conform, validate.
pub fn sanitize_reply(
    source_id: &str,
    raw: &str,
    contract: &ExtractionContract,
    policy: &RepairPolicy,
) -> ExtractionResult {
    let Sanitized {
        value,
        issues,
        repairs,
    } = sanitize_as(raw, policy, Some(contract.record_shape()));
    let Some(value) = value else {
        return ExtractionResult::new(source_id, Value::Null, issues, repairs);
    };
    match conform_shape(value, contract.record_shape()) {
        Ok(shaped) => {
            let issues = validate(&shaped, contract);
            ExtractionResult::new(source_id, shaped, issues, repairs)
        }
        Err(issue) => ExtractionResult::new(source_id, Value::Null, vec![issue], repairs),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Fences ───────────────────────────────────────────────────────────────────

static RE_FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[^\n`]*\n(.*?)```").unwrap());

/// Keep the body of the first fenced block; handle an opening fence whose
/// closing fence was cut off.
fn strip_fences(input: &str) -> String {
    let trimmed = input.trim();
    if let Some(caps) = RE_FENCED_BLOCK.captures(trimmed) {
        return caps[1].trim().to_string();
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        let body = match rest.split_once('\n') {
            Some((_, body)) => body,
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
        };
        return body.trim_end_matches('`').trim().to_string();
    }
    trimmed.to_string()
}

// ── String-aware scanning ────────────────────────────────────────────────────

/// Tracks whether the scanner is inside an ASCII-quoted JSON string.
#[derive(Default)]
struct StringState {
    in_string: bool,
    escaped: bool,
}

impl StringState {
    /// Feed one char; returns true if it belongs to a string (quotes included).
    fn step(&mut self, c: char) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == '"' {
                self.in_string = false;
            }
            true
        } else if c == '"' {
            self.in_string = true;
            true
        } else {
            false
        }
    }
}

// ── Repairs ──────────────────────────────────────────────────────────────────

/// Byte length of the balanced structure opening at the start of `input`,
/// or `None` when it runs off the end.
fn balanced_len(input: &str) -> Option<usize> {
    let mut state = StringState::default();
    let mut depth = 0usize;
    for (i, c) in input.char_indices() {
        if state.step(c) {
            continue;
        }
        match c {
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

fn span_fits(value: &Value, shape: Option<RecordShape>) -> bool {
    match (shape, value) {
        (_, Value::Object(_)) => true,
        (None, Value::Array(_)) => true,
        (Some(RecordShape::Single), Value::Array(items)) => {
            items.len() == 1 && items[0].is_object()
        }
        (Some(RecordShape::Many), Value::Array(items)) => items.iter().all(Value::is_object),
        _ => false,
    }
}

fn opener_fits(opener: &str, shape: Option<RecordShape>) -> bool {
    opener == "{" || shape != Some(RecordShape::Single)
}

/// Pick the span to keep, scanning top-level `{`/`[` openers left to right.
///
/// The first span that parses and fits `shape` wins. Failing that, the first
/// span that does not parse yet (later repairs may fix it) and whose opener
/// fits. Failing that, the first span that parses at all, then the first
/// unterminated one.
fn extract_span(input: &str, shape: Option<RecordShape>) -> String {
    let mut repairable: Option<&str> = None;
    let mut parsed: Option<&str> = None;
    let mut truncated: Option<&str> = None;
    let mut resume = 0usize;
    for (start, opener) in input.match_indices(['{', '[']) {
        if start < resume {
            continue;
        }
        let rest = &input[start..];
        let Some(len) = balanced_len(rest) else {
            // Unbalanced: keep from the opener on and let CloseStructures finish it.
            let tail = rest.trim_end();
            if opener_fits(opener, shape) {
                repairable.get_or_insert(tail);
                break;
            }
            truncated.get_or_insert(tail);
            continue;
        };
        let span = &rest[..len];
        resume = start + len;
        match serde_json::from_str::<Value>(span) {
            Ok(value) if span_fits(&value, shape) => return span.to_string(),
            Ok(_) => {
                parsed.get_or_insert(span);
            }
            Err(_) => {
                if opener_fits(opener, shape) {
                    repairable.get_or_insert(span);
                }
            }
        }
    }
    repairable
        .or(parsed)
        .or(truncated)
        .map_or_else(|| input.to_string(), str::to_string)
}

fn normalize_quotes(input: &str) -> String {
    const SMART_DOUBLE: [char; 4] = ['\u{201C}', '\u{201D}', '\u{201E}', '\u{201F}'];
    let mut out = String::with_capacity(input.len());
    let mut ascii = StringState::default();
    let mut in_smart = false;
    let mut escaped = false;
    for c in input.chars() {
        if in_smart {
            if escaped {
                escaped = false;
                out.push(c);
            } else if c == '\\' {
                escaped = true;
                out.push(c);
            } else if SMART_DOUBLE.contains(&c) {
                in_smart = false;
                out.push('"');
            } else if c == '"' {
                out.push_str("\\\"");
            } else {
                out.push(c);
            }
        } else if ascii.step(c) {
            // Typographic quotes inside ordinary strings are content.
            out.push(c);
        } else if SMART_DOUBLE.contains(&c) {
            in_smart = true;
            out.push('"');
        } else {
            out.push(c);
        }
    }
    out
}

fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut state = StringState::default();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if state.step(c) {
            out.push(c);
            continue;
        }
        match (c, chars.peek()) {
            ('/', Some('/')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn remove_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut state = StringState::default();
    for (i, &c) in chars.iter().enumerate() {
        if state.step(c) {
            out.push(c);
            continue;
        }
        if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Position inside an open object, for deciding how to close it.
#[derive(Clone, Copy, PartialEq)]
enum Frame {
    /// Expecting a key or `}`.
    Key,
    /// Key read, expecting `:`.
    AfterKey,
    /// `:` read, expecting a value.
    Value,
    /// Value read, expecting `,` or `}`.
    AfterValue,
    Array,
}

fn close_structures(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut stack: Vec<Frame> = Vec::new();
    let mut state = StringState::default();

    for c in input.chars() {
        out.push(c);
        let was_in_string = state.in_string;
        if state.step(c) {
            if was_in_string && !state.in_string {
                string_closed(&mut stack);
            }
            continue;
        }
        match c {
            '{' | '[' => {
                value_started(&mut stack);
                stack.push(if c == '{' { Frame::Key } else { Frame::Array });
            }
            '}' | ']' => {
                stack.pop();
            }
            ':' => transition(&mut stack, Frame::AfterKey, Frame::Value),
            ',' => transition(&mut stack, Frame::AfterValue, Frame::Key),
            c if !c.is_whitespace() => value_started(&mut stack),
            _ => {}
        }
    }

    if !state.in_string && stack.is_empty() {
        return input.to_string();
    }

    if state.in_string {
        if state.escaped {
            out.pop();
        }
        out.push('"');
        string_closed(&mut stack);
    }

    while let Some(frame) = stack.pop() {
        let trimmed_len = out.trim_end().len();
        out.truncate(trimmed_len);
        match frame {
            Frame::AfterKey => out.push_str(": null"),
            Frame::Value => out.push_str(" null"),
            Frame::Key | Frame::Array => {
                if out.ends_with(',') {
                    out.pop();
                }
            }
            Frame::AfterValue => {}
        }
        out.push(if frame == Frame::Array { ']' } else { '}' });
    }
    out
}

fn string_closed(stack: &mut [Frame]) {
    if let Some(top) = stack.last_mut() {
        *top = match *top {
            Frame::Key => Frame::AfterKey,
            Frame::Value => Frame::AfterValue,
            other => other,
        };
    }
}

fn value_started(stack: &mut [Frame]) {
    transition(stack, Frame::Value, Frame::AfterValue);
}

fn transition(stack: &mut [Frame], from: Frame, to: Frame) {
    if let Some(top) = stack.last_mut() {
        if *top == from {
            *top = to;
        }
    }
}
