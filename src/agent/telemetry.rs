//! Telemetry parser: a pure function from the agent's mixed stdout text
//! to a structured record of token usage, model, version, and tool calls.
//!
//! The agent interleaves several JSON event shapes with free-text log
//! lines on one stream. Each line is first tried as JSON and dispatched
//! by shape; unrecognized lines fall back to a battery of text patterns.
//! A malformed line never affects later lines.

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Tool-call start/finish events pair by name within this window.
const PAIRING_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    pub arguments: Value,
    pub success: bool,
    pub duration_ms: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub exit: i32,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub model: Option<String>,
    pub agent_version: Option<String>,
    pub tool_calls: Vec<ParsedToolCall>,
}

#[derive(Debug)]
struct PendingCall {
    name: String,
    arguments: Value,
    timestamp: Option<DateTime<Utc>>,
    id: Option<String>,
}

#[derive(Debug, Default)]
struct Parser {
    pending: Vec<PendingCall>,
    telemetry: Telemetry,
}

static BRACKET_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\[([^\]]+)\]\s+Using\s+(\S+)\s+tool with args:\s*(\{.*\})\s*$"#).unwrap()
});
static BRACKET_FINISH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\[([^\]]+)\]\s+(\S+)\s+tool\s+(completed|finished|failed)(?:\s+in)?\s+(\d+)\s*ms"#)
        .unwrap()
});
static BARE_START: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^Tool\s+(\S+)\s+started"#).unwrap());
static BARE_FINISH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^Tool\s+(\S+)\s+(?:done|completed|finished)\s+in\s+(\d+)\s*ms"#).unwrap()
});
static BARE_FAILED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^Tool\s+(\S+)\s+failed(?:\s+in\s+(\d+)\s*ms)?"#).unwrap());
static INVOKE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<invoke name="([^"]+)">"#).unwrap());
static TOKEN_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)prompt tokens:\s*([\d,]+),\s*completion tokens:\s*([\d,]+),\s*total(?:\s+tokens)?:\s*([\d,]+)"#,
    )
    .unwrap()
});
static TOKEN_IO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)input_tokens["\s=:]+(\d+)\D+output_tokens["\s=:]+(\d+)"#).unwrap()
});
static AGENT_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bamp\s+(?:version\s+|v)([0-9][\w.\-]*)"#).unwrap());
static MODEL_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)^\s*model:\s*(\S+)\s*$"#).unwrap());

/// Parse the agent's merged stdout/stderr text. Empty or whitespace-only
/// input yields an empty record.
pub fn parse_output(text: &str) -> Telemetry {
    let mut parser = Parser::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        parser.consume_line(line);
    }
    parser.finish()
}

impl Parser {
    fn consume_line(&mut self, line: &str) {
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(obj)) => self.consume_json(&obj),
            // Valid JSON that is not an object carries nothing we track.
            Ok(_) => {}
            Err(_) => self.consume_text(line),
        }
    }

    // ─── JSON shapes ─────────────────────────────────────────────────────

    fn consume_json(&mut self, obj: &serde_json::Map<String, Value>) {
        // Explicit start/finish events.
        if let (Some(tool), Some(event)) = (str_field(obj, "tool"), str_field(obj, "event")) {
            let ts = obj.get("timestamp").and_then(value_timestamp);
            match event {
                "tool_start" => {
                    self.pending.push(PendingCall {
                        name: tool.to_string(),
                        arguments: obj
                            .get("arguments")
                            .cloned()
                            .unwrap_or_else(empty_object),
                        timestamp: ts,
                        id: str_field(obj, "id").map(str::to_string),
                    });
                }
                "tool_finish" => {
                    let success = !obj.contains_key("error")
                        && obj.get("success").and_then(Value::as_bool) != Some(false);
                    let duration = u64_field(obj, "duration_ms").or(u64_field(obj, "duration"));
                    self.finish_by_name(tool, ts, success, duration);
                }
                _ => {}
            }
            return;
        }

        // Tool result referencing an id.
        if str_field(obj, "type") == Some("tool_result") {
            let success = !obj.contains_key("error");
            let duration = u64_field(obj, "duration").or(u64_field(obj, "duration_ms"));
            let id = str_field(obj, "id");
            let ts = obj.get("timestamp").and_then(value_timestamp);
            self.finish_by_id_or_closest(id, ts, success, duration);
            return;
        }

        // Batched tool calls.
        if let Some(calls) = obj.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let Some(function) = call.get("function") else {
                    continue;
                };
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    self.pending.push(PendingCall {
                        name: name.to_string(),
                        arguments: parse_arguments(function.get("arguments")),
                        timestamp: obj.get("timestamp").and_then(value_timestamp),
                        id: call.get("id").and_then(Value::as_str).map(str::to_string),
                    });
                }
            }
            return;
        }

        // Legacy single function call.
        if let Some(function_call) = obj.get("function_call").and_then(Value::as_object) {
            if let Some(name) = str_field(function_call, "name") {
                self.pending.push(PendingCall {
                    name: name.to_string(),
                    arguments: parse_arguments(function_call.get("arguments")),
                    timestamp: obj.get("timestamp").and_then(value_timestamp),
                    id: None,
                });
            }
            return;
        }

        // Token usage in any of its wrappings; model rides along.
        let usage = ["tokens", "token_usage", "usage"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_object));
        if let Some(usage) = usage {
            self.add_usage(usage);
            if let Some(model) = str_field(obj, "model") {
                self.set_model(model);
            }
            return;
        }
        if obj.contains_key("prompt_tokens")
            || obj.contains_key("completion_tokens")
            || obj.contains_key("total_tokens")
        {
            self.add_usage(obj);
            if let Some(model) = str_field(obj, "model") {
                self.set_model(model);
            }
            return;
        }

        // Tool-call intent: {name, arguments} without other markers.
        if let (Some(name), Some(arguments)) = (str_field(obj, "name"), obj.get("arguments")) {
            self.pending.push(PendingCall {
                name: name.to_string(),
                arguments: arguments.clone(),
                timestamp: obj.get("timestamp").and_then(value_timestamp),
                id: str_field(obj, "id").map(str::to_string),
            });
            return;
        }

        // Model-only frame.
        if let Some(model) = str_field(obj, "model") {
            self.set_model(model);
        }
    }

    // ─── Text patterns ───────────────────────────────────────────────────

    fn consume_text(&mut self, line: &str) {
        if let Some(caps) = BRACKET_START.captures(line) {
            // An unparseable timestamp invalidates the whole match.
            let Some(ts) = parse_text_timestamp(&caps[1]) else {
                return;
            };
            let arguments =
                serde_json::from_str(&caps[3]).unwrap_or_else(|_| empty_object());
            self.pending.push(PendingCall {
                name: caps[2].to_string(),
                arguments,
                timestamp: Some(ts),
                id: None,
            });
            return;
        }

        if let Some(caps) = BRACKET_FINISH.captures(line) {
            let Some(ts) = parse_text_timestamp(&caps[1]) else {
                return;
            };
            let success = &caps[3] != "failed";
            let duration = caps[4].parse().ok();
            self.finish_by_name(&caps[2], Some(ts), success, duration);
            return;
        }

        if let Some(caps) = BARE_START.captures(line) {
            self.pending.push(PendingCall {
                name: caps[1].to_string(),
                arguments: empty_object(),
                timestamp: None,
                id: None,
            });
            return;
        }

        if let Some(caps) = BARE_FINISH.captures(line) {
            let duration = caps[2].parse().ok();
            self.finish_by_name(&caps[1], None, true, duration);
            return;
        }

        if let Some(caps) = BARE_FAILED.captures(line) {
            let duration = caps.get(2).and_then(|m| m.as_str().parse().ok());
            self.finish_by_name(&caps[1], None, false, duration);
            return;
        }

        for caps in INVOKE_BLOCK.captures_iter(line) {
            self.pending.push(PendingCall {
                name: caps[1].to_string(),
                arguments: empty_object(),
                timestamp: None,
                id: None,
            });
        }

        if let Some(caps) = TOKEN_SUMMARY.captures(line) {
            let prompt = parse_count(&caps[1]);
            let completion = parse_count(&caps[2]);
            let total = parse_count(&caps[3]);
            self.add_tokens(prompt, completion, total);
            return;
        }

        if let Some(caps) = TOKEN_IO.captures(line) {
            let prompt = caps[1].parse().ok();
            let completion = caps[2].parse().ok();
            self.add_tokens(prompt, completion, None);
            return;
        }

        if let Some(caps) = AGENT_VERSION.captures(line) {
            if self.telemetry.agent_version.is_none() {
                self.telemetry.agent_version = Some(caps[1].to_string());
            }
            return;
        }

        if let Some(caps) = MODEL_LINE.captures(line) {
            let model = caps[1].to_string();
            self.set_model(&model);
        }
    }

    // ─── Pairing ─────────────────────────────────────────────────────────

    /// Match a finish to the pending start of the same name with the
    /// smallest timestamp distance within the window. Finishes with no
    /// matching start are emitted with empty args.
    fn finish_by_name(
        &mut self,
        name: &str,
        ts: Option<DateTime<Utc>>,
        success: bool,
        duration_ms: Option<u64>,
    ) {
        let mut best: Option<(usize, i64)> = None;
        for (idx, pending) in self.pending.iter().enumerate() {
            if pending.name != name {
                continue;
            }
            let distance = match (pending.timestamp, ts) {
                (Some(started), Some(finished)) => {
                    (finished - started).num_seconds().abs()
                }
                _ => 0,
            };
            if distance > PAIRING_WINDOW_SECS {
                continue;
            }
            if best.map(|(_, d)| distance < d).unwrap_or(true) {
                best = Some((idx, distance));
            }
        }

        match best {
            Some((idx, _)) => {
                let pending = self.pending.remove(idx);
                self.telemetry.tool_calls.push(ParsedToolCall {
                    name: pending.name,
                    arguments: pending.arguments,
                    success,
                    duration_ms,
                    timestamp: pending.timestamp.or(ts),
                });
            }
            None => {
                self.telemetry.tool_calls.push(ParsedToolCall {
                    name: name.to_string(),
                    arguments: empty_object(),
                    success,
                    duration_ms,
                    timestamp: ts,
                });
            }
        }
    }

    /// Match a tool result by id, else by closest timestamp regardless of
    /// name, else emit unpaired.
    fn finish_by_id_or_closest(
        &mut self,
        id: Option<&str>,
        ts: Option<DateTime<Utc>>,
        success: bool,
        duration_ms: Option<u64>,
    ) {
        let idx = id
            .and_then(|id| {
                self.pending
                    .iter()
                    .position(|p| p.id.as_deref() == Some(id))
            })
            .or_else(|| match ts {
                Some(finished) => self
                    .pending
                    .iter()
                    .enumerate()
                    .filter_map(|(i, p)| {
                        p.timestamp
                            .map(|started| (i, (finished - started).num_seconds().abs()))
                    })
                    .filter(|(_, d)| *d <= PAIRING_WINDOW_SECS)
                    .min_by_key(|(_, d)| *d)
                    .map(|(i, _)| i),
                None => (!self.pending.is_empty()).then_some(0),
            });

        match idx {
            Some(idx) => {
                let pending = self.pending.remove(idx);
                self.telemetry.tool_calls.push(ParsedToolCall {
                    name: pending.name,
                    arguments: pending.arguments,
                    success,
                    duration_ms,
                    timestamp: pending.timestamp.or(ts),
                });
            }
            None => {
                self.telemetry.tool_calls.push(ParsedToolCall {
                    name: id.unwrap_or("unknown").to_string(),
                    arguments: empty_object(),
                    success,
                    duration_ms,
                    timestamp: ts,
                });
            }
        }
    }

    // ─── Tokens ──────────────────────────────────────────────────────────

    fn add_usage(&mut self, usage: &serde_json::Map<String, Value>) {
        let prompt = ["prompt", "prompt_tokens", "input_tokens", "input"]
            .iter()
            .find_map(|k| u64_field(usage, k));
        let completion = ["completion", "completion_tokens", "output_tokens", "output"]
            .iter()
            .find_map(|k| u64_field(usage, k));
        let total = ["total", "total_tokens"].iter().find_map(|k| u64_field(usage, k));
        self.add_tokens(prompt, completion, total);
    }

    /// Token values sum across frames; zeros count as absent. A frame
    /// without an explicit total contributes prompt + completion.
    fn add_tokens(&mut self, prompt: Option<u64>, completion: Option<u64>, total: Option<u64>) {
        let prompt = prompt.filter(|v| *v > 0);
        let completion = completion.filter(|v| *v > 0);
        let total = total
            .filter(|v| *v > 0)
            .or(match (prompt, completion) {
                (None, None) => None,
                (p, c) => Some(p.unwrap_or(0) + c.unwrap_or(0)),
            });

        if let Some(v) = prompt {
            *self.telemetry.prompt_tokens.get_or_insert(0) += v;
        }
        if let Some(v) = completion {
            *self.telemetry.completion_tokens.get_or_insert(0) += v;
        }
        if let Some(v) = total {
            *self.telemetry.total_tokens.get_or_insert(0) += v;
        }
    }

    fn set_model(&mut self, model: &str) {
        if self.telemetry.model.is_none() && !model.is_empty() {
            self.telemetry.model = Some(model.to_string());
        }
    }

    /// Drain unpaired starts as successful calls with no duration.
    fn finish(mut self) -> Telemetry {
        for pending in self.pending.drain(..) {
            self.telemetry.tool_calls.push(ParsedToolCall {
                name: pending.name,
                arguments: pending.arguments,
                success: true,
                duration_ms: None,
                timestamp: pending.timestamp,
            });
        }
        self.telemetry
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn str_field<'a>(obj: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn u64_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<u64> {
    obj.get(key).and_then(Value::as_u64)
}

/// Arguments arrive either as an object or as a JSON-encoded string.
fn parse_arguments(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| empty_object()),
        Some(v) => v.clone(),
        None => empty_object(),
    }
}

fn value_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_text_timestamp(s),
        Value::Number(n) => {
            let millis = n.as_i64()?;
            DateTime::from_timestamp_millis(millis)
        }
        _ => None,
    }
}

fn parse_text_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

fn parse_count(text: &str) -> Option<u64> {
    text.replace(',', "").parse().ok()
}
