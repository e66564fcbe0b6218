//! Marker table - ordered `(pattern, constructor)` pairs
//!
//! The first matching row classifies a line. New markers are added as rows,
//! never as branches in the parser.

use super::event::EventKind;
use super::tokens::parse_usage_line;
use regex::{Captures, Regex};
use serde_json::{json, Value};
use std::sync::OnceLock;
use tracing::warn;

/// Version of the worker output vocabulary this table understands
pub const MARKER_VOCABULARY_VERSION: u32 = 1;

/// Builds the event payload from the regex captures
type PayloadFn = fn(&Captures, &str) -> Value;

/// One row of the marker table
pub struct Marker {
    pub name: &'static str,
    pub kind: EventKind,
    regex: Regex,
    payload: PayloadFn,
}

impl Marker {
    fn new(name: &'static str, kind: EventKind, pattern: &str, payload: PayloadFn) -> Option<Self> {
        match Regex::new(pattern) {
            Ok(regex) => Some(Self {
                name,
                kind,
                regex,
                payload,
            }),
            Err(e) => {
                warn!("Invalid marker pattern {}: {}", name, e);
                None
            }
        }
    }

    fn classify(&self, line: &str) -> Option<Classified> {
        let caps = self.regex.captures(line)?;
        Some(Classified {
            kind: self.kind,
            marker: self.name,
            payload: (self.payload)(&caps, line),
        })
    }
}

/// Classification of one line
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub kind: EventKind,
    pub marker: &'static str,
    pub payload: Value,
}

fn text(caps: &Captures, name: &str) -> String {
    caps.name(name)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

fn step_payload(caps: &Captures, _: &str) -> Value {
    json!({ "step": caps["step"].parse::<u32>().unwrap_or(0) })
}

fn action_payload(caps: &Captures, _: &str) -> Value {
    let body = text(caps, "body");
    let action = serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));
    json!({
        "index": caps["index"].parse::<u32>().unwrap_or(0),
        "total": caps["total"].parse::<u32>().unwrap_or(0),
        "action": action,
    })
}

fn message_payload(caps: &Captures, _: &str) -> Value {
    json!({ "message": text(caps, "msg") })
}

fn navigation_payload(caps: &Captures, _: &str) -> Value {
    json!({ "url": text(caps, "url") })
}

fn line_payload(_: &Captures, line: &str) -> Value {
    json!({ "message": line.trim() })
}

fn build_table() -> Vec<Marker> {
    let rows: [(&'static str, EventKind, &str, PayloadFn); 9] = [
        ("step", EventKind::Step, r"📍\s*Step\s+(?P<step>\d+)", step_payload),
        (
            "action",
            EventKind::Action,
            r"🛠\x{FE0F}?\s*Action\s+(?P<index>\d+)/(?P<total>\d+):\s*(?P<body>.*)$",
            action_payload,
        ),
        (
            "goal",
            EventKind::Goal,
            r"🎯\s*Next goal:\s*(?P<msg>.*)$",
            message_payload,
        ),
        (
            "eval_success",
            EventKind::Success,
            r"👍\s*Eval:\s*(?P<msg>.*)$",
            message_payload,
        ),
        (
            "done",
            EventKind::Success,
            r"(?:✅|📄\s*Result:)\s*(?P<msg>.*)$",
            message_payload,
        ),
        (
            "eval_warning",
            EventKind::Warning,
            r"⚠\x{FE0F}?\s*(?:Eval:)?\s*(?P<msg>.*)$",
            message_payload,
        ),
        (
            "failure",
            EventKind::Error,
            r"❌\s*(?:Eval:)?\s*(?P<msg>.*)$",
            message_payload,
        ),
        (
            "exception",
            EventKind::Error,
            r"Traceback \(most recent call last\)|\bERROR\b|\b\w*(?:Exception|Error):",
            line_payload,
        ),
        (
            "navigation",
            EventKind::Navigation,
            r"🔗\s*Navigated to\s+(?P<url>\S+)",
            navigation_payload,
        ),
    ];

    rows.into_iter()
        .filter_map(|(name, kind, pattern, payload)| Marker::new(name, kind, pattern, payload))
        .collect()
}

/// The marker table, compiled once
pub fn marker_table() -> &'static [Marker] {
    static TABLE: OnceLock<Vec<Marker>> = OnceLock::new();
    TABLE.get_or_init(build_table)
}

/// Classify one ANSI-stripped line. Unmatched lines are `info`.
pub fn classify(line: &str) -> Classified {
    if let Some(classified) = marker_table().iter().find_map(|m| m.classify(line)) {
        return classified;
    }

    if let Some(usage) = parse_usage_line(line) {
        return Classified {
            kind: EventKind::TokenUsage,
            marker: "token_usage",
            payload: usage.to_payload(),
        };
    }

    Classified {
        kind: EventKind::Info,
        marker: "info",
        payload: json!({ "message": line.trim() }),
    }
}
