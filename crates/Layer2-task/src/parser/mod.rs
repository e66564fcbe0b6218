//! Output Stream Parser
//!
//! Turns the worker's interleaved stdout/stderr chunks into typed
//! [`ProgressEvent`]s, a monotonic step counter, token usage and file hints.
//!
//! - `event.rs`: ProgressEvent, EventKind, StreamKind
//! - `markers.rs`: ordered marker table (vocabulary v1)
//! - `tokens.rs`: token usage formats and reconciliation
//! - `files.rs`: file-creation hints
//! - `result.rs`: structured result extraction

mod event;
mod files;
mod markers;
mod result;
mod tokens;

pub use event::{EventKind, ProgressEvent, StreamKind};
pub use files::{detect as detect_file_hint, is_plain_file_name, FileHint, HintMatch, HintStyle};
pub use markers::{classify, Classified, MARKER_VOCABULARY_VERSION};
pub use result::{extract as extract_result, Extraction, WorkerResult};
pub use tokens::{
    parse_count, parse_usage_line, usage_from_result, TokenAccumulator, TokenUsageRecord,
    UsageDetail, UsageSource,
};

use crate::task::{ExecutionId, TaskId};
use serde_json::json;
use std::collections::{HashSet, VecDeque};

/// Lines kept for result extraction
const MAX_TRANSCRIPT_LINES: usize = 20_000;

/// Stderr lines kept for diagnostics
const STDERR_TAIL_LINES: usize = 20;

/// Longest partial line buffered before it is force-split
const MAX_PARTIAL_LINE: usize = 1024 * 1024;

/// Everything one chunk produced
#[derive(Debug, Default, Clone)]
pub struct ParseOutput {
    pub events: Vec<ProgressEvent>,
    pub hints: Vec<FileHint>,
}

impl ParseOutput {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.hints.is_empty()
    }

    fn extend(&mut self, other: ParseOutput) {
        self.events.extend(other.events);
        self.hints.extend(other.hints);
    }
}

/// Parser state for one execution
#[derive(Debug)]
pub struct OutputParser {
    task_id: TaskId,
    session_id: String,
    execution_id: ExecutionId,

    /// Partial lines, per stream
    stdout_partial: Vec<u8>,
    stderr_partial: Vec<u8>,

    current_step: u32,
    transcript: VecDeque<String>,
    stderr_tail: VecDeque<String>,
    tokens: TokenAccumulator,

    /// File names already hinted in this execution
    seen_files: HashSet<String>,
}

impl OutputParser {
    pub fn new(task_id: TaskId, session_id: impl Into<String>, execution_id: ExecutionId) -> Self {
        Self {
            task_id,
            session_id: session_id.into(),
            execution_id,
            stdout_partial: Vec::new(),
            stderr_partial: Vec::new(),
            current_step: 0,
            transcript: VecDeque::new(),
            stderr_tail: VecDeque::with_capacity(STDERR_TAIL_LINES),
            tokens: TokenAccumulator::new(),
            seen_files: HashSet::new(),
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Highest step reported by this execution
    pub fn current_step(&self) -> u32 {
        self.current_step
    }

    /// Consume a raw chunk. Incomplete trailing lines are buffered.
    pub fn consume(&mut self, stream: StreamKind, chunk: &[u8]) -> ParseOutput {
        let mut output = ParseOutput::default();
        let mut partial = std::mem::take(self.partial_mut(stream));
        partial.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = partial[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = decode_line(&partial[start..end]);
            output.extend(self.consume_line(stream, &line));
            start = end + 1;
        }
        partial.drain(..start);

        if partial.len() > MAX_PARTIAL_LINE {
            let line = decode_line(&partial);
            partial.clear();
            output.extend(self.consume_line(stream, &line));
        }

        *self.partial_mut(stream) = partial;
        output
    }

    /// Flush buffered partial lines (call once the streams closed)
    pub fn finish(&mut self) -> ParseOutput {
        let mut output = ParseOutput::default();
        for stream in [StreamKind::Stdout, StreamKind::Stderr] {
            let partial = std::mem::take(self.partial_mut(stream));
            if !partial.is_empty() {
                let line = decode_line(&partial);
                output.extend(self.consume_line(stream, &line));
            }
        }
        output
    }

    fn partial_mut(&mut self, stream: StreamKind) -> &mut Vec<u8> {
        match stream {
            StreamKind::Stderr => &mut self.stderr_partial,
            _ => &mut self.stdout_partial,
        }
    }

    /// Classify one complete line
    pub fn consume_line(&mut self, stream: StreamKind, line: &str) -> ParseOutput {
        let mut output = ParseOutput::default();
        let line = line.trim_end_matches('\r');

        self.remember(stream, line);
        if line.trim().is_empty() {
            return output;
        }

        let classified = classify(line);
        match classified.kind {
            EventKind::Step => {
                let step = classified.payload["step"].as_u64().unwrap_or(0) as u32;
                // never decreases within one execution
                self.current_step = self.current_step.max(step);
            }
            EventKind::TokenUsage => {
                if let Some(detail) = parse_usage_line(line) {
                    self.tokens.push(detail);
                }
            }
            _ => {}
        }
        output.events.push(self.event(classified.kind, stream, line, classified.payload));

        match detect_file_hint(line) {
            Some(HintMatch::Hint(hint)) => {
                if self.seen_files.insert(hint.file_name.clone()) {
                    output.hints.push(hint);
                }
            }
            Some(HintMatch::Ambiguous { candidate }) => {
                output.events.push(self.event(
                    EventKind::Warning,
                    stream,
                    &format!("ambiguous file hint ignored: {}", candidate),
                    json!({ "hint": candidate, "reason": "ambiguous_file_hint" }),
                ));
            }
            None => {}
        }

        output
    }

    fn event(
        &self,
        kind: EventKind,
        stream: StreamKind,
        raw: &str,
        payload: serde_json::Value,
    ) -> ProgressEvent {
        ProgressEvent::new(kind, self.task_id.clone(), self.session_id.clone(), raw)
            .with_execution(self.execution_id)
            .with_stream(stream)
            .with_payload(payload)
    }

    fn remember(&mut self, stream: StreamKind, line: &str) {
        if self.transcript.len() >= MAX_TRANSCRIPT_LINES {
            self.transcript.pop_front();
        }
        self.transcript.push_back(line.to_string());

        if stream == StreamKind::Stderr && !line.trim().is_empty() {
            if self.stderr_tail.len() >= STDERR_TAIL_LINES {
                self.stderr_tail.pop_front();
            }
            self.stderr_tail.push_back(line.to_string());
        }
    }

    /// Last stderr lines joined for diagnostics
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Structured result, if the worker printed one
    pub fn extract_result(&self) -> Extraction {
        let lines: Vec<String> = self.transcript.iter().cloned().collect();
        extract_result(&lines)
    }

    /// Success message synthesized from success markers when no structured
    /// result is available
    pub fn heuristic_final_result(&self) -> Option<String> {
        let mut last_info = None;
        for line in self.transcript.iter().rev() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let classified = classify(trimmed);
            match classified.kind {
                EventKind::Success => {
                    let message = classified.payload["message"]
                        .as_str()
                        .unwrap_or(trimmed)
                        .to_string();
                    return Some(message);
                }
                EventKind::Info if last_info.is_none() => {
                    last_info = Some(trimmed.to_string());
                }
                _ => {}
            }
        }
        last_info
    }

    /// Token usage reconciled from every line plus the structured result
    pub fn token_usage(&self, result: Option<&serde_json::Value>) -> Option<TokenUsageRecord> {
        let mut tokens = self.tokens.clone();
        if let Some(detail) = result.and_then(usage_from_result) {
            tokens.push(detail);
        }
        tokens.reconcile(self.execution_id)
    }
}

/// Decode bytes as UTF-8 (lossy) and strip ANSI escape codes
fn decode_line(bytes: &[u8]) -> String {
    let stripped = strip_ansi_escapes::strip(bytes);
    String::from_utf8_lossy(&stripped).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> OutputParser {
        OutputParser::new(TaskId::from("task-1"), "session-1", ExecutionId::new())
    }

    #[test]
    fn test_partial_lines_across_chunks() {
        let mut p = parser();
        let out = p.consume(StreamKind::Stdout, "📍 St".as_bytes());
        assert!(out.events.is_empty());

        let out = p.consume(StreamKind::Stdout, "ep 2\n🎯 Next goal: lo".as_bytes());
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].kind, EventKind::Step);
        assert_eq!(p.current_step(), 2);

        let out = p.consume(StreamKind::Stdout, b"gin\n");
        assert_eq!(out.events[0].kind, EventKind::Goal);
        assert_eq!(out.events[0].payload["message"], "login");
    }

    #[test]
    fn test_split_utf8_sequence() {
        let mut p = parser();
        let bytes = "📍 Step 5\n".as_bytes();
        // split inside the 4-byte emoji
        p.consume(StreamKind::Stdout, &bytes[..2]);
        let out = p.consume(StreamKind::Stdout, &bytes[2..]);
        assert_eq!(out.events[0].kind, EventKind::Step);
        assert_eq!(p.current_step(), 5);
    }

    #[test]
    fn test_streams_are_buffered_separately() {
        let mut p = parser();
        p.consume(StreamKind::Stdout, b"hello ");
        p.consume(StreamKind::Stderr, b"Traceback (most recent call last):\n");
        let out = p.consume(StreamKind::Stdout, b"world\n");
        assert_eq!(out.events[0].raw, "hello world");
        assert!(p.stderr_tail().contains("Traceback"));
    }

    #[test]
    fn test_step_is_monotonic() {
        let mut p = parser();
        p.consume(StreamKind::Stdout, "📍 Step 4\n📍 Step 2\n".as_bytes());
        assert_eq!(p.current_step(), 4);
    }

    #[test]
    fn test_ansi_codes_are_stripped() {
        let mut p = parser();
        let out = p.consume(StreamKind::Stderr, b"\x1b[32mINFO\x1b[0m \xf0\x9f\x93\x8d Step 7\n");
        assert_eq!(out.events[0].kind, EventKind::Step);
        assert_eq!(out.events[0].raw, "INFO 📍 Step 7");
    }

    #[test]
    fn test_file_hints_deduplicated() {
        let mut p = parser();
        let out = p.consume(
            StreamKind::Stdout,
            "💾 Data written to file report.csv\nFile saved: report.csv\n".as_bytes(),
        );
        assert_eq!(out.hints.len(), 1);
        assert_eq!(out.hints[0].file_name, "report.csv");
    }

    #[test]
    fn test_ambiguous_hint_emits_warning() {
        let mut p = parser();
        let out = p.consume(StreamKind::Stdout, "💾 Data written to file results\n".as_bytes());
        assert!(out.hints.is_empty());
        assert!(out
            .events
            .iter()
            .any(|e| e.kind == EventKind::Warning && e.payload["reason"] == "ambiguous_file_hint"));
    }

    #[test]
    fn test_finish_flushes_partial_line() {
        let mut p = parser();
        p.consume(StreamKind::Stdout, "✅ done without newline".as_bytes());
        let out = p.finish();
        assert_eq!(out.events[0].kind, EventKind::Success);
        assert_eq!(p.heuristic_final_result().as_deref(), Some("done without newline"));
    }

    #[test]
    fn test_result_and_usage() {
        let mut p = parser();
        p.consume(
            StreamKind::Stdout,
            "💰 TOKEN_USAGE: gpt-4o | 700 tokens | $0.002\n{\"success\": true, \"final_result\": \"ok\", \"token_usage\": {\"total_tokens\": 900, \"total_cost\": 0.003, \"model\": \"gpt-4o\"}}\n"
                .as_bytes(),
        );
        let Extraction::Found(value) = p.extract_result() else {
            panic!("no result");
        };
        let usage = p.token_usage(Some(&value)).unwrap();
        assert_eq!(usage.total_tokens, 900);
        assert_eq!(usage.execution_id, p.execution_id());
    }

    #[test]
    fn test_heuristic_falls_back_to_last_info() {
        let mut p = parser();
        p.consume(StreamKind::Stdout, b"starting\nall good\n");
        assert_eq!(p.heuristic_final_result().as_deref(), Some("all good"));
    }
}
