//! Result extraction
//!
//! The worker prints its final result as one JSON object, either on a single
//! line or pretty-printed with the opening brace at column 0. The last
//! syntactically valid object wins.

use serde_json::Value;

/// Outcome of scanning the transcript
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// A valid JSON object was found
    Found(Value),
    /// Something looked like a result but none parsed
    Malformed(String),
    /// No candidate at all
    Missing,
}

/// Worker result in typed form
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResult {
    pub success: bool,
    pub final_result: Option<String>,
    pub error: Option<String>,
    pub steps_executed: Option<u32>,
    pub raw: Value,
}

impl WorkerResult {
    pub fn from_value(value: Value) -> Self {
        let final_result = match value.get("final_result") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        Self {
            // a result without an explicit flag is a success unless it carries an error
            success: value
                .get("success")
                .and_then(|v| v.as_bool())
                .unwrap_or_else(|| value.get("error").map_or(true, |e| e.is_null())),
            final_result,
            error: value
                .get("error")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            steps_executed: value
                .get("steps_executed")
                .and_then(|v| v.as_u64())
                .map(|v| u32::try_from(v).unwrap_or(u32::MAX)),
            raw: value,
        }
    }
}

fn parse_object(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Scan `lines` backward for the last valid JSON object
pub fn extract(lines: &[String]) -> Extraction {
    let mut malformed: Option<String> = None;

    for start in (0..lines.len()).rev() {
        let line = &lines[start];
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            continue;
        }

        // single-line object
        if trimmed.ends_with('}') {
            if let Some(value) = parse_object(trimmed) {
                return Extraction::Found(value);
            }
            malformed.get_or_insert_with(|| trimmed.to_string());
            continue;
        }

        // pretty-printed block: opening brace at column 0, closing brace at column 0
        if line.starts_with('{') {
            let end = lines[start + 1..]
                .iter()
                .position(|l| l.trim_end() == "}")
                .map(|offset| start + 1 + offset);
            if let Some(end) = end {
                let block = lines[start..=end].join("\n");
                if let Some(value) = parse_object(&block) {
                    return Extraction::Found(value);
                }
                malformed.get_or_insert_with(|| block);
            }
        }
    }

    match malformed {
        Some(text) => Extraction::Malformed(text),
        None => Extraction::Missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(|l| l.to_string()).collect()
    }

    #[test]
    fn test_single_line_result() {
        let out = lines(
            "📍 Step 1\n{\"success\": false}\nmore\n{\"success\": true, \"final_result\": \"done\"}\nbye",
        );
        match extract(&out) {
            Extraction::Found(value) => assert_eq!(value["final_result"], "done"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pretty_printed_result() {
        let out = lines(
            r#"INFO agent done
{
  "success": true,
  "task": "open example.com",
  "steps_executed": 4,
  "final_result": "Example Domain",
  "token_usage": {
    "total_tokens": 1200,
    "total_cost": 0.01,
    "model": "gpt-4o"
  },
  "error": null
}"#,
        );
        let Extraction::Found(value) = extract(&out) else {
            panic!("no result");
        };
        let result = WorkerResult::from_value(value);
        assert!(result.success);
        assert_eq!(result.steps_executed, Some(4));
        assert_eq!(result.final_result.as_deref(), Some("Example Domain"));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_malformed_and_missing() {
        assert_eq!(extract(&lines("no json\nat all")), Extraction::Missing);
        assert!(matches!(
            extract(&lines("{\"success\": tru}")),
            Extraction::Malformed(_)
        ));
    }

    #[test]
    fn test_later_valid_beats_earlier_malformed() {
        let out = lines("{broken}\n{\"success\": true}");
        assert!(matches!(extract(&out), Extraction::Found(_)));
    }

    #[test]
    fn test_failure_result() {
        let result = WorkerResult::from_value(serde_json::json!({
            "success": false,
            "error": "element not found",
            "final_result": null
        }));
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("element not found"));
        assert!(result.final_result.is_none());
    }

    #[test]
    fn test_oversized_step_count_saturates() {
        let result = WorkerResult::from_value(serde_json::json!({
            "success": true,
            "steps_executed": 4_294_967_298u64,
        }));
        assert_eq!(result.steps_executed, Some(u32::MAX));

        let result = WorkerResult::from_value(serde_json::json!({ "steps_executed": 12 }));
        assert_eq!(result.steps_executed, Some(12));
    }
}
