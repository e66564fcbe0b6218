//! Token usage extraction and reconciliation
//!
//! Recognized formats:
//! - breakdown: `🧠 <model> | 📥 <in> (<c> cached) (<w> cache write) | 📤 <out> | $<cost>`
//! - simplified: `TOKEN_USAGE: <model> | <n> tokens | $<cost>`
//! - final: `FINAL_TOKEN_USAGE: <model> | <n> tokens | $<cost>`
//! - the structured result's `token_usage` object
//!
//! Precedence per execution: final > sum of simplified > sum of breakdown.

use crate::pricing::estimate_cost;
use crate::task::ExecutionId;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Final token usage of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageRecord {
    pub execution_id: ExecutionId,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,

    /// True when `cost` came from the price table
    #[serde(default)]
    pub cost_estimated: bool,

    pub details: Vec<UsageDetail>,
}

impl TokenUsageRecord {
    /// Add another execution's usage (used for task-level totals)
    pub fn absorb(&mut self, other: &TokenUsageRecord) {
        self.execution_id = other.execution_id;
        if other.model != UNKNOWN_MODEL {
            self.model = other.model.clone();
        }
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.cost += other.cost;
        self.cost_estimated |= other.cost_estimated;
        self.details.extend(other.details.iter().cloned());
    }
}

/// Where a usage figure was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    Breakdown,
    Simplified,
    Final,
    Result,
}

/// One usage line as reported by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageDetail {
    pub source: UsageSource,
    pub model: String,
    pub input_tokens: u64,
    pub cached_tokens: u64,
    pub cache_creation_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost: Option<f64>,
}

impl UsageDetail {
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

const UNKNOWN_MODEL: &str = "unknown";

fn breakdown_pattern() -> &'static Option<Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r"🧠\s*(?P<model>[^|]+?)\s*\|\s*📥\s*(?P<input>[\d.,]+[kKmM]?)",
            r"(?:\s*\((?P<cached>[\d.,]+[kKmM]?)\s*cached\))?",
            r"(?:\s*\((?P<created>[\d.,]+[kKmM]?)\s*cache write\))?",
            r"\s*\|\s*📤\s*(?P<output>[\d.,]+[kKmM]?)",
            r"(?:\s*\|\s*\$(?P<cost>[\d.]+))?",
        ))
        .ok()
    })
}

fn simplified_pattern() -> &'static Option<Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?P<final>FINAL_)?TOKEN_USAGE:\s*(?P<model>[^|]+?)\s*\|\s*(?P<total>[\d.,]+[kKmM]?)\s*tokens\s*\|\s*\$(?P<cost>[\d.]+)",
        )
        .ok()
    })
}

/// Parse a count such as `1,234`, `12.5k` or `1.2M`
pub fn parse_count(text: &str) -> Option<u64> {
    let text = text.trim().replace(',', "");
    let (number, multiplier) = match text.chars().last()? {
        'k' | 'K' => (&text[..text.len() - 1], 1_000.0),
        'm' | 'M' => (&text[..text.len() - 1], 1_000_000.0),
        _ => (text.as_str(), 1.0),
    };
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier).round() as u64)
}

fn capture_count(caps: &Captures, name: &str) -> u64 {
    caps.name(name)
        .and_then(|m| parse_count(m.as_str()))
        .unwrap_or(0)
}

fn capture_cost(caps: &Captures) -> Option<f64> {
    caps.name("cost").and_then(|m| m.as_str().parse().ok())
}

/// Recognize a token usage line
pub fn parse_usage_line(line: &str) -> Option<UsageDetail> {
    if let Some(caps) = simplified_pattern().as_ref().and_then(|re| re.captures(line)) {
        let total = capture_count(&caps, "total");
        return Some(UsageDetail {
            source: if caps.name("final").is_some() {
                UsageSource::Final
            } else {
                UsageSource::Simplified
            },
            model: caps["model"].trim().to_string(),
            input_tokens: 0,
            cached_tokens: 0,
            cache_creation_tokens: 0,
            output_tokens: 0,
            total_tokens: total,
            cost: capture_cost(&caps),
        });
    }

    if let Some(caps) = breakdown_pattern().as_ref().and_then(|re| re.captures(line)) {
        let input = capture_count(&caps, "input");
        let output = capture_count(&caps, "output");
        return Some(UsageDetail {
            source: UsageSource::Breakdown,
            model: caps["model"].trim().to_string(),
            input_tokens: input,
            cached_tokens: capture_count(&caps, "cached"),
            cache_creation_tokens: capture_count(&caps, "created"),
            output_tokens: output,
            total_tokens: input + output,
            cost: capture_cost(&caps),
        });
    }

    None
}

/// Usage object from the structured result (`token_usage`)
pub fn usage_from_result(result: &serde_json::Value) -> Option<UsageDetail> {
    let usage = result.get("token_usage")?;
    let total = usage.get("total_tokens").and_then(|v| v.as_u64())?;
    Some(UsageDetail {
        source: UsageSource::Result,
        model: usage
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(UNKNOWN_MODEL)
            .to_string(),
        input_tokens: 0,
        cached_tokens: 0,
        cache_creation_tokens: 0,
        output_tokens: 0,
        total_tokens: total,
        cost: usage.get("total_cost").and_then(|v| v.as_f64()),
    })
}

/// Collects usage lines of one execution
#[derive(Debug, Default, Clone)]
pub struct TokenAccumulator {
    details: Vec<UsageDetail>,
}

impl TokenAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, detail: UsageDetail) {
        self.details.push(detail);
    }

    pub fn is_empty(&self) -> bool {
        self.details.is_empty()
    }

    pub fn details(&self) -> &[UsageDetail] {
        &self.details
    }

    /// Reconcile everything seen into one record, `None` if nothing was reported
    pub fn reconcile(&self, execution_id: ExecutionId) -> Option<TokenUsageRecord> {
        if self.details.is_empty() {
            return None;
        }

        let of = |source: UsageSource| self.details.iter().filter(move |d| d.source == source);
        let breakdown: Vec<&UsageDetail> = of(UsageSource::Breakdown).collect();
        let simplified: Vec<&UsageDetail> = of(UsageSource::Simplified).collect();
        // later-seen final figures win
        let final_usage = self
            .details
            .iter()
            .rev()
            .find(|d| matches!(d.source, UsageSource::Final | UsageSource::Result) && d.total_tokens > 0);

        let breakdown_total: u64 = breakdown.iter().map(|d| d.total_tokens).sum();
        let simplified_total: u64 = simplified.iter().map(|d| d.total_tokens).sum();

        let total = match final_usage {
            Some(f) => f.total_tokens,
            None if simplified_total > 0 => simplified_total,
            None => breakdown_total,
        };

        let breakdown_prompt: u64 = breakdown.iter().map(|d| d.input_tokens).sum();
        let prompt = if breakdown.is_empty() {
            total
        } else {
            breakdown_prompt.min(total)
        };
        let completion = total - prompt;

        let model = final_usage
            .map(|f| f.model.clone())
            .filter(|m| m != UNKNOWN_MODEL)
            .or_else(|| simplified.last().map(|d| d.model.clone()))
            .or_else(|| breakdown.last().map(|d| d.model.clone()))
            .unwrap_or_else(|| UNKNOWN_MODEL.to_string());

        let simplified_cost: Option<f64> = sum_costs(&simplified);
        let breakdown_cost: Option<f64> = sum_costs(&breakdown);
        let reported = final_usage
            .and_then(|f| f.cost)
            .filter(|c| *c > 0.0)
            .or(simplified_cost.filter(|c| *c > 0.0))
            .or(breakdown_cost.filter(|c| *c > 0.0));

        let (cost, cost_estimated) = match reported {
            Some(cost) => (cost, false),
            None => {
                let cached: u64 = breakdown.iter().map(|d| d.cached_tokens).sum();
                match estimate_cost(&model, prompt, completion, cached) {
                    Some(estimate) if total > 0 => (estimate, true),
                    _ => (0.0, false),
                }
            }
        };

        Some(TokenUsageRecord {
            execution_id,
            model,
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
            cost,
            cost_estimated,
            details: self.details.clone(),
        })
    }
}

fn sum_costs(details: &[&UsageDetail]) -> Option<f64> {
    let costs: Vec<f64> = details.iter().filter_map(|d| d.cost).collect();
    if costs.is_empty() {
        None
    } else {
        Some(costs.iter().sum())
    }
}
