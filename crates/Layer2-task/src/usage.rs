//! Token usage and cost tracking
//!
//! One entry per finished execution. Aggregates by model, session and
//! provider, buckets usage over time and exports as JSON or CSV.

use crate::parser::TokenUsageRecord;
use crate::pricing::format_cost;
use crate::task::{ExecutionId, TaskId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use webpilot_foundation::Result;

/// Entries kept before the oldest are dropped
const MAX_ENTRIES: usize = 10_000;

/// Usage of one execution with its context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    pub task_id: TaskId,
    pub session_id: String,
    pub provider: String,
    pub usage: TokenUsageRecord,
    pub recorded_at: DateTime<Utc>,
}

/// Summed usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub executions: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

impl UsageTotals {
    pub fn add(&mut self, usage: &TokenUsageRecord) {
        self.executions += 1;
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
        self.cost += usage.cost;
    }

    pub fn average_cost(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.cost / self.executions as f64
        }
    }
}

/// Cost breakdown
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostAnalysis {
    pub totals: UsageTotals,
    pub average_cost_per_execution: f64,
    pub average_tokens_per_execution: f64,
    pub most_expensive_model: Option<String>,
    pub by_model: BTreeMap<String, UsageTotals>,
    pub by_provider: BTreeMap<String, UsageTotals>,
}

impl CostAnalysis {
    pub fn format_total(&self) -> String {
        format_cost(self.totals.cost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendPeriod {
    Hour,
    Day,
}

impl TrendPeriod {
    fn bucket(&self, at: DateTime<Utc>) -> String {
        match self {
            TrendPeriod::Hour => format!("{}:00", at.format("%Y-%m-%dT%H")),
            TrendPeriod::Day => at.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Usage in one time bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBucket {
    pub period: String,
    pub totals: UsageTotals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl std::str::FromStr for ExportFormat {
    type Err = webpilot_foundation::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(webpilot_foundation::Error::InvalidInput(format!(
                "Unknown export format: {}",
                other
            ))),
        }
    }
}

/// Usage tracker
#[derive(Debug, Default)]
pub struct UsageTracker {
    entries: RwLock<VecDeque<UsageEntry>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished execution (replaces an earlier record of it)
    pub fn record(&self, entry: UsageEntry) {
        let mut entries = self.entries.write();
        entries.retain(|e| e.usage.execution_id != entry.usage.execution_id);
        if entries.len() >= MAX_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn by_execution(&self, execution_id: ExecutionId) -> Option<UsageEntry> {
        self.entries
            .read()
            .iter()
            .find(|e| e.usage.execution_id == execution_id)
            .cloned()
    }

    pub fn by_task(&self, task_id: &TaskId) -> Vec<UsageEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| &e.task_id == task_id)
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> UsageTotals {
        let mut totals = UsageTotals::default();
        for entry in self.entries.read().iter() {
            totals.add(&entry.usage);
        }
        totals
    }

    pub fn by_model(&self) -> BTreeMap<String, UsageTotals> {
        self.group_by(|e| e.usage.model.clone())
    }

    pub fn by_session(&self, session_id: &str) -> UsageTotals {
        let mut totals = UsageTotals::default();
        for entry in self.entries.read().iter().filter(|e| e.session_id == session_id) {
            totals.add(&entry.usage);
        }
        totals
    }

    fn group_by<F>(&self, key: F) -> BTreeMap<String, UsageTotals>
    where
        F: Fn(&UsageEntry) -> String,
    {
        let mut groups: BTreeMap<String, UsageTotals> = BTreeMap::new();
        for entry in self.entries.read().iter() {
            groups.entry(key(entry)).or_default().add(&entry.usage);
        }
        groups
    }

    pub fn cost_analysis(&self) -> CostAnalysis {
        let totals = self.summary();
        let by_model = self.by_model();
        let most_expensive_model = by_model
            .iter()
            .filter(|(_, t)| t.cost > 0.0)
            .max_by(|a, b| a.1.cost.total_cmp(&b.1.cost))
            .map(|(model, _)| model.clone());

        let executions = totals.executions.max(1) as f64;
        CostAnalysis {
            average_cost_per_execution: totals.average_cost(),
            average_tokens_per_execution: if totals.executions == 0 {
                0.0
            } else {
                totals.total_tokens as f64 / executions
            },
            most_expensive_model,
            by_provider: self.group_by(|e| e.provider.clone()),
            by_model,
            totals,
        }
    }

    /// Usage bucketed per hour or day, oldest first
    pub fn trends(&self, period: TrendPeriod) -> Vec<UsageBucket> {
        let buckets = self.group_by(|e| period.bucket(e.recorded_at));
        buckets
            .into_iter()
            .map(|(period, totals)| UsageBucket { period, totals })
            .collect()
    }

    pub fn export(&self, format: ExportFormat) -> Result<String> {
        let entries: Vec<UsageEntry> = self.entries.read().iter().cloned().collect();
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&entries)?),
            ExportFormat::Csv => {
                let mut out = String::from(
                    "recorded_at,task_id,session_id,execution_id,provider,model,prompt_tokens,completion_tokens,total_tokens,cost,cost_estimated\n",
                );
                for e in &entries {
                    let _ = writeln!(
                        out,
                        "{},{},{},{},{},{},{},{},{},{:.6},{}",
                        e.recorded_at.to_rfc3339(),
                        csv_field(e.task_id.as_str()),
                        csv_field(&e.session_id),
                        e.usage.execution_id,
                        csv_field(&e.provider),
                        csv_field(&e.usage.model),
                        e.usage.prompt_tokens,
                        e.usage.completion_tokens,
                        e.usage.total_tokens,
                        e.usage.cost,
                        e.usage.cost_estimated
                    );
                }
                Ok(out)
            }
        }
    }

    /// Entries recorded in the last `hours` hours
    pub fn recent(&self, hours: u32) -> Vec<UsageEntry> {
        let cutoff = Utc::now() - chrono::Duration::hours(i64::from(hours));
        self.entries
            .read()
            .iter()
            .filter(|e| e.recorded_at >= cutoff)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(session: &str, provider: &str, model: &str, tokens: u64, cost: f64) -> UsageEntry {
        UsageEntry {
            task_id: TaskId::from("t1"),
            session_id: session.to_string(),
            provider: provider.to_string(),
            usage: TokenUsageRecord {
                execution_id: ExecutionId::new(),
                model: model.to_string(),
                prompt_tokens: tokens,
                completion_tokens: 0,
                total_tokens: tokens,
                cost,
                cost_estimated: false,
                details: Vec::new(),
            },
            recorded_at: Utc::now(),
        }
    }

    fn tracker() -> UsageTracker {
        let tracker = UsageTracker::new();
        tracker.record(entry("s1", "openai", "gpt-4o", 1000, 0.02));
        tracker.record(entry("s1", "openai", "gpt-4o-mini", 500, 0.001));
        tracker.record(entry("s2", "azure", "gpt-4o", 2000, 0.04));
        tracker
    }

    #[test]
    fn test_summary_and_groups() {
        let tracker = tracker();
        let summary = tracker.summary();
        assert_eq!(summary.executions, 3);
        assert_eq!(summary.total_tokens, 3500);

        let by_model = tracker.by_model();
        assert_eq!(by_model["gpt-4o"].executions, 2);
        assert_eq!(tracker.by_session("s1").total_tokens, 1500);
        assert_eq!(tracker.by_session("missing").executions, 0);
    }

    #[test]
    fn test_cost_analysis() {
        let analysis = tracker().cost_analysis();
        assert_eq!(analysis.most_expensive_model.as_deref(), Some("gpt-4o"));
        assert!((analysis.average_cost_per_execution - 0.061 / 3.0).abs() < 1e-9);
        assert_eq!(analysis.by_provider["azure"].total_tokens, 2000);
        assert!((analysis.totals.cost - 0.061).abs() < 1e-9);

        let empty = UsageTracker::new().cost_analysis();
        assert!(empty.most_expensive_model.is_none());
        assert_eq!(empty.average_tokens_per_execution, 0.0);
    }

    #[test]
    fn test_record_replaces_same_execution() {
        let tracker = UsageTracker::new();
        let mut e = entry("s1", "openai", "gpt-4o", 100, 0.01);
        tracker.record(e.clone());
        e.usage.total_tokens = 300;
        tracker.record(e.clone());
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.by_execution(e.usage.execution_id).unwrap().usage.total_tokens, 300);
    }

    #[test]
    fn test_trends() {
        let tracker = tracker();
        let daily = tracker.trends(TrendPeriod::Day);
        let executions: u64 = daily.iter().map(|b| b.totals.executions).sum();
        assert_eq!(executions, 3);
        let hourly = tracker.trends(TrendPeriod::Hour);
        assert!(hourly[0].period.ends_with(":00"));
    }

    #[test]
    fn test_export() {
        let tracker = UsageTracker::new();
        tracker.record(entry("s,1", "openai", "gpt-4o", 1000, 0.02));

        let csv = tracker.export(ExportFormat::Csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("recorded_at,task_id"));
        assert!(lines[1].contains("\"s,1\""));
        assert!(lines[1].contains(",1000,0.020000,"));

        let json: serde_json::Value =
            serde_json::from_str(&tracker.export(ExportFormat::Json).unwrap()).unwrap();
        assert_eq!(json[0]["usage"]["totalTokens"], 1000);
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
    }
}
