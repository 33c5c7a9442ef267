//! Per-frame execution log. Nodes append typed entries while a frame flows
//! through the DAG; alert nodes render the collected entries into the
//! alert message. One collector is created per frame and shared across the
//! worker pool, so appends are locked.

use std::sync::Mutex;

use serde::Serialize;
use shared_utils::epoch_secs;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// What kind of event an entry records. Branch grouping keys off this
/// instead of sniffing message strings.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogKind {
    Detection { count: usize },
    Condition { detection_count: usize, target_count: usize, comparison: String, passed: bool },
    Function { name: String, matched: usize },
    Other,
}

#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub node_id: String,
    pub level: LogLevel,
    pub content: String,
    pub timestamp: f64,
    #[serde(flatten)]
    pub kind: LogKind,
}

#[derive(Default)]
pub struct ExecutionLogCollector {
    logs: Mutex<Vec<LogEntry>>,
}

impl ExecutionLogCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node_id: &str, level: LogLevel, content: String, kind: LogKind) {
        self.logs.lock().unwrap().push(LogEntry {
            node_id: node_id.to_string(),
            level,
            content,
            timestamp: epoch_secs(),
            kind,
        });
    }

    pub fn info(&self, node_id: &str, content: impl Into<String>) {
        self.add(node_id, LogLevel::Info, content.into(), LogKind::Other);
    }

    pub fn warning(&self, node_id: &str, content: impl Into<String>) {
        self.add(node_id, LogLevel::Warning, content.into(), LogKind::Other);
    }

    pub fn error(&self, node_id: &str, content: impl Into<String>) {
        self.add(node_id, LogLevel::Error, content.into(), LogKind::Other);
    }

    pub fn detection(&self, node_id: &str, count: usize) {
        self.add(
            node_id,
            LogLevel::Info,
            format!("detected {count} target(s)"),
            LogKind::Detection { count },
        );
    }

    pub fn condition(
        &self,
        node_id: &str,
        detection_count: usize,
        target_count: usize,
        comparison: &str,
        passed: bool,
    ) {
        let verdict = if passed { "passed" } else { "not met" };
        self.add(
            node_id,
            LogLevel::Info,
            format!("condition {detection_count} {comparison} {target_count}: {verdict}"),
            LogKind::Condition {
                detection_count,
                target_count,
                comparison: comparison.to_string(),
                passed,
            },
        );
    }

    pub fn function(&self, node_id: &str, name: &str, matched: usize) {
        self.add(
            node_id,
            LogLevel::Info,
            format!("function {name} matched {matched} pair(s)"),
            LogKind::Function { name: name.to_string(), matched },
        );
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.logs.lock().unwrap().clone()
    }

    pub fn error_count(&self) -> usize {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.level == LogLevel::Error)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.lock().unwrap().is_empty()
    }

    /// Render the collected entries. `detailed` and `simple` group by
    /// branch (detection -> condition -> verdict chain); `summary` groups
    /// by level.
    pub fn build_alert_message(&self, format: crate::types::MessageFormat) -> String {
        use crate::types::MessageFormat;
        let logs = self.snapshot();
        if logs.is_empty() {
            return "no execution log".to_string();
        }
        match format {
            MessageFormat::Detailed => grouped_message(&logs, true),
            MessageFormat::Simple => grouped_message(&logs, false),
            MessageFormat::Summary => summary_message(&logs),
        }
    }
}

struct Branch<'a> {
    detection: Option<&'a LogEntry>,
    condition: Option<&'a LogEntry>,
}

fn grouped_message(logs: &[LogEntry], include_node_id: bool) -> String {
    let mut sorted: Vec<&LogEntry> = logs.iter().collect();
    sorted.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

    let mut branches: Vec<Branch<'_>> = Vec::new();
    let mut current = Branch { detection: None, condition: None };
    let mut others: Vec<&LogEntry> = Vec::new();

    for &entry in &sorted {
        match &entry.kind {
            LogKind::Detection { .. } | LogKind::Function { .. } => {
                if current.detection.is_some() || current.condition.is_some() {
                    branches.push(current);
                    current = Branch { detection: None, condition: None };
                }
                current.detection = Some(entry);
            }
            LogKind::Condition { .. } => current.condition = Some(entry),
            LogKind::Other => others.push(entry),
        }
    }
    if current.detection.is_some() || current.condition.is_some() {
        branches.push(current);
    }

    if branches.is_empty() {
        // No detection/condition chain: fall back to a flat listing.
        return sorted
            .iter()
            .map(|e| render_line(e, include_node_id, 0))
            .collect::<Vec<_>>()
            .join("\n");
    }

    let mut lines = Vec::new();
    for (idx, branch) in branches.iter().enumerate() {
        let passed = match branch.condition.map(|c| &c.kind) {
            Some(LogKind::Condition { passed, .. }) => *passed,
            // A branch without a condition entry reached the alert directly.
            _ => branch.detection.is_some(),
        };
        if passed {
            lines.push(format!("branch {}: triggered", idx + 1));
        } else {
            lines.push(format!("branch {}: not triggered", idx + 1));
        }
        if let Some(detection) = branch.detection {
            lines.push(render_line(detection, include_node_id, 1));
        }
        if let Some(condition) = branch.condition {
            lines.push(render_line(condition, include_node_id, 1));
        }
        lines.push(String::new());
    }

    if !others.is_empty() {
        lines.push("other:".to_string());
        for entry in others {
            lines.push(render_line(entry, include_node_id, 1));
        }
    }

    lines.join("\n").trim_end().to_string()
}

fn summary_message(logs: &[LogEntry]) -> String {
    let mut lines = Vec::new();
    for (level, title) in [
        (LogLevel::Error, "errors"),
        (LogLevel::Warning, "warnings"),
        (LogLevel::Info, "info"),
    ] {
        let entries: Vec<&LogEntry> = logs.iter().filter(|e| e.level == level).collect();
        if entries.is_empty() {
            continue;
        }
        lines.push(format!("{title} ({}):", entries.len()));
        for entry in entries {
            lines.push(format!("  [{}] {}", entry.node_id, entry.content));
        }
    }
    if lines.is_empty() {
        "no execution log".to_string()
    } else {
        lines.join("\n")
    }
}

fn render_line(entry: &LogEntry, include_node_id: bool, indent: usize) -> String {
    let prefix = if indent > 0 { "  └─ " } else { "" };
    if include_node_id {
        format!("{prefix}[{}] {}", entry.node_id, entry.content)
    } else {
        format!("{prefix}{}", entry.content)
    }
}
