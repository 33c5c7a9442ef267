//! Test-mode execution: run the DAG once over a supplied frame with every
//! side effect shimmed out, and return a structured per-node result set.
//! The execution path is the live one; only the alert node short-circuits.

use serde::Serialize;
use shared_utils::epoch_secs;

use crate::executor::WorkflowExecutor;
use crate::log_collector::LogEntry;
use crate::types::{Detection, FrameData, NodeKind};

#[derive(Clone, Debug, Serialize)]
pub struct NodeReport {
    pub node_id: String,
    pub node_type: String,
    pub success: bool,
    pub execution_time_ms: u64,
    pub message: String,
    pub detections: Vec<Detection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TestReport {
    pub success: bool,
    pub nodes: Vec<NodeReport>,
    pub logs: Vec<LogEntry>,
}

impl WorkflowExecutor {
    /// Execute the workflow once against a raw RGB frame.
    pub fn run_test(&self, pixels: Vec<u8>, width: u32, height: u32) -> TestReport {
        let frame = FrameData::new(pixels, width, height);
        let collector = self.process_frame(frame, epoch_secs());

        let executed = self.executed.lock().unwrap().clone();
        let mut nodes = Vec::with_capacity(executed.len());
        for idx in executed {
            let node = &self.graph.nodes[idx];
            let status = self.exec_status.get(&idx).map(|s| s.clone());
            let (success, execution_time_ms, error) = match status {
                Some(s) => (s.success, s.execution_time_ms, s.error),
                None => (true, 0, None),
            };

            let cached = self.results.get(&idx).map(|r| r.clone());
            let detections = cached
                .as_ref()
                .map(|r| r.detections.clone())
                .unwrap_or_default();
            let message = self.describe_node(idx, cached.as_ref());

            nodes.push(NodeReport {
                node_id: node.id.clone(),
                node_type: node.type_name().to_string(),
                success,
                execution_time_ms,
                message,
                detections,
                error,
            });
        }

        TestReport {
            success: nodes.iter().all(|n| n.success),
            nodes,
            logs: collector.snapshot(),
        }
    }

    fn describe_node(
        &self,
        idx: usize,
        cached: Option<&crate::executor::NodeResult>,
    ) -> String {
        match &self.graph.nodes[idx].kind {
            NodeKind::Source { .. } => "video source (test mode)".to_string(),
            NodeKind::Roi { regions } => {
                format!("roi configuration with {} region(s)", regions.len())
            }
            NodeKind::Algorithm { .. } => match cached {
                Some(result) => format!("detected {} target(s)", result.detections.len()),
                None => "detector produced no result".to_string(),
            },
            NodeKind::Function { function_name, .. } => match cached {
                Some(result) => format!(
                    "function {function_name} matched {} pair(s), {} box(es) forwarded",
                    result.matches.len(),
                    result.detections.len()
                ),
                None => format!("function {function_name} skipped"),
            },
            NodeKind::Condition { comparison, target_count } => {
                let upstream_count: usize = self
                    .graph
                    .upstream_of(idx)
                    .iter()
                    .filter_map(|up| self.results.get(up))
                    .map(|r| r.detections.len())
                    .sum();
                let passed = comparison.evaluate(upstream_count, *target_count);
                format!(
                    "condition {} {} {} -> {}",
                    upstream_count,
                    comparison.symbol(),
                    target_count,
                    if passed { "passed" } else { "not met" }
                )
            }
            NodeKind::Alert { alert_type, .. } => format!("alert output ({alert_type})"),
        }
    }
}
