//! Typed workflow nodes. The stored graph is duck-typed JSON; loading turns
//! every node into a tagged variant with its required fields hydrated from
//! the referenced algorithm row, the node-level config and defaults, in that
//! order of increasing precedence.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_utils::types::{NodeSpec, RoiRegion};
use store::Db;

pub const DEFAULT_LABEL_COLOR: &str = "#FF0000";
pub const FUNCTION_LABEL_COLOR: &str = "#00FF00";

/// One detection box in pixel coordinates, `[x1, y1, x2, y2]`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bbox: [f64; 4],
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

impl Detection {
    pub fn new(bbox: [f64; 4], label: &str, confidence: f64) -> Self {
        Detection { bbox, label: label.to_string(), confidence }
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.bbox[0] + self.bbox[2]) / 2.0,
            (self.bbox[1] + self.bbox[3]) / 2.0,
        )
    }
}

/// Raw RGB frame shared between node executions without copying.
#[derive(Clone)]
pub struct FrameData {
    pub pixels: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
}

impl FrameData {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        FrameData { pixels: Arc::new(pixels), width, height }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
}

impl Comparison {
    pub fn parse(raw: &str) -> Comparison {
        match raw {
            "==" => Comparison::Eq,
            ">" => Comparison::Gt,
            "<=" => Comparison::Le,
            "<" => Comparison::Lt,
            _ => Comparison::Ge,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Eq => "==",
            Comparison::Ge => ">=",
            Comparison::Gt => ">",
            Comparison::Le => "<=",
            Comparison::Lt => "<",
        }
    }

    pub fn evaluate(self, count: usize, target: usize) -> bool {
        match self {
            Comparison::Eq => count == target,
            Comparison::Ge => count >= target,
            Comparison::Gt => count > target,
            Comparison::Le => count <= target,
            Comparison::Lt => count < target,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    Count,
    #[default]
    Ratio,
    Consecutive,
}

/// Windowed trigger configuration of an alert node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerCondition {
    #[serde(default)]
    pub enable: bool,
    /// Seconds; the effective window is `[now - window_size, now]`.
    #[serde(default = "default_window_size")]
    pub window_size: f64,
    #[serde(default)]
    pub mode: WindowMode,
    #[serde(default = "default_window_threshold")]
    pub threshold: f64,
}

fn default_window_size() -> f64 {
    30.0
}

fn default_window_threshold() -> f64 {
    0.3
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuppressionConfig {
    #[serde(default)]
    pub enable: bool,
    /// Cooldown seconds; falls back to ALERT_SUPPRESSION_DURATION when unset.
    #[serde(default)]
    pub duration: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MessageFormat {
    #[default]
    Detailed,
    Simple,
    Summary,
}

impl MessageFormat {
    fn parse(raw: &str) -> MessageFormat {
        match raw {
            "simple" => MessageFormat::Simple,
            "summary" => MessageFormat::Summary,
            _ => MessageFormat::Detailed,
        }
    }
}

/// Runtime knobs of a detector-backed node, merged from the algorithm row
/// and node config.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub interval_seconds: f64,
    pub runtime_timeout: f64,
    pub memory_limit_mb: u64,
    pub label_name: String,
    pub label_color: String,
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Source {
        data_id: Option<i64>,
    },
    Roi {
        regions: Vec<RoiRegion>,
    },
    Algorithm {
        data_id: i64,
        algorithm_name: String,
        script_path: String,
        runtime: RuntimeConfig,
        /// Node-local ROI, used only when no ancestor roi node exists.
        roi_regions: Vec<RoiRegion>,
        detector_config: Value,
    },
    Function {
        function_name: String,
        threshold: f64,
        operator: crate::functions::FnOperator,
        dimension: crate::functions::Dimension,
        interval_seconds: f64,
    },
    Condition {
        comparison: Comparison,
        target_count: usize,
    },
    Alert {
        alert_type: String,
        alert_level: String,
        alert_message: String,
        message_format: MessageFormat,
        trigger: Option<TriggerCondition>,
        suppression: Option<SuppressionConfig>,
    },
}

#[derive(Clone, Debug)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
}

impl Node {
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Source { .. } => "source",
            NodeKind::Roi { .. } => "roi",
            NodeKind::Algorithm { .. } => "algorithm",
            NodeKind::Function { .. } => "function",
            NodeKind::Condition { .. } => "condition",
            NodeKind::Alert { .. } => "alert",
        }
    }

    /// Scheduling order inside a topological layer.
    pub fn type_priority(&self) -> u8 {
        match self.kind {
            NodeKind::Source { .. } => 0,
            NodeKind::Roi { .. } => 1,
            NodeKind::Algorithm { .. } => 2,
            NodeKind::Function { .. } => 3,
            NodeKind::Condition { .. } => 4,
            NodeKind::Alert { .. } => 5,
        }
    }

    /// Sinks are fired through edge traversal, never scheduled as a layer.
    pub fn is_sink(&self) -> bool {
        matches!(self.kind, NodeKind::Alert { .. })
    }

    pub fn throttle_interval(&self) -> f64 {
        match &self.kind {
            NodeKind::Algorithm { runtime, .. } => runtime.interval_seconds,
            NodeKind::Function { interval_seconds, .. } => *interval_seconds,
            _ => 0.0,
        }
    }
}

fn config_f64(config: &Value, key: &str) -> Option<f64> {
    config.get(key).and_then(Value::as_f64)
}

fn config_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

fn parse_regions(value: Option<&Value>) -> Vec<RoiRegion> {
    value
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Build a typed node from its stored spec. Algorithm nodes pull their
/// descriptor from the database; unknown types are a load-time error.
pub fn hydrate_node(spec: &NodeSpec, db: &Db) -> Result<Node> {
    let config = spec.config.clone().unwrap_or(Value::Null);
    let kind = match spec.node_type.as_str() {
        "source" => NodeKind::Source { data_id: spec.data_id },
        "roi" | "roi_draw" => {
            let regions = parse_regions(config.get("roiRegions").or_else(|| config.get("roi_regions")));
            NodeKind::Roi { regions }
        }
        "algorithm" => {
            let data_id = spec
                .data_id
                .with_context(|| format!("algorithm node '{}' has no dataId", spec.id))?;
            let algorithm = db
                .get_algorithm(data_id)?
                .with_context(|| format!("algorithm {data_id} referenced by '{}' not found", spec.id))?;

            let runtime = RuntimeConfig {
                interval_seconds: config_f64(&config, "interval_seconds")
                    .unwrap_or(algorithm.interval_seconds),
                runtime_timeout: config_f64(&config, "runtime_timeout")
                    .unwrap_or(algorithm.runtime_timeout),
                memory_limit_mb: config
                    .get("memory_limit_mb")
                    .and_then(Value::as_u64)
                    .unwrap_or(algorithm.memory_limit_mb),
                label_name: config_str(&config, "label_name")
                    .unwrap_or(&algorithm.label_name)
                    .to_string(),
                label_color: config_str(&config, "label_color")
                    .unwrap_or(&algorithm.label_color)
                    .to_string(),
            };
            let roi_regions =
                parse_regions(config.get("roi_regions").or_else(|| config.get("roiRegions")));

            // Fixed algorithm attributes first, node config on top.
            let mut detector_config = match algorithm.config() {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            if let Value::Object(overrides) = &config {
                for (key, value) in overrides {
                    detector_config.insert(key.clone(), value.clone());
                }
            }

            NodeKind::Algorithm {
                data_id,
                algorithm_name: algorithm.name,
                script_path: algorithm.script_path,
                runtime,
                roi_regions,
                detector_config: Value::Object(detector_config),
            }
        }
        "function" => NodeKind::Function {
            function_name: config_str(&config, "function_name").unwrap_or("area_ratio").to_string(),
            threshold: config_f64(&config, "threshold").unwrap_or(0.7),
            operator: crate::functions::FnOperator::parse(
                config_str(&config, "operator").unwrap_or("less_than"),
            ),
            dimension: crate::functions::Dimension::parse(
                config_str(&config, "dimension").unwrap_or("height"),
            ),
            interval_seconds: config_f64(&config, "interval_seconds").unwrap_or(0.0),
        },
        "condition" => NodeKind::Condition {
            comparison: Comparison::parse(
                config_str(&config, "comparison")
                    .or_else(|| config_str(&config, "comparison_type"))
                    .unwrap_or(">="),
            ),
            target_count: config
                .get("target_count")
                .and_then(Value::as_u64)
                .unwrap_or(1) as usize,
        },
        "alert" | "output" => NodeKind::Alert {
            alert_type: config_str(&config, "alert_type").unwrap_or("detection").to_string(),
            alert_level: config_str(&config, "alert_level").unwrap_or("info").to_string(),
            alert_message: config_str(&config, "alert_message").unwrap_or("").to_string(),
            message_format: MessageFormat::parse(
                config_str(&config, "message_format").unwrap_or("detailed"),
            ),
            trigger: config
                .get("trigger_condition")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok()),
            suppression: config
                .get("suppression")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok()),
        },
        other => bail!("unknown node type '{other}' (node '{}')", spec.id),
    };
    Ok(Node { id: spec.id.clone(), kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, node_type: &str, config: Value) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            node_type: node_type.to_string(),
            data_id: None,
            config: Some(config),
        }
    }

    #[test]
    fn comparison_semantics() {
        assert!(Comparison::Ge.evaluate(2, 2));
        assert!(!Comparison::Gt.evaluate(2, 2));
        assert!(Comparison::Lt.evaluate(1, 2));
        assert!(Comparison::Eq.evaluate(3, 3));
        assert_eq!(Comparison::parse("unknown"), Comparison::Ge);
    }

    #[test]
    fn condition_node_defaults() {
        let db = Db::open_in_memory().unwrap();
        let node = hydrate_node(&spec("c1", "condition", serde_json::json!({})), &db).unwrap();
        match node.kind {
            NodeKind::Condition { comparison, target_count } => {
                assert_eq!(comparison, Comparison::Ge);
                assert_eq!(target_count, 1);
            }
            _ => panic!("expected condition node"),
        }
    }

    #[test]
    fn unknown_node_type_is_fatal() {
        let db = Db::open_in_memory().unwrap();
        assert!(hydrate_node(&spec("x", "mystery", Value::Null), &db).is_err());
    }

    #[test]
    fn algorithm_node_merges_row_and_node_config() {
        let db = Db::open_in_memory().unwrap();
        let algo_id = db
            .insert_algorithm(&store::Algorithm {
                id: 0,
                name: "person".to_string(),
                script_path: "scripted".to_string(),
                script_config: r#"{"min_confidence": 0.4}"#.to_string(),
                interval_seconds: 1.0,
                runtime_timeout: 30.0,
                memory_limit_mb: 512,
                label_name: "Person".to_string(),
                label_color: "#FF0000".to_string(),
            })
            .unwrap();

        let mut node_spec = spec(
            "a1",
            "algorithm",
            serde_json::json!({"interval_seconds": 0.25, "label_color": "#00FFAA"}),
        );
        node_spec.data_id = Some(algo_id);

        let node = hydrate_node(&node_spec, &db).unwrap();
        match node.kind {
            NodeKind::Algorithm { runtime, detector_config, .. } => {
                assert_eq!(runtime.interval_seconds, 0.25);
                assert_eq!(runtime.label_color, "#00FFAA");
                assert_eq!(runtime.label_name, "Person");
                assert_eq!(detector_config["min_confidence"], 0.4);
                assert_eq!(detector_config["interval_seconds"], 0.25);
            }
            _ => panic!("expected algorithm node"),
        }
    }

    #[test]
    fn alert_node_parses_trigger_and_suppression() {
        let db = Db::open_in_memory().unwrap();
        let node = hydrate_node(
            &spec(
                "alert1",
                "alert",
                serde_json::json!({
                    "alert_type": "intrusion",
                    "alert_level": "warning",
                    "message_format": "summary",
                    "trigger_condition": {"enable": true, "window_size": 10, "mode": "ratio", "threshold": 0.3},
                    "suppression": {"enable": true, "duration": 10}
                }),
            ),
            &db,
        )
        .unwrap();
        match node.kind {
            NodeKind::Alert { alert_type, message_format, trigger, suppression, .. } => {
                assert_eq!(alert_type, "intrusion");
                assert_eq!(message_format, MessageFormat::Summary);
                let trigger = trigger.unwrap();
                assert!(trigger.enable);
                assert_eq!(trigger.mode, WindowMode::Ratio);
                assert_eq!(suppression.unwrap().duration, Some(10.0));
            }
            _ => panic!("expected alert node"),
        }
    }
}
