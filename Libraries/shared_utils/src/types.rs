use serde::{Deserialize, Serialize};
use tracing::warn;

/// Serialized workflow graph, exactly as stored in the `workflows.data`
/// column and exchanged with the editor frontend.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct WorkflowData {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(rename = "dataId", default)]
    pub data_id: Option<i64>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ConnectionSpec {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: Option<String>,
}

/// Edge guard parsed from `ConnectionSpec::condition`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EdgeCondition {
    #[default]
    Always,
    IfDetected,
    IfNotDetected,
}

impl EdgeCondition {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None | Some("") => EdgeCondition::Always,
            Some("true") | Some("yes") | Some("detected") => EdgeCondition::IfDetected,
            Some("false") | Some("no") | Some("not_detected") => EdgeCondition::IfNotDetected,
            Some(other) => {
                warn!("unknown edge condition '{other}', treating as unconditional");
                EdgeCondition::Always
            }
        }
    }

    pub fn passes(self, has_detection: bool) -> bool {
        match self {
            EdgeCondition::Always => true,
            EdgeCondition::IfDetected => has_detection,
            EdgeCondition::IfNotDetected => !has_detection,
        }
    }
}

/// Relative polygon vertex (0..1 in both axes).
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PolyPoint {
    pub x: f64,
    pub y: f64,
}

/// How a region scopes detection: mask the frame before inference, or filter
/// detections afterwards by box center.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoiMode {
    PreMask,
    #[default]
    PostFilter,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RoiRegion {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mode: RoiMode,
    #[serde(default)]
    pub polygon: Vec<PolyPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_json_round_trip() {
        let raw = r#"{
            "nodes": [
                {"id": "n1", "type": "source", "dataId": 3},
                {"id": "n2", "type": "algorithm", "dataId": 7, "config": {"interval_seconds": 0.5}},
                {"id": "n3", "type": "alert"}
            ],
            "connections": [
                {"from": "n1", "to": "n2"},
                {"from": "n2", "to": "n3", "condition": "true"}
            ]
        }"#;
        let data: WorkflowData = serde_json::from_str(raw).unwrap();
        assert_eq!(data.nodes.len(), 3);
        assert_eq!(data.nodes[0].data_id, Some(3));
        assert_eq!(data.connections[1].condition.as_deref(), Some("true"));

        let back = serde_json::to_string(&data).unwrap();
        let again: WorkflowData = serde_json::from_str(&back).unwrap();
        assert_eq!(again.connections.len(), 2);
    }

    #[test]
    fn edge_condition_parsing() {
        assert_eq!(EdgeCondition::parse(None), EdgeCondition::Always);
        assert_eq!(EdgeCondition::parse(Some("yes")), EdgeCondition::IfDetected);
        assert_eq!(EdgeCondition::parse(Some("false")), EdgeCondition::IfNotDetected);
        assert_eq!(EdgeCondition::parse(Some("bogus")), EdgeCondition::Always);
        assert!(EdgeCondition::IfNotDetected.passes(false));
        assert!(!EdgeCondition::IfNotDetected.passes(true));
    }

    #[test]
    fn roi_region_defaults() {
        let region: RoiRegion =
            serde_json::from_str(r#"{"polygon": [{"x": 0.1, "y": 0.2}]}"#).unwrap();
        assert_eq!(region.mode, RoiMode::PostFilter);
        assert_eq!(region.polygon.len(), 1);
    }
}
