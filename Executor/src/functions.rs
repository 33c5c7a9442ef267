//! Built-in function-node implementations. Dual-input functions compare
//! every pair from upstream A x upstream B; single-input functions relate
//! each box of A to the frame itself. Matches carry the measured value so
//! alert messages can show why a pair passed.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::types::Detection;

/// Equality tolerance for ratio-valued tests.
const RATIO_EPSILON: f64 = 0.01;
/// Equality tolerance for pixel-valued tests (distances, absolute sizes).
const PIXEL_EPSILON: f64 = 1.0;

pub fn box_area(bbox: &[f64; 4]) -> f64 {
    (bbox[2] - bbox[0]) * (bbox[3] - bbox[1])
}

pub fn box_width(bbox: &[f64; 4]) -> f64 {
    bbox[2] - bbox[0]
}

pub fn box_height(bbox: &[f64; 4]) -> f64 {
    bbox[3] - bbox[1]
}

pub fn box_iou(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);
    if x2 < x1 || y2 < y1 {
        return 0.0;
    }
    let inter = (x2 - x1) * (y2 - y1);
    let union = box_area(a) + box_area(b) - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

pub fn center_distance(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    let (ax, ay) = ((a[0] + a[2]) / 2.0, (a[1] + a[3]) / 2.0);
    let (bx, by) = ((b[0] + b[2]) / 2.0, (b[1] + b[3]) / 2.0);
    ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FnOperator {
    LessThan,
    GreaterThan,
    Equal,
}

impl FnOperator {
    pub fn parse(raw: &str) -> FnOperator {
        match raw {
            "greater_than" => FnOperator::GreaterThan,
            "equal" => FnOperator::Equal,
            _ => FnOperator::LessThan,
        }
    }

    fn matches(self, value: f64, threshold: f64, epsilon: f64) -> bool {
        match self {
            FnOperator::LessThan => value < threshold,
            FnOperator::GreaterThan => value > threshold,
            FnOperator::Equal => (value - threshold).abs() < epsilon,
        }
    }
}

/// Which box dimension `size_absolute` measures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dimension {
    Height,
    Width,
}

impl Dimension {
    pub fn parse(raw: &str) -> Dimension {
        match raw {
            "width" => Dimension::Width,
            _ => Dimension::Height,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FunctionConfig {
    pub threshold: f64,
    pub operator: FnOperator,
    pub frame_width: f64,
    pub frame_height: f64,
    pub dimension: Dimension,
}

#[derive(Clone, Debug, Serialize)]
pub struct FunctionMatch {
    pub object_a: Detection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_b: Option<Detection>,
    pub value: f64,
    pub threshold: f64,
    pub function: String,
}

#[derive(Clone, Debug, Default)]
pub struct FunctionResult {
    pub matches: Vec<FunctionMatch>,
    /// Flattened boxes of all matched pairs, in match order.
    pub detections: Vec<Detection>,
}

pub fn is_single_input(name: &str) -> bool {
    matches!(
        name,
        "height_ratio_frame" | "width_ratio_frame" | "area_ratio_frame" | "size_absolute"
    )
}

pub fn evaluate(
    name: &str,
    detections_a: &[Detection],
    detections_b: &[Detection],
    config: &FunctionConfig,
) -> Result<FunctionResult> {
    match name {
        "area_ratio" => pairwise(name, detections_a, detections_b, config, RATIO_EPSILON, |a, b| {
            let denom = box_area(&b.bbox);
            (denom != 0.0).then(|| box_area(&a.bbox) / denom)
        }),
        "height_ratio" => pairwise(name, detections_a, detections_b, config, RATIO_EPSILON, |a, b| {
            let denom = box_height(&b.bbox);
            (denom != 0.0).then(|| box_height(&a.bbox) / denom)
        }),
        "width_ratio" => pairwise(name, detections_a, detections_b, config, RATIO_EPSILON, |a, b| {
            let denom = box_width(&b.bbox);
            (denom != 0.0).then(|| box_width(&a.bbox) / denom)
        }),
        "iou_check" => pairwise(name, detections_a, detections_b, config, RATIO_EPSILON, |a, b| {
            Some(box_iou(&a.bbox, &b.bbox))
        }),
        "distance_check" => {
            pairwise(name, detections_a, detections_b, config, PIXEL_EPSILON, |a, b| {
                Some(center_distance(&a.bbox, &b.bbox))
            })
        }
        "height_ratio_frame" => single(name, detections_a, config, RATIO_EPSILON, |a, cfg| {
            box_height(&a.bbox) / cfg.frame_height
        }),
        "width_ratio_frame" => single(name, detections_a, config, RATIO_EPSILON, |a, cfg| {
            box_width(&a.bbox) / cfg.frame_width
        }),
        "area_ratio_frame" => single(name, detections_a, config, RATIO_EPSILON, |a, cfg| {
            box_area(&a.bbox) / (cfg.frame_width * cfg.frame_height)
        }),
        "size_absolute" => single(name, detections_a, config, PIXEL_EPSILON, |a, cfg| {
            match cfg.dimension {
                Dimension::Height => box_height(&a.bbox),
                Dimension::Width => box_width(&a.bbox),
            }
        }),
        other => bail!("unknown builtin function '{other}'"),
    }
}

fn pairwise(
    name: &str,
    detections_a: &[Detection],
    detections_b: &[Detection],
    config: &FunctionConfig,
    epsilon: f64,
    measure: impl Fn(&Detection, &Detection) -> Option<f64>,
) -> Result<FunctionResult> {
    let mut result = FunctionResult::default();
    for a in detections_a {
        for b in detections_b {
            let Some(value) = measure(a, b) else { continue };
            if config.operator.matches(value, config.threshold, epsilon) {
                result.detections.push(a.clone());
                result.detections.push(b.clone());
                result.matches.push(FunctionMatch {
                    object_a: a.clone(),
                    object_b: Some(b.clone()),
                    value,
                    threshold: config.threshold,
                    function: name.to_string(),
                });
            }
        }
    }
    Ok(result)
}

fn single(
    name: &str,
    detections: &[Detection],
    config: &FunctionConfig,
    epsilon: f64,
    measure: impl Fn(&Detection, &FunctionConfig) -> f64,
) -> Result<FunctionResult> {
    let mut result = FunctionResult::default();
    for det in detections {
        let value = measure(det, config);
        if config.operator.matches(value, config.threshold, epsilon) {
            result.detections.push(det.clone());
            result.matches.push(FunctionMatch {
                object_a: det.clone(),
                object_b: None,
                value,
                threshold: config.threshold,
                function: name.to_string(),
            });
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f64; 4]) -> Detection {
        Detection::new(bbox, "obj", 0.9)
    }

    fn config(threshold: f64, operator: FnOperator) -> FunctionConfig {
        FunctionConfig {
            threshold,
            operator,
            frame_width: 100.0,
            frame_height: 100.0,
            dimension: Dimension::Height,
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert!((box_iou(&a, &a) - 1.0).abs() < 1e-9);
        assert_eq!(box_iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
    }

    #[test]
    fn iou_check_matches_overlapping_pairs() {
        let a = vec![det([0.0, 0.0, 10.0, 10.0])];
        let b = vec![det([0.0, 0.0, 10.0, 10.0]), det([50.0, 50.0, 60.0, 60.0])];
        let result =
            evaluate("iou_check", &a, &b, &config(0.5, FnOperator::GreaterThan)).unwrap();
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.detections.len(), 2);
        assert!(result.matches[0].value > 0.99);
    }

    #[test]
    fn area_ratio_skips_zero_denominator() {
        let a = vec![det([0.0, 0.0, 10.0, 10.0])];
        let degenerate = vec![det([5.0, 5.0, 5.0, 9.0])];
        let result =
            evaluate("area_ratio", &a, &degenerate, &config(0.5, FnOperator::LessThan)).unwrap();
        assert!(result.matches.is_empty());
    }

    #[test]
    fn distance_check_uses_pixel_epsilon_for_equal() {
        let a = vec![det([0.0, 0.0, 10.0, 10.0])];
        let b = vec![det([20.0, 0.0, 30.0, 10.0])]; // centers 20 px apart
        let result =
            evaluate("distance_check", &a, &b, &config(20.5, FnOperator::Equal)).unwrap();
        assert_eq!(result.matches.len(), 1);
    }

    #[test]
    fn height_ratio_frame_is_single_input() {
        assert!(is_single_input("height_ratio_frame"));
        let a = vec![det([0.0, 0.0, 10.0, 60.0])]; // 60% of frame height
        let result =
            evaluate("height_ratio_frame", &a, &[], &config(0.5, FnOperator::GreaterThan)).unwrap();
        assert_eq!(result.matches.len(), 1);
        assert!((result.matches[0].value - 0.6).abs() < 1e-9);
    }

    #[test]
    fn size_absolute_respects_dimension() {
        let a = vec![det([0.0, 0.0, 40.0, 80.0])];
        let mut cfg = config(50.0, FnOperator::GreaterThan);
        let result = evaluate("size_absolute", &a, &[], &cfg).unwrap();
        assert_eq!(result.matches.len(), 1); // height 80 > 50

        cfg.dimension = Dimension::Width;
        let result = evaluate("size_absolute", &a, &[], &cfg).unwrap();
        assert!(result.matches.is_empty()); // width 40 <= 50
    }

    #[test]
    fn unknown_function_errors() {
        assert!(evaluate("warp_check", &[], &[], &config(0.5, FnOperator::LessThan)).is_err());
    }
}
