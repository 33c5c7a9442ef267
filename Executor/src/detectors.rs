//! Detector contract and the compiled-in registry.
//!
//! The original system loaded detector scripts at runtime; here the registry
//! maps `script_path` keys to implementations compiled into the binary. All
//! detectors receive the frame, the effective ROI and the cached upstream
//! detections, and run under a watchdog bounded by `runtime_timeout`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::Value;
use shared_utils::types::RoiRegion;
use tracing::warn;

use crate::roi;
use crate::types::{Detection, FrameData};

#[derive(Clone, Debug, Default)]
pub struct DetectorOutput {
    pub detections: Vec<Detection>,
    pub metadata: serde_json::Map<String, Value>,
}

/// Upstream results visible to a detector, keyed by node id.
pub type UpstreamDetections = HashMap<String, Vec<Detection>>;

pub trait Detector: Send + Sync {
    fn process(
        &self,
        frame: &FrameData,
        roi_regions: &[RoiRegion],
        upstream: &UpstreamDetections,
        cancel: &AtomicBool,
    ) -> Result<DetectorOutput>;
}

/// Build a detector from its registry key and merged config.
pub fn build_detector(script_path: &str, config: &Value) -> Result<Arc<dyn Detector>> {
    match script_path {
        "placeholder" => Ok(Arc::new(PlaceholderDetector)),
        "scripted" => Ok(Arc::new(ScriptedDetector::from_config(config))),
        other => bail!("no detector registered for script path '{other}'"),
    }
}

/// Never detects anything. Useful for wiring up a workflow before the real
/// detector is configured.
pub struct PlaceholderDetector;

impl Detector for PlaceholderDetector {
    fn process(
        &self,
        _frame: &FrameData,
        _roi_regions: &[RoiRegion],
        _upstream: &UpstreamDetections,
        _cancel: &AtomicBool,
    ) -> Result<DetectorOutput> {
        Ok(DetectorOutput::default())
    }
}

/// Replays a fixed detection set from config, filtered by the effective ROI.
/// `frames` (a list of detection lists) makes the output vary per call,
/// which is what workflow test fixtures use to script multi-frame scenarios.
pub struct ScriptedDetector {
    static_detections: Vec<Detection>,
    frames: Option<Vec<Vec<Detection>>>,
    cursor: std::sync::Mutex<usize>,
    min_confidence: f64,
}

impl ScriptedDetector {
    pub fn from_config(config: &Value) -> ScriptedDetector {
        let static_detections = config
            .get("detections")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let frames = config
            .get("frames")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());
        ScriptedDetector {
            static_detections,
            frames,
            cursor: std::sync::Mutex::new(0),
            min_confidence: config
                .get("min_confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
        }
    }

    fn next_detections(&self) -> Vec<Detection> {
        if let Some(frames) = &self.frames {
            let mut cursor = self.cursor.lock().unwrap();
            let detections = frames.get(*cursor % frames.len().max(1)).cloned().unwrap_or_default();
            *cursor += 1;
            return detections;
        }
        self.static_detections.clone()
    }
}

impl Detector for ScriptedDetector {
    fn process(
        &self,
        frame: &FrameData,
        roi_regions: &[RoiRegion],
        _upstream: &UpstreamDetections,
        _cancel: &AtomicBool,
    ) -> Result<DetectorOutput> {
        let raw: Vec<Detection> = self
            .next_detections()
            .into_iter()
            .filter(|d| d.confidence >= self.min_confidence)
            .collect();
        let before = raw.len();
        let (kept, dropped) = roi::filter_detections(raw, roi_regions, frame.width, frame.height);

        let mut metadata = serde_json::Map::new();
        metadata.insert("detections_before_roi".into(), before.into());
        metadata.insert("roi_filtered_count".into(), dropped.into());
        metadata.insert(
            "roi_names".into(),
            Value::Array(
                roi_regions
                    .iter()
                    .map(|r| Value::String(r.name.clone()))
                    .collect(),
            ),
        );
        Ok(DetectorOutput { detections: kept, metadata })
    }
}

/// Run a detector invocation on a watchdog thread. On timeout the shared
/// cancellation flag is raised (implementations check it cooperatively), the
/// node is reported failed, and the zombie invocation is left to finish
/// detached.
pub fn run_with_timeout(
    detector: Arc<dyn Detector>,
    frame: FrameData,
    roi_regions: Vec<RoiRegion>,
    upstream: UpstreamDetections,
    timeout: f64,
) -> Result<DetectorOutput> {
    let cancel = Arc::new(AtomicBool::new(false));
    let (tx, rx) = crossbeam_channel::bounded(1);
    {
        let cancel = Arc::clone(&cancel);
        std::thread::spawn(move || {
            let output = detector.process(&frame, &roi_regions, &upstream, &cancel);
            let _ = tx.send(output);
        });
    }

    match rx.recv_timeout(Duration::from_secs_f64(timeout.max(0.001))) {
        Ok(output) => output,
        Err(_) => {
            cancel.store(true, Ordering::SeqCst);
            warn!("detector timed out after {timeout}s");
            bail!("detector timed out after {timeout}s")
        }
    }
}
