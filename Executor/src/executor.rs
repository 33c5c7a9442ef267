//! The execution engine: loads the workflow, attaches the source ring
//! buffer, and drives the DAG over live frames.
//!
//! Scheduling: Kahn layers run in order; inside a layer nodes run on the
//! worker pool when the layer carries no function node. Algorithm nodes
//! recurse into their downstream through condition-guarded edges, which is
//! how alert nodes fire. Function nodes only run from the layer walk, after
//! all of their connected upstreams produced a result this frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use broker::AlertPublisher;
use dashmap::DashMap;
use ringbuffer::{FrameShape, VideoRingBuffer};
use shared_utils::config::Settings;
use shared_utils::epoch_secs;
use shared_utils::types::RoiRegion;
use store::{Db, VideoSource, Workflow};
use tracing::{debug, error, info, warn};

use crate::detectors::{self, Detector, UpstreamDetections};
use crate::functions::{self, FunctionConfig, FunctionMatch};
use crate::graph::WorkflowGraph;
use crate::log_collector::ExecutionLogCollector;
use crate::recorder::VideoRecorder;
use crate::types::{
    hydrate_node, Detection, FrameData, NodeKind, DEFAULT_LABEL_COLOR, FUNCTION_LABEL_COLOR,
};
use crate::window::AlertWindow;

const BUFFER_ATTACH_RETRIES: u32 = 10;
const BUFFER_ATTACH_BACKOFF: Duration = Duration::from_secs(1);
const MAX_PARALLEL_LAYER_WIDTH: usize = 8;

/// Side-effect collaborators handed to the executor. Test mode passes none
/// of them and the engine runs pure.
#[derive(Clone, Default)]
pub struct AlertServices {
    pub db: Option<Arc<Db>>,
    pub publisher: Option<Arc<AlertPublisher>>,
    pub runtime: Option<tokio::runtime::Handle>,
}

/// State carried along one branch of the DAG for one frame. Each branch
/// gets its own copy, so parallel branches cannot observe each other.
#[derive(Clone)]
pub struct BranchContext {
    pub has_detection: bool,
    pub detections: Vec<Detection>,
    pub label_color: String,
    pub upstream_node: Option<usize>,
}

impl BranchContext {
    fn fresh() -> Self {
        BranchContext {
            has_detection: false,
            detections: Vec::new(),
            label_color: DEFAULT_LABEL_COLOR.to_string(),
            upstream_node: None,
        }
    }
}

pub struct FrameContext {
    pub frame: FrameData,
    pub timestamp: f64,
    pub collector: Arc<ExecutionLogCollector>,
}

/// Cached output of an algorithm or function node, visible downstream for
/// the rest of the frame.
#[derive(Clone, Debug)]
pub struct NodeResult {
    pub node: usize,
    pub has_detection: bool,
    pub detections: Vec<Detection>,
    pub matches: Vec<FunctionMatch>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub label_color: String,
    pub frame_timestamp: f64,
}

#[derive(Clone, Debug)]
pub struct ExecStatus {
    pub success: bool,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

pub struct WorkflowExecutor {
    pub workflow: Workflow,
    pub graph: WorkflowGraph,
    pub settings: Settings,
    pub test_mode: bool,
    pub video_source: Option<VideoSource>,
    pub(crate) services: AlertServices,
    pub(crate) recorder: Option<Arc<VideoRecorder>>,
    pub(crate) window: AlertWindow,
    pub(crate) results: DashMap<usize, NodeResult>,
    pub(crate) exec_status: DashMap<usize, ExecStatus>,
    pub(crate) executed: Mutex<Vec<usize>>,
    detectors: HashMap<usize, Arc<dyn Detector>>,
    layers: Vec<Vec<usize>>,
    buffer: Option<Arc<VideoRingBuffer>>,
    pool: rayon::ThreadPool,
    throttle: Mutex<HashMap<usize, f64>>,
    last_frame_ts: Mutex<Option<f64>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkflowExecutor {
    pub fn load(
        db: Arc<Db>,
        workflow_id: i64,
        test_mode: bool,
        settings: Settings,
        services: AlertServices,
    ) -> Result<WorkflowExecutor> {
        let workflow = db
            .get_workflow(workflow_id)?
            .with_context(|| format!("workflow {workflow_id} not found"))?;
        let data = workflow.graph()?;
        let graph = WorkflowGraph::build(&data, |spec| hydrate_node(spec, &db))?;
        let layers = graph.layers()?;
        info!(
            "loaded workflow '{}' ({} nodes, {} layers)",
            workflow.name,
            graph.nodes.len(),
            layers.len()
        );

        let mut detectors: HashMap<usize, Arc<dyn Detector>> = HashMap::new();
        for (idx, node) in graph.nodes.iter().enumerate() {
            if let NodeKind::Algorithm { script_path, detector_config, algorithm_name, .. } =
                &node.kind
            {
                let detector = detectors::build_detector(script_path, detector_config)
                    .with_context(|| format!("detector for node '{}' failed to load", node.id))?;
                detectors.insert(idx, detector);
                info!("loaded detector '{algorithm_name}' for node '{}'", node.id);
            }
        }

        let (video_source, buffer, recorder) = if test_mode {
            (None, None, None)
        } else {
            let NodeKind::Source { data_id } = &graph.nodes[graph.source].kind else {
                unreachable!("graph source index always points at a source node");
            };
            let source_id = data_id.context("source node must reference a video source")?;
            let source = db
                .get_source(source_id)?
                .with_context(|| format!("video source {source_id} not found"))?;
            let buffer = Arc::new(attach_with_retry(&source, settings.ringbuffer_duration)?);
            let recorder = settings.recording.enabled.then(|| {
                Arc::new(VideoRecorder::new(
                    Arc::clone(&buffer),
                    settings.videos_root.clone(),
                    settings.recording.fps,
                ))
            });
            (Some(source), Some(buffer), recorder)
        };

        let pool_width = layers
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(1)
            .clamp(1, MAX_PARALLEL_LAYER_WIDTH);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_width)
            .thread_name(|i| format!("wf-node-{i}"))
            .build()
            .context("worker pool build failed")?;

        Ok(WorkflowExecutor {
            window: AlertWindow::new(settings.alert_suppression_duration),
            workflow,
            graph,
            settings,
            test_mode,
            video_source,
            services,
            recorder,
            results: DashMap::new(),
            exec_status: DashMap::new(),
            executed: Mutex::new(Vec::new()),
            detectors,
            layers,
            buffer,
            pool,
            throttle: Mutex::new(HashMap::new()),
            last_frame_ts: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Live loop: watch the ring buffer head, run the DAG once per fresh
    /// frame. Exits after the in-flight frame when the shutdown flag rises,
    /// or after too many consecutive frame failures.
    pub fn run(&self) -> Result<()> {
        let buffer = self
            .buffer
            .as_ref()
            .context("executor has no ring buffer (test mode?)")?;
        info!(
            "[workflow_executor:{}] running workflow {} against buffer '{}'",
            std::process::id(),
            self.workflow.id,
            buffer.name()
        );

        let mut frame_count = 0u64;
        let mut error_count = 0u64;
        while !self.shutdown.load(Ordering::SeqCst) {
            let Some((pixels, timestamp)) = buffer.peek_with_timestamp(-1) else {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            };

            {
                let mut last = self.last_frame_ts.lock().unwrap();
                if *last == Some(timestamp) {
                    drop(last);
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
                *last = Some(timestamp);
            }

            let shape = buffer.shape();
            let frame = FrameData::new(pixels, shape.width, shape.height);
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.process_frame(frame, timestamp)
            })) {
                Ok(_) => {
                    error_count = 0;
                    frame_count += 1;
                    if frame_count % 100 == 0 {
                        info!("processed {frame_count} frames");
                    }
                }
                Err(panic) => {
                    error_count += 1;
                    error!(
                        "frame processing panicked ({error_count}/{}): {panic:?}",
                        self.settings.health.max_consecutive_errors
                    );
                    if error_count >= self.settings.health.max_consecutive_errors {
                        bail!("too many consecutive frame failures");
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
        info!("workflow {} stopped after {frame_count} frames", self.workflow.id);
        Ok(())
    }

    /// Run the DAG once over a frame. Per-frame caches are reset first; the
    /// returned collector holds the execution log of this frame.
    pub fn process_frame(&self, frame: FrameData, timestamp: f64) -> Arc<ExecutionLogCollector> {
        self.results.clear();
        self.exec_status.clear();
        self.executed.lock().unwrap().clear();

        let frame_ctx = FrameContext {
            frame,
            timestamp,
            collector: Arc::new(ExecutionLogCollector::new()),
        };

        for (level_idx, layer) in self.layers.iter().enumerate() {
            if level_idx == 0 {
                for &node in layer {
                    self.execute_layer_node(node, &frame_ctx);
                }
            } else if self.graph.layer_allows_parallel(layer) && layer.len() > 1 {
                self.pool.scope(|scope| {
                    for &node in layer {
                        let frame_ctx = &frame_ctx;
                        scope.spawn(move |_| self.execute_layer_node(node, frame_ctx));
                    }
                });
            } else {
                for &node in layer {
                    self.execute_layer_node(node, &frame_ctx);
                }
            }
        }

        Arc::clone(&frame_ctx.collector)
    }

    fn execute_layer_node(&self, idx: usize, frame_ctx: &FrameContext) {
        // Branch traversal may have run this node already in this frame.
        if self.executed.lock().unwrap().contains(&idx) {
            return;
        }
        match &self.graph.nodes[idx].kind {
            NodeKind::Function { .. } => {
                if !self.function_ready(idx) {
                    debug!(
                        "function '{}' skipped: upstream results incomplete",
                        self.graph.nodes[idx].id
                    );
                    return;
                }
                let mut ctx = BranchContext::fresh();
                if self.execute_node(idx, frame_ctx, &mut ctx) {
                    self.follow_edges(idx, frame_ctx, &ctx);
                }
            }
            NodeKind::Algorithm { .. } => {
                self.execute_branch(idx, frame_ctx, BranchContext::fresh());
            }
            _ => {
                let mut ctx = BranchContext::fresh();
                self.execute_node(idx, frame_ctx, &mut ctx);
            }
        }
    }

    /// Execute a node and, when it produced a usable result, walk its
    /// outgoing edges with the branch state it left behind.
    fn execute_branch(&self, idx: usize, frame_ctx: &FrameContext, mut ctx: BranchContext) {
        if !self.execute_node(idx, frame_ctx, &mut ctx) {
            return;
        }
        self.follow_edges(idx, frame_ctx, &ctx);
    }

    fn follow_edges(&self, idx: usize, frame_ctx: &FrameContext, ctx: &BranchContext) {
        for &edge_idx in &self.graph.out_edges[idx] {
            let edge = self.graph.edges[edge_idx];
            // Functions join all upstreams; they run from the layer walk.
            if matches!(self.graph.nodes[edge.to].kind, NodeKind::Function { .. }) {
                continue;
            }
            if edge.condition.passes(ctx.has_detection) {
                self.execute_branch(edge.to, frame_ctx, ctx.clone());
            } else {
                debug!(
                    "edge {} -> {} blocked (condition {:?}, has_detection={})",
                    self.graph.nodes[idx].id,
                    self.graph.nodes[edge.to].id,
                    edge.condition,
                    ctx.has_detection
                );
            }
        }
    }

    /// Central dispatch: throttling, status tracking, downstream pruning.
    /// Returns whether downstream of this node should execute.
    fn execute_node(&self, idx: usize, frame_ctx: &FrameContext, ctx: &mut BranchContext) -> bool {
        let node_id = self.graph.nodes[idx].id.clone();
        if !self.should_execute(idx) {
            debug!("node '{node_id}' throttled, skipping this frame");
            return false;
        }

        let start = Instant::now();
        let outcome = match &self.graph.nodes[idx].kind {
            NodeKind::Source { .. } | NodeKind::Roi { .. } => Ok(true),
            NodeKind::Algorithm { .. } => self.run_algorithm(idx, frame_ctx, ctx),
            NodeKind::Function { .. } => self.run_function(idx, frame_ctx, ctx),
            NodeKind::Condition { .. } => self.run_condition(idx, frame_ctx, ctx),
            NodeKind::Alert { .. } => self.execute_alert_node(idx, frame_ctx, ctx),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        {
            let mut executed = self.executed.lock().unwrap();
            if !executed.contains(&idx) {
                executed.push(idx);
            }
        }

        match outcome {
            Ok(proceed) => {
                self.exec_status.insert(
                    idx,
                    ExecStatus { success: true, error: None, execution_time_ms: elapsed_ms },
                );
                proceed
            }
            Err(e) => {
                error!("node '{node_id}' failed: {e:#}");
                frame_ctx.collector.error(&node_id, format!("execution failed: {e:#}"));
                self.exec_status.insert(
                    idx,
                    ExecStatus {
                        success: false,
                        error: Some(format!("{e:#}")),
                        execution_time_ms: elapsed_ms,
                    },
                );
                false
            }
        }
    }

    /// Per-node throttling on wall time. The timestamp updates on the
    /// attempt, so a throttled node stays quiet for a full interval.
    fn should_execute(&self, idx: usize) -> bool {
        let interval = self.graph.nodes[idx].throttle_interval();
        if interval <= 0.0 {
            return true;
        }
        let now = epoch_secs();
        let mut throttle = self.throttle.lock().unwrap();
        let last = throttle.get(&idx).copied().unwrap_or(0.0);
        if now - last >= interval {
            throttle.insert(idx, now);
            true
        } else {
            false
        }
    }

    fn run_algorithm(
        &self,
        idx: usize,
        frame_ctx: &FrameContext,
        ctx: &mut BranchContext,
    ) -> Result<bool> {
        let NodeKind::Algorithm { runtime, roi_regions, .. } = &self.graph.nodes[idx].kind else {
            unreachable!("run_algorithm called on a non-algorithm node");
        };
        let node_id = &self.graph.nodes[idx].id;

        // Branch-local ROI: nearest ancestor roi node wins, the node's own
        // configuration is the fallback.
        let effective_roi: Vec<RoiRegion> = match self.graph.nearest_roi(idx) {
            Some(roi_idx) => match &self.graph.nodes[roi_idx].kind {
                NodeKind::Roi { regions } => regions.clone(),
                _ => unreachable!("nearest_roi returns roi nodes only"),
            },
            None => roi_regions.clone(),
        };

        let upstream = self.upstream_detections(idx);
        let detector = Arc::clone(
            self.detectors
                .get(&idx)
                .with_context(|| format!("node '{node_id}' has no loaded detector"))?,
        );
        let output = detectors::run_with_timeout(
            detector,
            frame_ctx.frame.clone(),
            effective_roi,
            upstream,
            runtime.runtime_timeout,
        )?;

        let has_detection = !output.detections.is_empty();
        frame_ctx.collector.detection(node_id, output.detections.len());

        ctx.has_detection = has_detection;
        ctx.detections = output.detections.clone();
        ctx.label_color = runtime.label_color.clone();
        ctx.upstream_node = Some(idx);

        self.results.insert(
            idx,
            NodeResult {
                node: idx,
                has_detection,
                detections: output.detections,
                matches: Vec::new(),
                metadata: output.metadata,
                label_color: runtime.label_color.clone(),
                frame_timestamp: frame_ctx.timestamp,
            },
        );
        Ok(true)
    }

    fn run_function(
        &self,
        idx: usize,
        frame_ctx: &FrameContext,
        ctx: &mut BranchContext,
    ) -> Result<bool> {
        let NodeKind::Function { function_name, threshold, operator, dimension, .. } =
            &self.graph.nodes[idx].kind
        else {
            unreachable!("run_function called on a non-function node");
        };
        let node_id = &self.graph.nodes[idx].id;

        let upstream = self.graph.upstream_of(idx);
        let first = upstream
            .first()
            .and_then(|up| self.results.get(up))
            .with_context(|| format!("function '{node_id}' has no upstream result"))?;
        let detections_a = first.detections.clone();
        let first_node = first.node;
        drop(first);

        let single = functions::is_single_input(function_name);
        let detections_b = if single {
            Vec::new()
        } else {
            // Pairwise functions consume exactly the first two connected
            // upstreams, in edge declaration order.
            let Some(second) = upstream.get(1).and_then(|up| self.results.get(up)) else {
                warn!("function '{node_id}' ({function_name}) needs two upstreams, got {}", upstream.len());
                frame_ctx
                    .collector
                    .warning(node_id, format!("{function_name} needs two connected upstreams"));
                return Ok(false);
            };
            second.detections.clone()
        };

        let config = FunctionConfig {
            threshold: *threshold,
            operator: *operator,
            frame_width: frame_ctx.frame.width as f64,
            frame_height: frame_ctx.frame.height as f64,
            dimension: *dimension,
        };
        let result = functions::evaluate(function_name, &detections_a, &detections_b, &config)?;
        frame_ctx.collector.function(node_id, function_name, result.matches.len());

        let has_detection = !result.detections.is_empty();
        ctx.has_detection = has_detection;
        ctx.detections = result.detections.clone();
        ctx.label_color = FUNCTION_LABEL_COLOR.to_string();
        ctx.upstream_node = Some(first_node);

        let mut metadata = serde_json::Map::new();
        metadata.insert("function_name".into(), function_name.as_str().into());
        metadata.insert("matched_count".into(), result.matches.len().into());
        self.results.insert(
            idx,
            NodeResult {
                node: idx,
                has_detection,
                detections: result.detections,
                matches: result.matches,
                metadata,
                label_color: FUNCTION_LABEL_COLOR.to_string(),
                frame_timestamp: frame_ctx.timestamp,
            },
        );
        Ok(true)
    }

    fn run_condition(
        &self,
        idx: usize,
        frame_ctx: &FrameContext,
        ctx: &mut BranchContext,
    ) -> Result<bool> {
        let NodeKind::Condition { comparison, target_count } = &self.graph.nodes[idx].kind else {
            unreachable!("run_condition called on a non-condition node");
        };
        let node_id = &self.graph.nodes[idx].id;

        let detection_count: usize = self
            .graph
            .upstream_of(idx)
            .iter()
            .filter_map(|up| self.results.get(up))
            .map(|r| r.detections.len())
            .sum();

        let passed = comparison.evaluate(detection_count, *target_count);
        ctx.has_detection = passed;
        frame_ctx.collector.condition(
            node_id,
            detection_count,
            *target_count,
            comparison.symbol(),
            passed,
        );
        Ok(true)
    }

    /// All connected upstreams of a function node must have produced a
    /// result this frame (a throttled upstream means skip, not stale data).
    fn function_ready(&self, idx: usize) -> bool {
        let upstream = self.graph.upstream_of(idx);
        !upstream.is_empty() && upstream.iter().all(|up| self.results.contains_key(up))
    }

    pub(crate) fn upstream_detections(&self, idx: usize) -> UpstreamDetections {
        let mut upstream = UpstreamDetections::new();
        for up in self.graph.upstream_of(idx) {
            if let Some(result) = self.results.get(&up) {
                upstream.insert(self.graph.nodes[up].id.clone(), result.detections.clone());
            }
        }
        upstream
    }

    /// ROI used when annotating evidence for an upstream node: its ancestor
    /// roi node, or its own configured regions.
    pub(crate) fn effective_roi_of(&self, idx: usize) -> Vec<RoiRegion> {
        if let Some(roi_idx) = self.graph.nearest_roi(idx) {
            if let NodeKind::Roi { regions } = &self.graph.nodes[roi_idx].kind {
                return regions.clone();
            }
        }
        if let NodeKind::Algorithm { roi_regions, .. } = &self.graph.nodes[idx].kind {
            return roi_regions.clone();
        }
        Vec::new()
    }
}

fn attach_with_retry(source: &VideoSource, duration: u32) -> Result<VideoRingBuffer> {
    let shape = FrameShape::rgb(source.decode_height, source.decode_width);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match VideoRingBuffer::attach(&source.buffer_name, shape, source.fps, duration) {
            Ok(buffer) => {
                info!(
                    "attached to buffer '{}' (capacity {} frames)",
                    source.buffer_name,
                    buffer.capacity()
                );
                return Ok(buffer);
            }
            Err(e) if attempt < BUFFER_ATTACH_RETRIES => {
                warn!(
                    "attempt {attempt}/{BUFFER_ATTACH_RETRIES}: buffer '{}' not ready ({e}), retrying",
                    source.buffer_name
                );
                std::thread::sleep(BUFFER_ATTACH_BACKOFF);
            }
            Err(e) => {
                error!(
                    "buffer '{}' unavailable; is the decoder worker for source {} running?",
                    source.buffer_name, source.id
                );
                return Err(e.into());
            }
        }
    }
}
