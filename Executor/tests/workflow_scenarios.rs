//! End-to-end DAG scenarios driven through the real execution path with
//! scripted detectors: ROI branch isolation, condition-guarded alerting
//! with suppression, and function-node upstream joins with throttling.

use std::sync::Arc;

use ringbuffer::{FrameShape, VideoRingBuffer};
use shared_utils::config::{
    BrokerSettings, HealthThresholds, RecordingSettings, Settings,
};
use store::{Algorithm, Db, SourceStatus, VideoSource};
use workflow_executor::executor::{AlertServices, WorkflowExecutor};
use workflow_executor::types::FrameData;

const WIDTH: u32 = 100;
const HEIGHT: u32 = 100;

fn test_settings(root: &std::path::Path) -> Settings {
    Settings {
        db_path: root.join("ba.db"),
        frames_root: root.join("frames"),
        videos_root: root.join("videos"),
        ringbuffer_duration: 2,
        recording: RecordingSettings {
            enabled: false,
            pre_alert_duration: 1.0,
            post_alert_duration: 1.0,
            fps: 10,
        },
        broker: BrokerSettings {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 5672,
            vhost: "/".into(),
            user: "guest".into(),
            password: "guest".into(),
            exchange: "video.alerts".into(),
            exchange_type: "topic".into(),
            queue: "video.alert.queue".into(),
            routing_key: "video.alert".into(),
            topic_pattern: "video.alert.*".into(),
        },
        health: HealthThresholds {
            no_frame_warning: 10.0,
            no_frame_critical: 30.0,
            low_fps_ratio: 0.5,
            max_consecutive_errors: 10,
        },
        alert_suppression_duration: 60.0,
    }
}

fn insert_source(db: &Db, buffer_name: &str) -> i64 {
    db.insert_source(&VideoSource {
        id: 0,
        name: "test camera".into(),
        source_code: "cam_test".into(),
        source_url: "rtsp://example/stream".into(),
        decode_width: WIDTH,
        decode_height: HEIGHT,
        fps: 5,
        buffer_name: buffer_name.to_string(),
        enabled: true,
        status: SourceStatus::Stopped,
        decoder_pid: None,
    })
    .unwrap()
}

fn insert_scripted_algorithm(db: &Db, name: &str, config: serde_json::Value) -> i64 {
    db.insert_algorithm(&Algorithm {
        id: 0,
        name: name.to_string(),
        script_path: "scripted".into(),
        script_config: config.to_string(),
        interval_seconds: 0.0,
        runtime_timeout: 5.0,
        memory_limit_mb: 128,
        label_name: "Object".into(),
        label_color: "#FF0000".into(),
    })
    .unwrap()
}

fn frame_pixels() -> Vec<u8> {
    vec![0u8; (WIDTH * HEIGHT * 3) as usize]
}

struct OwnedBuffer(Arc<VideoRingBuffer>);
impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        let _ = self.0.unlink();
    }
}

/// Live-mode fixture: real ring buffer segment, in-memory store, no broker
/// and no recorder.
fn live_executor(
    db: Arc<Db>,
    workflow_id: i64,
    buffer_name: &str,
    settings: Settings,
) -> (WorkflowExecutor, OwnedBuffer) {
    let buffer = Arc::new(
        VideoRingBuffer::create(buffer_name, FrameShape::rgb(HEIGHT, WIDTH), 5, 2).unwrap(),
    );
    let services = AlertServices { db: Some(Arc::clone(&db)), publisher: None, runtime: None };
    let executor = WorkflowExecutor::load(db, workflow_id, false, settings, services).unwrap();
    (executor, OwnedBuffer(buffer))
}

fn unique_buffer_name(tag: &str) -> String {
    format!("wf_scenario_{tag}_{}", std::process::id())
}

#[test]
fn roi_branches_stay_isolated() {
    // source -> roi_left -> algo_x ; source -> roi_right -> algo_y.
    // Both detectors script the same two boxes (one per half); each branch
    // must keep only the box inside its own region.
    let db = Arc::new(Db::open_in_memory().unwrap());
    let both_halves = serde_json::json!({
        "detections": [
            {"box": [10.0, 40.0, 20.0, 50.0], "label": "left", "confidence": 0.9},
            {"box": [80.0, 40.0, 90.0, 50.0], "label": "right", "confidence": 0.9}
        ]
    });
    let algo_x = insert_scripted_algorithm(&db, "algo x", both_halves.clone());
    let algo_y = insert_scripted_algorithm(&db, "algo y", both_halves);

    let graph = serde_json::json!({
        "nodes": [
            {"id": "src", "type": "source", "dataId": 1},
            {"id": "roi_left", "type": "roi", "config": {"roi_regions": [
                {"name": "left zone", "polygon": [
                    {"x": 0.0, "y": 0.0}, {"x": 0.5, "y": 0.0}, {"x": 0.5, "y": 1.0}, {"x": 0.0, "y": 1.0}
                ]}
            ]}},
            {"id": "roi_right", "type": "roi", "config": {"roi_regions": [
                {"name": "right zone", "polygon": [
                    {"x": 0.5, "y": 0.0}, {"x": 1.0, "y": 0.0}, {"x": 1.0, "y": 1.0}, {"x": 0.5, "y": 1.0}
                ]}
            ]}},
            {"id": "algo_x", "type": "algorithm", "dataId": algo_x},
            {"id": "algo_y", "type": "algorithm", "dataId": algo_y}
        ],
        "connections": [
            {"from": "src", "to": "roi_left"},
            {"from": "src", "to": "roi_right"},
            {"from": "roi_left", "to": "algo_x"},
            {"from": "roi_right", "to": "algo_y"}
        ]
    });
    let workflow_id = db.insert_workflow("roi isolation", true, &graph.to_string()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let services = AlertServices::default();
    let executor =
        WorkflowExecutor::load(Arc::clone(&db), workflow_id, true, test_settings(dir.path()), services)
            .unwrap();
    let report = executor.run_test(frame_pixels(), WIDTH, HEIGHT);

    let by_id = |id: &str| {
        report
            .nodes
            .iter()
            .find(|n| n.node_id == id)
            .unwrap_or_else(|| panic!("node {id} not executed"))
    };
    let x = by_id("algo_x");
    assert_eq!(x.detections.len(), 1);
    assert_eq!(x.detections[0].label, "left");
    let y = by_id("algo_y");
    assert_eq!(y.detections.len(), 1);
    assert_eq!(y.detections[0].label, "right");
}

#[test]
fn condition_threshold_and_cooldown() {
    // source -> algo -> condition(>=2) -> alert(cooldown 10s). Frames with
    // detection counts [1, 2, 3]: no alert, alert, suppressed.
    let db = Arc::new(Db::open_in_memory().unwrap());
    let det = |x: f64| serde_json::json!({"box": [x, 0.0, x + 5.0, 5.0], "label": "p", "confidence": 1.0});
    let algo = insert_scripted_algorithm(
        &db,
        "counter",
        serde_json::json!({"frames": [
            [det(0.0)],
            [det(0.0), det(10.0)],
            [det(0.0), det(10.0), det(20.0)]
        ]}),
    );

    let buffer_name = unique_buffer_name("cond");
    let source_id = insert_source(&db, &buffer_name);
    let graph = serde_json::json!({
        "nodes": [
            {"id": "src", "type": "source", "dataId": source_id},
            {"id": "algo", "type": "algorithm", "dataId": algo},
            {"id": "cond", "type": "condition", "config": {"comparison": ">=", "target_count": 2}},
            {"id": "alert", "type": "alert", "config": {
                "alert_type": "crowding",
                "alert_level": "warning",
                "suppression": {"enable": true, "duration": 10.0}
            }}
        ],
        "connections": [
            {"from": "src", "to": "algo"},
            {"from": "algo", "to": "cond"},
            {"from": "cond", "to": "alert"}
        ]
    });
    let workflow_id = db.insert_workflow("crowding", true, &graph.to_string()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let (executor, _buffer) =
        live_executor(Arc::clone(&db), workflow_id, &buffer_name, test_settings(dir.path()));

    let base = shared_utils::epoch_secs();
    for i in 0..3 {
        let frame = FrameData::new(frame_pixels(), WIDTH, HEIGHT);
        executor.process_frame(frame, base + i as f64);
        let expected = if i == 0 { 0 } else { 1 };
        assert_eq!(db.alert_count().unwrap(), expected, "after frame {}", i + 1);
    }

    // The fired alert left evidence stills on disk.
    let frames_dir = dir.path().join("frames").join("cam_test").join("crowding");
    assert!(frames_dir.is_dir());
    assert!(frames_dir.read_dir().unwrap().count() >= 2); // annotated + ori
}

#[test]
fn function_join_skips_when_one_upstream_is_throttled() {
    // (algo_a, algo_b) -> iou_check(> 0.5) -> alert. algo_a is throttled on
    // the second frame, so the function is skipped and no second alert fires.
    let db = Arc::new(Db::open_in_memory().unwrap());
    let overlapping = serde_json::json!({
        "detections": [{"box": [0.0, 0.0, 10.0, 10.0], "label": "a", "confidence": 1.0}]
    });
    let algo_a = db
        .insert_algorithm(&Algorithm {
            id: 0,
            name: "slow algo".into(),
            script_path: "scripted".into(),
            script_config: overlapping.to_string(),
            interval_seconds: 0.5,
            runtime_timeout: 5.0,
            memory_limit_mb: 128,
            label_name: "A".into(),
            label_color: "#FF0000".into(),
        })
        .unwrap();
    let algo_b = insert_scripted_algorithm(
        &db,
        "fast algo",
        serde_json::json!({
            "detections": [
                {"box": [1.0, 1.0, 10.0, 10.0], "label": "b", "confidence": 1.0},
                {"box": [50.0, 50.0, 60.0, 60.0], "label": "b", "confidence": 1.0}
            ]
        }),
    );

    let buffer_name = unique_buffer_name("func");
    let source_id = insert_source(&db, &buffer_name);
    let graph = serde_json::json!({
        "nodes": [
            {"id": "src", "type": "source", "dataId": source_id},
            {"id": "algo_a", "type": "algorithm", "dataId": algo_a},
            {"id": "algo_b", "type": "algorithm", "dataId": algo_b},
            {"id": "overlap", "type": "function", "config": {
                "function_name": "iou_check", "threshold": 0.5, "operator": "greater_than"
            }},
            {"id": "alert", "type": "alert", "config": {"alert_type": "overlap"}}
        ],
        "connections": [
            {"from": "src", "to": "algo_a"},
            {"from": "src", "to": "algo_b"},
            {"from": "algo_a", "to": "overlap"},
            {"from": "algo_b", "to": "overlap"},
            {"from": "overlap", "to": "alert", "condition": "true"}
        ]
    });
    let workflow_id = db.insert_workflow("overlap", true, &graph.to_string()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let (executor, _buffer) =
        live_executor(Arc::clone(&db), workflow_id, &buffer_name, test_settings(dir.path()));

    let base = shared_utils::epoch_secs();
    executor.process_frame(FrameData::new(frame_pixels(), WIDTH, HEIGHT), base);
    assert_eq!(db.alert_count().unwrap(), 1, "overlapping pair must alert");

    // Immediately after, algo_a is inside its 0.5s interval: the function
    // has an incomplete upstream set and must not fire.
    executor.process_frame(FrameData::new(frame_pixels(), WIDTH, HEIGHT), base + 0.01);
    assert_eq!(db.alert_count().unwrap(), 1, "throttled upstream must skip the join");
}

#[test]
fn negated_edge_fires_on_absence() {
    // source -> algo(no detections) -> alert via a "false" edge: the alert
    // node executes exactly when nothing was detected.
    let db = Arc::new(Db::open_in_memory().unwrap());
    let algo = insert_scripted_algorithm(&db, "empty", serde_json::json!({"detections": []}));
    let graph = serde_json::json!({
        "nodes": [
            {"id": "src", "type": "source", "dataId": 1},
            {"id": "algo", "type": "algorithm", "dataId": algo},
            {"id": "missing", "type": "alert", "config": {"alert_type": "absence"}},
            {"id": "present", "type": "alert", "config": {"alert_type": "presence"}}
        ],
        "connections": [
            {"from": "src", "to": "algo"},
            {"from": "algo", "to": "missing", "condition": "false"},
            {"from": "algo", "to": "present", "condition": "true"}
        ]
    });
    let workflow_id = db.insert_workflow("absence", true, &graph.to_string()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let executor = WorkflowExecutor::load(
        Arc::clone(&db),
        workflow_id,
        true,
        test_settings(dir.path()),
        AlertServices::default(),
    )
    .unwrap();
    let report = executor.run_test(frame_pixels(), WIDTH, HEIGHT);

    let executed: Vec<&str> = report.nodes.iter().map(|n| n.node_id.as_str()).collect();
    assert!(executed.contains(&"missing"));
    assert!(!executed.contains(&"present"));
}

#[test]
fn test_mode_never_touches_database_or_disk() {
    let db = Arc::new(Db::open_in_memory().unwrap());
    let algo = insert_scripted_algorithm(
        &db,
        "always",
        serde_json::json!({"detections": [{"box": [1.0, 1.0, 9.0, 9.0], "label": "x", "confidence": 1.0}]}),
    );
    let graph = serde_json::json!({
        "nodes": [
            {"id": "src", "type": "source", "dataId": 1},
            {"id": "algo", "type": "algorithm", "dataId": algo},
            {"id": "alert", "type": "alert", "config": {"alert_type": "anything"}}
        ],
        "connections": [
            {"from": "src", "to": "algo"},
            {"from": "algo", "to": "alert", "condition": "true"}
        ]
    });
    let workflow_id = db.insert_workflow("test mode", true, &graph.to_string()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let executor = WorkflowExecutor::load(
        Arc::clone(&db),
        workflow_id,
        true,
        test_settings(dir.path()),
        AlertServices::default(),
    )
    .unwrap();
    let report = executor.run_test(frame_pixels(), WIDTH, HEIGHT);

    assert!(report.success);
    assert_eq!(db.alert_count().unwrap(), 0);
    assert!(!dir.path().join("frames").exists());
    // The alert node still reports what it would have done.
    assert!(report
        .logs
        .iter()
        .any(|log| log.content.contains("would_trigger=true")));
}
