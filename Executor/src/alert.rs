//! Alert node execution: window accumulation, trigger condition,
//! suppression, evidence capture, persistence, recording and broker
//! publish. In test mode everything after the log entry is shimmed out.

use anyhow::{Context, Result};
use broker::AlertEnvelope;
use serde_json::json;
use shared_utils::{compact_timestamp, display_timestamp, epoch_secs};
use store::NewAlert;
use tracing::{info, warn};

use crate::executor::{BranchContext, FrameContext, WorkflowExecutor};
use crate::types::NodeKind;
use crate::visualize;

impl WorkflowExecutor {
    pub(crate) fn execute_alert_node(
        &self,
        idx: usize,
        frame_ctx: &FrameContext,
        ctx: &mut BranchContext,
    ) -> Result<bool> {
        let NodeKind::Alert {
            alert_type,
            alert_level,
            alert_message,
            message_format,
            trigger,
            suppression,
        } = &self.graph.nodes[idx].kind
        else {
            unreachable!("execute_alert_node called on a non-alert node");
        };
        let node_id = self.graph.nodes[idx].id.clone();

        // Reached without branch state (e.g. scheduled oddly): pull the
        // nearest cached upstream result instead.
        if ctx.upstream_node.is_none() {
            let cached = self
                .graph
                .upstream_of(idx)
                .into_iter()
                .find_map(|up| self.results.get(&up).map(|r| r.clone()));
            match cached {
                Some(result) => {
                    ctx.has_detection = result.has_detection;
                    ctx.detections = result.detections.clone();
                    ctx.label_color = result.label_color.clone();
                    ctx.upstream_node = Some(result.node);
                }
                None => {
                    frame_ctx
                        .collector
                        .warning(&node_id, "upstream produced no result, nothing to alert on");
                    return Ok(true);
                }
            }
        }

        if self.test_mode {
            self.execute_alert_test(&node_id, alert_type, alert_level, ctx, frame_ctx);
            return Ok(true);
        }

        let source = self
            .video_source
            .as_ref()
            .context("alert execution requires a video source")?
            .clone();

        self.window
            .configure(source.id, &node_id, trigger.clone(), suppression.clone());
        self.window.add_record(
            source.id,
            &node_id,
            frame_ctx.timestamp,
            ctx.has_detection,
            None,
        );
        if !ctx.has_detection {
            return Ok(true);
        }

        let trigger_time = epoch_secs();
        let (condition_met, window_stats) =
            self.window.check_condition(source.id, &node_id, trigger_time);
        if !condition_met {
            if let Some(stats) = &window_stats {
                info!(
                    "alert '{node_id}' below trigger condition ({}/{} frames, ratio {:.2}, run {})",
                    stats.detection_count, stats.total_count, stats.detection_ratio, stats.max_consecutive
                );
            }
            return Ok(true);
        }

        let (not_suppressed, cooldown) =
            self.window.check_suppression(source.id, &node_id, trigger_time);
        if !not_suppressed {
            if let Some(info) = cooldown {
                info!(
                    "alert '{node_id}' suppressed, {:.1}s cooldown remaining",
                    info.cooldown_remaining
                );
            }
            return Ok(true);
        }

        self.window.record_trigger(source.id, &node_id, trigger_time);

        // Evidence: prefer images recorded in the window, otherwise
        // synthesize one from the current frame.
        let mut detection_images = Vec::new();
        for record in self.window.detection_records(source.id, &node_id, trigger_time) {
            if let Some(image_path) = record.image_path {
                detection_images.push(json!({
                    "image_path": image_path,
                    "image_ori_path": format!("{image_path}.ori.jpg"),
                    "timestamp": record.timestamp,
                    "detection_time": display_timestamp(record.timestamp),
                }));
            }
        }
        if detection_images.is_empty() {
            let relative = format!(
                "{}/{}/frame_{}.jpg",
                source.source_code,
                alert_type,
                compact_timestamp(frame_ctx.timestamp)
            );
            let absolute = self.settings.frames_root.join(&relative);
            let roi = ctx
                .upstream_node
                .map(|up| self.effective_roi_of(up))
                .unwrap_or_default();
            let annotated =
                visualize::annotate(&frame_ctx.frame, &ctx.detections, &ctx.label_color, &roi);
            visualize::save_jpeg(&annotated, &absolute)?;

            let relative_ori = format!("{relative}.ori.jpg");
            visualize::save_raw_frame(&frame_ctx.frame, &self.settings.frames_root.join(&relative_ori))?;

            detection_images.push(json!({
                "image_path": relative,
                "image_ori_path": relative_ori,
                "timestamp": frame_ctx.timestamp,
                "detection_time": display_timestamp(frame_ctx.timestamp),
            }));
        }

        let main_image = detection_images
            .last()
            .and_then(|v| v["image_path"].as_str())
            .unwrap_or_default()
            .to_string();
        let main_image_ori = detection_images
            .last()
            .and_then(|v| v["image_ori_path"].as_str())
            .unwrap_or_default()
            .to_string();

        // Compose the message: configured text first, execution details after.
        let details = frame_ctx.collector.build_alert_message(*message_format);
        let message = match (alert_message.is_empty(), details == "no execution log") {
            (false, false) => format!("{alert_message}\n\nexecution details:\n{details}"),
            (false, true) => alert_message.clone(),
            (true, _) => details,
        };

        let db = self
            .services
            .db
            .as_ref()
            .context("alert execution requires a database")?;
        let alert_time = display_timestamp(trigger_time);
        let alert_id = db.insert_alert(&NewAlert {
            video_source: source.id,
            workflow: Some(self.workflow.id),
            alert_time: alert_time.clone(),
            alert_type: alert_type.clone(),
            alert_level: alert_level.clone(),
            alert_message: message.clone(),
            alert_image: main_image.clone(),
            alert_image_ori: main_image_ori.clone(),
            alert_video: String::new(),
            detection_count: detection_images.len() as u32,
            window_stats: window_stats
                .as_ref()
                .and_then(|s| serde_json::to_string(s).ok()),
            detection_images: serde_json::to_string(&detection_images).ok(),
        })?;
        info!(
            "alert {alert_id} created for '{node_id}' ({alert_type}/{alert_level}, {} evidence images)",
            detection_images.len()
        );

        let mut alert_video = String::new();
        if let Some(recorder) = &self.recorder {
            alert_video = recorder.start_recording(
                source.id,
                alert_id,
                trigger_time,
                self.settings.recording.pre_alert_duration,
                self.settings.recording.post_alert_duration,
            );
            db.set_alert_video(alert_id, &alert_video)?;
            recorder.cleanup_completed();
        }

        if let (Some(publisher), Some(runtime)) =
            (self.services.publisher.clone(), self.services.runtime.clone())
        {
            let envelope = AlertEnvelope {
                alert_id,
                source_id: source.id,
                source_name: source.name.clone(),
                source_code: source.source_code.clone(),
                workflow_id: Some(self.workflow.id),
                workflow_name: Some(self.workflow.name.clone()),
                alert_time,
                alert_type: alert_type.clone(),
                alert_level: alert_level.clone(),
                alert_message: message,
                alert_image: main_image,
                alert_image_ori: main_image_ori,
                alert_video,
                timestamp: epoch_secs(),
                source: AlertEnvelope::SOURCE_TAG.to_string(),
            };
            runtime.spawn(async move {
                if !publisher.publish(&envelope).await && publisher.is_enabled() {
                    warn!("alert {} not delivered to broker", envelope.alert_id);
                }
            });
        }

        Ok(true)
    }

    /// Test-mode shim: same decision surface, no side effects.
    fn execute_alert_test(
        &self,
        node_id: &str,
        alert_type: &str,
        alert_level: &str,
        ctx: &BranchContext,
        frame_ctx: &FrameContext,
    ) {
        frame_ctx.collector.info(
            node_id,
            format!(
                "alert test: {alert_type}/{alert_level}, {} detection(s), would_trigger={}",
                ctx.detections.len(),
                ctx.has_detection
            ),
        );
    }
}
