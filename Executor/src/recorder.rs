//! Alert clip recording. On trigger, historical frames are back-read from
//! the ring buffer, future frames are collected by polling until the post
//! window elapses, and the combined sequence is piped into an ffmpeg
//! encoder. Tasks are tracked per alert id so the pipeline can report clip
//! status and avoid duplicate recordings.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use ringbuffer::VideoRingBuffer;
use shared_utils::{compact_timestamp, epoch_secs};
use tracing::{debug, error, info, warn};

/// Poll cadence while waiting for post-trigger frames.
const FUTURE_POLL: Duration = Duration::from_millis(50);
/// Margin past the trigger when pulling historical frames, covering
/// detector latency between capture and alert.
const HISTORICAL_MARGIN: f64 = 1.0;
/// Encoders tried in order until one accepts the job.
const CODEC_CANDIDATES: [&str; 3] = ["libx264", "h264", "mpeg4"];
const TASK_RETENTION: f64 = 3600.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingStatus {
    Starting,
    Collecting,
    Encoding,
    Completed,
    Failed,
}

#[derive(Clone, Debug)]
pub struct RecordingTask {
    pub alert_id: i64,
    pub trigger_time: f64,
    pub status: RecordingStatus,
    pub output_path: PathBuf,
    pub relative_path: String,
}

pub struct VideoRecorder {
    buffer: Arc<VideoRingBuffer>,
    save_dir: PathBuf,
    fps: u32,
    tasks: DashMap<i64, RecordingTask>,
}

impl VideoRecorder {
    pub fn new(buffer: Arc<VideoRingBuffer>, save_dir: PathBuf, fps: u32) -> VideoRecorder {
        VideoRecorder { buffer, save_dir, fps: fps.max(1), tasks: DashMap::new() }
    }

    /// Start an asynchronous recording and return the clip path relative to
    /// the videos root. A task already in flight for this alert wins.
    pub fn start_recording(
        self: &Arc<Self>,
        source_id: i64,
        alert_id: i64,
        trigger_time: f64,
        pre_seconds: f64,
        post_seconds: f64,
    ) -> String {
        if let Some(existing) = self.tasks.get(&alert_id) {
            warn!("recording task {alert_id} already exists, reusing");
            return existing.relative_path.clone();
        }

        let filename = format!("alert_{}_{}.mp4", alert_id, compact_timestamp(trigger_time));
        let relative_path = format!("{source_id}/{filename}");
        let output_path = self.save_dir.join(source_id.to_string()).join(&filename);

        let task = RecordingTask {
            alert_id,
            trigger_time,
            status: RecordingStatus::Starting,
            output_path: output_path.clone(),
            relative_path: relative_path.clone(),
        };
        self.tasks.insert(alert_id, task);

        let recorder = Arc::clone(self);
        let thread_output_path = output_path.clone();
        thread::spawn(move || {
            let output_path = thread_output_path;
            let status = match recorder.record(alert_id, trigger_time, pre_seconds, post_seconds, &output_path) {
                Ok(frames) => {
                    info!("recording {alert_id} completed ({frames} frames): {}", output_path.display());
                    RecordingStatus::Completed
                }
                Err(e) => {
                    error!("recording {alert_id} failed: {e:#}");
                    RecordingStatus::Failed
                }
            };
            recorder.set_status(alert_id, status);
        });

        info!("started recording task {alert_id} -> {}", output_path.display());
        relative_path
    }

    fn record(
        &self,
        alert_id: i64,
        trigger_time: f64,
        pre_seconds: f64,
        post_seconds: f64,
        output_path: &Path,
    ) -> Result<usize> {
        let stats = self.buffer.stats();
        debug!("recording {alert_id}: buffer holds {}/{} frames", stats.count, stats.capacity);

        // Historical phase: everything retained from the pre window, with a
        // small margin past the trigger.
        let start = trigger_time - pre_seconds;
        let mut frames = self
            .buffer
            .get_frames_in_time_range(start, trigger_time + HISTORICAL_MARGIN);
        if frames.is_empty() && stats.count > 0 {
            warn!("recording {alert_id}: no frames in range, falling back to most recent {pre_seconds}s");
            frames = self.buffer.get_recent_frames(pre_seconds);
        }

        // Future phase: poll for frames newer than the last collected one
        // until the post window has elapsed on the wall clock.
        self.set_status(alert_id, RecordingStatus::Collecting);
        let window_end = trigger_time + post_seconds;
        let wall_deadline = epoch_secs() + post_seconds;
        let mut last_ts = frames.last().map(|(_, ts)| *ts).unwrap_or(trigger_time);

        while epoch_secs() < wall_deadline {
            for (frame, ts) in self.buffer.get_frames_in_time_range(last_ts, window_end) {
                if ts > last_ts {
                    frames.push((frame, ts));
                    last_ts = ts;
                }
            }
            thread::sleep(FUTURE_POLL);
        }

        if frames.is_empty() {
            bail!("no frames collected around trigger {trigger_time}");
        }

        self.set_status(alert_id, RecordingStatus::Encoding);
        self.encode(&frames, output_path)?;
        Ok(frames.len())
    }

    /// Pipe raw rgb24 frames into ffmpeg, trying codec candidates in order.
    fn encode(&self, frames: &[(Vec<u8>, f64)], output_path: &Path) -> Result<()> {
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let shape = self.buffer.shape();

        let mut last_error = None;
        for codec in CODEC_CANDIDATES {
            match self.encode_with_codec(frames, output_path, codec, shape.width, shape.height) {
                Ok(()) => {
                    debug!("encoded {} frames with {codec}", frames.len());
                    return Ok(());
                }
                Err(e) => {
                    warn!("codec {codec} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no codec available")))
    }

    fn encode_with_codec(
        &self,
        frames: &[(Vec<u8>, f64)],
        output_path: &Path,
        codec: &str,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let mut child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-y",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "-s",
                &format!("{width}x{height}"),
                "-r",
                &self.fps.to_string(),
                "-i",
                "pipe:0",
                "-c:v",
                codec,
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
            ])
            .arg(output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("ffmpeg encoder spawn failed")?;

        {
            let mut stdin = child.stdin.take().context("encoder stdin missing")?;
            for (pixels, _) in frames {
                stdin.write_all(pixels).context("encoder rejected frame data")?;
            }
            // Closing stdin lets ffmpeg finalize the container.
        }

        let status = child.wait()?;
        if !status.success() {
            bail!("ffmpeg exited with {status}");
        }
        if !output_path.exists() {
            bail!("encoder produced no output file");
        }
        Ok(())
    }

    fn set_status(&self, alert_id: i64, status: RecordingStatus) {
        if let Some(mut task) = self.tasks.get_mut(&alert_id) {
            task.status = status;
        }
    }

    pub fn status(&self, alert_id: i64) -> Option<RecordingTask> {
        self.tasks.get(&alert_id).map(|t| t.clone())
    }

    /// Purge finished tasks older than the retention window.
    pub fn cleanup_completed(&self) {
        let now = epoch_secs();
        self.tasks.retain(|_, task| {
            let finished = matches!(task.status, RecordingStatus::Completed | RecordingStatus::Failed);
            !(finished && now - task.trigger_time > TASK_RETENTION)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuffer::FrameShape;

    fn test_recorder(tag: &str) -> (Arc<VideoRecorder>, tempfile::TempDir, Arc<VideoRingBuffer>) {
        let dir = tempfile::tempdir().unwrap();
        let name = format!("recorder_test_{tag}_{}", std::process::id());
        let buffer = Arc::new(
            VideoRingBuffer::create(&name, FrameShape::rgb(4, 4), 5, 2).unwrap(),
        );
        let recorder =
            Arc::new(VideoRecorder::new(Arc::clone(&buffer), dir.path().to_path_buf(), 10));
        (recorder, dir, buffer)
    }

    #[test]
    fn relative_path_follows_layout() {
        let (recorder, _dir, buffer) = test_recorder("path");
        let _cleanup = CleanupBuffer(Arc::clone(&buffer));
        // Empty buffer + zero post window: task fails quickly but the path
        // contract holds.
        let relative = recorder.start_recording(7, 99, 1_700_000_000.0, 0.0, 0.0);
        assert!(relative.starts_with("7/alert_99_"));
        assert!(relative.ends_with(".mp4"));

        // Duplicate start returns the same path.
        let again = recorder.start_recording(7, 99, 1_700_000_000.0, 0.0, 0.0);
        assert_eq!(relative, again);
    }

    #[test]
    fn empty_buffer_marks_task_failed() {
        let (recorder, _dir, buffer) = test_recorder("fail");
        let _cleanup = CleanupBuffer(Arc::clone(&buffer));
        recorder.start_recording(1, 5, epoch_secs(), 0.0, 0.0);
        for _ in 0..100 {
            if let Some(task) = recorder.status(5) {
                if task.status == RecordingStatus::Failed {
                    return;
                }
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("recording task never failed");
    }

    struct CleanupBuffer(Arc<VideoRingBuffer>);
    impl Drop for CleanupBuffer {
        fn drop(&mut self) {
            let _ = self.0.unlink();
        }
    }
}
