//! Reconciliation of the declared source set against running decoder
//! workers. Each tick: start enabled-but-stopped sources, stop
//! disabled-but-running ones, and sweep RUNNING sources whose child exited
//! (marked FAILED, cleaned up, restarted on the next tick).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use ringbuffer::{FrameShape, VideoRingBuffer};
use store::{Db, SourceStatus, VideoSource};
use sysinfo::{Pid, System};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// What one reconciliation pass intends to do, computed from rows alone so
/// the decision logic stays testable without processes.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickPlan {
    pub to_start: Vec<i64>,
    pub to_stop: Vec<i64>,
}

pub fn plan_tick(sources: &[VideoSource]) -> TickPlan {
    let mut plan = TickPlan::default();
    for source in sources {
        match (source.enabled, source.status) {
            (true, SourceStatus::Stopped) => plan.to_start.push(source.id),
            (false, SourceStatus::Running) => plan.to_stop.push(source.id),
            _ => {}
        }
    }
    plan
}

pub struct Orchestrator {
    db: Arc<Db>,
    worker_bin: PathBuf,
    ringbuffer_duration: u32,
    children: HashMap<i64, Child>,
    buffers: HashMap<i64, VideoRingBuffer>,
}

impl Orchestrator {
    /// Crash recovery happens here: stale RUNNING rows are reset and any
    /// still-alive workers from a previous incarnation are terminated.
    pub fn new(db: Arc<Db>, worker_bin: PathBuf, ringbuffer_duration: u32) -> Result<Orchestrator> {
        let stale: Vec<VideoSource> = db.running_sources()?;
        if !stale.is_empty() {
            let mut system = System::new_all();
            system.refresh_all();
            for source in &stale {
                if let Some(pid) = source.decoder_pid {
                    if let Some(process) = system.process(Pid::from(pid as usize)) {
                        warn!(
                            "killing stale decoder for source {} (pid {})",
                            source.id, pid
                        );
                        process.kill();
                    }
                }
            }
        }
        let reset = db.reset_running_sources()?;
        if reset > 0 {
            info!("reset {reset} stale source rows to STOPPED");
        }
        Ok(Orchestrator {
            db,
            worker_bin,
            ringbuffer_duration,
            children: HashMap::new(),
            buffers: HashMap::new(),
        })
    }

    pub async fn tick(&mut self) -> Result<()> {
        let plan = plan_tick(&self.db.list_sources()?);

        for id in plan.to_start {
            if let Some(source) = self.db.get_source(id)? {
                if let Err(e) = self.start_source(&source).await {
                    error!("failed to start source {}: {e:#}", source.id);
                }
            }
        }

        for id in plan.to_stop {
            if let Some(source) = self.db.get_source(id)? {
                info!("source {} disabled, stopping", source.id);
                self.stop_source(&source).await?;
            }
        }

        self.health_sweep().await?;
        Ok(())
    }

    async fn start_source(&mut self, source: &VideoSource) -> Result<()> {
        info!("starting source {} ({})", source.id, source.name);

        // The orchestrator creates and therefore owns the segment; the
        // worker and any executors only attach.
        let shape = FrameShape::rgb(source.decode_height, source.decode_width);
        let buffer =
            VideoRingBuffer::create(&source.buffer_name, shape, source.fps, self.ringbuffer_duration)
                .with_context(|| format!("ring buffer '{}' create failed", source.buffer_name))?;
        info!(
            "created ring buffer '{}': fps={}, duration={}s, capacity={} frames",
            source.buffer_name,
            source.fps,
            self.ringbuffer_duration,
            buffer.capacity()
        );

        let child = Command::new(&self.worker_bin)
            .arg("--url")
            .arg(&source.source_url)
            .arg("--source-id")
            .arg(source.id.to_string())
            .arg("--sample-mode")
            .arg("fps")
            .arg("--sample-fps")
            .arg(source.fps.to_string())
            .arg("--width")
            .arg(source.decode_width.to_string())
            .arg("--height")
            .arg(source.decode_height.to_string())
            .arg("--buffer")
            .arg(&source.buffer_name)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn of {} failed", self.worker_bin.display()))?;

        let pid = child.id().context("spawned worker has no pid")? as i64;
        self.db.set_source_running(source.id, pid)?;
        self.children.insert(source.id, child);
        self.buffers.insert(source.id, buffer);
        info!("source {} RUNNING with decoder pid {}", source.id, pid);
        Ok(())
    }

    /// Idempotent: safe to call for sources that are already down.
    async fn stop_source(&mut self, source: &VideoSource) -> Result<()> {
        if let Some(mut child) = self.children.remove(&source.id) {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        if let Some(buffer) = self.buffers.remove(&source.id) {
            if let Err(e) = buffer.unlink() {
                warn!("unlink of '{}' failed: {e}", buffer.name());
            }
        }
        self.db.set_source_stopped(source.id)?;
        info!("source {} stopped", source.id);
        Ok(())
    }

    async fn health_sweep(&mut self) -> Result<()> {
        for source in self.db.running_sources()? {
            let exited = match self.children.get_mut(&source.id) {
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        warn!("decoder for source {} exited: {status}", source.id);
                        true
                    }
                    Ok(None) => false,
                    Err(e) => {
                        warn!("decoder poll for source {} failed: {e}", source.id);
                        true
                    }
                },
                // RUNNING row without a child means state we did not create.
                None => {
                    warn!("source {} RUNNING without a supervised child", source.id);
                    true
                }
            };

            if exited {
                self.db.set_source_failed(source.id)?;
                self.stop_source(&source).await?;
                // Next tick sees STOPPED + enabled and restarts it.
            }
        }
        Ok(())
    }

    /// Graceful shutdown: stop every running source and leave clean rows.
    pub async fn stop_all(&mut self) -> Result<()> {
        info!("shutting down all running sources");
        for source in self.db.running_sources()? {
            self.stop_source(&source).await?;
        }
        Ok(())
    }
}
