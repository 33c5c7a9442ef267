//! Transport pullers. Each variant spawns an ffmpeg subprocess configured
//! for its transport, copies the elementary video stream to stdout, and fans
//! fixed-size byte chunks out to registered packet handlers.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};

const CHUNK_SIZE: usize = 65536;
const STOP_WAIT: Duration = Duration::from_secs(2);

pub type PacketHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Transport kind, auto-detected from the source URL or forced explicitly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Rtsp { transport: &'static str },
    File { looped: bool },
    HttpFlv,
    Hls,
}

impl StreamKind {
    pub fn detect(source: &str) -> Result<StreamKind> {
        let lower = source.to_ascii_lowercase();
        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            return Ok(StreamKind::Rtsp { transport: "tcp" });
        }
        if lower.ends_with(".m3u8") || lower.ends_with(".m3u") {
            return Ok(StreamKind::Hls);
        }
        if lower.ends_with(".flv") {
            return Ok(StreamKind::HttpFlv);
        }
        if lower.starts_with("http://") || lower.starts_with("https://") {
            warn!("ambiguous http source, assuming http-flv: {source}");
            return Ok(StreamKind::HttpFlv);
        }
        if Path::new(source).exists() {
            return Ok(StreamKind::File { looped: false });
        }
        bail!("unrecognized stream source: {source}")
    }

    /// Elementary stream format on stdout. HEVC sources keep hevc; everything
    /// else is copied as annex-b h264. The decoder must be fed the same
    /// format name.
    pub fn output_format(source: &str) -> &'static str {
        let lower = source.to_ascii_lowercase();
        if lower.contains("h265") || lower.contains("hevc") {
            "hevc"
        } else {
            "h264"
        }
    }

    pub fn build_command(&self, source: &str) -> Vec<String> {
        let mut cmd: Vec<String> = vec!["ffmpeg".into()];
        match self {
            StreamKind::Rtsp { transport } => {
                cmd.extend(["-rtsp_transport".into(), (*transport).into()]);
            }
            StreamKind::File { looped } => {
                if *looped {
                    cmd.extend(["-stream_loop".into(), "-1".into()]);
                }
                // Pace reads at the file's native frame rate.
                cmd.push("-re".into());
            }
            StreamKind::HttpFlv | StreamKind::Hls => {}
        }
        cmd.extend([
            "-i".into(),
            source.into(),
            "-an".into(),
            "-dn".into(),
            "-vcodec".into(),
            "copy".into(),
            "-f".into(),
            Self::output_format(source).into(),
            "pipe:1".into(),
        ]);
        cmd
    }
}

pub struct Streamer {
    source: String,
    kind: StreamKind,
    child: Arc<Mutex<Option<Child>>>,
    handlers: Arc<Mutex<Vec<PacketHandler>>>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl Streamer {
    pub fn new(source: &str, kind: Option<StreamKind>) -> Result<Streamer> {
        let kind = match kind {
            Some(kind) => kind,
            None => StreamKind::detect(source)?,
        };
        Ok(Streamer {
            source: source.to_string(),
            kind,
            child: Arc::new(Mutex::new(None)),
            handlers: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            reader: None,
        })
    }

    /// Register a packet sink. Handlers run in registration order; a panic in
    /// one of them must not take the reader loop down, so each call is caught.
    pub fn add_packet_handler(&self, handler: PacketHandler) {
        self.handlers.lock().unwrap().push(handler);
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            warn!("streamer for {} already running", self.source);
            return Ok(());
        }

        let argv = self.kind.build_command(&self.source);
        info!("starting stream puller: {}", argv.join(" "));
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn puller for {}", self.source))?;

        let stdout = child.stdout.take().context("puller stdout missing")?;
        let stderr = child.stderr.take().context("puller stderr missing")?;
        self.running.store(true, Ordering::SeqCst);
        *self.child.lock().unwrap() = Some(child);

        let running = Arc::clone(&self.running);
        thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                // ffmpeg reports progress on stderr; keep only real noise.
                if !(line.contains("frame=") || line.contains("fps=") || line.contains("bitrate="))
                    && !line.trim().is_empty()
                {
                    warn!("[puller stderr] {line}");
                }
            }
        });

        let running = Arc::clone(&self.running);
        let handlers = Arc::clone(&self.handlers);
        self.reader = Some(thread::spawn(move || {
            let mut stdout = stdout;
            let mut chunk = vec![0u8; CHUNK_SIZE];
            while running.load(Ordering::SeqCst) {
                match stdout.read(&mut chunk) {
                    Ok(0) => {
                        warn!("stream ended or disconnected");
                        break;
                    }
                    Ok(n) => {
                        let mut handlers = handlers.lock().unwrap();
                        for handler in handlers.iter_mut() {
                            let packet = &chunk[..n];
                            if let Err(panic) = std::panic::catch_unwind(
                                std::panic::AssertUnwindSafe(|| handler(packet)),
                            ) {
                                error!("packet handler panicked: {panic:?}");
                            }
                        }
                    }
                    Err(e) => {
                        if running.load(Ordering::SeqCst) {
                            error!("stream read failed: {e}");
                        }
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        }));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        if let Some(child) = self.child.lock().unwrap().as_mut() {
            if let Ok(Some(_)) = child.try_wait() {
                self.running.store(false, Ordering::SeqCst);
            }
        }
        self.running.load(Ordering::SeqCst)
    }

    /// Terminate the subprocess: SIGTERM, bounded wait, SIGKILL on timeout.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().unwrap().take() {
            terminate_child(&mut child, STOP_WAIT);
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        info!("stream puller for {} stopped", self.source);
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// SIGTERM then poll for `wait`, SIGKILL if the process is still alive.
pub fn terminate_child(child: &mut Child, wait: Duration) {
    #[cfg(unix)]
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
    let deadline = Instant::now() + wait;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(50));
            }
            _ => break,
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_transport_from_url() {
        assert_eq!(
            StreamKind::detect("rtsp://cam.example/stream1").unwrap(),
            StreamKind::Rtsp { transport: "tcp" }
        );
        assert_eq!(StreamKind::detect("http://host/live.m3u8").unwrap(), StreamKind::Hls);
        assert_eq!(StreamKind::detect("http://host/live.flv").unwrap(), StreamKind::HttpFlv);
        assert_eq!(StreamKind::detect("https://host/live").unwrap(), StreamKind::HttpFlv);
        assert!(StreamKind::detect("no-such-file.mp4").is_err());
    }

    #[test]
    fn detects_local_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let kind = StreamKind::detect(file.path().to_str().unwrap()).unwrap();
        assert_eq!(kind, StreamKind::File { looped: false });
    }

    #[test]
    fn rtsp_command_copies_codec() {
        let cmd = StreamKind::Rtsp { transport: "tcp" }.build_command("rtsp://cam/1");
        assert_eq!(cmd[0], "ffmpeg");
        assert!(cmd.windows(2).any(|w| w == ["-rtsp_transport", "tcp"]));
        assert!(cmd.windows(2).any(|w| w == ["-vcodec", "copy"]));
        assert_eq!(cmd.last().unwrap(), "pipe:1");
    }

    #[test]
    fn hevc_sources_keep_hevc_output() {
        let cmd = StreamKind::Rtsp { transport: "tcp" }.build_command("rtsp://cam/h265/main");
        assert!(cmd.windows(2).any(|w| w == ["-f", "hevc"]));
    }

    #[test]
    fn looped_file_command() {
        let cmd = StreamKind::File { looped: true }.build_command("/tmp/video.mp4");
        assert!(cmd.windows(2).any(|w| w == ["-stream_loop", "-1"]));
        assert!(cmd.iter().any(|a| a == "-re"));
    }
}
