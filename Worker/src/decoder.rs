//! Asynchronous ffmpeg decoder. Packets go in over stdin from a writer
//! thread, raw rgb24 frames come out of stdout on a reader thread, and land
//! on a bounded queue that drops the oldest frame on overflow. The
//! subprocess isolates decoder crashes from the worker and lets the engine
//! be swapped per codec without rebuilding the host.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, warn};

const PACKET_QUEUE: usize = 64;
const FRAME_QUEUE: usize = 30;

/// One decoded frame: tightly packed rgb24 pixels.
pub struct RawFrame {
    pub pixels: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct DecoderStats {
    pub frames_decoded: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub bytes_processed: AtomicU64,
}

pub struct FrameDecoder {
    width: u32,
    height: u32,
    child: Option<Child>,
    packet_tx: Option<Sender<Vec<u8>>>,
    frame_rx: Receiver<RawFrame>,
    running: Arc<AtomicBool>,
    /// Set when the stdin writer hits a broken pipe; the worker treats this
    /// as fatal and exits for a supervised restart.
    pipe_failed: Arc<AtomicBool>,
    pub stats: Arc<DecoderStats>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

fn build_decode_command(input_format: &str, width: u32, height: u32) -> Vec<String> {
    vec![
        "ffmpeg".into(),
        "-f".into(),
        input_format.into(),
        "-i".into(),
        "pipe:0".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-s".into(),
        format!("{width}x{height}"),
        "pipe:1".into(),
    ]
}

impl FrameDecoder {
    pub fn spawn(input_format: &str, width: u32, height: u32) -> Result<FrameDecoder> {
        let argv = build_decode_command(input_format, width, height);
        info!("starting decoder: {}", argv.join(" "));

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn ffmpeg decoder")?;

        let mut stdin = child.stdin.take().context("decoder stdin missing")?;
        let mut stdout = child.stdout.take().context("decoder stdout missing")?;
        let stderr = child.stderr.take().context("decoder stderr missing")?;

        let running = Arc::new(AtomicBool::new(true));
        let pipe_failed = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(DecoderStats::default());

        let (packet_tx, packet_rx) = bounded::<Vec<u8>>(PACKET_QUEUE);
        let (frame_tx, frame_rx) = bounded::<RawFrame>(FRAME_QUEUE);

        {
            let running = Arc::clone(&running);
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    if !line.trim().is_empty() && !line.contains("frame=") {
                        debug!("[decoder stderr] {line}");
                    }
                }
            });
        }

        let writer = {
            let running = Arc::clone(&running);
            let pipe_failed = Arc::clone(&pipe_failed);
            let stats = Arc::clone(&stats);
            thread::spawn(move || {
                // Timeout instead of a plain recv: packet-sink clones may
                // outlive close(), and the writer must still exit promptly.
                loop {
                    match packet_rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(packet) => {
                            if !running.load(Ordering::SeqCst) {
                                break;
                            }
                            if let Err(e) = stdin.write_all(&packet).and_then(|_| stdin.flush()) {
                                error!("decoder stdin write failed: {e}");
                                pipe_failed.store(true, Ordering::SeqCst);
                                running.store(false, Ordering::SeqCst);
                                break;
                            }
                            stats.bytes_processed.fetch_add(packet.len() as u64, Ordering::Relaxed);
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if !running.load(Ordering::SeqCst) {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                // Dropping stdin signals EOF so ffmpeg can flush and exit.
            })
        };

        let reader = {
            let running = Arc::clone(&running);
            let stats = Arc::clone(&stats);
            let queue = frame_rx.clone();
            let frame_size = (width * height * 3) as usize;
            thread::spawn(move || {
                loop {
                    let mut pixels = vec![0u8; frame_size];
                    match stdout.read_exact(&mut pixels) {
                        Ok(()) => {
                            let mut frame = RawFrame { pixels };
                            loop {
                                match frame_tx.try_send(frame) {
                                    Ok(()) => {
                                        stats.frames_decoded.fetch_add(1, Ordering::Relaxed);
                                        break;
                                    }
                                    Err(TrySendError::Full(back)) => {
                                        // Evict the oldest queued frame, keep the new one.
                                        if queue.try_recv().is_ok() {
                                            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                                        }
                                        frame = back;
                                    }
                                    Err(TrySendError::Disconnected(_)) => return,
                                }
                            }
                        }
                        Err(e) => {
                            if running.load(Ordering::SeqCst) {
                                warn!("decoder output ended: {e}");
                            }
                            break;
                        }
                    }
                }
                running.store(false, Ordering::SeqCst);
            })
        };

        Ok(FrameDecoder {
            width,
            height,
            child: Some(child),
            packet_tx: Some(packet_tx),
            frame_rx,
            running,
            pipe_failed,
            stats,
            writer: Some(writer),
            reader: Some(reader),
        })
    }

    pub fn frame_size(&self) -> usize {
        (self.width * self.height * 3) as usize
    }

    /// Non-blocking packet enqueue. A full queue drops the packet (counted);
    /// stalling the puller would back the transport up instead.
    pub fn send_packet(&self, packet: &[u8]) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = &self.packet_tx {
            if let Err(TrySendError::Full(_)) = tx.try_send(packet.to_vec()) {
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Detached handle for feeding packets from another thread, typically
    /// registered as a streamer packet handler.
    pub fn packet_sink(&self) -> PacketSink {
        PacketSink {
            tx: self.packet_tx.clone(),
            running: Arc::clone(&self.running),
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn get_frame(&self, timeout: Duration) -> Option<RawFrame> {
        match self.frame_rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drain the queue and return only the newest decoded frame.
    pub fn get_latest_frame(&self, timeout: Duration) -> Option<RawFrame> {
        let mut latest = self.get_frame(timeout)?;
        while let Ok(frame) = self.frame_rx.try_recv() {
            latest = frame;
        }
        Some(latest)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pipe_failed(&self) -> bool {
        self.pipe_failed.load(Ordering::SeqCst)
    }

    /// Shut down writer first, then the subprocess, then join the reader.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.packet_tx.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        if let Some(mut child) = self.child.take() {
            crate::streamer::terminate_child(&mut child, Duration::from_secs(2));
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        info!(
            "decoder closed: {} decoded, {} dropped, {} packets dropped, {:.2} MiB in",
            self.stats.frames_decoded.load(Ordering::Relaxed),
            self.stats.frames_dropped.load(Ordering::Relaxed),
            self.stats.packets_dropped.load(Ordering::Relaxed),
            self.stats.bytes_processed.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0),
        );
    }
}

impl Drop for FrameDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Clone)]
pub struct PacketSink {
    tx: Option<Sender<Vec<u8>>>,
    running: Arc<AtomicBool>,
    stats: Arc<DecoderStats>,
}

impl PacketSink {
    pub fn send(&self, packet: &[u8]) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = &self.tx {
            if let Err(TrySendError::Full(_)) = tx.try_send(packet.to_vec()) {
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_command_shape() {
        let cmd = build_decode_command("h264", 1280, 720);
        assert_eq!(cmd[0], "ffmpeg");
        assert!(cmd.windows(2).any(|w| w == ["-f", "h264"]));
        assert!(cmd.windows(2).any(|w| w == ["-pix_fmt", "rgb24"]));
        assert!(cmd.windows(2).any(|w| w == ["-s", "1280x720"]));
        assert_eq!(cmd.last().unwrap(), "pipe:1");
    }
}
