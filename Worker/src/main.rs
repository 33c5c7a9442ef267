//! Per-source decoder worker. Pulls a transport stream, decodes it to raw
//! RGB frames through an ffmpeg subprocess pair, and writes sampled frames
//! into the source's shared-memory ring buffer. A broken decode pipe makes
//! the process exit non-zero so the orchestrator restarts it.

mod decoder;
mod streamer;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use ringbuffer::{FrameShape, VideoRingBuffer};
use shared_utils::config::Settings;
use tracing::{error, info, warn, level_filters::LevelFilter};

use decoder::FrameDecoder;
use streamer::{StreamKind, Streamer};

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum SampleMode {
    /// One frame per 1/sample-fps seconds of wall time.
    Fps,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "decoder_worker")]
struct Args {
    /// Stream source (rtsp://, http(s)://, .m3u8, .flv or a local file)
    #[arg(long)]
    url: String,
    /// Video source id, used for logging and default buffer naming
    #[arg(long)]
    source_id: i64,
    #[arg(long, value_enum, default_value = "fps")]
    sample_mode: SampleMode,
    /// Target write rate into the ring buffer
    #[arg(long, default_value_t = 10)]
    sample_fps: u32,
    #[arg(long, default_value_t = 1920)]
    width: u32,
    #[arg(long, default_value_t = 1080)]
    height: u32,
    /// Shared-memory segment name (created by the orchestrator)
    #[arg(long)]
    buffer: Option<String>,
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(args.log_level))
        .init();

    match run(&args) {
        Ok(clean) => {
            if clean {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("decoder worker failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns Ok(true) on clean end-of-stream, Ok(false) on supervised-restart
/// conditions (decoder pipe failure, error threshold).
fn run(args: &Args) -> Result<bool> {
    let settings = Settings::from_env();
    let buffer_name = args
        .buffer
        .clone()
        .unwrap_or_else(|| format!("source_{}", args.source_id));

    info!(
        "[decoder_worker:{}] source {} -> buffer '{}' @{}fps",
        std::process::id(),
        args.url,
        buffer_name,
        args.sample_fps
    );

    // The orchestrator owns the segment; this process only attaches.
    let shape = FrameShape::rgb(args.height, args.width);
    let buffer = Arc::new(
        VideoRingBuffer::attach(&buffer_name, shape, args.sample_fps, settings.ringbuffer_duration)
            .with_context(|| format!("ring buffer '{buffer_name}' not available"))?,
    );

    let input_format = StreamKind::output_format(&args.url);
    let mut decoder =
        FrameDecoder::spawn(input_format, args.width, args.height).context("decoder start failed")?;

    let mut streamer = Streamer::new(&args.url, None)?;
    let sink = decoder.packet_sink();
    streamer.add_packet_handler(Box::new(move |packet| sink.send(packet)));
    streamer.start()?;

    let SampleMode::Fps = args.sample_mode;
    let sample_interval = Duration::from_secs_f64(1.0 / args.sample_fps.max(1) as f64);
    let mut last_written: Option<Instant> = None;
    let mut idle_misses: u64 = 0;
    let clean;

    loop {
        if decoder.pipe_failed() {
            error!("decoder pipe failed, exiting for restart");
            clean = false;
            break;
        }

        match decoder.get_latest_frame(Duration::from_millis(500)) {
            Some(frame) => {
                idle_misses = 0;
                let due = last_written
                    .map(|at| at.elapsed() >= sample_interval)
                    .unwrap_or(true);
                if !due {
                    continue;
                }
                match buffer.write(&frame.pixels, None) {
                    Ok(()) => last_written = Some(Instant::now()),
                    Err(e) => {
                        warn!("frame write rejected: {e}");
                        buffer.increment_error_count();
                    }
                }
            }
            None => {
                if !streamer.is_running() && !decoder.is_running() {
                    info!("stream ended, shutting down cleanly");
                    clean = true;
                    break;
                }
                idle_misses += 1;
                if idle_misses % 4 == 0 {
                    let errors = buffer.increment_error_count();
                    if errors >= settings.health.max_consecutive_errors {
                        error!("no frames for {errors} consecutive checks, giving up");
                        clean = false;
                        break;
                    }
                }
            }
        }
    }

    streamer.stop();
    decoder.close();
    // Non-owner: detach only, never unlink the segment.
    Ok(clean)
}
