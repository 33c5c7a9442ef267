//! Shared-memory video ring buffer.
//!
//! A fixed-capacity circular store of raw RGB frames living in a named
//! memory-mapped segment, addressable by any process that knows the name.
//! One writer (the decoder worker) and any number of readers (workflow
//! executors, recorders) attach to the same segment.
//!
//! Layout of the mapping:
//!
//! ```text
//! [ header 64 B | timestamps capacity x f64 | frames capacity x frame_size ]
//! ```
//!
//! Header fields sit at fixed 8-byte-aligned offsets, little-endian:
//! write_index (u64 @0), read_index (u64 @8), count (u64 @16),
//! lock_flag (u8 @24), last_write_time (f64 bits @32),
//! consecutive_errors (u64 @40). The lock byte is a cross-process spinlock;
//! every metadata update and frame copy happens inside it, so the critical
//! section is bounded by one frame memcpy.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use memmap2::MmapRaw;
use thiserror::Error;
use tracing::{debug, info, warn};

const HEADER_SIZE: usize = 64;
const OFF_WRITE_INDEX: usize = 0;
const OFF_READ_INDEX: usize = 8;
const OFF_COUNT: usize = 16;
const OFF_LOCK: usize = 24;
const OFF_LAST_WRITE: usize = 32;
const OFF_ERRORS: usize = 40;

/// Readers are considered healthy while the writer produced a frame within
/// this many seconds.
const HEALTHY_WRITE_AGE: f64 = 30.0;

#[derive(Debug, Error)]
pub enum RingBufferError {
    #[error("frame size {actual} does not match configured {expected} ({shape:?})")]
    ShapeMismatch {
        expected: usize,
        actual: usize,
        shape: FrameShape,
    },
    #[error("segment '{0}' does not exist")]
    NotFound(String),
    #[error("segment '{name}' is {actual} bytes, expected {expected}")]
    GeometryMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid buffer name '{0}'")]
    InvalidName(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RingBufferError>;

/// Decoded frame geometry. Channels are always 3 (RGB).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl FrameShape {
    pub fn rgb(height: u32, width: u32) -> Self {
        FrameShape { height, width, channels: 3 }
    }

    pub fn frame_size(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BufferStats {
    pub capacity: u64,
    pub count: u64,
    pub write_index: u64,
    pub read_index: u64,
    pub last_write_time: f64,
    pub consecutive_errors: u64,
}

impl BufferStats {
    pub fn is_full(&self) -> bool {
        self.count >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HealthStatus {
    pub last_write_time: f64,
    pub time_since_last_frame: f64,
    pub consecutive_errors: u64,
    pub frame_count: u64,
    pub is_healthy: bool,
}

/// Where named segments live. `/dev/shm` keeps the mapping memory-backed on
/// Linux; elsewhere the temp dir still gives every process the same path.
fn segment_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

fn segment_path(name: &str) -> Result<PathBuf> {
    if name.is_empty()
        || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
    {
        return Err(RingBufferError::InvalidName(name.to_string()));
    }
    Ok(segment_dir().join(name))
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs_f64()
}

#[derive(Debug)]
pub struct VideoRingBuffer {
    name: String,
    path: PathBuf,
    shape: FrameShape,
    fps: u32,
    capacity: u64,
    frame_size: usize,
    map: MmapRaw,
    _file: File,
    owner: bool,
}

// The mapping is only ever touched under the in-segment lock.
unsafe impl Send for VideoRingBuffer {}
unsafe impl Sync for VideoRingBuffer {}

impl VideoRingBuffer {
    /// Create a fresh segment, unlinking any prior one with the same name.
    /// The creator owns the segment and is the only party allowed to unlink.
    pub fn create(name: &str, shape: FrameShape, fps: u32, duration_seconds: u32) -> Result<Self> {
        let path = segment_path(name)?;
        if path.exists() {
            warn!("segment {} already exists, unlinking stale file", path.display());
            std::fs::remove_file(&path)?;
        }

        let capacity = (fps as u64 * duration_seconds as u64).max(1);
        let frame_size = shape.frame_size();
        let total = HEADER_SIZE + capacity as usize * 8 + capacity as usize * frame_size;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(total as u64)?;
        let map = MmapRaw::map_raw(&file)?;

        let buffer = VideoRingBuffer {
            name: name.to_string(),
            path,
            shape,
            fps,
            capacity,
            frame_size,
            map,
            _file: file,
            owner: true,
        };
        // Fresh file reads back as zeroes, but make the initial state explicit.
        {
            let _guard = buffer.lock();
            buffer.store_u64(OFF_WRITE_INDEX, 0);
            buffer.store_u64(OFF_READ_INDEX, 0);
            buffer.store_u64(OFF_COUNT, 0);
            buffer.store_f64(OFF_LAST_WRITE, 0.0);
            buffer.store_u64(OFF_ERRORS, 0);
        }
        info!(
            "created ring buffer '{}': capacity={} frames, frame={}x{}x{}, {} MiB",
            name,
            capacity,
            shape.width,
            shape.height,
            shape.channels,
            total / (1024 * 1024)
        );
        Ok(buffer)
    }

    /// Attach to a segment created by another process. Readers never unlink.
    pub fn attach(name: &str, shape: FrameShape, fps: u32, duration_seconds: u32) -> Result<Self> {
        let path = segment_path(name)?;
        if !path.exists() {
            return Err(RingBufferError::NotFound(name.to_string()));
        }

        let capacity = (fps as u64 * duration_seconds as u64).max(1);
        let frame_size = shape.frame_size();
        let expected = HEADER_SIZE + capacity as usize * 8 + capacity as usize * frame_size;

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let actual = file.metadata()?.len() as usize;
        if actual != expected {
            return Err(RingBufferError::GeometryMismatch {
                name: name.to_string(),
                expected,
                actual,
            });
        }
        let map = MmapRaw::map_raw(&file)?;
        debug!("attached to ring buffer '{}' ({} frames)", name, capacity);
        Ok(VideoRingBuffer {
            name: name.to_string(),
            path,
            shape,
            fps,
            capacity,
            frame_size,
            map,
            _file: file,
            owner: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Write one frame, overwriting the oldest slot when full. `timestamp`
    /// defaults to now. Nothing is committed on shape mismatch.
    pub fn write(&self, pixels: &[u8], timestamp: Option<f64>) -> Result<()> {
        if pixels.len() != self.frame_size {
            return Err(RingBufferError::ShapeMismatch {
                expected: self.frame_size,
                actual: pixels.len(),
                shape: self.shape,
            });
        }
        let timestamp = timestamp.unwrap_or_else(now_secs);

        let _guard = self.lock();
        let write_idx = self.load_u64(OFF_WRITE_INDEX);
        let mut read_idx = self.load_u64(OFF_READ_INDEX);
        let mut count = self.load_u64(OFF_COUNT);

        // FIFO overflow: drop the oldest retained frame.
        if count >= self.capacity {
            read_idx = (read_idx + 1) % self.capacity;
            count = self.capacity - 1;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                pixels.as_ptr(),
                self.frame_ptr(write_idx),
                self.frame_size,
            );
        }
        self.store_timestamp(write_idx, timestamp);

        self.store_u64(OFF_WRITE_INDEX, (write_idx + 1) % self.capacity);
        self.store_u64(OFF_READ_INDEX, read_idx);
        self.store_u64(OFF_COUNT, count + 1);
        self.store_f64(OFF_LAST_WRITE, timestamp);
        self.store_u64(OFF_ERRORS, 0);
        Ok(())
    }

    /// Non-consuming read. `offset == -1` is the most recently written frame,
    /// `offset == 0` the oldest retained one; intermediate negatives count
    /// back from the write head. Returns a copy, never a view.
    pub fn peek(&self, offset: i64) -> Option<Vec<u8>> {
        self.peek_with_timestamp(offset).map(|(frame, _)| frame)
    }

    pub fn peek_with_timestamp(&self, offset: i64) -> Option<(Vec<u8>, f64)> {
        let _guard = self.lock();
        let write_idx = self.load_u64(OFF_WRITE_INDEX);
        let read_idx = self.load_u64(OFF_READ_INDEX);
        let count = self.load_u64(OFF_COUNT);

        // Offsets count from opposite ends: -1 is the newest retained frame
        // and 0 the oldest, so -count is still in range while +count is not.
        let n = offset.unsigned_abs();
        let out_of_bounds = if offset < 0 { n > count } else { n >= count };
        if count == 0 || out_of_bounds {
            return None;
        }

        let slot = if offset < 0 {
            (write_idx + self.capacity - (offset.unsigned_abs() % self.capacity)) % self.capacity
        } else {
            (read_idx + offset as u64) % self.capacity
        };

        let frame = self.copy_frame(slot);
        let timestamp = self.load_timestamp(slot);
        Some((frame, timestamp))
    }

    /// Retained frames whose timestamp falls in `[start, end]`, oldest first.
    pub fn get_frames_in_time_range(&self, start: f64, end: f64) -> Vec<(Vec<u8>, f64)> {
        let _guard = self.lock();
        let read_idx = self.load_u64(OFF_READ_INDEX);
        let count = self.load_u64(OFF_COUNT);

        let mut frames = Vec::new();
        for i in 0..count {
            let slot = (read_idx + i) % self.capacity;
            let timestamp = self.load_timestamp(slot);
            if timestamp >= start && timestamp <= end {
                frames.push((self.copy_frame(slot), timestamp));
            }
        }
        frames
    }

    /// Frames newer than `latest_timestamp - seconds`, oldest first.
    pub fn get_recent_frames(&self, seconds: f64) -> Vec<(Vec<u8>, f64)> {
        let _guard = self.lock();
        let write_idx = self.load_u64(OFF_WRITE_INDEX);
        let read_idx = self.load_u64(OFF_READ_INDEX);
        let count = self.load_u64(OFF_COUNT);
        if count == 0 {
            return Vec::new();
        }

        let latest_slot = (write_idx + self.capacity - 1) % self.capacity;
        let cutoff = self.load_timestamp(latest_slot) - seconds;

        let mut frames = Vec::new();
        for i in 0..count {
            let slot = (read_idx + i) % self.capacity;
            let timestamp = self.load_timestamp(slot);
            if timestamp >= cutoff {
                frames.push((self.copy_frame(slot), timestamp));
            }
        }
        frames
    }

    pub fn stats(&self) -> BufferStats {
        let _guard = self.lock();
        BufferStats {
            capacity: self.capacity,
            count: self.load_u64(OFF_COUNT),
            write_index: self.load_u64(OFF_WRITE_INDEX),
            read_index: self.load_u64(OFF_READ_INDEX),
            last_write_time: self.load_f64(OFF_LAST_WRITE),
            consecutive_errors: self.load_u64(OFF_ERRORS),
        }
    }

    /// An empty buffer counts as healthy: the writer may not have started yet.
    pub fn health(&self) -> HealthStatus {
        let stats = self.stats();
        let time_since_last_frame = if stats.last_write_time == 0.0 {
            0.0
        } else {
            now_secs() - stats.last_write_time
        };
        let is_healthy = stats.count == 0 || time_since_last_frame < HEALTHY_WRITE_AGE;
        HealthStatus {
            last_write_time: stats.last_write_time,
            time_since_last_frame,
            consecutive_errors: stats.consecutive_errors,
            frame_count: stats.count,
            is_healthy,
        }
    }

    /// Touch the health clock without committing a frame.
    pub fn update_last_write_time(&self, timestamp: Option<f64>) {
        let timestamp = timestamp.unwrap_or_else(now_secs);
        let _guard = self.lock();
        self.store_f64(OFF_LAST_WRITE, timestamp);
    }

    pub fn increment_error_count(&self) -> u64 {
        let _guard = self.lock();
        let errors = self.load_u64(OFF_ERRORS) + 1;
        self.store_u64(OFF_ERRORS, errors);
        errors
    }

    pub fn reset_error_count(&self) {
        let _guard = self.lock();
        self.store_u64(OFF_ERRORS, 0);
    }

    pub fn clear(&self) {
        let _guard = self.lock();
        self.store_u64(OFF_WRITE_INDEX, 0);
        self.store_u64(OFF_READ_INDEX, 0);
        self.store_u64(OFF_COUNT, 0);
        self.store_f64(OFF_LAST_WRITE, 0.0);
        self.store_u64(OFF_ERRORS, 0);
    }

    /// Remove the backing segment. Only the creator may unlink; readers just
    /// drop their mapping.
    pub fn unlink(&self) -> io::Result<()> {
        if !self.owner {
            warn!("refusing to unlink '{}' from a non-owning handle", self.name);
            return Ok(());
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ---- raw segment access, all callers hold the lock ----

    fn base(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    fn lock(&self) -> LockGuard<'_> {
        let flag = unsafe { &*(self.base().add(OFF_LOCK) as *const AtomicU8) };
        let mut spins = 0u32;
        loop {
            if flag
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return LockGuard { flag };
            }
            spins += 1;
            if spins < 1000 {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
    }

    fn load_u64(&self, offset: usize) -> u64 {
        unsafe { u64::from_le((self.base().add(offset) as *const u64).read_volatile()) }
    }

    fn store_u64(&self, offset: usize, value: u64) {
        unsafe { (self.base().add(offset) as *mut u64).write_volatile(value.to_le()) }
    }

    fn load_f64(&self, offset: usize) -> f64 {
        f64::from_bits(self.load_u64(offset))
    }

    fn store_f64(&self, offset: usize, value: f64) {
        self.store_u64(offset, value.to_bits());
    }

    fn timestamp_offset(&self, slot: u64) -> usize {
        HEADER_SIZE + (slot % self.capacity) as usize * 8
    }

    fn load_timestamp(&self, slot: u64) -> f64 {
        self.load_f64(self.timestamp_offset(slot))
    }

    fn store_timestamp(&self, slot: u64, timestamp: f64) {
        self.store_f64(self.timestamp_offset(slot), timestamp);
    }

    fn frame_ptr(&self, slot: u64) -> *mut u8 {
        let offset =
            HEADER_SIZE + self.capacity as usize * 8 + (slot % self.capacity) as usize * self.frame_size;
        unsafe { self.base().add(offset) }
    }

    fn copy_frame(&self, slot: u64) -> Vec<u8> {
        let mut frame = vec![0u8; self.frame_size];
        unsafe {
            std::ptr::copy_nonoverlapping(self.frame_ptr(slot), frame.as_mut_ptr(), self.frame_size);
        }
        frame
    }
}

struct LockGuard<'a> {
    flag: &'a AtomicU8,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn unique_name(tag: &str) -> String {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        format!(
            "ringbuffer_test_{}_{}_{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn filled_frame(shape: FrameShape, value: u8) -> Vec<u8> {
        vec![value; shape.frame_size()]
    }

    struct Cleanup(VideoRingBuffer);
    impl Drop for Cleanup {
        fn drop(&mut self) {
            let _ = self.0.unlink();
        }
    }

    #[test]
    fn write_then_peek_round_trip() {
        let shape = FrameShape::rgb(4, 6);
        let buffer = Cleanup(VideoRingBuffer::create(&unique_name("roundtrip"), shape, 5, 2).unwrap());
        let frame = filled_frame(shape, 0xAB);

        buffer.0.write(&frame, Some(123.456)).unwrap();
        let (got, ts) = buffer.0.peek_with_timestamp(-1).unwrap();
        assert_eq!(got, frame);
        assert_eq!(ts, 123.456);
    }

    #[test]
    fn overflow_keeps_newest_and_saturates_count() {
        let shape = FrameShape::rgb(2, 2);
        // capacity = 2 * 3 = 6
        let buffer = Cleanup(VideoRingBuffer::create(&unique_name("overflow"), shape, 2, 3).unwrap());
        let capacity = buffer.0.capacity();
        let total = capacity + 4;

        for i in 0..total {
            buffer.0.write(&filled_frame(shape, i as u8), Some(i as f64)).unwrap();
            let stats = buffer.0.stats();
            assert_eq!(stats.count, (i + 1).min(capacity));
        }

        // Oldest retained timestamp is the (total - capacity)-th write.
        let (oldest, oldest_ts) = buffer.0.peek_with_timestamp(0).unwrap();
        assert_eq!(oldest_ts, (total - capacity) as f64);
        assert_eq!(oldest[0], (total - capacity) as u8);

        let (newest, newest_ts) = buffer.0.peek_with_timestamp(-1).unwrap();
        assert_eq!(newest_ts, (total - 1) as f64);
        assert_eq!(newest[0], (total - 1) as u8);
    }

    #[test]
    fn peek_out_of_range_is_none() {
        let shape = FrameShape::rgb(2, 2);
        let buffer = Cleanup(VideoRingBuffer::create(&unique_name("range"), shape, 2, 2).unwrap());
        assert!(buffer.0.peek(-1).is_none());
        buffer.0.write(&filled_frame(shape, 1), Some(1.0)).unwrap();
        assert!(buffer.0.peek(0).is_some());
        assert!(buffer.0.peek(1).is_none());
        assert!(buffer.0.peek(-2).is_none());
    }

    #[test]
    fn shape_mismatch_commits_nothing() {
        let shape = FrameShape::rgb(4, 4);
        let buffer = Cleanup(VideoRingBuffer::create(&unique_name("shape"), shape, 2, 2).unwrap());

        let err = buffer.0.write(&[0u8; 7], Some(1.0)).unwrap_err();
        assert!(matches!(err, RingBufferError::ShapeMismatch { .. }));
        let stats = buffer.0.stats();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.write_index, 0);
        assert_eq!(stats.last_write_time, 0.0);
    }

    #[test]
    fn time_range_is_sorted_and_bounded() {
        let shape = FrameShape::rgb(2, 2);
        let buffer = Cleanup(VideoRingBuffer::create(&unique_name("timerange"), shape, 5, 2).unwrap());
        for i in 0..8u64 {
            buffer.0.write(&filled_frame(shape, i as u8), Some(10.0 + i as f64)).unwrap();
        }

        let frames = buffer.0.get_frames_in_time_range(12.0, 15.0);
        let stamps: Vec<f64> = frames.iter().map(|(_, ts)| *ts).collect();
        assert_eq!(stamps, vec![12.0, 13.0, 14.0, 15.0]);

        let recent = buffer.0.get_recent_frames(3.0);
        let stamps: Vec<f64> = recent.iter().map(|(_, ts)| *ts).collect();
        assert_eq!(stamps, vec![14.0, 15.0, 16.0, 17.0]);
    }

    #[test]
    fn attach_sees_writer_frames() {
        let shape = FrameShape::rgb(3, 3);
        let name = unique_name("attach");
        let writer = Cleanup(VideoRingBuffer::create(&name, shape, 4, 2).unwrap());
        writer.0.write(&filled_frame(shape, 9), Some(42.0)).unwrap();

        let reader = VideoRingBuffer::attach(&name, shape, 4, 2).unwrap();
        assert!(!reader.is_owner());
        let (frame, ts) = reader.peek_with_timestamp(-1).unwrap();
        assert_eq!(ts, 42.0);
        assert_eq!(frame[0], 9);

        // Non-owner unlink is a no-op; the writer can still read.
        reader.unlink().unwrap();
        assert!(writer.0.peek(-1).is_some());
    }

    #[test]
    fn attach_rejects_wrong_geometry() {
        let shape = FrameShape::rgb(3, 3);
        let name = unique_name("geometry");
        let _writer = Cleanup(VideoRingBuffer::create(&name, shape, 4, 2).unwrap());
        let err = VideoRingBuffer::attach(&name, FrameShape::rgb(6, 6), 4, 2).unwrap_err();
        assert!(matches!(err, RingBufferError::GeometryMismatch { .. }));
    }

    #[test]
    fn health_tracks_write_recency_and_errors() {
        let shape = FrameShape::rgb(2, 2);
        let buffer = Cleanup(VideoRingBuffer::create(&unique_name("health"), shape, 2, 2).unwrap());

        // Uninitialized buffers are healthy by definition.
        assert!(buffer.0.health().is_healthy);

        buffer.0.write(&filled_frame(shape, 1), None).unwrap();
        let health = buffer.0.health();
        assert!(health.is_healthy);
        assert!(health.time_since_last_frame < 1.0);

        buffer.0.increment_error_count();
        buffer.0.increment_error_count();
        assert_eq!(buffer.0.stats().consecutive_errors, 2);
        buffer.0.write(&filled_frame(shape, 2), None).unwrap();
        assert_eq!(buffer.0.stats().consecutive_errors, 0);
    }
}
