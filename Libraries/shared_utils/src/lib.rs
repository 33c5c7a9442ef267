pub mod config;
pub mod types;

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch as a float, the timestamp unit used by the
/// ring buffer, the alert window and the recorder.
pub fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs_f64()
}

/// Compact local timestamp used in evidence file names (frame_YYYYmmdd_HHMMSS.jpg).
pub fn compact_timestamp(epoch: f64) -> String {
    use chrono::{Local, TimeZone};
    let secs = epoch.floor() as i64;
    match Local.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y%m%d_%H%M%S").to_string(),
        _ => format!("{secs}"),
    }
}

/// Human-readable local timestamp used in alert rows and detection records.
pub fn display_timestamp(epoch: f64) -> String {
    use chrono::{Local, TimeZone};
    let secs = epoch.floor() as i64;
    match Local.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => format!("{secs}"),
    }
}
