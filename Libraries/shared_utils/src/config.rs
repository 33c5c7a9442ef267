//! Environment-backed runtime settings. Every knob has a default so the
//! pipeline runs with an empty environment.

use std::env;
use std::path::PathBuf;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub db_path: PathBuf,
    pub frames_root: PathBuf,
    pub videos_root: PathBuf,
    /// Seconds of video retained per source ring buffer.
    pub ringbuffer_duration: u32,
    pub recording: RecordingSettings,
    pub broker: BrokerSettings,
    pub health: HealthThresholds,
    /// Default cooldown applied when an alert node enables suppression
    /// without its own duration.
    pub alert_suppression_duration: f64,
}

#[derive(Clone, Debug)]
pub struct RecordingSettings {
    pub enabled: bool,
    pub pre_alert_duration: f64,
    pub post_alert_duration: f64,
    pub fps: u32,
}

#[derive(Clone, Debug)]
pub struct BrokerSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub password: String,
    pub exchange: String,
    /// "topic" or "direct".
    pub exchange_type: String,
    pub queue: String,
    pub routing_key: String,
    pub topic_pattern: String,
}

#[derive(Clone, Debug)]
pub struct HealthThresholds {
    pub no_frame_warning: f64,
    pub no_frame_critical: f64,
    pub low_fps_ratio: f64,
    pub max_consecutive_errors: u64,
}

impl Settings {
    pub fn from_env() -> Self {
        Settings {
            db_path: env_path("DB_PATH", "data/db/ba.db"),
            frames_root: env_path("FRAME_SAVE_PATH", "data/frames"),
            videos_root: env_path("VIDEO_SAVE_PATH", "data/videos"),
            ringbuffer_duration: env_or("RINGBUFFER_DURATION", 30u32),
            recording: RecordingSettings {
                enabled: env_bool("RECORDING_ENABLED", true),
                pre_alert_duration: env_or("PRE_ALERT_DURATION", 5.0f64),
                post_alert_duration: env_or("POST_ALERT_DURATION", 5.0f64),
                fps: env_or("RECORDING_FPS", 10u32),
            },
            broker: BrokerSettings {
                enabled: env_bool("RABBITMQ_ENABLED", false),
                host: env_or("RABBITMQ_HOST", "127.0.0.1".to_string()),
                port: env_or("RABBITMQ_PORT", 5672u16),
                vhost: env_or("RABBITMQ_VHOST", "/".to_string()),
                user: env_or("RABBITMQ_USER", "guest".to_string()),
                password: env_or("RABBITMQ_PASSWORD", "guest".to_string()),
                exchange: env_or("RABBITMQ_ALERT_EXCHANGE", "video.alerts".to_string()),
                exchange_type: env_or("RABBITMQ_EXCHANGE_TYPE", "topic".to_string()),
                queue: env_or("RABBITMQ_ALERT_QUEUE", "video.alert.queue".to_string()),
                routing_key: env_or("RABBITMQ_ALERT_ROUTING_KEY", "video.alert".to_string()),
                topic_pattern: env_or("RABBITMQ_ALERT_TOPIC_PATTERN", "video.alert.*".to_string()),
            },
            health: HealthThresholds {
                no_frame_warning: env_or("NO_FRAME_WARNING_THRESHOLD", 10.0f64),
                no_frame_critical: env_or("NO_FRAME_CRITICAL_THRESHOLD", 30.0f64),
                low_fps_ratio: env_or("LOW_FPS_RATIO", 0.5f64),
                max_consecutive_errors: env_or("MAX_CONSECUTIVE_ERRORS", 10u64),
            },
            alert_suppression_duration: env_or("ALERT_SUPPRESSION_DURATION", 60.0f64),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let settings = Settings::from_env();
        assert_eq!(settings.ringbuffer_duration, 30);
        assert_eq!(settings.recording.fps, 10);
        assert_eq!(settings.broker.port, 5672);
        assert_eq!(settings.broker.exchange_type, "topic");
        assert!(settings.health.no_frame_critical > settings.health.no_frame_warning);
    }
}
