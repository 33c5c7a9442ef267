//! Sliding-window detection aggregation and alert suppression, keyed by
//! `(source_id, node_id)`. Records live in a bounded ring; stats are cached
//! briefly because several checks per frame hit the same window.

use circular_buffer::CircularBuffer;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::types::{SuppressionConfig, TriggerCondition, WindowMode};

/// Hard cap on retained records per (source, node) key.
const MAX_RECORDS: usize = 3000;
const STATS_CACHE_TTL: f64 = 0.5;
const CLEANUP_INTERVAL: f64 = 60.0;

#[derive(Clone, Debug)]
pub struct WindowRecord {
    pub timestamp: f64,
    pub detected: bool,
    pub image_path: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct WindowStats {
    pub total_count: usize,
    pub detection_count: usize,
    pub detection_ratio: f64,
    pub max_consecutive: usize,
    pub window_start: f64,
    pub window_end: f64,
    pub window_size: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SuppressionInfo {
    pub last_trigger: f64,
    pub cooldown_remaining: f64,
}

struct WindowEntry {
    records: Box<CircularBuffer<MAX_RECORDS, WindowRecord>>,
    trigger: Option<TriggerCondition>,
    suppression: Option<SuppressionConfig>,
    stats_cache: Option<(f64, WindowStats)>,
    last_trigger: Option<f64>,
}

impl WindowEntry {
    fn new() -> Self {
        WindowEntry {
            records: CircularBuffer::boxed(),
            trigger: None,
            suppression: None,
            stats_cache: None,
            last_trigger: None,
        }
    }
}

pub struct AlertWindow {
    entries: DashMap<(i64, String), WindowEntry>,
    default_cooldown: f64,
    last_cleanup: std::sync::Mutex<f64>,
}

impl AlertWindow {
    pub fn new(default_cooldown: f64) -> Self {
        AlertWindow {
            entries: DashMap::new(),
            default_cooldown,
            last_cleanup: std::sync::Mutex::new(0.0),
        }
    }

    /// (Re)load the trigger/suppression config for a key. Called by the
    /// alert node on every execution, so config edits take effect live.
    pub fn configure(
        &self,
        source_id: i64,
        node_id: &str,
        trigger: Option<TriggerCondition>,
        suppression: Option<SuppressionConfig>,
    ) {
        let mut entry = self
            .entries
            .entry((source_id, node_id.to_string()))
            .or_insert_with(WindowEntry::new);
        entry.trigger = trigger;
        entry.suppression = suppression;
    }

    pub fn add_record(
        &self,
        source_id: i64,
        node_id: &str,
        timestamp: f64,
        detected: bool,
        image_path: Option<String>,
    ) {
        let mut entry = self
            .entries
            .entry((source_id, node_id.to_string()))
            .or_insert_with(WindowEntry::new);
        entry.records.push_back(WindowRecord { timestamp, detected, image_path });
        entry.stats_cache = None;
        drop(entry);
        self.maybe_cleanup(timestamp);
    }

    /// Evaluate the windowed trigger condition. Disabled or missing config
    /// passes unconditionally with no stats.
    pub fn check_condition(
        &self,
        source_id: i64,
        node_id: &str,
        now: f64,
    ) -> (bool, Option<WindowStats>) {
        let mut entry = match self.entries.get_mut(&(source_id, node_id.to_string())) {
            Some(entry) => entry,
            None => return (true, None),
        };
        let Some(trigger) = entry.trigger.clone() else {
            return (true, None);
        };
        if !trigger.enable {
            return (true, None);
        }

        let stats = Self::window_stats(&mut entry, now, &trigger);
        let passed = match trigger.mode {
            WindowMode::Count => stats.detection_count as f64 >= trigger.threshold,
            WindowMode::Ratio => stats.detection_ratio >= trigger.threshold,
            WindowMode::Consecutive => stats.max_consecutive as f64 >= trigger.threshold,
        };
        (passed, Some(stats))
    }

    /// Not-suppressed check: false while inside the cooldown that follows
    /// the last recorded trigger.
    pub fn check_suppression(
        &self,
        source_id: i64,
        node_id: &str,
        now: f64,
    ) -> (bool, Option<SuppressionInfo>) {
        let entry = match self.entries.get(&(source_id, node_id.to_string())) {
            Some(entry) => entry,
            None => return (true, None),
        };
        let Some(suppression) = &entry.suppression else {
            return (true, None);
        };
        if !suppression.enable {
            return (true, None);
        }
        let duration = suppression.duration.unwrap_or(self.default_cooldown);
        match entry.last_trigger {
            Some(last) if now - last < duration => {
                let info = SuppressionInfo {
                    last_trigger: last,
                    cooldown_remaining: duration - (now - last),
                };
                debug!(
                    "({source_id},{node_id}) suppressed, {:.2}s cooldown left",
                    info.cooldown_remaining
                );
                (false, Some(info))
            }
            _ => (true, None),
        }
    }

    pub fn record_trigger(&self, source_id: i64, node_id: &str, timestamp: f64) {
        let mut entry = self
            .entries
            .entry((source_id, node_id.to_string()))
            .or_insert_with(WindowEntry::new);
        entry.last_trigger = Some(timestamp);
    }

    /// Detected records inside the current window, oldest first. Used to
    /// attach evidence images to an alert.
    pub fn detection_records(&self, source_id: i64, node_id: &str, now: f64) -> Vec<WindowRecord> {
        let entry = match self.entries.get(&(source_id, node_id.to_string())) {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        let window_size = entry
            .trigger
            .as_ref()
            .map(|t| t.window_size)
            .unwrap_or(30.0);
        let start = now - window_size;
        entry
            .records
            .iter()
            .filter(|r| r.detected && r.timestamp >= start)
            .cloned()
            .collect()
    }

    fn window_stats(entry: &mut WindowEntry, now: f64, trigger: &TriggerCondition) -> WindowStats {
        if let Some((cached_at, stats)) = &entry.stats_cache {
            if now - cached_at < STATS_CACHE_TTL {
                return stats.clone();
            }
        }

        let window_start = now - trigger.window_size;
        let mut total_count = 0usize;
        let mut detection_count = 0usize;
        let mut max_consecutive = 0usize;
        let mut run = 0usize;
        for record in entry.records.iter().filter(|r| r.timestamp >= window_start) {
            total_count += 1;
            if record.detected {
                detection_count += 1;
                run += 1;
                max_consecutive = max_consecutive.max(run);
            } else {
                run = 0;
            }
        }

        let stats = WindowStats {
            total_count,
            detection_count,
            detection_ratio: if total_count > 0 {
                detection_count as f64 / total_count as f64
            } else {
                0.0
            },
            max_consecutive,
            window_start,
            window_end: now,
            window_size: trigger.window_size,
        };
        entry.stats_cache = Some((now, stats.clone()));
        stats
    }

    /// Drop stale stats caches. Record rings are bounded already.
    fn maybe_cleanup(&self, now: f64) {
        {
            let mut last = self.last_cleanup.lock().unwrap();
            if now - *last < CLEANUP_INTERVAL {
                return;
            }
            *last = now;
        }
        let mut dropped = 0;
        for mut entry in self.entries.iter_mut() {
            if let Some((cached_at, _)) = &entry.stats_cache {
                if now - cached_at > CLEANUP_INTERVAL {
                    entry.stats_cache = None;
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            debug!("window cleanup dropped {dropped} stale stats caches");
        }
    }

    pub fn clear(&self, source_id: i64, node_id: &str) {
        self.entries.remove(&(source_id, node_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(mode: WindowMode, window_size: f64, threshold: f64) -> TriggerCondition {
        TriggerCondition { enable: true, window_size, mode, threshold }
    }

    fn suppression(duration: f64) -> SuppressionConfig {
        SuppressionConfig { enable: true, duration: Some(duration) }
    }

    #[test]
    fn ratio_mode_matches_scenario_pattern() {
        // Window 10s, ratio >= 0.3, 1 Hz pattern [T,F,F,F,T,F,F,T,F,F].
        let window = AlertWindow::new(60.0);
        let pattern = [true, false, false, false, true, false, false, true, false, false];
        window.configure(1, "alert", Some(trigger(WindowMode::Ratio, 10.0, 0.3)), None);

        let mut verdicts = Vec::new();
        for (i, &detected) in pattern.iter().enumerate() {
            let ts = i as f64;
            window.add_record(1, "alert", ts, detected, None);
            // Fresh timestamps defeat the stats cache (TTL 0.5s < 1s steps).
            let (passed, stats) = window.check_condition(1, "alert", ts);
            verdicts.push((passed, stats.unwrap().detection_ratio));
        }

        // 4th frame (index 3): 1/4 = 0.25, does not pass.
        assert!(!verdicts[3].0);
        assert!((verdicts[3].1 - 0.25).abs() < 1e-9);
        // 9th frame (index 8): 3/9 = 0.333..., passes.
        assert!(verdicts[8].0);
        // 10th frame (index 9): 3/10 = 0.3, passes on the boundary.
        assert!(verdicts[9].0);
        assert!((verdicts[9].1 - 0.3).abs() < 1e-9);
    }

    #[test]
    fn count_mode_counts_detections_in_window() {
        let window = AlertWindow::new(60.0);
        window.configure(1, "n", Some(trigger(WindowMode::Count, 5.0, 2.0)), None);
        window.add_record(1, "n", 0.0, true, None);
        let (passed, _) = window.check_condition(1, "n", 0.0);
        assert!(!passed);
        window.add_record(1, "n", 1.0, true, None);
        let (passed, stats) = window.check_condition(1, "n", 1.0);
        assert!(passed);
        assert_eq!(stats.unwrap().detection_count, 2);

        // Far in the future both records age out of the 5s window.
        let (passed, stats) = window.check_condition(1, "n", 100.0);
        assert!(!passed);
        assert_eq!(stats.unwrap().total_count, 0);
    }

    #[test]
    fn consecutive_mode_tracks_longest_run() {
        let window = AlertWindow::new(60.0);
        window.configure(1, "n", Some(trigger(WindowMode::Consecutive, 100.0, 3.0)), None);
        for (i, detected) in [true, true, false, true, true].iter().enumerate() {
            window.add_record(1, "n", i as f64, *detected, None);
        }
        let (passed, stats) = window.check_condition(1, "n", 4.0);
        assert!(!passed);
        assert_eq!(stats.unwrap().max_consecutive, 2);

        window.add_record(1, "n", 5.0, true, None);
        let (passed, stats) = window.check_condition(1, "n", 5.0);
        assert!(passed);
        assert_eq!(stats.unwrap().max_consecutive, 3);
    }

    #[test]
    fn disabled_or_missing_trigger_always_passes() {
        let window = AlertWindow::new(60.0);
        let (passed, stats) = window.check_condition(9, "never-seen", 0.0);
        assert!(passed);
        assert!(stats.is_none());

        window.configure(
            9,
            "n",
            Some(TriggerCondition {
                enable: false,
                window_size: 10.0,
                mode: WindowMode::Ratio,
                threshold: 0.5,
            }),
            None,
        );
        assert!(window.check_condition(9, "n", 0.0).0);
    }

    #[test]
    fn suppression_enforces_cooldown_spacing() {
        let window = AlertWindow::new(60.0);
        window.configure(1, "n", None, Some(suppression(10.0)));

        assert!(window.check_suppression(1, "n", 100.0).0);
        window.record_trigger(1, "n", 100.0);

        // Within cooldown: suppressed, remaining time reported.
        let (ok, info) = window.check_suppression(1, "n", 104.0);
        assert!(!ok);
        assert!((info.unwrap().cooldown_remaining - 6.0).abs() < 1e-9);

        // After cooldown: allowed again.
        assert!(window.check_suppression(1, "n", 110.5).0);
    }

    #[test]
    fn suppression_defaults_to_global_cooldown() {
        let window = AlertWindow::new(42.0);
        window.configure(1, "n", None, Some(SuppressionConfig { enable: true, duration: None }));
        window.record_trigger(1, "n", 0.0);
        assert!(!window.check_suppression(1, "n", 41.0).0);
        assert!(window.check_suppression(1, "n", 43.0).0);
    }

    #[test]
    fn detection_records_filters_window_and_outcome() {
        let window = AlertWindow::new(60.0);
        window.configure(1, "n", Some(trigger(WindowMode::Ratio, 10.0, 0.1)), None);
        window.add_record(1, "n", 0.0, true, Some("old.jpg".to_string()));
        window.add_record(1, "n", 95.0, false, None);
        window.add_record(1, "n", 96.0, true, Some("fresh.jpg".to_string()));

        let records = window.detection_records(1, "n", 100.0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].image_path.as_deref(), Some("fresh.jpg"));
    }
}
