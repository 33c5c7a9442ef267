//! SQLite-backed entity model: video sources, workflows, algorithms and
//! alerts. The orchestrator mutates source lifecycle state, the executor
//! reads workflows/algorithms and appends alerts. Schema is created on open
//! so a fresh deployment needs no migration step.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};
use shared_utils::types::WorkflowData;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("workflow {0} has invalid graph JSON: {1}")]
    BadWorkflowData(i64, serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceStatus {
    Stopped,
    Running,
    Failed,
}

impl SourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceStatus::Stopped => "STOPPED",
            SourceStatus::Running => "RUNNING",
            SourceStatus::Failed => "FAILED",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "RUNNING" => SourceStatus::Running,
            "FAILED" => SourceStatus::Failed,
            _ => SourceStatus::Stopped,
        }
    }
}

#[derive(Clone, Debug)]
pub struct VideoSource {
    pub id: i64,
    pub name: String,
    pub source_code: String,
    pub source_url: String,
    pub decode_width: u32,
    pub decode_height: u32,
    pub fps: u32,
    pub buffer_name: String,
    pub enabled: bool,
    pub status: SourceStatus,
    pub decoder_pid: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct Workflow {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    pub data: String,
}

impl Workflow {
    pub fn graph(&self) -> Result<WorkflowData> {
        serde_json::from_str(&self.data).map_err(|e| StoreError::BadWorkflowData(self.id, e))
    }
}

/// Detector descriptor referenced by algorithm nodes. `script_path` selects
/// an implementation from the compiled-in registry; `script_config` is the
/// free-form config handed to it.
#[derive(Clone, Debug)]
pub struct Algorithm {
    pub id: i64,
    pub name: String,
    pub script_path: String,
    pub script_config: String,
    pub interval_seconds: f64,
    pub runtime_timeout: f64,
    pub memory_limit_mb: u64,
    pub label_name: String,
    pub label_color: String,
}

impl Algorithm {
    pub fn config(&self) -> serde_json::Value {
        serde_json::from_str(&self.script_config).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Clone, Debug, Default)]
pub struct NewAlert {
    pub video_source: i64,
    pub workflow: Option<i64>,
    pub alert_time: String,
    pub alert_type: String,
    pub alert_level: String,
    pub alert_message: String,
    pub alert_image: String,
    pub alert_image_ori: String,
    pub alert_video: String,
    pub detection_count: u32,
    pub window_stats: Option<String>,
    pub detection_images: Option<String>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS video_sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    source_code TEXT NOT NULL UNIQUE,
    source_url TEXT NOT NULL,
    decode_width INTEGER NOT NULL DEFAULT 1920,
    decode_height INTEGER NOT NULL DEFAULT 1080,
    fps INTEGER NOT NULL DEFAULT 10,
    buffer_name TEXT NOT NULL UNIQUE,
    enabled INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'STOPPED',
    decoder_pid INTEGER
);
CREATE TABLE IF NOT EXISTS workflows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    data TEXT NOT NULL DEFAULT '{}'
);
CREATE TABLE IF NOT EXISTS algorithms (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    script_path TEXT NOT NULL,
    script_config TEXT NOT NULL DEFAULT '{}',
    interval_seconds REAL NOT NULL DEFAULT 1.0,
    runtime_timeout REAL NOT NULL DEFAULT 30.0,
    memory_limit_mb INTEGER NOT NULL DEFAULT 512,
    label_name TEXT NOT NULL DEFAULT 'Object',
    label_color TEXT NOT NULL DEFAULT '#FF0000'
);
CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    video_source INTEGER NOT NULL REFERENCES video_sources(id),
    workflow INTEGER REFERENCES workflows(id),
    alert_time TEXT NOT NULL,
    alert_type TEXT NOT NULL,
    alert_level TEXT NOT NULL,
    alert_message TEXT NOT NULL DEFAULT '',
    alert_image TEXT NOT NULL DEFAULT '',
    alert_image_ori TEXT NOT NULL DEFAULT '',
    alert_video TEXT NOT NULL DEFAULT '',
    detection_count INTEGER NOT NULL DEFAULT 0,
    window_stats TEXT,
    detection_images TEXT
);
";

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Db> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        info!("opened database {}", path.display());
        Ok(Db { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Db> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Db { conn: Mutex::new(conn) })
    }

    fn source_from_row(row: &Row<'_>) -> rusqlite::Result<VideoSource> {
        Ok(VideoSource {
            id: row.get("id")?,
            name: row.get("name")?,
            source_code: row.get("source_code")?,
            source_url: row.get("source_url")?,
            decode_width: row.get("decode_width")?,
            decode_height: row.get("decode_height")?,
            fps: row.get("fps")?,
            buffer_name: row.get("buffer_name")?,
            enabled: row.get("enabled")?,
            status: SourceStatus::parse(&row.get::<_, String>("status")?),
            decoder_pid: row.get("decoder_pid")?,
        })
    }

    pub fn insert_source(&self, source: &VideoSource) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO video_sources
                 (name, source_code, source_url, decode_width, decode_height,
                  fps, buffer_name, enabled, status, decoder_pid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                source.name,
                source.source_code,
                source.source_url,
                source.decode_width,
                source.decode_height,
                source.fps,
                source.buffer_name,
                source.enabled,
                source.status.as_str(),
                source.decoder_pid,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_source(&self, id: i64) -> Result<Option<VideoSource>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT * FROM video_sources WHERE id = ?1",
                params![id],
                Self::source_from_row,
            )
            .optional()?)
    }

    pub fn list_sources(&self) -> Result<Vec<VideoSource>> {
        self.query_sources("SELECT * FROM video_sources ORDER BY id")
    }

    pub fn sources_to_start(&self) -> Result<Vec<VideoSource>> {
        self.query_sources(
            "SELECT * FROM video_sources WHERE enabled = 1 AND status = 'STOPPED' ORDER BY id",
        )
    }

    pub fn sources_to_stop(&self) -> Result<Vec<VideoSource>> {
        self.query_sources(
            "SELECT * FROM video_sources WHERE enabled = 0 AND status = 'RUNNING' ORDER BY id",
        )
    }

    pub fn running_sources(&self) -> Result<Vec<VideoSource>> {
        self.query_sources("SELECT * FROM video_sources WHERE status = 'RUNNING' ORDER BY id")
    }

    fn query_sources(&self, sql: &str) -> Result<Vec<VideoSource>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], Self::source_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn set_source_running(&self, id: i64, pid: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE video_sources SET status = 'RUNNING', decoder_pid = ?2 WHERE id = ?1",
            params![id, pid],
        )?;
        Ok(())
    }

    pub fn set_source_stopped(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE video_sources SET status = 'STOPPED', decoder_pid = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn set_source_failed(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE video_sources SET status = 'FAILED' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Crash recovery: no source may claim to be RUNNING before the first
    /// reconciliation tick of a fresh orchestrator.
    pub fn reset_running_sources(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(
            "UPDATE video_sources SET status = 'STOPPED', decoder_pid = NULL
             WHERE status != 'STOPPED' OR decoder_pid IS NOT NULL",
            [],
        )?)
    }

    pub fn insert_workflow(&self, name: &str, is_active: bool, data: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO workflows (name, is_active, data) VALUES (?1, ?2, ?3)",
            params![name, is_active, data],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_workflow(&self, id: i64) -> Result<Option<Workflow>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT id, name, is_active, data FROM workflows WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Workflow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        is_active: row.get(2)?,
                        data: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn active_workflows(&self) -> Result<Vec<Workflow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, name, is_active, data FROM workflows WHERE is_active = 1")?;
        let rows = stmt.query_map([], |row| {
            Ok(Workflow {
                id: row.get(0)?,
                name: row.get(1)?,
                is_active: row.get(2)?,
                data: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn insert_algorithm(&self, algorithm: &Algorithm) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO algorithms
                 (name, script_path, script_config, interval_seconds, runtime_timeout,
                  memory_limit_mb, label_name, label_color)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                algorithm.name,
                algorithm.script_path,
                algorithm.script_config,
                algorithm.interval_seconds,
                algorithm.runtime_timeout,
                algorithm.memory_limit_mb,
                algorithm.label_name,
                algorithm.label_color,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_algorithm(&self, id: i64) -> Result<Option<Algorithm>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT id, name, script_path, script_config, interval_seconds,
                        runtime_timeout, memory_limit_mb, label_name, label_color
                 FROM algorithms WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Algorithm {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        script_path: row.get(2)?,
                        script_config: row.get(3)?,
                        interval_seconds: row.get(4)?,
                        runtime_timeout: row.get(5)?,
                        memory_limit_mb: row.get(6)?,
                        label_name: row.get(7)?,
                        label_color: row.get(8)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn insert_alert(&self, alert: &NewAlert) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alerts
                 (video_source, workflow, alert_time, alert_type, alert_level, alert_message,
                  alert_image, alert_image_ori, alert_video, detection_count,
                  window_stats, detection_images)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                alert.video_source,
                alert.workflow,
                alert.alert_time,
                alert.alert_type,
                alert.alert_level,
                alert.alert_message,
                alert.alert_image,
                alert.alert_image_ori,
                alert.alert_video,
                alert.detection_count,
                alert.window_stats,
                alert.detection_images,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_alert_video(&self, id: i64, video_path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alerts SET alert_video = ?2 WHERE id = ?1",
            params![id, video_path],
        )?;
        Ok(())
    }

    pub fn alert_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get::<_, u64>(0))?)
    }
}
