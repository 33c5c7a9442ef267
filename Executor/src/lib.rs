//! Workflow execution engine: loads a persisted DAG, schedules its nodes in
//! topological layers over live frames from a shared-memory ring buffer, and
//! drives the alert pipeline (windowing, suppression, evidence capture,
//! recording, broker publish).

pub mod alert;
pub mod detectors;
pub mod executor;
pub mod functions;
pub mod graph;
pub mod log_collector;
pub mod recorder;
pub mod roi;
pub mod testmode;
pub mod types;
pub mod visualize;
pub mod window;
