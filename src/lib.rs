//! Train-triggered frame capture (LPX)
//!
//! A trackside sensor reports trains arriving and leaving. Each arrival opens
//! a capture session: camera frames are written to disk one file per frame,
//! and a per-session index records the time span covered by every frame.
//! Sessions can later be located by wall-clock time and exported as a single
//! length-prefixed byte stream, read incrementally by the HTTP service.
//!
//! # On-disk layout
//!
//! ```text
//! <root>/<session_id>/0.jpeg, 1.jpeg, ...
//! <root>/<session_id>/index.csv      start_us,end_us per frame
//! ```
//!
//! # Module Structure
//!
//! - `index`: frame time spans, index text format, offset resolution
//! - `storage`: session directories, frame files, lookup, export setup
//! - `capture`: recorder thread and producer sink
//! - `export`: the streaming export encoder
//! - `ingest`: frame sources and the pump feeding a recorder
//! - `controller`: sensor events driving start/stop
//! - `api`: HTTP export service

use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod export;
pub mod index;
pub mod ingest;
pub mod storage;

pub use capture::{CaptureState, CaptureSummary, FrameSink, Recorder};
pub use error::{Error, Result};
pub use export::{Chunk, ExportRequest, ExportSelection, ExportStream, ReadOutcome};
pub use index::FrameMeta;
pub use storage::Store;

/// Wall clock in microseconds since the Unix epoch. Clocks set before the
/// epoch read as 0.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
