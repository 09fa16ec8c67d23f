//! Write side of a capture session.
//!
//! A `Recorder` runs at most one capture at a time. `start` prepares the
//! session directory and spawns a capture thread that owns the in-memory
//! frame index; producers push frames through a cloneable `FrameSink`.
//! Frames, producer errors and the stop request all travel over one channel,
//! so the capture thread blocks in a single place and wakes on any of them.
//!
//! `stop` raises the shared stopping flag before anything else. From then on
//! `FrameSink::deliver` refuses frames, and frames that still reach the
//! channel behind the stop request are discarded. Everything delivered before
//! the stop request is persisted and indexed, then the index is written once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::{Error, Result};
use crate::index::FrameMeta;
use crate::storage::Store;

/// Message from a frame producer (or the controller) to the capture thread.
#[derive(Debug)]
pub enum CaptureEvent {
    FrameReady { data: Vec<u8>, received_at: i64 },
    Error(String),
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Stopping,
}

/// Outcome of one capture session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureSummary {
    pub session_id: String,
    /// Frames persisted and indexed.
    pub frames: usize,
    /// Frames that arrived behind the stop request.
    pub dropped: usize,
    /// Producer errors plus failed frame writes.
    pub errors: usize,
}

/// Producer handle of an active capture.
#[derive(Clone, Debug)]
pub struct FrameSink {
    stopping: Arc<AtomicBool>,
    tx: Sender<CaptureEvent>,
}

impl FrameSink {
    /// Hands a frame to the capture thread, stamped with the current time as
    /// its receive instant. Returns false once the capture is stopping.
    pub fn deliver(&self, data: Vec<u8>) -> bool {
        if self.is_stopping() {
            return false;
        }
        let received_at = crate::now_micros();
        self.tx
            .send(CaptureEvent::FrameReady { data, received_at })
            .is_ok()
    }

    pub fn report_error(&self, message: impl Into<String>) -> bool {
        if self.is_stopping() {
            return false;
        }
        self.tx.send(CaptureEvent::Error(message.into())).is_ok()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

struct ActiveCapture {
    session_id: String,
    stopping: Arc<AtomicBool>,
    tx: Sender<CaptureEvent>,
    join: JoinHandle<Result<CaptureSummary>>,
}

pub struct Recorder {
    store: Arc<Store>,
    active: Option<ActiveCapture>,
}

impl Recorder {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            active: None,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn state(&self) -> CaptureState {
        match &self.active {
            None => CaptureState::Idle,
            Some(active) if active.stopping.load(Ordering::SeqCst) => CaptureState::Stopping,
            Some(_) => CaptureState::Capturing,
        }
    }

    pub fn active_session(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.session_id.as_str())
    }

    /// Starts capturing into a new session.
    pub fn start(&mut self, session_id: &str) -> Result<FrameSink> {
        if let Some(active) = &self.active {
            return Err(Error::CaptureActive(active.session_id.clone()));
        }
        self.store.prepare(session_id)?;

        let stopping = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let first_request = crate::now_micros();
        let store = self.store.clone();
        let id = session_id.to_string();
        let join = std::thread::Builder::new()
            .name(format!("capture-{session_id}"))
            .spawn(move || run_capture(&store, id, rx, first_request))?;

        log::info!("capture: session {} started", session_id);
        self.active = Some(ActiveCapture {
            session_id: session_id.to_string(),
            stopping: stopping.clone(),
            tx: tx.clone(),
            join,
        });
        Ok(FrameSink { stopping, tx })
    }

    /// Stops the active capture and writes its index. Returns `None` when no
    /// capture is running.
    pub fn stop(&mut self) -> Result<Option<CaptureSummary>> {
        let Some(active) = self.active.take() else {
            log::debug!("capture: not capturing, ignoring stop request");
            return Ok(None);
        };

        active.stopping.store(true, Ordering::SeqCst);
        // The capture thread only exits on this event, so a send failure
        // means it already died; join reports why.
        let _ = active.tx.send(CaptureEvent::Stopped);
        let summary = active
            .join
            .join()
            .map_err(|_| Error::Io(std::io::Error::other("capture thread panicked")))??;

        log::info!(
            "capture: session {} stopped ({} frames, {} dropped, {} errors)",
            summary.session_id,
            summary.frames,
            summary.dropped,
            summary.errors
        );
        Ok(Some(summary))
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("capture: stop on drop failed: {}", err);
        }
    }
}

fn run_capture(
    store: &Store,
    session_id: String,
    rx: Receiver<CaptureEvent>,
    first_request: i64,
) -> Result<CaptureSummary> {
    let mut frames: Vec<FrameMeta> = Vec::new();
    let mut requested_at = first_request;
    let mut errors = 0usize;

    while let Ok(event) = rx.recv() {
        match event {
            CaptureEvent::FrameReady { data, received_at } => {
                let ordinal = frames.len();
                if let Err(err) = store.store_frame(&session_id, ordinal, &data) {
                    log::error!(
                        "capture: frame {} of session {} not stored: {}",
                        ordinal,
                        session_id,
                        err
                    );
                    errors += 1;
                    if let Ok(path) = store.frame_path(&session_id, ordinal) {
                        let _ = std::fs::remove_file(path);
                    }
                    continue;
                }
                frames.push(FrameMeta::new(requested_at, received_at));
                requested_at = received_at;
            }
            CaptureEvent::Error(message) => {
                log::warn!("capture: source error in session {}: {}", session_id, message);
                errors += 1;
            }
            CaptureEvent::Stopped => break,
        }
    }

    let dropped = rx
        .try_iter()
        .filter(|event| matches!(event, CaptureEvent::FrameReady { .. }))
        .count();
    drop(rx);

    store.write_index(&session_id, &frames)?;
    Ok(CaptureSummary {
        session_id,
        frames: frames.len(),
        dropped,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (tempfile::TempDir, Recorder) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        (dir, Recorder::new(store))
    }

    #[test]
    fn start_deliver_stop_indexes_every_frame() {
        let (_dir, mut recorder) = recorder();
        let sink = recorder.start("1529488179409").unwrap();
        assert_eq!(recorder.state(), CaptureState::Capturing);
        for i in 0..5u8 {
            assert!(sink.deliver(vec![i; 16]));
        }
        let summary = recorder.stop().unwrap().unwrap();
        assert_eq!(summary.frames, 5);
        assert_eq!(summary.dropped, 0);
        assert_eq!(recorder.state(), CaptureState::Idle);

        let store = recorder.store().clone();
        let index = store.read_index("1529488179409").unwrap();
        assert_eq!(index.len(), 5);
        for pair in index.windows(2) {
            assert_eq!(pair[0].end_time, pair[1].start_time);
            assert!(pair[0].start_time <= pair[1].start_time);
        }
        assert_eq!(store.read_frame("1529488179409", 4).unwrap(), vec![4u8; 16]);
    }

    #[test]
    fn sink_refuses_frames_after_stop() {
        let (dir, mut recorder) = recorder();
        let sink = recorder.start("s").unwrap();
        assert!(sink.deliver(b"first".to_vec()));
        recorder.stop().unwrap();

        assert!(sink.is_stopping());
        assert!(!sink.deliver(b"late".to_vec()));
        assert!(!sink.report_error("late"));
        assert!(!dir.path().join("s").join("1.jpeg").exists());
        assert_eq!(recorder.store().read_index("s").unwrap().len(), 1);
    }

    #[test]
    fn second_start_is_rejected() {
        let (_dir, mut recorder) = recorder();
        let _sink = recorder.start("a").unwrap();
        assert!(matches!(recorder.start("b"), Err(Error::CaptureActive(id)) if id == "a"));
        assert_eq!(recorder.active_session(), Some("a"));
    }

    #[test]
    fn stop_when_idle_is_a_no_op() {
        let (_dir, mut recorder) = recorder();
        assert!(recorder.stop().unwrap().is_none());
    }

    #[test]
    fn start_fails_for_existing_session() {
        let (_dir, mut recorder) = recorder();
        recorder.store().prepare("dup").unwrap();
        assert!(matches!(recorder.start("dup"), Err(Error::AlreadyExists(_))));
        assert_eq!(recorder.state(), CaptureState::Idle);
    }

    #[test]
    fn producer_errors_are_counted() {
        let (_dir, mut recorder) = recorder();
        let sink = recorder.start("err").unwrap();
        assert!(sink.report_error("sensor timeout"));
        assert!(sink.deliver(b"f".to_vec()));
        let summary = recorder.stop().unwrap().unwrap();
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.frames, 1);
    }
}
