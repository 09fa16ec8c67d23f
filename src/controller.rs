//! Sensor-driven capture control.
//!
//! The train sensor reports a train approaching (`TrainIn`) and leaving
//! (`TrainLeave`). Each approach starts a new session named after the current
//! epoch milliseconds; the matching departure stops it. A sensor fault or a
//! shutdown request stops any running capture and ends the control loop.

use anyhow::Result;
use std::ops::ControlFlow;
use std::sync::mpsc::Receiver;
use std::thread::JoinHandle;

use crate::capture::{CaptureSummary, Recorder};
use crate::error::Error;
use crate::ingest::{self, FrameSource, PumpStats};

/// Session id collisions tolerated before a start is abandoned.
const SESSION_ID_ATTEMPTS: i64 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SensorEvent {
    TrainIn,
    TrainLeave,
    Fault(String),
    Shutdown,
}

/// Parses one line of the text sensor protocol: `in`/`1` or `leave`/`0`.
pub fn parse_sensor_line(line: &str) -> Option<SensorEvent> {
    match line.trim().to_ascii_lowercase().as_str() {
        "in" | "1" => Some(SensorEvent::TrainIn),
        "leave" | "out" | "0" => Some(SensorEvent::TrainLeave),
        "quit" | "exit" => Some(SensorEvent::Shutdown),
        _ => None,
    }
}

pub struct Controller<F>
where
    F: FnMut() -> Result<Box<dyn FrameSource>>,
{
    recorder: Recorder,
    make_source: F,
    pump: Option<JoinHandle<PumpStats>>,
}

impl<F> Controller<F>
where
    F: FnMut() -> Result<Box<dyn FrameSource>>,
{
    pub fn new(recorder: Recorder, make_source: F) -> Self {
        Self {
            recorder,
            make_source,
            pump: None,
        }
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Processes events until the channel closes, a fault arrives or a
    /// shutdown is requested.
    pub fn run(&mut self, events: Receiver<SensorEvent>) -> Result<()> {
        while let Ok(event) = events.recv() {
            if self.handle(event)?.is_break() {
                break;
            }
        }
        self.finish_capture()?;
        Ok(())
    }

    pub fn handle(&mut self, event: SensorEvent) -> Result<ControlFlow<()>> {
        match event {
            SensorEvent::TrainIn => {
                if let Some(session_id) = self.recorder.active_session() {
                    log::info!("controller: train in while capturing {}, ignored", session_id);
                    return Ok(ControlFlow::Continue(()));
                }
                if let Err(err) = self.begin_capture() {
                    log::error!("controller: capture not started: {:#}", err);
                }
                Ok(ControlFlow::Continue(()))
            }
            SensorEvent::TrainLeave => {
                if self.recorder.active_session().is_none() {
                    log::debug!("controller: train leave while idle, ignored");
                    return Ok(ControlFlow::Continue(()));
                }
                self.finish_capture()?;
                Ok(ControlFlow::Continue(()))
            }
            SensorEvent::Fault(reason) => {
                log::error!("controller: sensor fault: {}", reason);
                self.finish_capture()?;
                Ok(ControlFlow::Break(()))
            }
            SensorEvent::Shutdown => {
                log::info!("controller: shutdown requested");
                self.finish_capture()?;
                Ok(ControlFlow::Break(()))
            }
        }
    }

    fn begin_capture(&mut self) -> Result<()> {
        let mut source = (self.make_source)()?;
        source.connect()?;

        let base = crate::now_millis();
        let mut attempt = 0;
        let sink = loop {
            let session_id = (base + attempt).to_string();
            match self.recorder.start(&session_id) {
                Ok(sink) => break sink,
                Err(Error::AlreadyExists(_)) if attempt + 1 < SESSION_ID_ATTEMPTS => attempt += 1,
                Err(err) => return Err(err.into()),
            }
        };
        self.pump = Some(ingest::spawn_pump(source, sink)?);
        Ok(())
    }

    fn finish_capture(&mut self) -> Result<Option<CaptureSummary>> {
        let summary = self.recorder.stop()?;
        if let Some(pump) = self.pump.take() {
            match pump.join() {
                Ok(stats) => log::debug!(
                    "controller: source delivered {} frames ({} errors)",
                    stats.frames_delivered,
                    stats.errors
                ),
                Err(_) => log::error!("controller: frame pump panicked"),
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureState;
    use crate::storage::Store;
    use std::sync::Arc;

    struct CountingSource(u8);

    impl FrameSource for CountingSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Vec<u8>> {
            std::thread::sleep(std::time::Duration::from_millis(2));
            self.0 = self.0.wrapping_add(1);
            Ok(vec![self.0; 8])
        }

        fn describe(&self) -> String {
            "counting".to_string()
        }
    }

    fn controller(
        dir: &tempfile::TempDir,
    ) -> Controller<impl FnMut() -> Result<Box<dyn FrameSource>>> {
        let store = Arc::new(Store::open(dir.path()).unwrap());
        Controller::new(Recorder::new(store), || {
            Ok(Box::new(CountingSource(0)) as Box<dyn FrameSource>)
        })
    }

    #[test]
    fn parses_sensor_lines() {
        assert_eq!(parse_sensor_line(" IN\n"), Some(SensorEvent::TrainIn));
        assert_eq!(parse_sensor_line("0"), Some(SensorEvent::TrainLeave));
        assert_eq!(parse_sensor_line("quit"), Some(SensorEvent::Shutdown));
        assert_eq!(parse_sensor_line("maybe"), None);
    }

    #[test]
    fn train_in_and_leave_produce_one_indexed_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(&dir);

        assert!(controller.handle(SensorEvent::TrainIn).unwrap().is_continue());
        assert_eq!(controller.recorder().state(), CaptureState::Capturing);
        // duplicate approach keeps the running session
        let session_id = controller.recorder().active_session().unwrap().to_string();
        controller.handle(SensorEvent::TrainIn).unwrap();
        assert_eq!(controller.recorder().active_session(), Some(session_id.as_str()));

        std::thread::sleep(std::time::Duration::from_millis(30));
        controller.handle(SensorEvent::TrainLeave).unwrap();
        assert_eq!(controller.recorder().state(), CaptureState::Idle);

        let store = controller.recorder().store().clone();
        assert_eq!(store.list_sessions().unwrap(), vec![session_id.clone()]);
        let index = store.read_index(&session_id).unwrap();
        let files = std::fs::read_dir(dir.path().join(&session_id))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == "jpeg")
            })
            .count();
        assert!(!index.is_empty());
        assert_eq!(files, index.len());
    }

    #[test]
    fn fault_stops_capture_and_ends_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(&dir);
        let (tx, rx) = std::sync::mpsc::channel();
        tx.send(SensorEvent::TrainIn).unwrap();
        tx.send(SensorEvent::Fault("usb timeout".to_string())).unwrap();
        tx.send(SensorEvent::TrainIn).unwrap();
        controller.run(rx).unwrap();

        assert_eq!(controller.recorder().state(), CaptureState::Idle);
        assert_eq!(controller.recorder().store().list_sessions().unwrap().len(), 1);
    }
}
