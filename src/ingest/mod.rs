//! Frame sources.
//!
//! A source produces encoded frames one at a time, blocking until the next
//! frame is available:
//! - `stub://` synthetic frames (no hardware)
//! - a local directory of image files, replayed in order
//!
//! Device drivers (V4L2, raw sensor) plug in by implementing `FrameSource`.
//! A source is driven by `spawn_pump`, which runs it on its own thread and
//! hands every frame to the capture session's `FrameSink`.

use anyhow::{anyhow, Result};
use std::thread::JoinHandle;

use crate::capture::FrameSink;
use crate::config::SourceSettings;

pub mod directory;
pub mod synthetic;

pub use directory::DirectorySource;
pub use synthetic::SyntheticSource;

/// Consecutive read failures after which a pump gives up on its source.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

pub trait FrameSource: Send {
    /// Prepares the device. Called once before the first frame.
    fn connect(&mut self) -> Result<()>;

    /// Blocks until the next frame is available.
    fn next_frame(&mut self) -> Result<Vec<u8>>;

    /// Human readable source name for logs.
    fn describe(&self) -> String;
}

/// Opens the source named by `settings.url`.
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    if settings.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(settings.clone())));
    }
    if settings.url.contains("://") {
        return Err(anyhow!(
            "unsupported frame source '{}' (expected stub:// or a local directory)",
            settings.url
        ));
    }
    Ok(Box::new(DirectorySource::new(settings.clone())?))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub frames_delivered: u64,
    pub errors: u64,
}

/// Runs `source` on a dedicated thread until the sink stops accepting frames
/// or the source keeps failing.
pub fn spawn_pump(
    mut source: Box<dyn FrameSource>,
    sink: FrameSink,
) -> Result<JoinHandle<PumpStats>> {
    let name = source.describe();
    let join = std::thread::Builder::new()
        .name("frame-pump".to_string())
        .spawn(move || {
            let mut stats = PumpStats::default();
            let mut consecutive_errors = 0u32;
            while !sink.is_stopping() {
                match source.next_frame() {
                    Ok(frame) => {
                        consecutive_errors = 0;
                        if !sink.deliver(frame) {
                            break;
                        }
                        stats.frames_delivered += 1;
                    }
                    Err(err) => {
                        stats.errors += 1;
                        consecutive_errors += 1;
                        sink.report_error(format!("{name}: {err}"));
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            log::error!("pump: giving up on {} after {} errors", name, consecutive_errors);
                            break;
                        }
                    }
                }
            }
            log::debug!(
                "pump: {} finished ({} frames, {} errors)",
                name,
                stats.frames_delivered,
                stats.errors
            );
            stats
        })?;
    Ok(join)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Recorder;
    use crate::storage::Store;
    use std::sync::Arc;

    struct FailingSource;

    impl FrameSource for FailingSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Vec<u8>> {
            Err(anyhow!("device unplugged"))
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    #[test]
    fn rejects_remote_urls() {
        let settings = SourceSettings {
            url: "rtsp://camera".to_string(),
            ..SourceSettings::default()
        };
        assert!(open_source(&settings).is_err());
    }

    #[test]
    fn pump_gives_up_on_failing_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new(Arc::new(Store::open(dir.path()).unwrap()));
        let sink = recorder.start("failing").unwrap();
        let stats = spawn_pump(Box::new(FailingSource), sink).unwrap().join().unwrap();
        assert_eq!(stats.errors, u64::from(MAX_CONSECUTIVE_ERRORS));
        let summary = recorder.stop().unwrap().unwrap();
        assert_eq!(summary.frames, 0);
        assert_eq!(summary.errors, MAX_CONSECUTIVE_ERRORS as usize);
    }
}
