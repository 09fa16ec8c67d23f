//! Replays the files of a local directory as frames.
//!
//! Files are read in file-name order and looped; subdirectories are ignored.
//! Only local paths are accepted (no URL schemes).

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::FrameSource;
use crate::config::SourceSettings;

pub struct DirectorySource {
    settings: SourceSettings,
    files: Vec<PathBuf>,
    position: usize,
    last_frame_at: Option<Instant>,
}

impl DirectorySource {
    pub fn new(settings: SourceSettings) -> Result<Self> {
        if settings.url.trim().is_empty() || settings.url.contains("://") {
            return Err(anyhow!(
                "directory source only supports local paths (no URL schemes)"
            ));
        }
        Ok(Self {
            settings,
            files: Vec::new(),
            position: 0,
            last_frame_at: None,
        })
    }
}

impl FrameSource for DirectorySource {
    fn connect(&mut self) -> Result<()> {
        let dir = PathBuf::from(&self.settings.url);
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .map_err(|e| anyhow!("failed to read frame directory {}: {}", dir.display(), e))?
        {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        if files.is_empty() {
            return Err(anyhow!("frame directory {} is empty", dir.display()));
        }
        files.sort();
        log::info!(
            "DirectorySource: connected to {} ({} frames)",
            dir.display(),
            files.len()
        );
        self.files = files;
        self.position = 0;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Vec<u8>> {
        if self.files.is_empty() {
            return Err(anyhow!("directory source not connected"));
        }
        let interval = Duration::from_secs(1) / self.settings.target_fps.max(1);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());

        let path = &self.files[self.position];
        self.position = (self.position + 1) % self.files.len();
        std::fs::read(path).map_err(|e| anyhow!("failed to read frame {}: {}", path.display(), e))
    }

    fn describe(&self) -> String {
        format!("dir:{}", self.settings.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_files_in_order_and_loops() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jpeg"), b"second").unwrap();
        std::fs::write(dir.path().join("a.jpeg"), b"first").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let mut source = DirectorySource::new(SourceSettings {
            url: dir.path().to_string_lossy().to_string(),
            target_fps: 1000,
            ..SourceSettings::default()
        })
        .unwrap();
        source.connect().unwrap();
        assert_eq!(source.next_frame().unwrap(), b"first");
        assert_eq!(source.next_frame().unwrap(), b"second");
        assert_eq!(source.next_frame().unwrap(), b"first");
    }

    #[test]
    fn empty_directory_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = DirectorySource::new(SourceSettings {
            url: dir.path().to_string_lossy().to_string(),
            ..SourceSettings::default()
        })
        .unwrap();
        assert!(source.connect().is_err());
    }
}
