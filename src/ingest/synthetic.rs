//! Synthetic frame source (`stub://...`) for running without a camera.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::FrameSource;
use crate::config::SourceSettings;

pub struct SyntheticSource {
    settings: SourceSettings,
    frame_count: u64,
    /// Simulated scene, changes every 50 frames.
    scene_state: u8,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(settings: SourceSettings) -> Self {
        Self {
            settings,
            frame_count: 0,
            scene_state: 0,
            last_frame_at: None,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.settings.target_fps.max(1)
    }

    fn generate_pixels(&mut self) -> Result<Vec<u8>> {
        let pixel_count = frame_bytes(self.settings.width, self.settings.height).ok_or_else(|| {
            anyhow!(
                "synthetic frame {}x{} is too large",
                self.settings.width,
                self.settings.height
            )
        })?;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        Ok(pixels)
    }
}

/// Size of a packed RGB frame, `None` if it does not fit in memory.
pub fn frame_bytes(width: u32, height: u32) -> Option<usize> {
    usize::try_from(width)
        .ok()?
        .checked_mul(usize::try_from(height).ok()?)?
        .checked_mul(3)
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!("SyntheticSource: connected to {}", self.settings.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Vec<u8>> {
        if let Some(last) = self.last_frame_at {
            let interval = self.frame_interval();
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
        self.frame_count += 1;
        self.generate_pixels()
    }

    fn describe(&self) -> String {
        self.settings.url.clone()
    }
}
