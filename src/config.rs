use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_STORAGE_ROOT: &str = "lpx-data";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8888";
const DEFAULT_SOURCE_URL: &str = "stub://camera";
const DEFAULT_TARGET_FPS: u32 = 10;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_EXPORT_CHUNK_BYTES: usize = 64 * 1024;
const MAX_FRAME_DIMENSION: u32 = 16_384;
/// Large enough for the frame count and any frame sub-header.
const MIN_EXPORT_CHUNK_BYTES: usize = 256;

#[derive(Debug, Deserialize, Default)]
struct LpxConfigFile {
    storage_root: Option<PathBuf>,
    api: Option<ApiConfigFile>,
    source: Option<SourceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    export_chunk_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LpxConfig {
    pub storage_root: PathBuf,
    pub api_addr: String,
    pub export_chunk_bytes: usize,
    pub source: SourceSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    /// `stub://<name>` or a local directory of frame files.
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_SOURCE_URL.to_string(),
            target_fps: DEFAULT_TARGET_FPS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

impl LpxConfig {
    /// File named by `LPX_CONFIG` (optional), then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LPX_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: LpxConfigFile) -> Self {
        let storage_root = file
            .storage_root
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));
        let api = file.api.unwrap_or_default();
        let source = file.source.unwrap_or_default();
        let defaults = SourceSettings::default();
        Self {
            storage_root,
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            export_chunk_bytes: api
                .export_chunk_bytes
                .unwrap_or(DEFAULT_EXPORT_CHUNK_BYTES),
            source: SourceSettings {
                url: source.url.unwrap_or(defaults.url),
                target_fps: source.target_fps.unwrap_or(defaults.target_fps),
                width: source.width.unwrap_or(defaults.width),
                height: source.height.unwrap_or(defaults.height),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var("LPX_STORAGE_ROOT") {
            if !root.trim().is_empty() {
                self.storage_root = PathBuf::from(root);
            }
        }
        if let Ok(addr) = std::env::var("LPX_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(url) = std::env::var("LPX_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(fps) = std::env::var("LPX_TARGET_FPS") {
            self.source.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("LPX_TARGET_FPS must be an integer frame rate"))?;
        }
        if let Ok(chunk) = std::env::var("LPX_EXPORT_CHUNK_BYTES") {
            self.export_chunk_bytes = chunk
                .trim()
                .parse()
                .map_err(|_| anyhow!("LPX_EXPORT_CHUNK_BYTES must be an integer byte count"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(anyhow!("storage root must not be empty"));
        }
        if self.source.target_fps == 0 {
            return Err(anyhow!("target fps must be greater than zero"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("frame dimensions must be greater than zero"));
        }
        if self.source.width > MAX_FRAME_DIMENSION || self.source.height > MAX_FRAME_DIMENSION {
            return Err(anyhow!(
                "frame dimensions must be at most {} pixels",
                MAX_FRAME_DIMENSION
            ));
        }
        if self.export_chunk_bytes < MIN_EXPORT_CHUNK_BYTES {
            return Err(anyhow!(
                "export chunk size must be at least {} bytes",
                MIN_EXPORT_CHUNK_BYTES
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<LpxConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
