use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classify::{DEFAULT_CLASS_NAMES, DEFAULT_OCCUPIED_INDEX};
use crate::ingest::SourceTimeouts;
use crate::model::{demo_regions, RegionSpec, StreamRequest};

const DEFAULT_API_ADDR: &str = "127.0.0.1:5001";
const DEFAULT_INTERVAL_SECS: u64 = 30;
const DEFAULT_SCREENSHOTS_DIR: &str = "screenshots";
const DEFAULT_INPUT_SIZE: u32 = 224;
const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    api: Option<ApiConfigFile>,
    capture: Option<CaptureConfigFile>,
    classifier: Option<ClassifierConfigFile>,
    storage: Option<StorageConfigFile>,
    default_regions: Option<Vec<RegionSpec>>,
    streams: Option<Vec<StreamRequest>>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    interval_secs: Option<u64>,
    screenshots_dir: Option<String>,
    open_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassifierConfigFile {
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    class_names: Option<Vec<String>>,
    occupied_index: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    db_path: Option<String>,
    occupancy_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub api_addr: String,
    pub interval: Duration,
    /// `None` disables screenshots.
    pub screenshots_dir: Option<PathBuf>,
    pub timeouts: SourceTimeouts,
    pub classifier: ClassifierSettings,
    /// SQLite mirror location; `None` runs without persistence.
    pub db_path: Option<String>,
    pub occupancy_ttl: Option<Duration>,
    pub default_regions: Vec<RegionSpec>,
    pub streams: Vec<StreamRequest>,
}

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub class_names: Vec<String>,
    pub occupied_index: usize,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            input_size: DEFAULT_INPUT_SIZE,
            class_names: DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
            occupied_index: DEFAULT_OCCUPIED_INDEX,
        }
    }
}

impl MonitorConfig {
    /// Read `$OCCUPANCY_CONFIG` if set, then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("OCCUPANCY_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let capture = file.capture.unwrap_or_default();
        let interval = Duration::from_secs(capture.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS));
        let screenshots_dir = non_empty_path(
            capture
                .screenshots_dir
                .unwrap_or_else(|| DEFAULT_SCREENSHOTS_DIR.to_string()),
        );
        let timeouts = SourceTimeouts {
            open: Duration::from_secs(
                capture
                    .open_timeout_secs
                    .unwrap_or(DEFAULT_OPEN_TIMEOUT_SECS),
            ),
            read: Duration::from_secs(
                capture
                    .read_timeout_secs
                    .unwrap_or(DEFAULT_READ_TIMEOUT_SECS),
            ),
        };

        let defaults = ClassifierSettings::default();
        let classifier = match file.classifier {
            Some(c) => ClassifierSettings {
                model_path: c.model_path,
                input_size: c.input_size.unwrap_or(defaults.input_size),
                class_names: c.class_names.unwrap_or(defaults.class_names),
                occupied_index: c.occupied_index.unwrap_or(defaults.occupied_index),
            },
            None => defaults,
        };

        let storage = file.storage.unwrap_or_default();

        Self {
            api_addr,
            interval,
            screenshots_dir,
            timeouts,
            classifier,
            db_path: storage.db_path.filter(|path| !path.trim().is_empty()),
            occupancy_ttl: storage.occupancy_ttl_secs.map(Duration::from_secs),
            default_regions: file.default_regions.unwrap_or_else(demo_regions),
            streams: file.streams.unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("OCCUPANCY_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(interval) = std::env::var("OCCUPANCY_INTERVAL_SECS") {
            let seconds: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("OCCUPANCY_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.interval = Duration::from_secs(seconds);
        }
        if let Ok(dir) = std::env::var("OCCUPANCY_SCREENSHOTS_DIR") {
            self.screenshots_dir = non_empty_path(dir);
        }
        if let Ok(path) = std::env::var("OCCUPANCY_DB_PATH") {
            self.db_path = Some(path).filter(|path| !path.trim().is_empty());
        }
        if let Ok(path) = std::env::var("OCCUPANCY_MODEL_PATH") {
            self.classifier.model_path = non_empty_path(path);
        }
        if let Ok(names) = std::env::var("OCCUPANCY_CLASS_NAMES") {
            let parsed = split_csv(&names);
            if !parsed.is_empty() {
                self.classifier.class_names = parsed;
            }
        }
        if let Ok(ttl) = std::env::var("OCCUPANCY_TTL_SECS") {
            let seconds: u64 = ttl.trim().parse().map_err(|_| {
                anyhow!("OCCUPANCY_TTL_SECS must be an integer number of seconds")
            })?;
            self.occupancy_ttl = Some(Duration::from_secs(seconds));
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid api addr '{}': {}", self.api_addr, e))?;
        if self.interval.is_zero() {
            return Err(anyhow!("capture interval must be greater than zero"));
        }
        if self.timeouts.open.is_zero() || self.timeouts.read.is_zero() {
            return Err(anyhow!("source timeouts must be greater than zero"));
        }
        if self.classifier.input_size == 0 {
            return Err(anyhow!("classifier input size must be greater than zero"));
        }
        if self.classifier.class_names.is_empty() {
            return Err(anyhow!("classifier needs at least one class name"));
        }
        if self.classifier.occupied_index >= self.classifier.class_names.len() {
            return Err(anyhow!(
                "occupied index {} is outside the {} class names",
                self.classifier.occupied_index,
                self.classifier.class_names.len()
            ));
        }
        if matches!(self.occupancy_ttl, Some(ttl) if ttl.is_zero()) {
            self.occupancy_ttl = None;
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_path(value: String) -> Option<PathBuf> {
    if value.trim().is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
