use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::paths::Paths;

pub const MIB: u64 = 1024 * 1024;

/// Hard upper bound for any ranking length.
pub const MAX_TOP_N: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_max_capture_bytes")]
    pub max_capture_bytes: u64,
    #[serde(default = "default_max_parse_bytes")]
    pub max_parse_bytes: u64,
    #[serde(default = "default_max_inline_bytes")]
    pub max_inline_bytes: u64,
    /// Default allocation tracking window.
    #[serde(default = "default_trace_duration_ms")]
    pub trace_duration_ms: u64,
    /// Where scratch and exported captures go. Defaults to `<workspace>/captures`.
    #[serde(default)]
    pub output_dir: Option<String>,
}

fn default_top_n() -> usize {
    20
}

fn default_max_capture_bytes() -> u64 {
    200 * MIB
}

fn default_max_parse_bytes() -> u64 {
    50 * MIB
}

fn default_max_inline_bytes() -> u64 {
    64 * 1024
}

fn default_trace_duration_ms() -> u64 {
    5000
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            max_capture_bytes: default_max_capture_bytes(),
            max_parse_bytes: default_max_parse_bytes(),
            max_inline_bytes: default_max_inline_bytes(),
            trace_duration_ms: default_trace_duration_ms(),
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    /// Attach to an already running browser on this remote debugging port
    /// instead of launching one.
    #[serde(default)]
    pub debug_port: Option<u16>,
    #[serde(default)]
    pub headed: bool,
    /// Explicit browser binary; auto-detected when unset.
    #[serde(default)]
    pub executable: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolve the capture directory, expanding a leading `~`.
    pub fn captures_dir(&self, paths: &Paths) -> PathBuf {
        match self.capture.output_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => expand_home(dir),
            _ => paths.captures_dir(),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_budgets() {
        let cfg = Config::default();
        assert_eq!(cfg.capture.top_n, 20);
        assert_eq!(cfg.capture.max_capture_bytes, 200 * MIB);
        assert_eq!(cfg.capture.max_parse_bytes, 50 * MIB);
        assert_eq!(cfg.capture.max_inline_bytes, 65536);
        assert!(cfg.browser.debug_port.is_none());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let raw = r#"{
  "capture": { "topN": 5, "outputDir": "/var/tmp/caps" },
  "browser": { "debugPort": 9222 }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.capture.top_n, 5);
        assert_eq!(cfg.capture.max_parse_bytes, 50 * MIB);
        assert_eq!(cfg.browser.debug_port, Some(9222));
        let paths = Paths::with_base(PathBuf::from("/tmp/hl"));
        assert_eq!(cfg.captures_dir(&paths), PathBuf::from("/var/tmp/caps"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = Config::default();
        cfg.browser.headed = true;
        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert!(loaded.browser.headed);
    }
}
