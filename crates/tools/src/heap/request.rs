//! Capture request parameters and their validation.

use heaplens_core::config::{CaptureConfig, MAX_TOP_N};
use heaplens_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Longest allocation tracking window a single request may ask for.
pub const MAX_TRACE_DURATION_MS: u64 = 60_000;

/// Where the raw capture should end up besides the scratch file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    #[default]
    None,
    File,
    Inline,
    Both,
}

impl ExportMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(Self::None),
            "file" => Some(Self::File),
            "inline" => Some(Self::Inline),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    pub fn wants_file(&self) -> bool {
        matches!(self, Self::File | Self::Both)
    }

    pub fn wants_inline(&self) -> bool {
        matches!(self, Self::Inline | Self::Both)
    }
}

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    /// Ranking length; 0 disables ranking while totals are still reported.
    pub top_n: usize,
    pub force_gc: bool,
    pub max_capture_bytes: u64,
    pub max_parse_bytes: u64,
    pub export_mode: ExportMode,
    pub export_path: Option<PathBuf>,
    pub max_inline_bytes: u64,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self::from_config(&CaptureConfig::default())
    }
}

impl CaptureRequest {
    pub fn from_config(cfg: &CaptureConfig) -> Self {
        Self {
            top_n: cfg.top_n.min(MAX_TOP_N),
            force_gc: false,
            max_capture_bytes: cfg.max_capture_bytes,
            max_parse_bytes: cfg.max_parse_bytes,
            export_mode: ExportMode::None,
            export_path: None,
            max_inline_bytes: cfg.max_inline_bytes,
        }
    }

    /// Build a request from tool parameters, falling back to `cfg` defaults.
    pub fn from_params(params: &Value, cfg: &CaptureConfig) -> Result<Self> {
        let mut req = Self::from_config(cfg);

        if let Some(n) = opt_u64(params, "top_n")? {
            req.top_n = (n as usize).min(MAX_TOP_N);
        }
        if let Some(v) = params.get("force_gc").filter(|v| !v.is_null()) {
            req.force_gc = v
                .as_bool()
                .ok_or_else(|| Error::Validation("'force_gc' must be a boolean".into()))?;
        }
        if let Some(n) = opt_budget(params, "max_capture_bytes")? {
            req.max_capture_bytes = n;
        }
        if let Some(n) = opt_budget(params, "max_parse_bytes")? {
            req.max_parse_bytes = n;
        }
        if let Some(n) = opt_budget(params, "max_inline_bytes")? {
            req.max_inline_bytes = n;
        }
        if let Some(mode) = params.get("export_mode").and_then(|v| v.as_str()) {
            req.export_mode = ExportMode::parse(mode).ok_or_else(|| {
                Error::Validation(format!(
                    "Unknown export_mode '{}': expected none, file, inline or both",
                    mode
                ))
            })?;
        }
        if let Some(path) = params.get("export_path").and_then(|v| v.as_str()) {
            if !path.trim().is_empty() {
                req.export_path = Some(PathBuf::from(path));
            }
        }

        Ok(req)
    }
}

/// Allocation tracking window from `duration_ms`, capped at [`MAX_TRACE_DURATION_MS`].
pub fn trace_duration_ms(params: &Value, cfg: &CaptureConfig) -> Result<u64> {
    let ms = opt_u64(params, "duration_ms")?.unwrap_or(cfg.trace_duration_ms);
    Ok(ms.min(MAX_TRACE_DURATION_MS))
}

fn opt_u64(params: &Value, key: &str) -> Result<Option<u64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| {
            Error::Validation(format!("'{}' must be a non-negative integer", key))
        }),
    }
}

fn opt_budget(params: &Value, key: &str) -> Result<Option<u64>> {
    match opt_u64(params, key)? {
        Some(0) => Err(Error::Validation(format!("'{}' must be greater than 0", key))),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let req = CaptureRequest::default();
        assert_eq!(req.top_n, 20);
        assert_eq!(req.max_capture_bytes, 200 * 1024 * 1024);
        assert_eq!(req.max_parse_bytes, 50 * 1024 * 1024);
        assert_eq!(req.max_inline_bytes, 64 * 1024);
        assert_eq!(req.export_mode, ExportMode::None);
        assert!(!req.force_gc);
    }

    #[test]
    fn test_from_params_overrides_and_clamps() {
        let cfg = CaptureConfig::default();
        let req = CaptureRequest::from_params(
            &json!({
                "top_n": 5000,
                "force_gc": true,
                "export_mode": "Both",
                "export_path": "/tmp/out.heapsnapshot",
                "max_inline_bytes": 10
            }),
            &cfg,
        )
        .unwrap();
        assert_eq!(req.top_n, MAX_TOP_N);
        assert!(req.force_gc);
        assert_eq!(req.export_mode, ExportMode::Both);
        assert_eq!(req.export_path, Some(PathBuf::from("/tmp/out.heapsnapshot")));
        assert_eq!(req.max_inline_bytes, 10);
    }

    #[test]
    fn test_from_params_rejects_bad_values() {
        let cfg = CaptureConfig::default();
        assert!(CaptureRequest::from_params(&json!({"export_mode": "disk"}), &cfg).is_err());
        assert!(CaptureRequest::from_params(&json!({"top_n": -1}), &cfg).is_err());
        assert!(CaptureRequest::from_params(&json!({"max_capture_bytes": 0}), &cfg).is_err());
        assert!(CaptureRequest::from_params(&json!({"force_gc": "yes"}), &cfg).is_err());
    }

    #[test]
    fn test_top_n_zero_allowed() {
        let cfg = CaptureConfig::default();
        let req = CaptureRequest::from_params(&json!({"top_n": 0}), &cfg).unwrap();
        assert_eq!(req.top_n, 0);
    }

    #[test]
    fn test_export_mode_destinations() {
        assert!(ExportMode::Both.wants_file() && ExportMode::Both.wants_inline());
        assert!(ExportMode::File.wants_file() && !ExportMode::File.wants_inline());
        assert!(!ExportMode::None.wants_file() && !ExportMode::None.wants_inline());
    }

    #[test]
    fn test_trace_duration_capped() {
        let cfg = CaptureConfig::default();
        assert_eq!(trace_duration_ms(&json!({}), &cfg).unwrap(), 5000);
        assert_eq!(
            trace_duration_ms(&json!({"duration_ms": 600_000}), &cfg).unwrap(),
            MAX_TRACE_DURATION_MS
        );
    }
}
