pub mod browser;
pub mod heap;
pub mod registry;

use async_trait::async_trait;
use heaplens_core::{Config, Paths, Result};
use serde_json::Value;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

pub use registry::ToolRegistry;

/// Truncate a string to at most `max_bytes` bytes, respecting UTF-8 char boundaries.
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    // Find the last valid char boundary at or before max_bytes
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[derive(Clone)]
pub struct ToolContext {
    pub workspace: PathBuf,
    pub paths: Paths,
    pub config: Config,
    /// Fired when the caller goes away; long-running tools tear down and bail.
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(paths: Paths, config: Config) -> Self {
        Self {
            workspace: paths.workspace(),
            paths,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Directory that receives scratch and exported captures.
    pub fn captures_dir(&self) -> PathBuf {
        self.config.captures_dir(&self.paths)
    }
}

pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    fn validate(&self, params: &Value) -> Result<()>;
    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_truncate_ascii() {
        assert_eq!(safe_truncate("abcdef", 3), "abc");
        assert_eq!(safe_truncate("abc", 10), "abc");
    }

    #[test]
    fn test_safe_truncate_multibyte() {
        // "é" is two bytes; cutting inside it backs off to the previous boundary
        let s = "aé";
        assert_eq!(safe_truncate(s, 2), "a");
        assert_eq!(safe_truncate(s, 3), "aé");
    }
}
