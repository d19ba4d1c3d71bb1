use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".heaplens"))
            .unwrap_or_else(|| PathBuf::from(".heaplens"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn workspace(&self) -> PathBuf {
        self.base.join("workspace")
    }

    /// Default directory for scratch and exported captures.
    pub fn captures_dir(&self) -> PathBuf {
        self.workspace().join("captures")
    }

    /// Root of per-session browser profiles.
    pub fn browser_dir(&self) -> PathBuf {
        self.workspace().join("browser")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.workspace())?;
        std::fs::create_dir_all(self.captures_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_layout() {
        let paths = Paths::with_base(PathBuf::from("/tmp/hl"));
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/hl/config.json"));
        assert_eq!(
            paths.captures_dir(),
            PathBuf::from("/tmp/hl/workspace/captures")
        );
        assert_eq!(paths.browser_dir(), PathBuf::from("/tmp/hl/workspace/browser"));
    }
}
