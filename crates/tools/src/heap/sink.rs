//! Dual-destination sink for streamed capture chunks.
//!
//! Every chunk is accounted against two independent budgets: the capture file
//! (always written, the decoders read from it) and an optional inline preview.
//! File writes go straight to the handle, so `bytes_written_to_file` only ever
//! counts bytes the OS has accepted.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::safe_truncate;

/// A capture file on disk. Removed on drop unless it is kept for export.
#[derive(Debug)]
pub struct CaptureFile {
    path: PathBuf,
    keep: bool,
}

impl CaptureFile {
    /// A private scratch file, deleted once the request finishes.
    pub fn scratch(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    /// A file the caller asked to keep.
    pub fn exported(path: PathBuf) -> Self {
        Self { path, keep: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file even if it was meant to be kept.
    pub fn discard(mut self) {
        self.keep = false;
    }
}

impl Drop for CaptureFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed scratch capture"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove scratch capture"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SinkPolicy {
    pub max_file_bytes: u64,
    /// `None` disables the inline destination entirely.
    pub max_inline_bytes: Option<u64>,
}

/// Final accounting of one capture stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkReport {
    /// Every byte the stream delivered, written or not.
    pub bytes_seen: u64,
    pub bytes_written_to_file: u64,
    pub bytes_buffered_inline: u64,
    pub truncated_file: bool,
    pub truncated_inline: bool,
    pub write_error: Option<String>,
}

pub struct SinkOutput {
    pub report: SinkReport,
    pub inline: Option<String>,
    pub file: CaptureFile,
}

pub struct CaptureSink {
    // Declared before `file` so the handle closes before a scratch file is removed.
    writer: Option<File>,
    file: CaptureFile,
    policy: SinkPolicy,
    inline: Option<String>,
    report: SinkReport,
}

impl CaptureSink {
    /// Create the backing file. Failing here is fatal for the capture.
    pub fn open(file: CaptureFile, policy: SinkPolicy) -> std::io::Result<Self> {
        let handle = File::create(file.path())?;
        Ok(Self {
            writer: Some(handle),
            file,
            policy,
            inline: policy.max_inline_bytes.map(|_| String::new()),
            report: SinkReport::default(),
        })
    }

    pub fn report(&self) -> &SinkReport {
        &self.report
    }

    /// Account one chunk against both destinations, in arrival order.
    pub fn on_chunk(&mut self, chunk: &str) {
        let len = chunk.len() as u64;
        self.report.bytes_seen += len;
        self.write_file(chunk, len);
        self.buffer_inline(chunk);
    }

    fn write_file(&mut self, chunk: &str, len: u64) {
        if self.report.truncated_file {
            return;
        }
        if self.report.bytes_written_to_file + len > self.policy.max_file_bytes {
            self.report.truncated_file = true;
            warn!(
                budget = self.policy.max_file_bytes,
                written = self.report.bytes_written_to_file,
                "Capture exceeded file budget, dropping remaining chunks"
            );
            return;
        }
        let Some(writer) = self.writer.as_mut() else {
            self.report.truncated_file = true;
            return;
        };
        match writer.write_all(chunk.as_bytes()) {
            Ok(()) => self.report.bytes_written_to_file += len,
            Err(e) => self.fail_writes(format!("write to {} failed: {}", self.file.path().display(), e)),
        }
    }

    fn buffer_inline(&mut self, chunk: &str) {
        let (Some(buf), Some(budget)) = (self.inline.as_mut(), self.policy.max_inline_bytes) else {
            return;
        };
        let remaining = budget.saturating_sub(buf.len() as u64) as usize;
        if chunk.len() <= remaining {
            buf.push_str(chunk);
        } else {
            buf.push_str(safe_truncate(chunk, remaining));
            self.report.truncated_inline = true;
        }
        self.report.bytes_buffered_inline = buf.len() as u64;
    }

    fn fail_writes(&mut self, message: String) {
        warn!(error = %message, "Capture file write failed, truncating file destination");
        self.writer = None;
        self.report.truncated_file = true;
        if self.report.write_error.is_none() {
            self.report.write_error = Some(message);
        }
    }

    /// Sync and close the file, returning the final accounting.
    pub fn finalize(mut self) -> SinkOutput {
        if let Some(handle) = self.writer.take() {
            if let Err(e) = handle.sync_all() {
                debug!(error = %e, "sync_all on capture file failed");
            }
        }
        let CaptureSink {
            file,
            inline,
            report,
            ..
        } = self;
        SinkOutput { report, inline, file }
    }

    /// Throw the capture away, file included.
    pub fn abort(mut self) {
        self.writer = None;
        let CaptureSink { file, .. } = self;
        file.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, max_file: u64, max_inline: Option<u64>) -> CaptureSink {
        let file = CaptureFile::scratch(dir.path().join("cap.heapsnapshot"));
        CaptureSink::open(
            file,
            SinkPolicy {
                max_file_bytes: max_file,
                max_inline_bytes: max_inline,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_within_budget_writes_everything() {
        let dir = TempDir::new().unwrap();
        let mut sink = open(&dir, 100, Some(100));
        sink.on_chunk("{\"a\":");
        sink.on_chunk("1}");
        let out = sink.finalize();
        assert_eq!(out.report.bytes_written_to_file, 7);
        assert!(!out.report.truncated_file);
        assert!(!out.report.truncated_inline);
        assert_eq!(out.inline.as_deref(), Some("{\"a\":1}"));
        assert_eq!(std::fs::read_to_string(out.file.path()).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_file_budget_drops_first_overflowing_chunk_and_rest() {
        let dir = TempDir::new().unwrap();
        let mut sink = open(&dir, 10, None);
        sink.on_chunk("12345678");
        sink.on_chunk("abc"); // would reach 11
        sink.on_chunk("z"); // would fit, but truncation is sticky
        let out = sink.finalize();
        assert!(out.report.truncated_file);
        assert_eq!(out.report.bytes_written_to_file, 8);
        assert_eq!(out.report.bytes_seen, 12);
        let on_disk = std::fs::metadata(out.file.path()).unwrap().len();
        assert!(on_disk <= 10);
        assert!(out.inline.is_none());
    }

    #[test]
    fn test_inline_budget_slices_chunk() {
        let dir = TempDir::new().unwrap();
        let mut sink = open(&dir, 1000, Some(5));
        sink.on_chunk("abc");
        sink.on_chunk("defgh");
        sink.on_chunk("ij");
        let out = sink.finalize();
        assert_eq!(out.inline.as_deref(), Some("abcde"));
        assert!(out.report.truncated_inline);
        assert!(!out.report.truncated_file);
        assert_eq!(out.report.bytes_buffered_inline, 5);
    }

    #[test]
    fn test_inline_slice_respects_char_boundary() {
        let dir = TempDir::new().unwrap();
        let mut sink = open(&dir, 1000, Some(2));
        sink.on_chunk("aé");
        let out = sink.finalize();
        assert_eq!(out.inline.as_deref(), Some("a"));
        assert!(out.report.truncated_inline);
    }

    #[test]
    fn test_budgets_are_independent() {
        let dir = TempDir::new().unwrap();
        let mut sink = open(&dir, 4, Some(100));
        sink.on_chunk("abcdef");
        let out = sink.finalize();
        assert!(out.report.truncated_file);
        assert!(!out.report.truncated_inline);
        assert_eq!(out.inline.as_deref(), Some("abcdef"));
    }

    #[test]
    fn test_scratch_file_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let mut sink = open(&dir, 100, None);
        sink.on_chunk("data");
        let out = sink.finalize();
        let path = out.file.path().to_path_buf();
        assert!(path.exists());
        drop(out);
        assert!(!path.exists());
    }

    #[test]
    fn test_exported_file_kept_and_abort_discards() {
        let dir = TempDir::new().unwrap();
        let kept = dir.path().join("kept.heapsnapshot");
        let sink = CaptureSink::open(
            CaptureFile::exported(kept.clone()),
            SinkPolicy {
                max_file_bytes: 100,
                max_inline_bytes: None,
            },
        )
        .unwrap();
        drop(sink.finalize());
        assert!(kept.exists());

        let aborted = dir.path().join("aborted.heapsnapshot");
        let mut sink = CaptureSink::open(
            CaptureFile::exported(aborted.clone()),
            SinkPolicy {
                max_file_bytes: 100,
                max_inline_bytes: None,
            },
        )
        .unwrap();
        sink.on_chunk("partial");
        sink.abort();
        assert!(!aborted.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_write_failure_truncates_file_destination() {
        let sink_file = CaptureFile::exported(PathBuf::from("/dev/full"));
        let mut sink = CaptureSink::open(
            sink_file,
            SinkPolicy {
                max_file_bytes: 100,
                max_inline_bytes: Some(100),
            },
        )
        .unwrap();
        sink.on_chunk("hello");
        assert!(sink.report().truncated_file);
        sink.on_chunk("world");
        let out = sink.finalize();
        assert_eq!(out.report.bytes_written_to_file, 0);
        assert_eq!(out.report.bytes_seen, 10);
        assert!(out.report.truncated_file);
        let err = out.report.write_error.as_deref().unwrap();
        assert!(err.contains("/dev/full"));
        // The inline destination is unaffected.
        assert_eq!(out.inline.as_deref(), Some("helloworld"));
        assert!(!out.report.truncated_inline);
    }

    #[test]
    fn test_open_fails_for_missing_directory() {
        let dir = TempDir::new().unwrap();
        let file = CaptureFile::scratch(dir.path().join("missing").join("cap.json"));
        let result = CaptureSink::open(
            file,
            SinkPolicy {
                max_file_bytes: 10,
                max_inline_bytes: None,
            },
        );
        assert!(result.is_err());
    }
}
