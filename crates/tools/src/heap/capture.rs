//! Capture orchestration: instrument, stream into the sink, gate and decode,
//! then tear everything down regardless of how the earlier steps went.

use chrono::Utc;
use heaplens_core::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::document::CaptureDecoder;
use super::graph::{ObjectGraphDecoder, ObjectGraphSummary};
use super::issue::CaptureIssue;
use super::request::{CaptureRequest, ExportMode};
use super::sink::{CaptureFile, CaptureSink, SinkOutput, SinkPolicy};
use super::target::{HeapTarget, MemoryUsage, PageHeapStats};
use super::trace::{AllocationTraceDecoder, AllocationTraceSummary};

/// What a capture holds, and therefore which decoder reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    ObjectGraph,
    AllocationTrace,
}

impl CaptureKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "object_graph" | "snapshot" | "heap_snapshot" => Some(Self::ObjectGraph),
            "allocation_trace" | "trace" => Some(Self::AllocationTrace),
            _ => None,
        }
    }

    fn file_prefix(&self) -> &'static str {
        match self {
            Self::ObjectGraph => "heap",
            Self::AllocationTrace => "alloc",
        }
    }
}

/// Per-request lifecycle, logged at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    Idle,
    Instrumenting,
    Capturing,
    ParseGate,
    Parsed,
    ParseSkipped,
    ParseFailed,
    Finalized,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSummary {
    pub parsed: bool,
    #[serde(flatten)]
    pub object_graph: Option<ObjectGraphSummary>,
    #[serde(flatten)]
    pub allocation_trace: Option<AllocationTraceSummary>,
}

impl CaptureSummary {
    fn unparsed() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub mode: ExportMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_bytes: Option<u64>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_inline_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<MemoryUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<PageHeapStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureReport {
    pub timestamp: String,
    pub kind: CaptureKind,
    /// Total bytes the browser streamed, whether or not they were kept.
    pub captured_bytes: u64,
    pub summary: CaptureSummary,
    pub export: ExportResult,
    pub limitations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySample>,
}

/// Result of decoding a capture file that is already on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub kind: CaptureKind,
    pub file_path: String,
    pub file_bytes: u64,
    pub summary: CaptureSummary,
    pub limitations: Vec<String>,
}

pub struct CaptureEngine {
    output_dir: PathBuf,
}

impl CaptureEngine {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Point-in-time object graph capture.
    pub async fn capture_snapshot(
        &self,
        target: &dyn HeapTarget,
        req: &CaptureRequest,
        cancel: &CancellationToken,
    ) -> Result<CaptureReport> {
        self.run(target, req, CaptureKind::ObjectGraph, Duration::ZERO, cancel)
            .await
    }

    /// Time-boxed allocation tracking capture.
    pub async fn capture_allocation_trace(
        &self,
        target: &dyn HeapTarget,
        req: &CaptureRequest,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<CaptureReport> {
        self.run(target, req, CaptureKind::AllocationTrace, duration, cancel)
            .await
    }

    async fn run(
        &self,
        target: &dyn HeapTarget,
        req: &CaptureRequest,
        kind: CaptureKind,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<CaptureReport> {
        let mut phase = CapturePhase::Idle;
        let mut limitations = Vec::new();
        let memory = sample_memory(target).await;

        advance(&mut phase, CapturePhase::Instrumenting, kind);
        if let Err(e) = target.enable_instrumentation().await {
            limitations.push(
                CaptureIssue::InstrumentationUnavailable(format!("enabling heap profiler: {}", e))
                    .to_string(),
            );
        }
        if req.force_gc {
            if let Err(e) = target.collect_garbage().await {
                debug!(error = %e, "Forced garbage collection unsupported, continuing");
            }
        }

        let outcome = self
            .capture_and_parse(target, req, kind, duration, cancel, &mut phase, &mut limitations)
            .await;

        // Released on every path, including failures and cancellation.
        if let Err(e) = target.disable_instrumentation().await {
            limitations.push(
                CaptureIssue::InstrumentationUnavailable(format!("disabling heap profiler: {}", e))
                    .to_string(),
            );
        }
        advance(&mut phase, CapturePhase::Finalized, kind);

        let (summary, export, captured_bytes) = outcome?;
        Ok(CaptureReport {
            timestamp: Utc::now().to_rfc3339(),
            kind,
            captured_bytes,
            summary,
            export,
            limitations,
            memory,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn capture_and_parse(
        &self,
        target: &dyn HeapTarget,
        req: &CaptureRequest,
        kind: CaptureKind,
        duration: Duration,
        cancel: &CancellationToken,
        phase: &mut CapturePhase,
        limitations: &mut Vec<String>,
    ) -> Result<(CaptureSummary, ExportResult, u64)> {
        advance(phase, CapturePhase::Capturing, kind);

        if kind == CaptureKind::AllocationTrace {
            target.start_tracking().await?;
            info!(duration_ms = duration.as_millis() as u64, "Allocation tracking started");
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(duration) => false,
                _ = cancel.cancelled() => true,
            };
            if cancelled {
                // Stop tracking so the browser drops its tracking state; the payload is discarded.
                if let Err(e) = target.stop_tracking(&mut |_: &str| {}).await {
                    warn!(error = %e, "Failed to stop allocation tracking after cancellation");
                }
                return Err(Error::Cancelled("allocation trace aborted by caller".into()));
            }
        }

        let mut sink = self.open_sink(req, kind)?;
        let streamed = {
            let mut on_chunk = |chunk: &str| sink.on_chunk(chunk);
            let stream = async {
                match kind {
                    CaptureKind::ObjectGraph => target.stream_snapshot(&mut on_chunk).await,
                    CaptureKind::AllocationTrace => target.stop_tracking(&mut on_chunk).await,
                }
            };
            tokio::select! {
                result = stream => Some(result),
                _ = cancel.cancelled() => None,
            }
        };

        match streamed {
            None => {
                sink.abort();
                if kind == CaptureKind::AllocationTrace {
                    if let Err(e) = target.stop_tracking(&mut |_: &str| {}).await {
                        warn!(error = %e, "Failed to stop allocation tracking after cancellation");
                    }
                }
                return Err(Error::Cancelled("capture aborted by caller".into()));
            }
            Some(Err(e)) if sink.report().bytes_seen == 0 => {
                sink.abort();
                return Err(e);
            }
            Some(Err(e)) => {
                // Partial payload: keep what arrived but never trust it for parsing.
                warn!(error = %e, bytes = sink.report().bytes_seen, "Capture stream ended with an error");
                limitations.push(
                    CaptureIssue::malformed(format!("capture stream ended early: {}", e)).to_string(),
                );
                let output = sink.finalize();
                let export = build_export(req, &output, limitations);
                let captured = output.report.bytes_seen;
                advance(phase, CapturePhase::ParseSkipped, kind);
                return Ok((CaptureSummary::unparsed(), export, captured));
            }
            Some(Ok(())) => {}
        }

        let output = sink.finalize();
        info!(
            bytes = output.report.bytes_seen,
            written = output.report.bytes_written_to_file,
            truncated = output.report.truncated_file,
            "Capture streamed"
        );

        advance(phase, CapturePhase::ParseGate, kind);
        let summary = if let Some(err) = &output.report.write_error {
            limitations.push(CaptureIssue::SinkIoFailure(err.clone()).to_string());
            advance(phase, CapturePhase::ParseSkipped, kind);
            CaptureSummary::unparsed()
        } else if output.report.truncated_file {
            limitations.push(
                CaptureIssue::CaptureTruncated {
                    seen: output.report.bytes_seen,
                    written: output.report.bytes_written_to_file,
                    budget: req.max_capture_bytes,
                }
                .to_string(),
            );
            advance(phase, CapturePhase::ParseSkipped, kind);
            CaptureSummary::unparsed()
        } else {
            // File read and decode run off the async workers.
            let path = output.file.path().to_path_buf();
            let (top_n, budget) = (req.top_n, req.max_parse_bytes);
            let decoded = tokio::task::spawn_blocking(move || {
                let mut issues = Vec::new();
                let summary = parse_capture_file(&path, kind, top_n, budget, &mut issues);
                (summary, issues)
            })
            .await;
            let summary = match decoded {
                Ok((summary, issues)) => {
                    limitations.extend(issues);
                    summary
                }
                Err(e) => {
                    warn!(error = %e, "Capture decode task failed");
                    limitations.push(CaptureIssue::malformed(format!("decode task failed: {}", e)).to_string());
                    CaptureSummary::unparsed()
                }
            };
            let next = if summary.parsed {
                CapturePhase::Parsed
            } else {
                CapturePhase::ParseFailed
            };
            advance(phase, next, kind);
            summary
        };

        let export = build_export(req, &output, limitations);
        Ok((summary, export, output.report.bytes_seen))
    }

    fn open_sink(&self, req: &CaptureRequest, kind: CaptureKind) -> Result<CaptureSink> {
        let path = match (&req.export_path, req.export_mode.wants_file()) {
            (Some(path), true) => path.clone(),
            _ => {
                std::fs::create_dir_all(&self.output_dir)?;
                self.output_dir.join(capture_file_name(kind))
            }
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = if req.export_mode.wants_file() {
            CaptureFile::exported(path)
        } else {
            CaptureFile::scratch(path)
        };
        let policy = SinkPolicy {
            max_file_bytes: req.max_capture_bytes,
            max_inline_bytes: req
                .export_mode
                .wants_inline()
                .then_some(req.max_inline_bytes),
        };
        debug!(path = %file.path().display(), "Opening capture sink");
        Ok(CaptureSink::open(file, policy)?)
    }
}

/// Decode a capture file already on disk, applying the same parse budget.
pub fn analyze_file(
    path: &Path,
    kind: CaptureKind,
    top_n: usize,
    max_parse_bytes: u64,
) -> Result<AnalysisReport> {
    let file_bytes = std::fs::metadata(path)
        .map_err(|e| Error::NotFound(format!("{}: {}", path.display(), e)))?
        .len();
    let mut limitations = Vec::new();
    let summary = parse_capture_file(path, kind, top_n, max_parse_bytes, &mut limitations);
    Ok(AnalysisReport {
        kind,
        file_path: path.display().to_string(),
        file_bytes,
        summary,
        limitations,
    })
}

/// Parse gate plus decode. Every problem becomes a limitation, never an error.
fn parse_capture_file(
    path: &Path,
    kind: CaptureKind,
    top_n: usize,
    max_parse_bytes: u64,
    limitations: &mut Vec<String>,
) -> CaptureSummary {
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) => {
            limitations.push(CaptureIssue::SinkIoFailure(format!("stat {}: {}", path.display(), e)).to_string());
            return CaptureSummary::unparsed();
        }
    };
    if size > max_parse_bytes {
        limitations.push(
            CaptureIssue::ParseBudgetExceeded {
                size,
                budget: max_parse_bytes,
            }
            .to_string(),
        );
        return CaptureSummary::unparsed();
    }

    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            limitations.push(CaptureIssue::SinkIoFailure(format!("read {}: {}", path.display(), e)).to_string());
            return CaptureSummary::unparsed();
        }
    };

    let decoded = match kind {
        CaptureKind::ObjectGraph => ObjectGraphDecoder.decode(&text, top_n).map(|s| CaptureSummary {
            parsed: true,
            object_graph: Some(s),
            allocation_trace: None,
        }),
        CaptureKind::AllocationTrace => {
            AllocationTraceDecoder.decode(&text, top_n).map(|s| CaptureSummary {
                parsed: true,
                object_graph: None,
                allocation_trace: Some(s),
            })
        }
    };

    decoded.unwrap_or_else(|issue| {
        warn!(error = %issue, "Capture decode failed");
        limitations.push(issue.to_string());
        CaptureSummary::unparsed()
    })
}

fn build_export(req: &CaptureRequest, output: &SinkOutput, limitations: &mut Vec<String>) -> ExportResult {
    let mode = req.export_mode;
    let report = &output.report;
    let mut export = ExportResult {
        mode,
        file_path: None,
        file_bytes: None,
        inline_payload: None,
        inline_bytes: None,
        truncated: false,
        max_inline_bytes: None,
    };

    if mode.wants_file() {
        export.file_path = Some(output.file.path().display().to_string());
        export.file_bytes = Some(report.bytes_written_to_file);
        export.truncated |= report.truncated_file;
    }
    if mode.wants_inline() {
        export.inline_payload = output.inline.clone();
        export.inline_bytes = Some(report.bytes_buffered_inline);
        export.max_inline_bytes = Some(req.max_inline_bytes);
        export.truncated |= report.truncated_inline;
        if report.truncated_inline {
            limitations.push(format!(
                "Inline payload truncated to {} of {} bytes (maxInlineBytes {})",
                report.bytes_buffered_inline, report.bytes_seen, req.max_inline_bytes
            ));
        }
    }
    export
}

async fn sample_memory(target: &dyn HeapTarget) -> Option<MemorySample> {
    let runtime = target.runtime_memory_usage().await.ok();
    let page = target.page_heap_stats().await.ok().flatten();
    if runtime.is_none() && page.is_none() {
        return None;
    }
    Some(MemorySample { runtime, page })
}

fn capture_file_name(kind: CaptureKind) -> String {
    format!(
        "{}-{}-{}.heapsnapshot",
        kind.file_prefix(),
        Utc::now().format("%Y%m%dT%H%M%S"),
        uuid::Uuid::new_v4().simple()
    )
}

fn advance(phase: &mut CapturePhase, next: CapturePhase, kind: CaptureKind) {
    debug!(kind = ?kind, from = ?*phase, to = ?next, "Capture phase");
    *phase = next;
}
