//! Heap capture and analysis engine.
//!
//! - Capture: drive V8 heap instrumentation through a [`HeapTarget`], stream
//!   the document into a budgeted [`CaptureSink`]
//! - Decode: summarize object graphs and allocation trees from the file on disk
//! - Tools: expose captures, memory sampling and offline analysis to callers

pub mod capture;
pub mod document;
pub mod graph;
pub mod issue;
pub mod request;
pub mod sink;
pub mod target;
pub mod tool;
pub mod trace;

pub use capture::{analyze_file, CaptureEngine, CaptureKind, CaptureReport};
pub use issue::CaptureIssue;
pub use request::{CaptureRequest, ExportMode};
pub use sink::{CaptureFile, CaptureSink, SinkPolicy};
pub use target::HeapTarget;
pub use tool::{AllocationTraceTool, HeapAnalyzeTool, HeapSnapshotTool, MemoryUsageTool};
