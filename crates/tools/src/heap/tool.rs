//! Heap tools: captures and memory sampling against a browser session, plus
//! offline analysis of exported capture files.

use async_trait::async_trait;
use chrono::Utc;
use heaplens_core::config::MAX_TOP_N;
use heaplens_core::{Error, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::capture::{analyze_file, CaptureEngine, CaptureKind};
use super::request::{trace_duration_ms, CaptureRequest, MAX_TRACE_DURATION_MS};
use super::target::HeapTarget;
use crate::browser::{BrowserSession, SessionManager};
use crate::{Tool, ToolContext, ToolSchema};

const NAVIGATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Global session manager (daemon model: persists across tool calls).
static SESSION_MANAGER: once_cell::sync::Lazy<Arc<Mutex<Option<SessionManager>>>> =
    once_cell::sync::Lazy::new(|| Arc::new(Mutex::new(None)));

/// Resolve the named session, launching or attaching on first use.
///
/// The manager lock is held only while the session is looked up, so waits on
/// one session never block calls against another.
async fn open_session(ctx: &ToolContext, params: &Value) -> Result<Arc<BrowserSession>> {
    let name = params["session"].as_str().unwrap_or("default");
    let mut guard = SESSION_MANAGER.lock().await;
    let mgr = guard.get_or_insert_with(|| SessionManager::new(ctx.paths.browser_dir()));
    let session = mgr
        .get_or_create(name, &ctx.config.browser)
        .await
        .map_err(|e| Error::Session(format!("session '{}': {}", name, e)))?;
    drop(guard);

    if let Some(url) = params["url"].as_str().filter(|u| !u.is_empty()) {
        info!(session = name, url = url, "Navigating before capture");
        session
            .cdp
            .navigate(url, NAVIGATE_TIMEOUT)
            .await
            .map_err(|e| Error::Session(format!("navigate to {}: {}", url, e)))?;
    }
    Ok(session)
}

/// Close every browser session this process owns. Attached browsers keep running.
pub async fn shutdown_sessions() {
    let mut guard = SESSION_MANAGER.lock().await;
    if let Some(mgr) = guard.as_mut() {
        mgr.close_all().await;
    }
    *guard = None;
}

fn session_properties() -> Value {
    json!({
        "session": {
            "type": "string",
            "description": "Browser session name (default: 'default'). Sessions persist between calls."
        },
        "url": {
            "type": "string",
            "description": "Optional URL to load (waits for the load event) before capturing"
        }
    })
}

fn capture_properties() -> Value {
    json!({
        "top_n": {
            "type": "integer",
            "description": format!("Ranking length (default 20, capped at {}; 0 reports totals only)", MAX_TOP_N)
        },
        "force_gc": {
            "type": "boolean",
            "description": "Request a garbage collection before capturing (best effort)"
        },
        "max_capture_bytes": {
            "type": "integer",
            "description": "Capture file budget in bytes (default 200 MiB). Larger captures are truncated and not parsed."
        },
        "max_parse_bytes": {
            "type": "integer",
            "description": "Largest capture file that is parsed (default 50 MiB)"
        },
        "export_mode": {
            "type": "string",
            "enum": ["none", "file", "inline", "both"],
            "description": "'file' keeps the raw capture on disk, 'inline' returns a bounded prefix in the result"
        },
        "export_path": {
            "type": "string",
            "description": "Destination for file export (default: a unique file in the captures directory)"
        },
        "max_inline_bytes": {
            "type": "integer",
            "description": "Inline payload budget in bytes (default 64 KiB)"
        }
    })
}

fn merge(parts: &[Value]) -> Value {
    let mut merged = serde_json::Map::new();
    for part in parts {
        if let Some(obj) = part.as_object() {
            merged.extend(obj.clone());
        }
    }
    Value::Object(merged)
}

fn validate_common(params: &Value) -> Result<()> {
    for key in ["session", "url", "export_mode", "export_path"] {
        if let Some(v) = params.get(key).filter(|v| !v.is_null()) {
            if !v.is_string() {
                return Err(Error::Validation(format!("'{}' must be a string", key)));
            }
        }
    }
    // Full parse of numeric and enum parameters against default budgets.
    CaptureRequest::from_params(params, &Default::default()).map(|_| ())
}

pub struct HeapSnapshotTool;

#[async_trait]
impl Tool for HeapSnapshotTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "heap_snapshot",
            description: "Capture a V8 heap snapshot of a browser page and summarize it: total nodes and self size, the largest constructors and the largest individual objects. Raw capture can be exported to a file and/or inline within byte budgets; problems are reported in 'limitations'.",
            parameters: json!({
                "type": "object",
                "properties": merge(&[session_properties(), capture_properties()]),
                "required": []
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        validate_common(params)
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value> {
        let req = CaptureRequest::from_params(&params, &ctx.config.capture)?;
        let session = open_session(&ctx, &params).await?;
        let _capture = session.capture_lock.lock().await;

        let engine = CaptureEngine::new(ctx.captures_dir());
        let report = engine.capture_snapshot(&session.cdp, &req, &ctx.cancel).await?;
        debug!(session = %session.name, limitations = report.limitations.len(), "Heap snapshot done");
        Ok(serde_json::to_value(report)?)
    }
}

pub struct AllocationTraceTool;

#[async_trait]
impl Tool for AllocationTraceTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "allocation_trace",
            description: "Track allocations on a browser page for a time window and report the call stacks that allocated the most bytes. Accepts the same budgets and export options as heap_snapshot.",
            parameters: json!({
                "type": "object",
                "properties": merge(&[
                    session_properties(),
                    capture_properties(),
                    json!({
                        "duration_ms": {
                            "type": "integer",
                            "description": format!("Tracking window in milliseconds (default 5000, max {})", MAX_TRACE_DURATION_MS)
                        }
                    }),
                ]),
                "required": []
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        validate_common(params)?;
        trace_duration_ms(params, &Default::default()).map(|_| ())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value> {
        let req = CaptureRequest::from_params(&params, &ctx.config.capture)?;
        let duration = Duration::from_millis(trace_duration_ms(&params, &ctx.config.capture)?);
        let session = open_session(&ctx, &params).await?;
        let _capture = session.capture_lock.lock().await;

        let engine = CaptureEngine::new(ctx.captures_dir());
        let report = engine
            .capture_allocation_trace(&session.cdp, &req, duration, &ctx.cancel)
            .await?;
        Ok(serde_json::to_value(report)?)
    }
}

pub struct MemoryUsageTool;

#[async_trait]
impl Tool for MemoryUsageTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "memory_usage",
            description: "Sample JavaScript heap usage of a browser page: runtime used/total bytes and, where the page exposes them, performance.memory statistics.",
            parameters: json!({
                "type": "object",
                "properties": session_properties(),
                "required": []
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        for key in ["session", "url"] {
            if params.get(key).is_some_and(|v| !v.is_null() && !v.is_string()) {
                return Err(Error::Validation(format!("'{}' must be a string", key)));
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value> {
        let session = open_session(&ctx, &params).await?;
        let target: &dyn HeapTarget = &session.cdp;
        let runtime = target.runtime_memory_usage().await?;
        let page = match target.page_heap_stats().await {
            Ok(page) => page,
            Err(e) => {
                debug!(error = %e, "performance.memory unavailable");
                None
            }
        };
        Ok(json!({
            "timestamp": Utc::now().to_rfc3339(),
            "session": session.name,
            "debugPort": session.debug_port,
            "runtime": runtime,
            "page": page,
        }))
    }
}

pub struct HeapAnalyzeTool;

#[async_trait]
impl Tool for HeapAnalyzeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "heap_analyze",
            description: "Summarize a heap capture file that is already on disk (for example one exported by heap_snapshot or allocation_trace). No browser is needed.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Capture file to decode"
                    },
                    "kind": {
                        "type": "string",
                        "enum": ["object_graph", "allocation_trace"],
                        "description": "How to read the file (default: object_graph)"
                    },
                    "top_n": {
                        "type": "integer",
                        "description": format!("Ranking length (default 20, capped at {})", MAX_TOP_N)
                    },
                    "max_parse_bytes": {
                        "type": "integer",
                        "description": "Largest file that is parsed (default 50 MiB)"
                    }
                },
                "required": ["path"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        if params["path"].as_str().map_or(true, |p| p.trim().is_empty()) {
            return Err(Error::Validation("Missing required parameter: path".into()));
        }
        parse_kind(params)?;
        CaptureRequest::from_params(params, &Default::default()).map(|_| ())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value> {
        let path = PathBuf::from(params["path"].as_str().unwrap_or_default());
        let path = if path.is_relative() {
            ctx.workspace.join(path)
        } else {
            path
        };
        let kind = parse_kind(&params)?;
        let req = CaptureRequest::from_params(&params, &ctx.config.capture)?;
        let report = tokio::task::spawn_blocking(move || {
            analyze_file(&path, kind, req.top_n, req.max_parse_bytes)
        })
        .await
        .map_err(|e| Error::Other(format!("analysis task failed: {}", e)))??;
        Ok(serde_json::to_value(report)?)
    }
}

fn parse_kind(params: &Value) -> Result<CaptureKind> {
    match params["kind"].as_str() {
        None => Ok(CaptureKind::ObjectGraph),
        Some(kind) => CaptureKind::parse(kind).ok_or_else(|| {
            Error::Validation(format!(
                "Unknown kind '{}': expected object_graph or allocation_trace",
                kind
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heaplens_core::{Config, Paths};
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> ToolContext {
        ToolContext::new(Paths::with_base(dir.path().to_path_buf()), Config::default())
    }

    #[test]
    fn test_schemas() {
        assert_eq!(HeapSnapshotTool.schema().name, "heap_snapshot");
        assert_eq!(AllocationTraceTool.schema().name, "allocation_trace");
        assert_eq!(MemoryUsageTool.schema().name, "memory_usage");
        assert_eq!(HeapAnalyzeTool.schema().name, "heap_analyze");

        let params = AllocationTraceTool.schema().parameters;
        assert!(params["properties"]["duration_ms"].is_object());
        assert!(params["properties"]["export_mode"].is_object());
        assert!(params["properties"]["session"].is_object());
    }

    #[test]
    fn test_validate_capture_params() {
        assert!(HeapSnapshotTool.validate(&json!({})).is_ok());
        assert!(HeapSnapshotTool
            .validate(&json!({"export_mode": "both", "top_n": 500}))
            .is_ok());
        assert!(HeapSnapshotTool.validate(&json!({"export_mode": "zip"})).is_err());
        assert!(HeapSnapshotTool.validate(&json!({"max_capture_bytes": 0})).is_err());
        assert!(HeapSnapshotTool.validate(&json!({"url": 5})).is_err());
        assert!(AllocationTraceTool.validate(&json!({"duration_ms": -1})).is_err());
        assert!(AllocationTraceTool.validate(&json!({"duration_ms": 999999})).is_ok());
        assert!(MemoryUsageTool.validate(&json!({"session": "a"})).is_ok());
        assert!(MemoryUsageTool.validate(&json!({"session": 1})).is_err());
    }

    #[test]
    fn test_validate_analyze_params() {
        assert!(HeapAnalyzeTool.validate(&json!({})).is_err());
        assert!(HeapAnalyzeTool.validate(&json!({"path": "  "})).is_err());
        assert!(HeapAnalyzeTool.validate(&json!({"path": "a.heapsnapshot"})).is_ok());
        assert!(HeapAnalyzeTool
            .validate(&json!({"path": "a", "kind": "trace"}))
            .is_ok());
        assert!(HeapAnalyzeTool
            .validate(&json!({"path": "a", "kind": "flamegraph"}))
            .is_err());
    }

    #[tokio::test]
    async fn test_analyze_relative_path_in_workspace() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        std::fs::create_dir_all(&ctx.workspace).unwrap();
        let document = json!({
            "snapshot": {"meta": {"node_fields": ["type", "name", "self_size"], "node_types": [["object"]]}},
            "nodes": [0, 0, 40, 0, 1, 2],
            "strings": ["Big", "Small"]
        });
        std::fs::write(ctx.workspace.join("saved.heapsnapshot"), document.to_string()).unwrap();

        let result = HeapAnalyzeTool
            .execute(ctx, json!({"path": "saved.heapsnapshot", "top_n": 1}))
            .await
            .unwrap();
        assert_eq!(result["kind"], "object_graph");
        assert_eq!(result["summary"]["parsed"], true);
        assert_eq!(result["summary"]["totalSelfSizeBytes"], 42);
        assert_eq!(result["summary"]["topConstructors"][0]["name"], "Big");
        assert_eq!(result["summary"]["topNodes"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_analyze_over_parse_budget() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let path = dir.path().join("big.heapsnapshot");
        std::fs::write(&path, "x".repeat(64)).unwrap();

        let result = HeapAnalyzeTool
            .execute(
                ctx,
                json!({"path": path.to_string_lossy(), "max_parse_bytes": 16}),
            )
            .await
            .unwrap();
        assert_eq!(result["summary"]["parsed"], false);
        assert!(result["limitations"][0]
            .as_str()
            .unwrap()
            .contains("maxParseBytes 16"));
    }

    #[tokio::test]
    async fn test_analyze_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = HeapAnalyzeTool
            .execute(context(&dir), json!({"path": "/nonexistent/capture.heapsnapshot"}))
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
