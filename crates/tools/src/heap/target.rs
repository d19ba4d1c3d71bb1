//! The browser-side collaborator the capture engine drives.

use async_trait::async_trait;
use heaplens_core::{Error, Result};
use serde::Serialize;
use serde_json::Value;

use crate::browser::CdpClient;

/// Callback receiving capture chunks in arrival order.
pub type ChunkFn<'a> = dyn FnMut(&str) + Send + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageHeapStats {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub limit_bytes: u64,
}

/// Heap instrumentation of one page.
#[async_trait]
pub trait HeapTarget: Send + Sync {
    async fn enable_instrumentation(&self) -> Result<()>;
    async fn disable_instrumentation(&self) -> Result<()>;
    /// May fail where on-demand collection is unsupported.
    async fn collect_garbage(&self) -> Result<()>;
    async fn start_tracking(&self) -> Result<()>;
    /// Stop allocation tracking, streaming the tracked document to `on_chunk`.
    async fn stop_tracking(&self, on_chunk: &mut ChunkFn<'_>) -> Result<()>;
    /// Stream a point-in-time heap snapshot to `on_chunk`.
    async fn stream_snapshot(&self, on_chunk: &mut ChunkFn<'_>) -> Result<()>;
    async fn runtime_memory_usage(&self) -> Result<MemoryUsage>;
    /// `None` when the page exposes no heap statistics.
    async fn page_heap_stats(&self) -> Result<Option<PageHeapStats>>;
}

fn cdp_err(e: String) -> Error {
    Error::Session(e)
}

const PAGE_HEAP_STATS_JS: &str = "(() => { const m = performance.memory; \
    return m ? { used: m.usedJSHeapSize, total: m.totalJSHeapSize, limit: m.jsHeapSizeLimit } : null; })()";

#[async_trait]
impl HeapTarget for CdpClient {
    async fn enable_instrumentation(&self) -> Result<()> {
        self.enable_domain("HeapProfiler").await.map_err(cdp_err)
    }

    async fn disable_instrumentation(&self) -> Result<()> {
        self.disable_domain("HeapProfiler").await.map_err(cdp_err)
    }

    async fn collect_garbage(&self) -> Result<()> {
        CdpClient::collect_garbage(self).await.map_err(cdp_err)
    }

    async fn start_tracking(&self) -> Result<()> {
        self.start_tracking_heap_objects().await.map_err(cdp_err)
    }

    async fn stop_tracking(&self, on_chunk: &mut ChunkFn<'_>) -> Result<()> {
        self.stop_tracking_heap_objects(on_chunk)
            .await
            .map_err(cdp_err)
    }

    async fn stream_snapshot(&self, on_chunk: &mut ChunkFn<'_>) -> Result<()> {
        self.take_heap_snapshot(on_chunk).await.map_err(cdp_err)
    }

    async fn runtime_memory_usage(&self) -> Result<MemoryUsage> {
        let (used_bytes, total_bytes) = self.heap_usage().await.map_err(cdp_err)?;
        Ok(MemoryUsage {
            used_bytes,
            total_bytes,
        })
    }

    async fn page_heap_stats(&self) -> Result<Option<PageHeapStats>> {
        let result = self.evaluate_js(PAGE_HEAP_STATS_JS).await.map_err(cdp_err)?;
        Ok(parse_page_heap_stats(&result))
    }
}

/// Read a `Runtime.evaluate` result carrying `{used,total,limit}` or null.
fn parse_page_heap_stats(result: &Value) -> Option<PageHeapStats> {
    let value = result.get("result")?.get("value")?;
    let field = |key: &str| value.get(key).and_then(|v| v.as_f64()).map(|f| f as u64);
    Some(PageHeapStats {
        used_bytes: field("used")?,
        total_bytes: field("total")?,
        limit_bytes: field("limit")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_page_heap_stats() {
        let result = json!({"result": {"type": "object", "value": {"used": 10.0, "total": 20, "limit": 30}}});
        assert_eq!(
            parse_page_heap_stats(&result),
            Some(PageHeapStats {
                used_bytes: 10,
                total_bytes: 20,
                limit_bytes: 30
            })
        );
    }

    #[test]
    fn test_parse_page_heap_stats_absent() {
        let result = json!({"result": {"type": "object", "subtype": "null", "value": null}});
        assert_eq!(parse_page_heap_stats(&result), None);
    }
}
