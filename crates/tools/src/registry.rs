use std::collections::HashMap;
use std::sync::Arc;
use heaplens_core::{Error, Result};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{Tool, ToolContext};
use crate::heap::{AllocationTraceTool, HeapAnalyzeTool, HeapSnapshotTool, MemoryUsageTool};

#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        // Browser-backed captures
        registry.register(Arc::new(HeapSnapshotTool));
        registry.register(Arc::new(AllocationTraceTool));
        registry.register(Arc::new(MemoryUsageTool));

        // Offline decoding of exported captures
        registry.register(Arc::new(HeapAnalyzeTool));

        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.schema();
        debug!(name = schema.name, "Registering tool");
        self.tools.insert(schema.name.to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn get_tool_schemas(&self) -> Vec<Value> {
        let mut schemas: Vec<(&'static str, Value)> = self
            .tools
            .values()
            .map(|tool| {
                let schema = tool.schema();
                (
                    schema.name,
                    json!({
                        "name": schema.name,
                        "description": schema.description,
                        "parameters": schema.parameters
                    }),
                )
            })
            .collect();
        schemas.sort_by_key(|(name, _)| *name);
        schemas.into_iter().map(|(_, schema)| schema).collect()
    }

    /// Get all registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn execute(&self, name: &str, ctx: ToolContext, params: Value) -> Result<Value> {
        let tool = self.get(name).ok_or_else(|| {
            Error::Tool(format!("Unknown tool: {}", name))
        })?;

        // Validate parameters
        if let Err(e) = tool.validate(&params) {
            warn!(tool = name, error = %e, "Tool validation failed");
            return Err(e);
        }

        debug!(tool = name, "Executing tool");
        tool.execute(ctx, params).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heaplens_core::{Config, Paths};
    use tempfile::TempDir;

    #[test]
    fn test_registry_new_empty() {
        let reg = ToolRegistry::new();
        assert!(reg.tool_names().is_empty());
        assert!(reg.get("heap_snapshot").is_none());
    }

    #[test]
    fn test_registry_with_defaults_has_heap_tools() {
        let reg = ToolRegistry::with_defaults();
        assert_eq!(
            reg.tool_names(),
            vec!["allocation_trace", "heap_analyze", "heap_snapshot", "memory_usage"]
        );
    }

    #[test]
    fn test_tool_schemas_sorted() {
        let reg = ToolRegistry::with_defaults();
        let schemas = reg.get_tool_schemas();
        assert_eq!(schemas.len(), 4);
        assert_eq!(schemas[0]["name"], "allocation_trace");
        assert!(schemas.iter().all(|s| s["parameters"]["type"] == "object"));
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let dir = TempDir::new().unwrap();
        let ctx = ToolContext::new(Paths::with_base(dir.path().to_path_buf()), Config::default());
        let reg = ToolRegistry::with_defaults();
        let err = reg.execute("browse", ctx, json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_execute_rejects_invalid_params() {
        let dir = TempDir::new().unwrap();
        let ctx = ToolContext::new(Paths::with_base(dir.path().to_path_buf()), Config::default());
        let reg = ToolRegistry::with_defaults();
        let err = reg
            .execute("heap_snapshot", ctx, json!({"export_mode": "zip"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
