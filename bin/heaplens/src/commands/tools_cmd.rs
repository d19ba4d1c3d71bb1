use heaplens_tools::ToolRegistry;
use serde_json::Value;

/// List all registered tools.
pub fn list() {
    let registry = ToolRegistry::with_defaults();
    let schemas = registry.get_tool_schemas();

    println!();
    println!("Registered tools ({} total)", schemas.len());
    println!();
    for schema in &schemas {
        let name = schema["name"].as_str().unwrap_or("");
        let desc = schema["description"].as_str().unwrap_or("");
        let short = desc
            .split_once(". ")
            .map(|(first, _)| format!("{}.", first))
            .unwrap_or_else(|| desc.to_string());
        println!("  {:<18} {}", name, short);
    }
    println!();
    println!("Use `heaplens tools info <name>` for parameter details.");
}

/// Show detailed info for a specific tool.
pub fn info(tool_name: &str) -> anyhow::Result<()> {
    let registry = ToolRegistry::with_defaults();
    let schemas = registry.get_tool_schemas();
    let schema = schemas
        .iter()
        .find(|s| s["name"].as_str() == Some(tool_name))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Tool '{}' not found. Use `heaplens tools list` to see all available tools.",
                tool_name
            )
        })?;

    println!();
    println!("{}", tool_name);
    println!();
    println!("  Description: {}", schema["description"].as_str().unwrap_or(""));
    println!();
    println!("  Parameters:");
    for line in parameter_lines(&schema["parameters"]) {
        println!("{}", line);
    }
    println!();
    Ok(())
}

fn parameter_lines(params: &Value) -> Vec<String> {
    let Some(props) = params.get("properties").and_then(|p| p.as_object()) else {
        return Vec::new();
    };
    let required: Vec<&str> = params
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let mut lines = Vec::new();
    for (key, val) in props {
        let typ = val.get("type").and_then(|t| t.as_str()).unwrap_or("any");
        let req = if required.contains(&key.as_str()) { " (required)" } else { "" };
        // Show enum values if present
        let enum_str = val
            .get("enum")
            .and_then(|e| e.as_array())
            .map(|arr| {
                let vals: Vec<&str> = arr.iter().filter_map(|v| v.as_str()).collect();
                format!(" [{}]", vals.join("|"))
            })
            .unwrap_or_default();
        lines.push(format!("    {:<20} {:<8}{}{}", key, typ, req, enum_str));
        if let Some(desc) = val.get("description").and_then(|d| d.as_str()) {
            lines.push(format!("      {}", desc));
        }
    }
    lines
}
