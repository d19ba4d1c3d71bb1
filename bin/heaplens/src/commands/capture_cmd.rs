use clap::Args;
use heaplens_core::{Config, Paths};
use heaplens_tools::heap::tool::shutdown_sessions;
use heaplens_tools::{ToolContext, ToolRegistry};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Args, Debug, Default)]
pub struct SessionArgs {
    /// Browser session name
    #[arg(short, long, default_value = "default")]
    pub session: String,

    /// Load this URL before capturing
    #[arg(short, long)]
    pub url: Option<String>,
}

impl SessionArgs {
    pub fn to_params(&self) -> Value {
        let mut params = Map::new();
        params.insert("session".into(), json!(self.session));
        if let Some(url) = &self.url {
            params.insert("url".into(), json!(url));
        }
        Value::Object(params)
    }
}

#[derive(Args, Debug, Default)]
pub struct CaptureArgs {
    /// Ranking length (0 reports totals only)
    #[arg(short = 'n', long)]
    pub top_n: Option<u64>,

    /// Request a garbage collection first
    #[arg(long)]
    pub force_gc: bool,

    /// Export mode: none, file, inline or both
    #[arg(short, long)]
    pub export: Option<String>,

    /// Destination for file export
    #[arg(short = 'o', long)]
    pub export_path: Option<PathBuf>,

    /// Capture file budget in bytes
    #[arg(long)]
    pub max_capture_bytes: Option<u64>,

    /// Largest capture that is parsed, in bytes
    #[arg(long)]
    pub max_parse_bytes: Option<u64>,

    /// Inline payload budget in bytes
    #[arg(long)]
    pub max_inline_bytes: Option<u64>,
}

impl CaptureArgs {
    pub fn to_params(&self, session: &SessionArgs, duration_ms: Option<u64>) -> Value {
        let mut params = session.to_params();
        let Some(obj) = params.as_object_mut() else {
            return params;
        };
        let optional = [
            ("top_n", self.top_n.map(Value::from)),
            ("export_mode", self.export.as_deref().map(Value::from)),
            (
                "export_path",
                self.export_path
                    .as_ref()
                    .map(|p| Value::from(p.display().to_string())),
            ),
            ("max_capture_bytes", self.max_capture_bytes.map(Value::from)),
            ("max_parse_bytes", self.max_parse_bytes.map(Value::from)),
            ("max_inline_bytes", self.max_inline_bytes.map(Value::from)),
            ("duration_ms", duration_ms.map(Value::from)),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                obj.insert(key.to_string(), value);
            }
        }
        if self.force_gc {
            obj.insert("force_gc".into(), Value::Bool(true));
        }
        params
    }
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Capture file to decode
    pub file: PathBuf,

    /// object_graph or allocation_trace
    #[arg(short, long, default_value = "object_graph")]
    pub kind: String,

    /// Ranking length
    #[arg(short = 'n', long)]
    pub top_n: Option<u64>,

    /// Largest file that is parsed, in bytes
    #[arg(long)]
    pub max_parse_bytes: Option<u64>,
}

impl AnalyzeArgs {
    pub fn to_params(&self) -> Value {
        let mut params = json!({
            "path": self.file.display().to_string(),
            "kind": self.kind,
        });
        if let Some(n) = self.top_n {
            params["top_n"] = json!(n);
        }
        if let Some(n) = self.max_parse_bytes {
            params["max_parse_bytes"] = json!(n);
        }
        params
    }
}

/// Execute a registered tool and print its JSON result.
///
/// Ctrl-C cancels the running capture; launched browsers are closed on the way out.
pub async fn run_tool(tool_name: &str, params: Value, port: Option<u16>) -> anyhow::Result<()> {
    let registry = ToolRegistry::with_defaults();
    if registry.get(tool_name).is_none() {
        anyhow::bail!(
            "Tool '{}' not found. Use `heaplens tools list` to see available tools.",
            tool_name
        );
    }

    let paths = Paths::new();
    let mut config = Config::load_or_default(&paths)?;
    if port.is_some() {
        config.browser.debug_port = port;
    }
    paths.ensure_dirs()?;

    let ctx = ToolContext::new(paths, config);
    let cancel = ctx.cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling capture");
            cancel.cancel();
        }
    });

    info!(tool = tool_name, "Running tool");
    let result = registry.execute(tool_name, ctx, params).await;
    ctrl_c.abort();
    shutdown_sessions().await;

    let result = result?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_params() {
        let session = SessionArgs {
            session: "s1".into(),
            url: Some("https://example.com".into()),
        };
        let capture = CaptureArgs {
            top_n: Some(5),
            force_gc: true,
            export: Some("both".into()),
            ..Default::default()
        };
        let params = capture.to_params(&session, Some(1000));
        assert_eq!(params["session"], "s1");
        assert_eq!(params["url"], "https://example.com");
        assert_eq!(params["top_n"], 5);
        assert_eq!(params["force_gc"], true);
        assert_eq!(params["export_mode"], "both");
        assert_eq!(params["duration_ms"], 1000);
        assert!(params.get("max_capture_bytes").is_none());
    }

    #[test]
    fn test_analyze_params() {
        let args = AnalyzeArgs {
            file: PathBuf::from("/tmp/a.heapsnapshot"),
            kind: "allocation_trace".into(),
            top_n: None,
            max_parse_bytes: Some(10),
        };
        let params = args.to_params();
        assert_eq!(params["path"], "/tmp/a.heapsnapshot");
        assert_eq!(params["kind"], "allocation_trace");
        assert_eq!(params["max_parse_bytes"], 10);
        assert!(params.get("top_n").is_none());
    }
}
