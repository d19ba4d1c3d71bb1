mod commands;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::capture_cmd::{AnalyzeArgs, CaptureArgs, SessionArgs};

#[derive(Parser)]
#[command(name = "heaplens")]
#[command(about = "Capture and summarize V8 heap snapshots and allocation traces", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Attach to a browser already listening on this remote debugging port
    /// instead of launching headless Chrome
    #[arg(short, long, global = true)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a heap snapshot and summarize the object graph
    Snapshot {
        #[command(flatten)]
        session: SessionArgs,
        #[command(flatten)]
        capture: CaptureArgs,
    },

    /// Track allocations for a time window and rank allocating call stacks
    Trace {
        #[command(flatten)]
        session: SessionArgs,
        #[command(flatten)]
        capture: CaptureArgs,
        /// Tracking window in milliseconds (max 60000)
        #[arg(short, long)]
        duration_ms: Option<u64>,
    },

    /// Sample JavaScript heap usage of the page
    Usage {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Summarize a capture file already on disk
    Analyze(AnalyzeArgs),

    /// Inspect registered tools
    Tools {
        #[command(subcommand)]
        command: ToolsCommands,
    },

    /// Run a tool directly with JSON params
    Run(RunArgs),
}

#[derive(Subcommand)]
enum ToolsCommands {
    /// List all registered tools
    List,
    /// Show detailed info for a specific tool
    Info {
        /// Tool name
        tool_name: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Tool name
    tool_name: String,
    /// JSON parameters
    #[arg(default_value = "{}")]
    params: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Snapshot { session, capture } => {
            let params = capture.to_params(&session, None);
            commands::capture_cmd::run_tool("heap_snapshot", params, cli.port).await?;
        }
        Commands::Trace {
            session,
            capture,
            duration_ms,
        } => {
            let params = capture.to_params(&session, duration_ms);
            commands::capture_cmd::run_tool("allocation_trace", params, cli.port).await?;
        }
        Commands::Usage { session } => {
            let params = session.to_params();
            commands::capture_cmd::run_tool("memory_usage", params, cli.port).await?;
        }
        Commands::Analyze(args) => {
            commands::capture_cmd::run_tool("heap_analyze", args.to_params(), cli.port).await?;
        }
        Commands::Tools { command } => match command {
            ToolsCommands::List => {
                commands::tools_cmd::list();
            }
            ToolsCommands::Info { tool_name } => {
                commands::tools_cmd::info(&tool_name)?;
            }
        },
        Commands::Run(args) => {
            let params = serde_json::from_str(&args.params).map_err(|e| {
                anyhow::anyhow!("Failed to parse JSON params: {}\nInput: {}", e, args.params)
            })?;
            commands::capture_cmd::run_tool(&args.tool_name, params, cli.port).await?;
        }
    }

    Ok(())
}
