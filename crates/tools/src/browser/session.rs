//! Browser session management.
//!
//! A session is either a headless Chrome launched and owned by us, or an
//! attachment to an already running browser's remote debugging port. Sessions
//! persist between tool calls (daemon model).

use super::cdp::CdpClient;
use heaplens_core::config::BrowserConfig;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A single browser session with its CDP client.
pub struct BrowserSession {
    /// Session name (e.g., "default", "agent1").
    pub name: String,
    /// Remote debugging port used to discover the page target.
    pub debug_port: u16,
    /// Browser child process, absent when attached to an external browser.
    process: Mutex<Option<Child>>,
    /// CDP WebSocket client bound to the page target.
    pub cdp: CdpClient,
    /// Serializes heap captures: the HeapProfiler channel is exclusive per cycle.
    pub capture_lock: Mutex<()>,
}

impl BrowserSession {
    /// Close the browser session. Attached browsers are left running.
    pub async fn close(&self) {
        let mut process = self.process.lock().await;
        if let Some(child) = process.as_mut() {
            if let Err(e) = self.cdp.send_command("Browser.close", json!({})).await {
                debug!("CDP Browser.close failed (may already be closed): {}", e);
            }
            let _ = child.kill().await;
        }
        *process = None;
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        // Best-effort kill on drop
        if let Some(child) = self.process.get_mut().as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Manages multiple browser sessions.
pub struct SessionManager {
    sessions: HashMap<String, Arc<BrowserSession>>,
    /// Base directory for per-session browser profiles.
    base_dir: PathBuf,
}

impl SessionManager {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            sessions: HashMap::new(),
            base_dir,
        }
    }

    /// Get or create a session by name, attaching or launching per `config`.
    pub async fn get_or_create(
        &mut self,
        session_name: &str,
        config: &BrowserConfig,
    ) -> Result<Arc<BrowserSession>, String> {
        if let Some(session) = self.sessions.get(session_name) {
            return Ok(session.clone());
        }

        let session = match config.debug_port {
            Some(port) => attach_browser(session_name, port).await?,
            None => self.launch_browser(session_name, config).await?,
        };
        let session = Arc::new(session);
        self.sessions
            .insert(session_name.to_string(), session.clone());
        Ok(session)
    }

    /// Close all sessions.
    pub async fn close_all(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.close().await;
        }
    }

    /// Launch a headless browser instance and connect via CDP.
    async fn launch_browser(
        &self,
        session_name: &str,
        config: &BrowserConfig,
    ) -> Result<BrowserSession, String> {
        let browser_path = match config.executable.as_deref() {
            Some(path) => path.to_string(),
            None => find_browser_binary()
                .ok_or_else(|| "Chrome/Chromium not found. Please install it.".to_string())?,
        };

        let user_data_dir = self.base_dir.join("sessions").join(session_name);
        std::fs::create_dir_all(&user_data_dir)
            .map_err(|e| format!("Failed to create user data dir: {}", e))?;

        let debug_port = find_free_port().await?;
        let args = build_browser_args(debug_port, &user_data_dir, config.headed);

        info!(
            session = session_name,
            port = debug_port,
            headed = config.headed,
            "Launching browser for session"
        );

        let child = Command::new(&browser_path)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to launch {}: {}", browser_path, e))?;

        wait_for_cdp_ready(debug_port, 15).await?;
        let mut session = connect_page(session_name, debug_port).await?;
        session.process = Mutex::new(Some(child));
        Ok(session)
    }
}

/// Attach to a browser that is already listening on `port`.
async fn attach_browser(session_name: &str, port: u16) -> Result<BrowserSession, String> {
    info!(session = session_name, port = port, "Attaching to running browser");
    wait_for_cdp_ready(port, 5).await?;
    connect_page(session_name, port).await
}

async fn connect_page(session_name: &str, port: u16) -> Result<BrowserSession, String> {
    // Connect to the page target (not browser-level) so Page/Runtime/HeapProfiler work
    let page_ws_url = get_page_ws_url(port).await?;
    let cdp = CdpClient::connect(&page_ws_url).await?;

    cdp.enable_domain("Page").await?;
    cdp.enable_domain("Runtime").await?;

    info!(
        session = session_name,
        ws_url = %page_ws_url,
        "CDP connection established (page target)"
    );

    Ok(BrowserSession {
        name: session_name.to_string(),
        debug_port: port,
        process: Mutex::new(None),
        cdp,
        capture_lock: Mutex::new(()),
    })
}

fn build_browser_args(debug_port: u16, user_data_dir: &Path, headed: bool) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
    ];
    if !headed {
        args.push("--headless=new".to_string());
    }
    args.push("--window-size=1280,720".to_string());
    args.push("about:blank".to_string());
    args
}

/// Find a Chromium-family browser binary (V8 is required for heap profiling).
pub fn find_browser_binary() -> Option<String> {
    let candidates: Vec<&str> = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
        ]
    } else if cfg!(target_os = "linux") {
        vec![
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
            "microsoft-edge",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
        ]
    } else {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ]
    };

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        if !candidate.contains('/') && !candidate.contains('\\') && which::which(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

/// Find a free TCP port.
async fn find_free_port() -> Result<u16, String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| format!("Failed to bind to find free port: {}", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| format!("Failed to get local addr: {}", e))?
        .port();
    drop(listener);
    Ok(port)
}

/// Wait for the CDP endpoint to become available.
/// Polls /json/version until it responds, up to `timeout_secs`.
async fn wait_for_cdp_ready(port: u16, timeout_secs: u64) -> Result<String, String> {
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_secs(timeout_secs);
    let url = format!("http://127.0.0.1:{}/json/version", port);

    loop {
        if start.elapsed() > timeout {
            return Err(format!(
                "CDP not ready after {}s on port {}",
                timeout_secs, port
            ));
        }

        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if let Some(ws_url) = body.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
                    return Ok(ws_url.to_string());
                }
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

/// Resolve the first page target's WebSocket URL via /json/list.
/// Retries a few times since the page target may not appear immediately.
pub async fn get_page_ws_url(port: u16) -> Result<String, String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);

    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        }

        let resp = match reqwest::get(&url).await {
            Ok(r) => r,
            Err(_) => continue,
        };
        let targets: Vec<Value> = match resp.json().await {
            Ok(t) => t,
            Err(_) => continue,
        };

        if let Some(ws_url) = first_page_ws_url(&targets) {
            return Ok(ws_url);
        }
    }

    Err("No page target found after retries".to_string())
}

fn first_page_ws_url(targets: &[Value]) -> Option<String> {
    targets
        .iter()
        .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
        .find_map(|t| t.get("webSocketDebuggerUrl").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}
