//! Low-level Chrome DevTools Protocol (CDP) client over WebSocket.
//!
//! Communicates with a Chrome/Chromium page target via its debugging WebSocket endpoint.
//! Supports sending commands, receiving responses, and streaming events in order.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

/// Default timeout for ordinary commands.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Streaming heap commands only answer after the whole payload has been emitted.
const HEAP_STREAM_TIMEOUT: Duration = Duration::from_secs(600);

/// Event emitted once per snapshot chunk by the HeapProfiler domain.
pub const HEAP_CHUNK_EVENT: &str = "HeapProfiler.addHeapSnapshotChunk";

type Listeners = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>;

/// A CDP WebSocket client that can send commands and receive responses/events.
pub struct CdpClient {
    /// Sender to write messages to the WebSocket.
    ws_tx: mpsc::Sender<String>,
    /// Pending command responses, keyed by request ID.
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    /// Auto-incrementing command ID.
    next_id: AtomicU64,
    /// Event listeners (domain.event -> channel).
    event_listeners: Listeners,
    /// Handle to the reader task so we can abort on close.
    _reader_handle: tokio::task::JoinHandle<()>,
    /// Handle to the writer task.
    _writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a Chrome CDP WebSocket endpoint.
    pub async fn connect(ws_url: &str) -> Result<Self, String> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| format!("Failed to connect to CDP endpoint {}: {}", ws_url, e))?;

        let (mut ws_sink, mut ws_stream_read) = ws_stream.split();

        // Channel for outgoing messages
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();

        let event_listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));
        let events_clone = event_listeners.clone();

        // Writer task: owns the sink, forwards messages from channel
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    break;
                }
            }
        });

        // Reader task: reads from WebSocket, dispatches responses and events.
        // Events are delivered with backpressure so no chunk is ever dropped, and
        // strictly before any response that follows them on the wire.
        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_stream_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            let mut pending = pending_clone.lock().await;
                            if let Some(tx) = pending.remove(&id) {
                                let _ = tx.send(val);
                            }
                        } else if let Some(method) = val.get("method").and_then(|v| v.as_str()) {
                            let senders = live_listeners(&events_clone, method).await;
                            if senders.is_empty() {
                                continue;
                            }
                            let params = val.get("params").cloned().unwrap_or(Value::Null);
                            for tx in senders {
                                // A closed receiver just means the subscriber went away.
                                let _ = tx.send(params.clone()).await;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            event_listeners,
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
        })
    }

    /// Send a CDP command and wait for the response.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value, String> {
        self.send_command_with_timeout(method, params, COMMAND_TIMEOUT)
            .await
    }

    /// Send a CDP command with an explicit response timeout.
    pub async fn send_command_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        self.ws_tx
            .send(msg.to_string())
            .await
            .map_err(|e| format!("Failed to send CDP command: {}", e))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.get("error") {
                    Err(format!("CDP error: {}", error))
                } else {
                    Ok(response.get("result").cloned().unwrap_or(Value::Null))
                }
            }
            Ok(Err(_)) => Err("CDP response channel closed".to_string()),
            Err(_) => {
                let mut pending = self.pending.lock().await;
                pending.remove(&id);
                Err(format!(
                    "CDP command '{}' timed out after {}s",
                    method,
                    timeout.as_secs()
                ))
            }
        }
    }

    /// Subscribe to a CDP event. Returns a receiver that will get event params.
    /// Dropping the receiver unsubscribes.
    pub async fn subscribe_event(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(64);
        let mut listeners = self.event_listeners.lock().await;
        listeners.entry(method.to_string()).or_default().push(tx);
        rx
    }

    /// Enable a CDP domain (e.g., "Page", "Runtime", "HeapProfiler").
    pub async fn enable_domain(&self, domain: &str) -> Result<(), String> {
        self.send_command(&format!("{}.enable", domain), json!({}))
            .await?;
        Ok(())
    }

    /// Disable a CDP domain.
    pub async fn disable_domain(&self, domain: &str) -> Result<(), String> {
        self.send_command(&format!("{}.disable", domain), json!({}))
            .await?;
        Ok(())
    }

    /// Navigate to a URL and wait for the load event (bounded by `timeout`).
    pub async fn navigate(&self, url: &str, timeout: Duration) -> Result<Value, String> {
        let mut loaded = self.subscribe_event("Page.loadEventFired").await;
        let result = self.send_command("Page.navigate", json!({"url": url})).await?;
        if let Some(err) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(format!("Navigation to {} failed: {}", url, err));
        }
        if tokio::time::timeout(timeout, loaded.recv()).await.is_err() {
            warn!(url = url, "Load event not observed before timeout, continuing");
        }
        Ok(result)
    }

    /// Evaluate JavaScript in the page context.
    pub async fn evaluate_js(&self, expression: &str) -> Result<Value, String> {
        self.send_command(
            "Runtime.evaluate",
            json!({
                "expression": expression,
                "returnByValue": true,
                "awaitPromise": true,
            }),
        )
        .await
    }

    // ─── Heap profiling ───────────────────────────────────────────────

    pub async fn collect_garbage(&self) -> Result<(), String> {
        self.send_command("HeapProfiler.collectGarbage", json!({}))
            .await?;
        Ok(())
    }

    pub async fn start_tracking_heap_objects(&self) -> Result<(), String> {
        self.send_command(
            "HeapProfiler.startTrackingHeapObjects",
            json!({"trackAllocations": true}),
        )
        .await?;
        Ok(())
    }

    /// Stop allocation tracking; the browser streams the tracked snapshot as chunks.
    pub async fn stop_tracking_heap_objects(
        &self,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(), String> {
        self.stream_heap_chunks(
            "HeapProfiler.stopTrackingHeapObjects",
            json!({"reportProgress": false}),
            on_chunk,
        )
        .await
    }

    /// Take a heap snapshot, handing every chunk to `on_chunk` in arrival order.
    pub async fn take_heap_snapshot(
        &self,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(), String> {
        self.stream_heap_chunks(
            "HeapProfiler.takeHeapSnapshot",
            json!({"reportProgress": false}),
            on_chunk,
        )
        .await
    }

    /// Issue a streaming HeapProfiler command and drain its chunk events.
    ///
    /// Chunks are consumed while the command is in flight (the reader applies
    /// backpressure, so the response cannot overtake undrained chunks). Once the
    /// response arrives every preceding chunk is already queued and is drained
    /// before returning.
    async fn stream_heap_chunks(
        &self,
        method: &str,
        params: Value,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(), String> {
        let mut chunks = self.subscribe_event(HEAP_CHUNK_EVENT).await;
        let command = self.send_command_with_timeout(method, params, HEAP_STREAM_TIMEOUT);
        tokio::pin!(command);

        let mut delivered: u64 = 0;
        let outcome = loop {
            tokio::select! {
                biased;
                Some(event) = chunks.recv() => {
                    if let Some(chunk) = event.get("chunk").and_then(|v| v.as_str()) {
                        delivered += 1;
                        on_chunk(chunk);
                    }
                }
                result = &mut command => break result,
            }
        };

        while let Ok(event) = chunks.try_recv() {
            if let Some(chunk) = event.get("chunk").and_then(|v| v.as_str()) {
                delivered += 1;
                on_chunk(chunk);
            }
        }
        debug!(method = method, chunks = delivered, "Heap stream drained");

        outcome.map(|_| ())
    }

    /// `Runtime.getHeapUsage` as (used, total) bytes.
    pub async fn heap_usage(&self) -> Result<(u64, u64), String> {
        let result = self.send_command("Runtime.getHeapUsage", json!({})).await?;
        let used = result.get("usedSize").and_then(|v| v.as_f64());
        let total = result.get("totalSize").and_then(|v| v.as_f64());
        match (used, total) {
            (Some(used), Some(total)) => Ok((used as u64, total as u64)),
            _ => Err("Runtime.getHeapUsage returned no sizes".to_string()),
        }
    }
}

/// Snapshot the live senders for `method`, pruning closed subscriptions.
async fn live_listeners(listeners: &Listeners, method: &str) -> Vec<mpsc::Sender<Value>> {
    let mut guard = listeners.lock().await;
    let Some(senders) = guard.get_mut(method) else {
        return Vec::new();
    };
    senders.retain(|tx| !tx.is_closed());
    let live = senders.clone();
    if live.is_empty() {
        guard.remove(method);
    }
    live
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self._reader_handle.abort();
        self._writer_handle.abort();
    }
}
