use super::json_rpc::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::error::{Error, Result};
use crate::lock;
use crate::transport::Transport;
use async_process::{ChildStdin, ChildStdout};
use async_trait::async_trait;
use futures_lite::StreamExt;
use futures_lite::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

/// StdioTransport provides communication with an MCP server via standard I/O.
///
/// Messages are newline-delimited JSON. A background task reads the
/// server's stdout and completes pending requests by id; anything that is
/// not a response (server notifications, stray log lines) is skipped.
///
/// # Example
///
/// ```no_run
/// use mcp_host::transport::{JsonRpcRequest, StdioTransport, Transport};
/// use async_process::{Command, Stdio};
///
/// # async fn example() -> mcp_host::Result<()> {
/// let mut child = Command::new("mcp-server")
///     .stdin(Stdio::piped())
///     .stdout(Stdio::piped())
///     .spawn()
///     .expect("Failed to start MCP server");
///
/// let stdin = child.stdin.take().expect("Failed to get stdin");
/// let stdout = child.stdout.take().expect("Failed to get stdout");
///
/// let transport = StdioTransport::new("example-server".to_string(), stdin, stdout);
/// let response = transport.send_request(JsonRpcRequest::ping("1")).await?;
/// assert!(response.is_success());
/// # Ok(())
/// # }
/// ```
pub struct StdioTransport {
    /// Server name
    name: String,
    /// Child process stdin, `None` once closed
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    /// Response handlers keyed by request id
    pending: PendingMap,
    /// Set once stdout reaches EOF
    closed: Arc<AtomicBool>,
    /// Task reading from stdout
    reader_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Creates a new StdioTransport instance.
    ///
    /// Takes ownership of the child's stdin and stdout and spawns the reader
    /// task. Must be called within a Tokio runtime.
    pub fn new(name: String, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_responses(
            name.clone(),
            stdout,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Self {
            name,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            pending,
            closed,
            reader_task,
        }
    }

    /// Gets the name of the server associated with this transport.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn write_message(&self, message: &impl Serialize) -> Result<()> {
        let mut line = serde_json::to_vec(message)
            .map_err(|e| Error::Serialization(format!("Failed to serialize message: {}", e)))?;
        line.push(b'\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::Transport(format!("stdin of '{}' is closed", self.name)))?;

        stdin
            .write_all(&line)
            .await
            .map_err(|e| Error::Communication(format!("Failed to write to stdin: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Communication(format!("Failed to flush stdin: {}", e)))
    }
}

/// Removes a request's pending entry however the request ends
struct PendingEntry<'a> {
    pending: &'a PendingMap,
    key: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.key);
    }
}

async fn read_responses(name: String, stdout: ChildStdout, pending: PendingMap, closed: Arc<AtomicBool>) {
    let mut lines = BufReader::new(stdout).lines();

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "Failed to read from server stdout");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<JsonRpcMessage>(&line) {
            Ok(JsonRpcMessage::Response(response)) => {
                let Some(key) = response.id_key() else {
                    tracing::debug!(server = %name, "Response with unusable id");
                    continue;
                };
                if let Some(sender) = lock(&pending).remove(&key) {
                    // The requester may have timed out and gone away
                    let _ = sender.send(response);
                }
            }
            Ok(_) => tracing::trace!(server = %name, "Ignoring server-initiated message"),
            Err(_) => tracing::debug!(server = %name, line = %line, "Discarding non JSON-RPC output"),
        }
    }

    tracing::debug!(server = %name, "Server stdout closed");
    closed.store(true, Ordering::SeqCst);
    lock(&pending).clear();
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let key = request
            .id_key()
            .ok_or_else(|| Error::Communication("Invalid request ID type".to_string()))?;

        let (sender, receiver) = oneshot::channel();
        lock(&self.pending).insert(key.clone(), sender);
        // Also fires when the caller drops this future, e.g. on a timeout
        let _entry = PendingEntry {
            pending: &self.pending,
            key,
        };

        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Communication(format!("'{}' closed its output", self.name)));
        }

        self.write_message(&request).await?;

        let response = receiver
            .await
            .map_err(|_| Error::Communication(format!("'{}' closed before responding", self.name)))?;

        if let Some(error) = &response.error {
            return Err(Error::JsonRpc(error.to_string()));
        }

        Ok(response)
    }

    async fn send_notification(&self, notification: JsonRpcNotification) -> Result<()> {
        self.write_message(&notification).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            stdin
                .close()
                .await
                .map_err(|e| Error::Transport(format!("Failed to close stdin: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use async_process::{Command, Stdio};
    use std::time::Duration;

    fn silent_server() -> (async_process::Child, StdioTransport) {
        let mut child = Command::new("sh")
            .args(["-c", "cat > /dev/null"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        (child, StdioTransport::new("silent".to_string(), stdin, stdout))
    }

    #[tokio::test]
    async fn test_timed_out_requests_leave_no_pending_entries() {
        let (mut child, transport) = silent_server();

        for i in 0..10 {
            let request = JsonRpcRequest::ping(format!("ping-{}", i));
            let result = tokio::time::timeout(Duration::from_millis(20), transport.send_request(request)).await;
            assert!(result.is_err());
        }

        assert!(lock(&transport.pending).is_empty());
        child.kill().unwrap();
    }

    #[tokio::test]
    async fn test_request_after_stdout_closed_fails() {
        let (mut child, transport) = silent_server();
        child.kill().unwrap();
        child.status().await.unwrap();

        // Either the write or the closed output makes the request fail
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            transport.send_request(JsonRpcRequest::ping("late")),
        )
        .await
        .unwrap();
        assert!(result.is_err());
        assert!(lock(&transport.pending).is_empty());
    }
}
