use super::{Sandbox, SandboxEvent, SandboxEventSender, TerminationMode, route};
use crate::client::{McpClient, ProtocolClient};
use crate::error::{Error, Result};
use crate::lock;
use crate::transport::{
    ChannelTransport, Envelope, INTERNAL_ERROR, JsonRpcMessage, JsonRpcResponse, MCP_PROTOCOL_VERSION,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

const INBOX_CAPACITY: usize = 64;

/// A server implemented inside the host process.
///
/// Requests are handled one at a time in arrival order. A handler that
/// panics takes the server down, which the host sees as a crash.
#[async_trait]
pub trait EmbeddedServer: Send + Sync {
    /// Answer a request; errors become JSON-RPC error responses
    async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value>;

    /// React to a notification
    async fn handle_notification(&self, _method: &str, _params: Option<Value>) {}

    /// Result of the `initialize` handshake
    async fn initialize(&self) -> Result<Value> {
        Ok(json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {}
        }))
    }

    /// Answer a health ping
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

async fn serve(server: Arc<dyn EmbeddedServer>, mut inbox: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = inbox.recv().await {
        match envelope {
            Envelope::Request { request, reply } => {
                let outcome = match request.method.as_str() {
                    "ping" => server.ping().await.map(|_| json!({})),
                    "initialize" => server.initialize().await,
                    method => server.handle_request(method, request.params).await,
                };
                let response = match outcome {
                    Ok(result) => JsonRpcResponse::success(request.id, result),
                    Err(e) => JsonRpcResponse::error(request.id, INTERNAL_ERROR, e.to_string(), None),
                };
                let _ = reply.send(response);
            }
            Envelope::Notification(notification) => {
                server
                    .handle_notification(&notification.method, notification.params)
                    .await;
            }
        }
    }
}

struct Worker {
    client: Arc<McpClient>,
    abort: AbortHandle,
    finished: watch::Receiver<bool>,
}

/// Runs an [`EmbeddedServer`] on a Tokio task.
///
/// The task is the isolation boundary: its inbox is the only way in and
/// its termination (normal or panic) is reported as an exit.
pub struct InProcessSandbox {
    server_id: String,
    server: Arc<dyn EmbeddedServer>,
    events: SandboxEventSender,
    terminating: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
}

impl InProcessSandbox {
    /// Wrap `server`; nothing runs until `initialize`
    pub fn new(server_id: String, server: Arc<dyn EmbeddedServer>, events: SandboxEventSender) -> Self {
        Self {
            server_id,
            server,
            events,
            terminating: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    fn client(&self) -> Option<Arc<McpClient>> {
        lock(&self.worker).as_ref().map(|worker| Arc::clone(&worker.client))
    }
}

#[async_trait]
impl Sandbox for InProcessSandbox {
    async fn initialize(&self) -> Result<()> {
        if lock(&self.worker).is_some() {
            return Err(Error::Sandbox(format!("'{}' is already initialized", self.server_id)));
        }
        self.terminating.store(false, Ordering::SeqCst);

        let (transport, inbox) = ChannelTransport::pair(self.server_id.clone(), INBOX_CAPACITY);
        let task = tokio::spawn(serve(Arc::clone(&self.server), inbox));
        let abort = task.abort_handle();

        let (finished_tx, finished_rx) = watch::channel(false);
        let server_id = self.server_id.clone();
        let terminating = Arc::clone(&self.terminating);
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = task.await;
            let _ = finished_tx.send(true);
            if terminating.load(Ordering::SeqCst) {
                return;
            }
            match outcome {
                Err(e) if e.is_panic() => tracing::warn!(server_id = %server_id, "Embedded server panicked"),
                _ => tracing::warn!(server_id = %server_id, "Embedded server stopped unexpectedly"),
            }
            let _ = events.send(SandboxEvent::Exited { code: None });
        });

        let client = Arc::new(McpClient::new(self.server_id.clone(), transport));
        *lock(&self.worker) = Some(Worker {
            client: Arc::clone(&client),
            abort,
            finished: finished_rx,
        });

        client.initialize().await?;
        Ok(())
    }

    async fn terminate(&self, mode: TerminationMode) -> Result<()> {
        self.terminating.store(true, Ordering::SeqCst);

        let running = lock(&self.worker)
            .as_ref()
            .map(|worker| (Arc::clone(&worker.client), worker.abort.clone(), worker.finished.clone()));
        let Some((client, abort, mut finished)) = running else {
            return Ok(());
        };

        match mode {
            // Closing the inbox lets the worker drain and return
            TerminationMode::Graceful => client.close().await?,
            TerminationMode::Forced => abort.abort(),
        }

        finished
            .wait_for(|done| *done)
            .await
            .map_err(|_| Error::Sandbox(format!("'{}' worker watcher went away", self.server_id)))?;
        lock(&self.worker).take();
        Ok(())
    }

    async fn handle_message(&self, message: JsonRpcMessage) -> Result<Option<JsonRpcResponse>> {
        let client = self
            .client()
            .ok_or_else(|| Error::Sandbox(format!("'{}' is not running", self.server_id)))?;
        route(&client, message).await
    }

    fn protocol(&self) -> Option<Arc<dyn ProtocolClient>> {
        self.client().map(|client| client as Arc<dyn ProtocolClient>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::JsonRpcRequest;

    struct Echo;

    #[async_trait]
    impl EmbeddedServer for Echo {
        async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
            match method {
                "echo" => Ok(params.unwrap_or(Value::Null)),
                "boom" => panic!("handler exploded"),
                other => Err(Error::Other(format!("unknown method {}", other))),
            }
        }
    }

    fn sandbox() -> (InProcessSandbox, mpsc::UnboundedReceiver<SandboxEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (InProcessSandbox::new("echo".to_string(), Arc::new(Echo), events), receiver)
    }

    #[tokio::test]
    async fn test_routes_requests_and_pings() {
        let (sandbox, _events) = sandbox();
        sandbox.initialize().await.unwrap();

        let protocol = sandbox.protocol().expect("protocol after initialize");
        protocol.ping().await.unwrap();

        let request = JsonRpcRequest::new("r1", "echo", Some(json!({"hello": "world"})));
        let response = sandbox
            .handle_message(JsonRpcMessage::Request(request))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.result, Some(json!({"hello": "world"})));

        let unknown = JsonRpcRequest::new("r2", "nope", None);
        assert!(matches!(
            sandbox.handle_message(JsonRpcMessage::Request(unknown)).await,
            Err(Error::JsonRpc(_))
        ));
    }

    #[tokio::test]
    async fn test_graceful_terminate_reports_no_exit() {
        let (sandbox, mut events) = sandbox();
        sandbox.initialize().await.unwrap();
        sandbox.terminate(TerminationMode::Graceful).await.unwrap();

        assert!(sandbox.protocol().is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_panicking_handler_is_reported_as_exit() {
        let (sandbox, mut events) = sandbox();
        sandbox.initialize().await.unwrap();

        let request = JsonRpcRequest::new("r1", "boom", None);
        assert!(sandbox.handle_message(JsonRpcMessage::Request(request)).await.is_err());

        assert_eq!(events.recv().await, Some(SandboxEvent::Exited { code: None }));
        sandbox.terminate(TerminationMode::Forced).await.unwrap();
    }
}
