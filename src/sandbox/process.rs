use super::{Sandbox, SandboxEvent, SandboxEventSender, TerminationMode, route};
use crate::client::{McpClient, ProtocolClient};
use crate::error::{Error, Result};
use crate::lock;
use crate::transport::{JsonRpcMessage, JsonRpcResponse, StdioTransport};
use async_process::{Child, ChildStderr, Command, Stdio};
use async_trait::async_trait;
use futures_lite::StreamExt;
use futures_lite::io::{AsyncBufReadExt, BufReader};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};

struct RunningProcess {
    client: Arc<McpClient>,
    pid: u32,
    /// Dropping this kills the child
    kill: oneshot::Sender<()>,
    exited: watch::Receiver<bool>,
}

/// Runs a hosted server as a child process.
///
/// The child's stdin/stdout carry newline-delimited JSON-RPC and its stderr
/// is forwarded to `tracing` at debug level. Graceful termination closes
/// stdin and waits; forced termination kills the child.
pub struct ProcessSandbox {
    server_id: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    events: SandboxEventSender,
    terminating: Arc<AtomicBool>,
    process: Mutex<Option<RunningProcess>>,
}

impl ProcessSandbox {
    /// Describe a process; nothing is spawned until `initialize`
    pub fn new(
        server_id: String,
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        events: SandboxEventSender,
    ) -> Self {
        Self {
            server_id,
            command,
            args,
            env,
            events,
            terminating: Arc::new(AtomicBool::new(false)),
            process: Mutex::new(None),
        }
    }

    fn spawn(&self) -> Result<Child> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        command
            .spawn()
            .map_err(|e| Error::Process(format!("Failed to start process '{}': {}", self.command, e)))
    }

    async fn wait_for_exit(mut exited: watch::Receiver<bool>) -> Result<()> {
        exited
            .wait_for(|done| *done)
            .await
            .map(|_| ())
            .map_err(|_| Error::Process("process supervisor went away".to_string()))
    }
}

/// Owns the child until it exits or is killed
async fn supervise(
    server_id: String,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exited: watch::Sender<bool>,
    terminating: Arc<AtomicBool>,
    events: SandboxEventSender,
) {
    tokio::select! {
        status = child.status() => {
            let code = status.ok().and_then(|status| status.code());
            if !terminating.load(Ordering::SeqCst) {
                tracing::warn!(server_id = %server_id, ?code, "Server process exited unexpectedly");
                let _ = events.send(SandboxEvent::Exited { code });
            } else {
                tracing::debug!(server_id = %server_id, ?code, "Server process exited");
            }
        }
        _ = kill => {
            if let Err(e) = child.kill() {
                tracing::warn!(server_id = %server_id, error = %e, "Failed to kill server process");
            }
            let _ = child.status().await;
            tracing::debug!(server_id = %server_id, "Server process killed");
        }
    }
    let _ = exited.send(true);
}

async fn forward_stderr(server_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Some(Ok(line)) = lines.next().await {
        tracing::debug!(server_id = %server_id, "stderr: {}", line);
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn initialize(&self) -> Result<()> {
        if lock(&self.process).is_some() {
            return Err(Error::Sandbox(format!("'{}' is already initialized", self.server_id)));
        }
        self.terminating.store(false, Ordering::SeqCst);

        let mut child = self.spawn()?;
        let pid = child.id();
        tracing::debug!(server_id = %self.server_id, pid, "Spawned server process");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("Failed to get stdin pipe from child process".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("Failed to get stdout pipe from child process".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(self.server_id.clone(), stderr));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        tokio::spawn(supervise(
            self.server_id.clone(),
            child,
            kill_rx,
            exited_tx,
            Arc::clone(&self.terminating),
            self.events.clone(),
        ));

        let transport = StdioTransport::new(self.server_id.clone(), stdin, stdout);
        let client = Arc::new(McpClient::new(self.server_id.clone(), transport));
        *lock(&self.process) = Some(RunningProcess {
            client: Arc::clone(&client),
            pid,
            kill: kill_tx,
            exited: exited_rx,
        });

        client.initialize().await?;
        Ok(())
    }

    async fn terminate(&self, mode: TerminationMode) -> Result<()> {
        self.terminating.store(true, Ordering::SeqCst);

        match mode {
            TerminationMode::Graceful => {
                // Keep the process registered so a cancelled graceful stop
                // can still be escalated.
                let running = lock(&self.process)
                    .as_ref()
                    .map(|process| (Arc::clone(&process.client), process.exited.clone()));
                let Some((client, exited)) = running else {
                    return Ok(());
                };
                client.close().await?;
                Self::wait_for_exit(exited).await?;
                lock(&self.process).take();
            }
            TerminationMode::Forced => {
                let Some(process) = lock(&self.process).take() else {
                    return Ok(());
                };
                let _ = process.kill.send(());
                Self::wait_for_exit(process.exited).await?;
            }
        }
        Ok(())
    }

    async fn handle_message(&self, message: JsonRpcMessage) -> Result<Option<JsonRpcResponse>> {
        let client = lock(&self.process)
            .as_ref()
            .map(|process| Arc::clone(&process.client))
            .ok_or_else(|| Error::Sandbox(format!("'{}' is not running", self.server_id)))?;
        route(&client, message).await
    }

    fn protocol(&self) -> Option<Arc<dyn ProtocolClient>> {
        lock(&self.process)
            .as_ref()
            .map(|process| Arc::clone(&process.client) as Arc<dyn ProtocolClient>)
    }

    fn pid(&self) -> Option<u32> {
        lock(&self.process).as_ref().map(|process| process.pid)
    }
}
