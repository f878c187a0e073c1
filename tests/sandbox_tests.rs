#![cfg(unix)]

mod common;

use async_trait::async_trait;
use common::{fast_config, wait_for};
use mcp_host::config::{PluginManifest, ServerConfig};
use mcp_host::error::{Error, Result};
use mcp_host::sandbox::{
    DefaultSandboxFactory, EmbeddedServer, ProcessSandbox, Sandbox, SandboxEvent, SandboxFactory, TerminationMode,
};
use mcp_host::transport::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest};
use mcp_host::{ServerHost, ServerStatus};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Answers every request with an empty result, ignores notifications
const RESPONDER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":"%s","result":{}}\n' "$id"
  fi
done
"#;

/// Completes the handshake, then exits with code 3
const EXITS_AFTER_HANDSHAKE: &str = r#"
IFS= read -r line
id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
printf '{"jsonrpc":"2.0","id":"%s","result":{}}\n' "$id"
IFS= read -r line
exit 3
"#;

fn shell_sandbox(script: &str) -> (ProcessSandbox, mpsc::UnboundedReceiver<SandboxEvent>) {
    let (events, receiver) = mpsc::unbounded_channel();
    let sandbox = ProcessSandbox::new(
        "shell".to_string(),
        "sh".to_string(),
        vec!["-c".to_string(), script.to_string()],
        HashMap::new(),
        events,
    );
    (sandbox, receiver)
}

#[tokio::test]
async fn test_process_handshake_ping_and_graceful_stop() -> Result<()> {
    let (sandbox, mut events) = shell_sandbox(RESPONDER);

    sandbox.initialize().await?;
    assert!(sandbox.pid().is_some());

    let protocol = sandbox.protocol().expect("protocol after initialize");
    protocol.ping().await?;

    let request = JsonRpcRequest::new("req-1", "tools/list", None);
    let response = sandbox.handle_message(JsonRpcMessage::Request(request)).await?;
    assert_eq!(response.map(|r| r.result), Some(Some(json!({}))));

    let notification = JsonRpcNotification::new("notifications/cancelled", None);
    assert!(
        sandbox
            .handle_message(JsonRpcMessage::Notification(notification))
            .await?
            .is_none()
    );

    sandbox.terminate(TerminationMode::Graceful).await?;
    assert!(sandbox.protocol().is_none());
    assert!(events.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_process_forced_stop() -> Result<()> {
    let (sandbox, mut events) = shell_sandbox(RESPONDER);
    sandbox.initialize().await?;

    sandbox.terminate(TerminationMode::Forced).await?;

    assert!(sandbox.pid().is_none());
    assert!(events.try_recv().is_err());
    // Terminating twice is harmless
    sandbox.terminate(TerminationMode::Forced).await
}

#[tokio::test]
async fn test_process_unexpected_exit_is_reported() -> Result<()> {
    let (sandbox, mut events) = shell_sandbox(EXITS_AFTER_HANDSHAKE);
    sandbox.initialize().await?;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("exit reported");
    assert_eq!(event, Some(SandboxEvent::Exited { code: Some(3) }));

    sandbox.terminate(TerminationMode::Forced).await
}

#[tokio::test]
async fn test_missing_command_fails_to_initialize() {
    let (events, _receiver) = mpsc::unbounded_channel();
    let sandbox = ProcessSandbox::new(
        "missing".to_string(),
        "/nonexistent/mcp-server".to_string(),
        vec![],
        HashMap::new(),
        events,
    );

    assert!(matches!(sandbox.initialize().await, Err(Error::Process(_))));
}

struct Notes;

#[async_trait]
impl EmbeddedServer for Notes {
    async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        Ok(json!({ "method": method, "params": params }))
    }
}

#[test]
fn test_default_factory_requires_registration() {
    let factory = DefaultSandboxFactory::new();
    let (events, _receiver) = mpsc::unbounded_channel();

    let result = factory.create("notes", &ServerConfig::embedded("Notes"), events.clone());
    assert!(matches!(result, Err(Error::Sandbox(_))));

    factory.register_embedded("Notes", Arc::new(Notes));
    assert!(
        factory
            .create("notes", &ServerConfig::embedded("Notes"), events)
            .is_ok()
    );
}

#[tokio::test]
async fn test_host_runs_real_sandboxes() -> Result<()> {
    let factory = Arc::new(DefaultSandboxFactory::new());
    factory.register_embedded("Notes", Arc::new(Notes));
    factory.register_embedded("notes-plugin", Arc::new(Notes));

    let host = ServerHost::builder(fast_config())
        .sandbox_factory(factory)
        .build();
    host.initialize().await?;

    let shell = ServerConfig::external("Shell", "sh", vec!["-c".to_string(), RESPONDER.to_string()]);
    let external = host.start_server("shell", shell).await?;
    assert!(external.pid().is_some());

    host.start_server("notes", ServerConfig::embedded("Notes")).await?;
    let manifest = PluginManifest {
        id: "notes-plugin".to_string(),
        name: "Notes".to_string(),
        version: "1.0.0".to_string(),
        permissions: vec![],
        main: None,
    };
    host.start_server("plugin", ServerConfig::internal("Notes", manifest))
        .await?;

    host.run_health_checks().await;
    for server_id in ["shell", "notes", "plugin"] {
        let health = host.get_server_health(server_id).expect("checked");
        assert_eq!(health.status, mcp_host::HealthStatus::Healthy, "{}", server_id);
    }

    let request = JsonRpcRequest::new("n1", "notes/read", Some(json!({"id": 7})));
    let response = host
        .send_message("notes", JsonRpcMessage::Request(request))
        .await?
        .expect("requests get responses");
    assert_eq!(
        response.result,
        Some(json!({"method": "notes/read", "params": {"id": 7}}))
    );

    host.stop_server("shell", true).await?;
    assert_eq!(external.status(), ServerStatus::Stopped);

    host.shutdown().await;
    assert!(host.list_servers().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_external_crash_is_restarted() -> Result<()> {
    let host = ServerHost::new(fast_config());
    host.initialize().await?;

    let config = ServerConfig::external(
        "Flaky",
        "sh",
        vec!["-c".to_string(), EXITS_AFTER_HANDSHAKE.to_string()],
    );
    host.start_server("flaky", config).await?;

    assert!(
        wait_for(|| host
            .get_server("flaky")
            .is_some_and(|instance| instance.restart_count() >= 1))
        .await
    );

    host.shutdown().await;
    Ok(())
}
