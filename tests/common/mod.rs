#![allow(dead_code)]

use async_trait::async_trait;
use mcp_host::client::ProtocolClient;
use mcp_host::config::ServerConfig;
use mcp_host::error::{Error, Result};
use mcp_host::sandbox::{Sandbox, SandboxEvent, SandboxEventSender, SandboxFactory, TerminationMode};
use mcp_host::transport::{JsonRpcMessage, JsonRpcResponse};
use mcp_host::{HostConfig, ServerHost};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a fake sandbox misbehaves
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub init_error: Option<String>,
    pub init_delay: Duration,
    pub graceful_hangs: bool,
    pub forced_fails: bool,
    pub ping_fails: bool,
    pub ping_delay: Duration,
}

/// Records what the host asked of the fake sandboxes
#[derive(Default)]
pub struct FakeFactory {
    behaviors: Mutex<HashMap<String, Behavior>>,
    senders: Mutex<HashMap<String, SandboxEventSender>>,
    terminations: Arc<Mutex<HashMap<String, Vec<TerminationMode>>>>,
    created: AtomicUsize,
}

impl FakeFactory {
    pub fn configure(&self, server_id: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(server_id.to_string(), behavior);
    }

    /// Deliver a runtime event to the latest sandbox created for `server_id`
    pub fn send(&self, server_id: &str, event: SandboxEvent) {
        let senders = self.senders.lock().unwrap();
        senders
            .get(server_id)
            .expect("no sandbox created for server")
            .send(event)
            .expect("event channel closed");
    }

    pub fn terminations(&self, server_id: &str) -> Vec<TerminationMode> {
        self.terminations
            .lock()
            .unwrap()
            .get(server_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl SandboxFactory for FakeFactory {
    fn create(&self, server_id: &str, _config: &ServerConfig, events: SandboxEventSender) -> Result<Arc<dyn Sandbox>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(server_id)
            .cloned()
            .unwrap_or_default();
        self.senders
            .lock()
            .unwrap()
            .insert(server_id.to_string(), events);

        Ok(Arc::new(FakeSandbox {
            server_id: server_id.to_string(),
            protocol: Arc::new(FakeProtocol {
                fails: behavior.ping_fails,
                delay: behavior.ping_delay,
            }),
            behavior,
            terminations: Arc::clone(&self.terminations),
        }))
    }
}

struct FakeProtocol {
    fails: bool,
    delay: Duration,
}

#[async_trait]
impl ProtocolClient for FakeProtocol {
    async fn ping(&self) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        if self.fails {
            Err(Error::Communication("connection reset".to_string()))
        } else {
            Ok(())
        }
    }

    async fn request(&self, method: &str, _params: Option<Value>) -> Result<Value> {
        Ok(json!({ "method": method }))
    }
}

struct FakeSandbox {
    server_id: String,
    behavior: Behavior,
    protocol: Arc<FakeProtocol>,
    terminations: Arc<Mutex<HashMap<String, Vec<TerminationMode>>>>,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn initialize(&self) -> Result<()> {
        tokio::time::sleep(self.behavior.init_delay).await;
        match &self.behavior.init_error {
            Some(error) => Err(Error::Sandbox(error.clone())),
            None => Ok(()),
        }
    }

    async fn terminate(&self, mode: TerminationMode) -> Result<()> {
        self.terminations
            .lock()
            .unwrap()
            .entry(self.server_id.clone())
            .or_default()
            .push(mode);

        match mode {
            TerminationMode::Graceful if self.behavior.graceful_hangs => {
                std::future::pending::<()>().await;
                Ok(())
            }
            TerminationMode::Forced if self.behavior.forced_fails => {
                Err(Error::Sandbox("kill failed".to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn handle_message(&self, message: JsonRpcMessage) -> Result<Option<JsonRpcResponse>> {
        match message {
            JsonRpcMessage::Request(request) => Ok(Some(JsonRpcResponse::success(
                request.id,
                json!({ "method": request.method }),
            ))),
            _ => Ok(None),
        }
    }

    fn protocol(&self) -> Option<Arc<dyn ProtocolClient>> {
        Some(Arc::clone(&self.protocol) as Arc<dyn ProtocolClient>)
    }
}

/// Short timeouts; health checks only run when a test asks for them
pub fn fast_config() -> HostConfig {
    HostConfig {
        server_startup_timeout: Duration::from_secs(2),
        server_shutdown_timeout: Duration::from_millis(200),
        health_check_interval: Duration::from_secs(3600),
        health_check_timeout: Duration::from_millis(100),
        ..HostConfig::default()
    }
}

/// An initialized host backed by a fake factory
pub async fn host_with(config: HostConfig) -> (ServerHost, Arc<FakeFactory>) {
    let factory = Arc::new(FakeFactory::default());
    let host = ServerHost::builder(config)
        .sandbox_factory(Arc::clone(&factory) as Arc<dyn SandboxFactory>)
        .build();
    host.initialize().await.unwrap();
    (host, factory)
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
