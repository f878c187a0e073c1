use super::json_rpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::error::{Error, Result};
use crate::lock;
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};

/// A message delivered to an in-process server
#[derive(Debug)]
pub enum Envelope {
    /// A request and the slot its response goes into
    Request {
        /// The request
        request: JsonRpcRequest,
        /// Where to send the response
        reply: oneshot::Sender<JsonRpcResponse>,
    },
    /// A notification
    Notification(JsonRpcNotification),
}

/// Transport to a server running on a task in this process
pub struct ChannelTransport {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
}

impl ChannelTransport {
    /// Wrap the sending half of a server's inbox
    pub fn new(name: String, sender: mpsc::Sender<Envelope>) -> Self {
        Self {
            name,
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Create a transport together with the inbox the server reads from
    pub fn pair(name: String, capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(name, sender), receiver)
    }

    /// Gets the name of the server associated with this transport.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        let sender = lock(&self.sender)
            .clone()
            .ok_or_else(|| Error::Transport(format!("channel to '{}' is closed", self.name)))?;
        sender
            .send(envelope)
            .await
            .map_err(|_| Error::Communication(format!("'{}' is no longer receiving", self.name)))
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let (reply, response) = oneshot::channel();
        self.deliver(Envelope::Request { request, reply }).await?;

        let response = response
            .await
            .map_err(|_| Error::Communication(format!("'{}' dropped the request", self.name)))?;

        if let Some(error) = &response.error {
            return Err(Error::JsonRpc(error.to_string()));
        }
        Ok(response)
    }

    async fn send_notification(&self, notification: JsonRpcNotification) -> Result<()> {
        self.deliver(Envelope::Notification(notification)).await
    }

    async fn close(&self) -> Result<()> {
        lock(&self.sender).take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_request_round_trip_through_inbox() {
        let (transport, mut inbox) = ChannelTransport::pair("echo".to_string(), 4);

        tokio::spawn(async move {
            while let Some(Envelope::Request { request, reply }) = inbox.recv().await {
                let _ = reply.send(JsonRpcResponse::success(request.id, json!({"method": request.method})));
            }
        });

        let response = transport.send_request(JsonRpcRequest::ping("1")).await.unwrap();
        assert_eq!(response.result, Some(json!({"method": "ping"})));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_sends() {
        let (transport, _inbox) = ChannelTransport::pair("echo".to_string(), 4);
        transport.close().await.unwrap();

        let err = transport
            .send_notification(JsonRpcNotification::initialized())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
