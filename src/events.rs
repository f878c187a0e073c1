//! In-process publish/subscribe.
//!
//! [`EventBus`] wraps a Tokio broadcast channel. Every subscription hands
//! back a handle that ends it: [`Subscription`] for consumers that pull
//! events with `recv().await`, [`Listener`] for callback-style consumers.
//! Dropping either handle unsubscribes.
//!
//! The host publishes [`HostEvent`]s on one bus; each `ServerInstance`
//! publishes its own `StatusChange`s on a bus of its own.

use crate::config::ServerType;
use crate::server::ServerStatus;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;

/// Why a server was restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartReason {
    /// `restart_server` was called
    Explicit,
    /// The server crashed and `restart_on_crash` is enabled
    Crash,
}

/// Events published by the `ServerHost`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HostEvent {
    /// `initialize()` completed
    Initialized,
    /// A server reached `Running`
    #[serde(rename_all = "camelCase")]
    ServerStarted {
        /// Server id
        server_id: String,
        /// Display name from the config
        name: String,
        /// Isolation type
        server_type: ServerType,
    },
    /// A server reached `Stopped` and left the registry
    #[serde(rename_all = "camelCase")]
    ServerStopped {
        /// Server id
        server_id: String,
    },
    /// A server was replaced by a fresh instance
    #[serde(rename_all = "camelCase")]
    ServerRestarted {
        /// Server id
        server_id: String,
        /// What triggered the restart
        reason: RestartReason,
    },
    /// A server reported or caused an error
    #[serde(rename_all = "camelCase")]
    ServerError {
        /// Server id
        server_id: String,
        /// Error description
        error: String,
    },
    /// An instance moved along its state machine
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        /// Server id
        server_id: String,
        /// New status
        status: ServerStatus,
        /// Status before the transition
        previous: ServerStatus,
    },
    /// `shutdown()` completed
    Shutdown,
}

impl HostEvent {
    /// Wire name of the event, e.g. `server-started`
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::ServerStarted { .. } => "server-started",
            Self::ServerStopped { .. } => "server-stopped",
            Self::ServerRestarted { .. } => "server-restarted",
            Self::ServerError { .. } => "server-error",
            Self::StatusChanged { .. } => "status-changed",
            Self::Shutdown => "shutdown",
        }
    }

    /// Server the event concerns, if any
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::ServerStarted { server_id, .. }
            | Self::ServerStopped { server_id }
            | Self::ServerRestarted { server_id, .. }
            | Self::ServerError { server_id, .. }
            | Self::StatusChanged { server_id, .. } => Some(server_id),
            Self::Initialized | Self::Shutdown => None,
        }
    }
}

/// Broadcasts events of type `E` to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Create a bus buffering up to `capacity` events per subscriber.
    ///
    /// Slow subscribers lose the oldest events once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn emit(&self, event: E) -> usize {
        // No subscribers is not an error
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> Subscription<E> {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Run `callback` for every event published from now on.
    ///
    /// The callback runs on a Tokio task. Must be called within a runtime.
    pub fn on<F>(&self, callback: F) -> Listener
    where
        F: Fn(E) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                callback(event);
            }
        });
        Listener { task }
    }

    /// Current number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Pull-style subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<E> {
    receiver: broadcast::Receiver<E>,
}

impl<E: Clone> Subscription<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` once the bus is gone. Events lost because this
    /// subscriber fell behind are skipped.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// End the subscription
    pub fn unsubscribe(self) {}
}

/// Handle of a callback registered with [`EventBus::on`].
///
/// Dropping it unsubscribes the callback.
#[derive(Debug)]
pub struct Listener {
    task: JoinHandle<()>,
}

impl Listener {
    /// End the subscription
    pub fn unsubscribe(self) {}
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
