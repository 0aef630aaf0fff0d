//! Topic-based notification hub.
//!
//! Fans out experiment, metric, and task events to live observers.
//!
//! - **Event loop**: one task serializes registration, unregistration and
//!   broadcast delivery, plus periodic heartbeat and idle eviction.
//!   Subscription changes go straight to the registry lock instead
//! - **Registry**: clients and the topic index behind one `RwLock`, so the
//!   two-way subscription index never goes out of step
//! - **Delivery**: non-blocking `try_send` per client; a full buffer drops
//!   the message for that client only
//!
//! Producers hold an `Arc<NotificationHub>` and never wait on consumers.

use metrics::counter;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::error::{Result, SplitrunError};
use crate::experiments::ExperimentId;
use crate::observability::metrics as hub_metrics;

mod client;
mod message;
mod socket;
mod topics;

pub use client::{ClientId, HubClient};
pub use message::{experiment_topic, metrics_topic, ClientMessage, HubMessage, MessageType};
pub use socket::serve_socket;
pub use topics::TopicIndex;

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Registry {
    clients: HashMap<ClientId, HubClient>,
    topics: TopicIndex,
}

impl Registry {
    fn remove(&mut self, client_id: ClientId) -> bool {
        self.topics.remove_client(client_id);
        self.clients.remove(&client_id).is_some()
    }
}

type RegisterRequest = (HubClient, oneshot::Sender<()>);
type UnregisterRequest = (ClientId, Option<oneshot::Sender<bool>>);

// ═══════════════════════════════════════════════════════════════════════════════
// Hub
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle to the running hub.
pub struct NotificationHub {
    config: HubConfig,
    registry: Arc<RwLock<Registry>>,
    register_tx: mpsc::UnboundedSender<RegisterRequest>,
    unregister_tx: mpsc::UnboundedSender<UnregisterRequest>,
    broadcast_tx: mpsc::Sender<HubMessage>,
    cancel: CancellationToken,
}

impl NotificationHub {
    /// Spawn the event loop and return a handle to it.
    pub fn start(config: HubConfig) -> Arc<Self> {
        let registry = Arc::new(RwLock::new(Registry::default()));
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_buffer.max(1));
        let cancel = CancellationToken::new();

        let event_loop = EventLoop {
            config: config.clone(),
            registry: registry.clone(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            cancel: cancel.clone(),
        };
        tokio::spawn(event_loop.run());

        info!(
            heartbeat_interval = ?config.heartbeat_interval,
            idle_timeout = ?config.idle_timeout,
            "Notification hub started"
        );

        Arc::new(Self {
            config,
            registry,
            register_tx,
            unregister_tx,
            broadcast_tx,
            cancel,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Client lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a client. Returns once the event loop has added it and sent
    /// the welcome notification.
    pub async fn register(&self, client: HubClient) -> Result<ClientId> {
        let client_id = client.id;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.register_tx
            .send((client, ack_tx))
            .map_err(|_| SplitrunError::hub_unavailable())?;
        ack_rx.await.map_err(|_| SplitrunError::hub_unavailable())?;
        Ok(client_id)
    }

    /// Unregister a client and wait for the event loop to apply it.
    /// Returns false if the client was not registered.
    pub async fn unregister(&self, client_id: ClientId) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.unregister_tx.send((client_id, Some(ack_tx))).is_err() {
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }

    /// Subscribe a registered client to a topic.
    ///
    /// Applied directly under the registry write lock rather than through the
    /// event loop: it touches only the topic index for a client the registry
    /// already holds, and the websocket reader needs the reply synchronously.
    pub fn subscribe(&self, client_id: ClientId, topic: &str) -> Result<()> {
        let mut registry = self.registry.write();
        if !registry.clients.contains_key(&client_id) {
            return Err(SplitrunError::client_not_found(client_id));
        }
        if registry.topics.subscribe(client_id, topic) {
            debug!(client_id = %client_id, topic = %topic, "Client subscribed");
        }
        Ok(())
    }

    /// Unsubscribe a registered client from a topic. Same locking as
    /// [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, client_id: ClientId, topic: &str) -> Result<()> {
        let mut registry = self.registry.write();
        if !registry.clients.contains_key(&client_id) {
            return Err(SplitrunError::client_not_found(client_id));
        }
        if registry.topics.unsubscribe(client_id, topic) {
            debug!(client_id = %client_id, topic = %topic, "Client unsubscribed");
        }
        Ok(())
    }

    /// Record inbound activity from a client.
    pub fn touch(&self, client_id: ClientId) -> bool {
        match self.registry.write().clients.get_mut(&client_id) {
            Some(client) => {
                client.touch();
                true
            }
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Publishing
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue a message for delivery. Never waits: if the hub mailbox is full
    /// the message is dropped with a warning.
    pub fn broadcast(&self, message: HubMessage) {
        match self.broadcast_tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                counter!(hub_metrics::HUB_MESSAGES_DROPPED, "reason" => "mailbox_full").increment(1);
                warn!(
                    message_type = ?message.message_type,
                    topic = ?message.topic,
                    "Hub mailbox full, dropping broadcast"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Hub stopped, broadcast discarded");
            }
        }
    }

    pub fn broadcast_experiment_update(&self, experiment_id: ExperimentId, data: serde_json::Value) {
        self.broadcast(HubMessage::experiment_update(experiment_id, data));
    }

    pub fn broadcast_metric_update(&self, experiment_id: ExperimentId, data: serde_json::Value) {
        self.broadcast(HubMessage::metric_update(experiment_id, data));
    }

    pub fn broadcast_status_change(&self, topic: impl Into<String>, data: serde_json::Value) {
        self.broadcast(HubMessage::status_change(topic, data));
    }

    /// Send directly to one client, bypassing topics.
    pub fn send_to(&self, client_id: ClientId, message: HubMessage) -> Result<()> {
        let registry = self.registry.read();
        let client = registry
            .clients
            .get(&client_id)
            .ok_or_else(|| SplitrunError::client_not_found(client_id))?;
        deliver(client, message);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lookups
    // ─────────────────────────────────────────────────────────────────────────

    pub fn client_count(&self) -> usize {
        self.registry.read().clients.len()
    }

    pub fn is_registered(&self, client_id: ClientId) -> bool {
        self.registry.read().clients.contains_key(&client_id)
    }

    pub fn subscribers(&self, topic: &str) -> Vec<ClientId> {
        self.registry.read().topics.subscribers(topic)
    }

    pub fn topics_of(&self, client_id: ClientId) -> Vec<String> {
        self.registry.read().topics.topics_of(client_id)
    }

    /// Stop the event loop and drop every client.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for NotificationHub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Non-blocking delivery to one client.
fn deliver(client: &HubClient, message: HubMessage) {
    match client.try_send(message) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(message)) => {
            counter!(hub_metrics::HUB_MESSAGES_DROPPED, "reason" => "client_buffer_full").increment(1);
            warn!(
                client_id = %client.id,
                message_type = ?message.message_type,
                topic = ?message.topic,
                "Client buffer full, dropping message"
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(client_id = %client.id, "Client channel closed, skipping delivery");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event Loop
// ═══════════════════════════════════════════════════════════════════════════════

struct EventLoop {
    config: HubConfig,
    registry: Arc<RwLock<Registry>>,
    register_rx: mpsc::UnboundedReceiver<RegisterRequest>,
    unregister_rx: mpsc::UnboundedReceiver<UnregisterRequest>,
    broadcast_rx: mpsc::Receiver<HubMessage>,
    cancel: CancellationToken,
}

impl EventLoop {
    async fn run(mut self) {
        let period = self.config.heartbeat_interval;
        let mut housekeeping = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                Some((client, ack)) = self.register_rx.recv() => {
                    self.register(client);
                    let _ = ack.send(());
                }

                Some((client_id, ack)) = self.unregister_rx.recv() => {
                    let removed = self.unregister(client_id);
                    if let Some(ack) = ack {
                        let _ = ack.send(removed);
                    }
                }

                Some(message) = self.broadcast_rx.recv() => {
                    self.dispatch(message);
                }

                _ = housekeeping.tick() => {
                    self.evict_idle();
                    self.dispatch(HubMessage::heartbeat());
                }
            }
        }

        let mut registry = self.registry.write();
        let dropped = registry.clients.len();
        *registry = Registry::default();
        hub_metrics::set_hub_clients(0);
        info!(clients_dropped = dropped, "Notification hub stopped");
    }

    fn register(&self, client: HubClient) {
        let client_id = client.id;
        deliver(
            &client,
            HubMessage::notification("Connected to notification hub")
                .with_data_field("client_id", client_id.to_string()),
        );

        let count = {
            let mut registry = self.registry.write();
            registry.clients.insert(client_id, client);
            registry.clients.len()
        };
        hub_metrics::set_hub_clients(count);
        info!(client_id = %client_id, clients = count, "Client registered");
    }

    fn unregister(&self, client_id: ClientId) -> bool {
        let (removed, count) = {
            let mut registry = self.registry.write();
            let removed = registry.remove(client_id);
            (removed, registry.clients.len())
        };
        if removed {
            hub_metrics::set_hub_clients(count);
            info!(client_id = %client_id, clients = count, "Client unregistered");
        }
        removed
    }

    fn dispatch(&self, message: HubMessage) {
        let registry = self.registry.read();
        match message.topic.as_deref() {
            Some(topic) => {
                for client_id in registry.topics.subscribers(topic) {
                    if let Some(client) = registry.clients.get(&client_id) {
                        deliver(client, message.clone());
                    }
                }
            }
            None => {
                for client in registry.clients.values() {
                    deliver(client, message.clone());
                }
            }
        }
    }

    fn evict_idle(&self) {
        let idle: Vec<ClientId> = self
            .registry
            .read()
            .clients
            .values()
            .filter(|c| c.idle_for() > self.config.idle_timeout)
            .map(|c| c.id)
            .collect();

        for client_id in idle {
            if self.unregister(client_id) {
                info!(client_id = %client_id, "Evicted idle client");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
