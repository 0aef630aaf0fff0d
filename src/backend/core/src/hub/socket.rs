//! Websocket adapter for hub clients.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::client::{ClientId, HubClient};
use super::message::{ClientMessage, HubMessage};
use super::NotificationHub;

/// Drive one upgraded websocket as a hub client until it closes.
pub async fn serve_socket(socket: WebSocket, hub: Arc<NotificationHub>) {
    let (client, mut outbound) = HubClient::new(hub.config().client_buffer);

    let client_id = match hub.register(client).await {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "Failed to register websocket client");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Message forwarding task (outgoing)
    let mut forward_handle = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize hub message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Main message loop
    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                hub.touch(client_id);
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&hub, client_id, &text);
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(client_id = %client_id, "Client requested close");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client_id = %client_id, error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        info!(client_id = %client_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            // The hub closed our channel (eviction or shutdown) or the peer stopped reading.
            _ = &mut forward_handle => {
                debug!(client_id = %client_id, "Outbound stream finished");
                break;
            }
        }
    }

    forward_handle.abort();
    hub.unregister(client_id).await;
}

/// Apply a control message from the client.
fn handle_client_message(hub: &NotificationHub, client_id: ClientId, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let _ = hub.send_to(
                client_id,
                HubMessage::error(format!("Invalid message format: {}", e)),
            );
            return;
        }
    };

    let result = match &message {
        ClientMessage::Subscribe { topic } => hub.subscribe(client_id, topic),
        ClientMessage::Unsubscribe { topic } => hub.unsubscribe(client_id, topic),
    };

    let reply = match (result, message) {
        (Ok(()), ClientMessage::Subscribe { topic }) => {
            HubMessage::notification(format!("Subscribed to {}", topic)).with_data_field("topic", topic)
        }
        (Ok(()), ClientMessage::Unsubscribe { topic }) => {
            HubMessage::notification(format!("Unsubscribed from {}", topic)).with_data_field("topic", topic)
        }
        (Err(e), _) => HubMessage::error(e.user_message().to_string()),
    };
    let _ = hub.send_to(client_id, reply);
}
