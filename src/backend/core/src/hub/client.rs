//! Hub client handle.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::message::HubMessage;

/// Unique identifier for a hub client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live observer connection as seen by the hub.
///
/// The hub owns the sending half; dropping the client closes the channel
/// and ends the receiver's stream.
#[derive(Debug)]
pub struct HubClient {
    pub id: ClientId,
    sender: mpsc::Sender<HubMessage>,
    last_activity: Instant,
}

impl HubClient {
    /// Create a client with an outbound buffer of `buffer` messages.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<HubMessage>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let client = Self {
            id: ClientId::new(),
            sender,
            last_activity: Instant::now(),
        };
        (client, receiver)
    }

    /// Queue a message without waiting for buffer space.
    pub(crate) fn try_send(&self, message: HubMessage) -> Result<(), mpsc::error::TrySendError<HubMessage>> {
        self.sender.try_send(message)
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }
}
