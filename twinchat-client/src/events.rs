use tokio::sync::{broadcast, watch};
use twinchat_core::{Message, ServerEvent};

const CHANNEL_CAPACITY: usize = 128;

/// Typed fan-out of decoded session events.
///
/// Four channels: connection status (replays the current value to new
/// subscribers), typing indicator, raw decoded events, and reconciled new
/// messages. Delivery order within a channel matches emit order; a subscriber
/// dropping out never affects delivery to the others.
pub struct SessionEventBus {
    connection_status_tx: watch::Sender<bool>,
    typing_tx: broadcast::Sender<bool>,
    raw_tx: broadcast::Sender<ServerEvent>,
    new_message_tx: broadcast::Sender<Message>,
}

impl SessionEventBus {
    pub fn new() -> Self {
        let (connection_status_tx, _) = watch::channel(false);
        let (typing_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (raw_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (new_message_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            connection_status_tx,
            typing_tx,
            raw_tx,
            new_message_tx,
        }
    }

    pub fn emit_connection_status(&self, connected: bool) {
        self.connection_status_tx.send_replace(connected);
    }

    pub fn emit_typing(&self, is_typing: bool) {
        let _ = self.typing_tx.send(is_typing);
    }

    pub fn emit_raw(&self, event: ServerEvent) {
        let _ = self.raw_tx.send(event);
    }

    pub fn emit_new_message(&self, message: Message) {
        let _ = self.new_message_tx.send(message);
    }

    /// Current connection state without subscribing.
    pub fn is_connected(&self) -> bool {
        *self.connection_status_tx.borrow()
    }

    pub fn subscribe_connection_status(&self) -> watch::Receiver<bool> {
        self.connection_status_tx.subscribe()
    }

    pub fn subscribe_typing(&self) -> broadcast::Receiver<bool> {
        self.typing_tx.subscribe()
    }

    pub fn subscribe_raw(&self) -> broadcast::Receiver<ServerEvent> {
        self.raw_tx.subscribe()
    }

    pub fn subscribe_new_message(&self) -> broadcast::Receiver<Message> {
        self.new_message_tx.subscribe()
    }
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new()
    }
}
