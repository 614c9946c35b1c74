use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use twinchat_core::{ProtocolCodec, ServerEvent};

use crate::config::ClientConfig;
use crate::errors::{ClientError, ClientResult};
use crate::events::SessionEventBus;
use crate::queue::{OutboundFrame, OutboundMessageQueue};

type NoSend = fn(OutboundFrame) -> std::future::Ready<ClientResult<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Disconnected,
}

/// Exponential backoff delay for one reconnect attempt (1-based).
pub(crate) fn reconnect_delay(config: &ClientConfig, attempt: u32) -> Duration {
    let base = config.reconnect_base_delay.as_millis() as u64;
    let delay = base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Duration::from_millis(delay.min(config.reconnect_max_delay.as_millis() as u64))
}

/// Enforces the minimum spacing between heartbeats, no matter which timer or
/// caller asked for one.
#[derive(Debug)]
pub(crate) struct HeartbeatThrottle {
    last_sent: Option<Instant>,
    min_gap: Duration,
}

impl HeartbeatThrottle {
    pub(crate) fn new(min_gap: Duration) -> Self {
        Self {
            last_sent: None,
            min_gap,
        }
    }

    pub(crate) fn should_send(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.duration_since(last) < self.min_gap => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }
}

/// Everything tied to one connected (or connecting) chat.
struct ActiveSession {
    chat_id: String,
    token: String,
    codec: ProtocolCodec,
    writer_tx: Option<mpsc::Sender<String>>,
    writer_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl ActiveSession {
    fn new(chat_id: &str, token: &str, local_user_id: Option<String>) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            token: token.to_string(),
            codec: ProtocolCodec::new(chat_id, local_user_id),
            writer_tx: None,
            writer_task: None,
            reader_task: None,
            heartbeat_task: None,
            reconnect_task: None,
        }
    }
}

/// Owns the one socket per active chat: open/close, the reconnect policy,
/// and the heartbeat. Nothing else touches the socket handle.
///
/// Reconnects happen only after unclean closures, with exponential backoff
/// and a hard attempt cap; an explicit `disconnect` or a normal server close
/// ends the session for good until the caller reconnects.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    bus: Arc<SessionEventBus>,
    queue: Arc<OutboundMessageQueue>,
    local_user_id: Option<String>,
    client_id: Uuid,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<ActiveSession>>,
    /// Bumped on every connect/disconnect; spawned tasks carry the value they
    /// were born under and go inert once it moves on.
    generation: AtomicU64,
    reconnect_attempt: AtomicU32,
    throttle: Mutex<HeartbeatThrottle>,
}

impl ConnectionManager {
    pub fn new(
        config: ClientConfig,
        bus: Arc<SessionEventBus>,
        queue: Arc<OutboundMessageQueue>,
        local_user_id: Option<String>,
    ) -> Self {
        let throttle = HeartbeatThrottle::new(config.heartbeat_min_gap);
        Self {
            inner: Arc::new(Inner {
                config,
                bus,
                queue,
                local_user_id,
                client_id: Uuid::new_v4(),
                state: Mutex::new(ConnectionState::Idle),
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                reconnect_attempt: AtomicU32::new(0),
                throttle: Mutex::new(throttle),
            }),
        }
    }

    /// Connect to one chat's socket. A no-op when already OPEN for the same
    /// chat; otherwise any existing connection is closed first. Without an
    /// auth token this logs, reports DISCONNECTED, and does not retry.
    pub async fn connect(&self, chat_id: &str, token: Option<&str>) -> ClientResult<()> {
        if self.state() == ConnectionState::Open && self.active_chat().as_deref() == Some(chat_id)
        {
            tracing::debug!(
                "CLIENT {}: already connected to chat {}, nothing to do",
                self.inner.client_id,
                chat_id
            );
            return Ok(());
        }

        self.inner.teardown();

        let token = match token.filter(|t| !t.is_empty()) {
            Some(token) => token.to_string(),
            None => {
                tracing::warn!(
                    "CLIENT {}: no access token available, staying disconnected",
                    self.inner.client_id
                );
                self.inner.set_state(ConnectionState::Disconnected);
                self.inner.bus.emit_connection_status(false);
                return Ok(());
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.reconnect_attempt.store(0, Ordering::SeqCst);
        {
            let mut session = self.inner.session.lock().expect("session lock poisoned");
            *session = Some(ActiveSession::new(
                chat_id,
                &token,
                self.inner.local_user_id.clone(),
            ));
        }

        if let Err(e) = Inner::establish(self.inner.clone(), generation).await {
            tracing::warn!(
                "CLIENT {}: connection to chat {} failed: {}",
                self.inner.client_id,
                chat_id,
                e
            );
            Inner::handle_closed(self.inner.clone(), generation, true);
        }
        Ok(())
    }

    /// Close the socket cleanly and cancel every pending timer. No reconnect
    /// or heartbeat fires after this returns.
    pub fn disconnect(&self) {
        self.inner.teardown();
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    pub fn active_chat(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .expect("session lock poisoned")
            .as_ref()
            .map(|s| s.chat_id.clone())
    }

    /// Connection status stream; replays the current state to new
    /// subscribers.
    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.inner.bus.subscribe_connection_status()
    }

    /// Transmit a frame now if OPEN, buffer it otherwise. A failed transmit
    /// re-queues the frame at the front of the buffer.
    pub async fn send(&self, frame: OutboundFrame) -> ClientResult<bool> {
        match self.inner.writer_tx() {
            Some(tx) => {
                self.inner
                    .queue
                    .enqueue_or_send(frame, Some(move |f: OutboundFrame| async move {
                        tx.send(f.payload)
                            .await
                            .map_err(|_| ClientError::ConnectionLost)
                    }))
                    .await
            }
            None => self.inner.queue.enqueue_or_send(frame, None::<NoSend>).await,
        }
    }

    /// Ask for a keepalive now. Throttled so no two heartbeats go out within
    /// the configured minimum gap, whatever the trigger source.
    pub async fn trigger_heartbeat(&self) {
        self.inner.trigger_heartbeat().await;
    }

    pub fn queue(&self) -> Arc<OutboundMessageQueue> {
        self.inner.queue.clone()
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn writer_tx(&self) -> Option<mpsc::Sender<String>> {
        self.session
            .lock()
            .expect("session lock poisoned")
            .as_ref()
            .and_then(|s| s.writer_tx.clone())
    }

    /// Open the socket for the current session and wire up the writer,
    /// reader, and heartbeat tasks. Flushes the outbound buffer once OPEN.
    async fn establish(self: Arc<Self>, generation: u64) -> ClientResult<()> {
        let (chat_id, token, codec) = {
            let session = self.session.lock().expect("session lock poisoned");
            let session = session
                .as_ref()
                .ok_or_else(|| ClientError::InvalidState("no session to establish".into()))?;
            (
                session.chat_id.clone(),
                session.token.clone(),
                session.codec.clone(),
            )
        };

        self.set_state(ConnectionState::Connecting);
        let url = self.config.ws_url(&chat_id, &token)?;
        tracing::info!(
            "CLIENT {}: connecting to chat {}",
            self.client_id,
            chat_id
        );

        let ws = match timeout(self.config.open_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return Err(ClientError::WebSocket(e.to_string())),
            Err(_) => {
                return Err(ClientError::WebSocket(format!(
                    "open timed out after {:?}",
                    self.config.open_timeout
                )))
            }
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            // Torn down while the handshake was in flight; drop the socket.
            return Ok(());
        }

        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);

        // Writer: drains the channel; channel closure is the clean-shutdown
        // signal and ends with a normal close frame.
        let writer_inner = self.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if let Err(e) = write.send(WsMessage::Text(payload)).await {
                    tracing::warn!(
                        "CLIENT {}: socket write failed: {}",
                        writer_inner.client_id,
                        e
                    );
                    Inner::handle_closed(writer_inner, generation, true);
                    return;
                }
            }
            let _ = write.send(WsMessage::Close(None)).await;
        });

        // Reader: decodes frames and fans them out until the stream ends.
        let reader_inner = self.clone();
        let reader_task = tokio::spawn(async move {
            let mut unclean = true;
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => reader_inner.dispatch(&codec, &text),
                    Ok(WsMessage::Close(close_frame)) => {
                        unclean =
                            !matches!(&close_frame, Some(f) if f.code == CloseCode::Normal);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            "CLIENT {}: socket read error: {}",
                            reader_inner.client_id,
                            e
                        );
                        break;
                    }
                }
            }
            Inner::handle_closed(reader_inner, generation, unclean);
        });

        // Heartbeat timer; the throttle coalesces it with manual triggers.
        let heartbeat_inner = self.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_inner.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                heartbeat_inner.trigger_heartbeat().await;
            }
        });

        {
            let mut session = self.session.lock().expect("session lock poisoned");
            if let Some(session) = session.as_mut() {
                session.writer_tx = Some(tx.clone());
                session.writer_task = Some(writer_task);
                session.reader_task = Some(reader_task);
                session.heartbeat_task = Some(heartbeat_task);
            }
        }

        self.reconnect_attempt.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Open);
        self.bus.emit_connection_status(true);
        tracing::info!("CLIENT {}: chat {} socket OPEN", self.client_id, chat_id);

        // Drain frames buffered while disconnected, strictly FIFO. A failure
        // leaves the rest queued for the next OPEN.
        let flush_tx = tx;
        if let Err(e) = self
            .queue
            .flush(move |frame: OutboundFrame| {
                let tx = flush_tx.clone();
                async move {
                    tx.send(frame.payload)
                        .await
                        .map_err(|_| ClientError::ConnectionLost)
                }
            })
            .await
        {
            tracing::warn!("CLIENT {}: flush after reconnect failed: {}", self.client_id, e);
        }
        Ok(())
    }

    fn dispatch(&self, codec: &ProtocolCodec, raw: &str) {
        let Some(event) = codec.decode(raw) else { return };
        match &event {
            ServerEvent::Typing { is_typing, .. } => self.bus.emit_typing(*is_typing),
            ServerEvent::ServerError { message } => {
                tracing::warn!("CLIENT {}: server error: {}", self.client_id, message);
                if message.to_lowercase().contains("heartbeat") {
                    // Server does not support keepalives; stop sending them
                    // instead of tearing the connection down.
                    self.stop_heartbeat();
                }
            }
            ServerEvent::HeartbeatAck => {
                tracing::trace!("CLIENT {}: heartbeat acknowledged", self.client_id);
            }
            _ => {}
        }
        self.bus.emit_raw(event);
    }

    async fn trigger_heartbeat(&self) {
        if self.current_state() != ConnectionState::Open {
            return;
        }
        let allowed = self
            .throttle
            .lock()
            .expect("throttle lock poisoned")
            .should_send(Instant::now());
        if !allowed {
            return;
        }
        if let Some(tx) = self.writer_tx() {
            if tx.send("ping".to_string()).await.is_err() {
                tracing::warn!(
                    "CLIENT {}: heartbeat send failed, writer gone",
                    self.client_id
                );
            }
        }
    }

    fn stop_heartbeat(&self) {
        let task = self
            .session
            .lock()
            .expect("session lock poisoned")
            .as_mut()
            .and_then(|s| s.heartbeat_task.take());
        if let Some(task) = task {
            task.abort();
            tracing::info!("CLIENT {}: heartbeat timer cancelled", self.client_id);
        }
    }

    /// One of the socket tasks observed the connection going away. First
    /// caller for a generation wins; stale generations are ignored entirely.
    fn handle_closed(self: Arc<Self>, generation: u64, unclean: bool) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if matches!(
                *state,
                ConnectionState::Disconnected | ConnectionState::Closing | ConnectionState::Idle
            ) {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        {
            let mut session = self.session.lock().expect("session lock poisoned");
            if let Some(session) = session.as_mut() {
                session.writer_tx = None;
                if let Some(task) = session.heartbeat_task.take() {
                    task.abort();
                }
            }
        }
        self.bus.emit_connection_status(false);

        if unclean {
            self.schedule_reconnect(generation);
        } else {
            tracing::info!(
                "CLIENT {}: socket closed normally, not reconnecting",
                self.client_id
            );
        }
    }

    fn schedule_reconnect(self: Arc<Self>, generation: u64) {
        let attempt = self.reconnect_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.config.max_reconnect_attempts {
            tracing::warn!(
                "CLIENT {}: still disconnected after {} reconnect attempts, waiting for an explicit reconnect",
                self.client_id,
                self.config.max_reconnect_attempts
            );
            return;
        }

        let delay = reconnect_delay(&self.config, attempt);
        tracing::info!(
            "CLIENT {}: reconnect attempt #{} in {:?}",
            self.client_id,
            attempt,
            delay
        );

        let inner = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Err(e) = Inner::establish(inner.clone(), generation).await {
                tracing::warn!(
                    "CLIENT {}: reconnect attempt #{} failed: {}",
                    inner.client_id,
                    attempt,
                    e
                );
                Inner::handle_closed(inner, generation, true);
            }
        });

        let mut session = self.session.lock().expect("session lock poisoned");
        match session.as_mut() {
            Some(session) => session.reconnect_task = Some(handle),
            // Session torn down in the meantime; the timer must not fire.
            None => handle.abort(),
        }
    }

    /// Invalidate every task of the current session and close the socket.
    fn teardown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let session = self.session.lock().expect("session lock poisoned").take();
        if let Some(mut session) = session {
            self.set_state(ConnectionState::Closing);
            // Dropping the writer channel makes the writer task send a
            // normal close frame and exit on its own.
            session.writer_tx.take();
            for task in [
                session.reader_task.take(),
                session.heartbeat_task.take(),
                session.reconnect_task.take(),
            ]
            .into_iter()
            .flatten()
            {
                task.abort();
            }
            tracing::info!(
                "CLIENT {}: disconnected from chat {}",
                self.client_id,
                session.chat_id
            );
        }
        self.reconnect_attempt.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        self.bus.emit_connection_status(false);
    }
}
