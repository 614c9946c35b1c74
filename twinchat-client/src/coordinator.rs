use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use twinchat_core::{ChatSummary, ClientFrame, Message, ProtocolCodec, ServerEvent};

use crate::auth::TokenProvider;
use crate::chats::ChatDirectory;
use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::errors::{ClientError, ClientResult};
use crate::events::SessionEventBus;
use crate::history::MessageHistory;
use crate::queue::{FrameKind, OutboundFrame, OutboundMessageQueue};
use crate::reconciler::{AdmitOutcome, MessageReconciler};

/// Per-chat session state: one codec and one reconciler, swapped out whole
/// on chat switch.
struct ActiveChat {
    chat_id: String,
    codec: ProtocolCodec,
    reconciler: MessageReconciler,
}

/// Top-level session orchestrator. Owns chat selection and drives the
/// connection, the reconciler, the outbound queue, and the chat directory
/// from one place; everything else observes through the event bus.
pub struct ChatSessionCoordinator {
    inner: Arc<Inner>,
    pump_task: JoinHandle<()>,
}

struct Inner {
    config: ClientConfig,
    bus: Arc<SessionEventBus>,
    connection: ConnectionManager,
    history: Arc<dyn MessageHistory>,
    tokens: Arc<dyn TokenProvider>,
    local_user_id: Option<String>,
    active: Mutex<Option<ActiveChat>>,
    directory: Mutex<ChatDirectory>,
    /// Delayed format-variant sends still waiting on their timers. Cleared
    /// whole on chat switch so a variant never lands on the wrong socket.
    pending_sends: Mutex<Vec<JoinHandle<()>>>,
    typing_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSessionCoordinator {
    pub fn new(
        config: ClientConfig,
        tokens: Arc<dyn TokenProvider>,
        history: Arc<dyn MessageHistory>,
        local_user_id: Option<String>,
    ) -> Self {
        let bus = Arc::new(SessionEventBus::new());
        let queue = Arc::new(OutboundMessageQueue::new());
        let connection = ConnectionManager::new(
            config.clone(),
            bus.clone(),
            queue,
            local_user_id.clone(),
        );

        let inner = Arc::new(Inner {
            config,
            bus,
            connection,
            history,
            tokens,
            local_user_id,
            active: Mutex::new(None),
            directory: Mutex::new(ChatDirectory::new()),
            pending_sends: Mutex::new(Vec::new()),
            typing_task: Mutex::new(None),
        });

        // Subscribe before spawning so raw events emitted between
        // construction and the pump's first poll are never lost.
        let pump_inner = inner.clone();
        let raw = inner.bus.subscribe_raw();
        let pump_task = tokio::spawn(async move { Inner::pump(pump_inner, raw).await });

        Self { inner, pump_task }
    }

    /// Switch the active chat. `None` disconnects and clears the session.
    /// Reselecting the current chat keeps its state and only reconnects the
    /// socket if it went down.
    pub async fn select_chat(&self, chat_id: Option<&str>) -> ClientResult<()> {
        let Some(chat_id) = chat_id else {
            self.clear_session();
            return Ok(());
        };

        let already_active = {
            let active = self.inner.active.lock().expect("active lock poisoned");
            active.as_ref().map(|a| a.chat_id == chat_id).unwrap_or(false)
        };
        if already_active {
            // connect() is itself a no-op when the socket is already OPEN.
            return self.connect_active(chat_id).await;
        }

        self.clear_session();
        {
            let mut active = self.inner.active.lock().expect("active lock poisoned");
            *active = Some(ActiveChat {
                chat_id: chat_id.to_string(),
                codec: ProtocolCodec::new(chat_id, self.inner.local_user_id.clone()),
                reconciler: MessageReconciler::new(chat_id),
            });
        }

        self.connect_active(chat_id).await?;
        self.initial_load(chat_id).await;
        Ok(())
    }

    async fn connect_active(&self, chat_id: &str) -> ClientResult<()> {
        let token = self.inner.tokens.access_token();
        self.inner.connection.connect(chat_id, token.as_deref()).await
    }

    /// First page of history plus the read acknowledgement for whatever it
    /// brought in. A failed fetch is logged and leaves the list empty; the
    /// live socket keeps working regardless.
    async fn initial_load(&self, chat_id: &str) {
        match self.inner.history.fetch_page(chat_id, None).await {
            Ok(page) => {
                let loaded = {
                    let mut active = self.inner.active.lock().expect("active lock poisoned");
                    match active.as_mut().filter(|a| a.chat_id == chat_id) {
                        Some(active) => active
                            .reconciler
                            .merge_older(page.results, page.next.as_deref()),
                        // Chat switched away while the fetch was in flight.
                        None => return,
                    }
                };
                tracing::info!("Loaded {} messages for chat {}", loaded, chat_id);
                self.mark_active_chat_read().await;
            }
            Err(e) => {
                tracing::warn!("Initial history load for chat {} failed: {}", chat_id, e);
            }
        }
    }

    /// Send one text message: optimistic placeholder immediately, canonical
    /// frame now, format-variant duplicates after their delays when enabled.
    /// Returns the placeholder; the server echo replaces it in place later.
    pub async fn send_message(
        &self,
        text: &str,
        reply_to: Option<&str>,
    ) -> ClientResult<Message> {
        let (chat_id, placeholder, variants) = {
            let mut active = self.inner.active.lock().expect("active lock poisoned");
            let active = active
                .as_mut()
                .ok_or_else(|| ClientError::InvalidState("no chat selected".into()))?;
            let placeholder = active
                .reconciler
                .create_optimistic(text, reply_to.map(str::to_string));
            let variants = active.codec.encode_text_variants(
                text,
                reply_to,
                self.inner.config.compat_duplicate_sends,
            );
            (active.chat_id.clone(), placeholder, variants)
        };

        self.inner.bus.emit_new_message(placeholder.clone());
        self.stop_typing_timer();

        let mut variants = variants.into_iter();
        if let Some(first) = variants.next() {
            let frame = OutboundFrame::new(FrameKind::ChatMessage, first.payload);
            if let Err(e) = self.inner.connection.send(frame).await {
                tracing::warn!("Send failed, frame stays queued: {}", e);
            }
        }

        for variant in variants {
            let inner = self.inner.clone();
            let chat_id = chat_id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(variant.delay).await;
                let still_active = {
                    let active = inner.active.lock().expect("active lock poisoned");
                    active.as_ref().map(|a| a.chat_id == chat_id).unwrap_or(false)
                };
                if !still_active {
                    return;
                }
                let frame = OutboundFrame::new(FrameKind::ChatMessage, variant.payload);
                if let Err(e) = inner.connection.send(frame).await {
                    tracing::debug!("Variant send failed, frame stays queued: {}", e);
                }
            });
            self.inner
                .pending_sends
                .lock()
                .expect("pending sends lock poisoned")
                .push(handle);
        }

        Ok(placeholder)
    }

    /// Fetch the next older page and prepend what we have not seen yet.
    /// On failure the list, cursor, and `has_more` stay exactly as they were.
    pub async fn load_older(&self) -> ClientResult<usize> {
        let (chat_id, cursor, has_more) = {
            let active = self.inner.active.lock().expect("active lock poisoned");
            let active = active
                .as_ref()
                .ok_or_else(|| ClientError::InvalidState("no chat selected".into()))?;
            (
                active.chat_id.clone(),
                active.reconciler.cursor().map(str::to_string),
                active.reconciler.has_more(),
            )
        };
        if !has_more {
            return Ok(0);
        }

        let page = self
            .inner
            .history
            .fetch_page(&chat_id, cursor.as_deref())
            .await?;

        let mut active = self.inner.active.lock().expect("active lock poisoned");
        match active.as_mut().filter(|a| a.chat_id == chat_id) {
            Some(active) => Ok(active
                .reconciler
                .merge_older(page.results, page.next.as_deref())),
            None => Ok(0),
        }
    }

    /// Raise or lower the typing indicator. Raising arms a timer that lowers
    /// it automatically after the configured delay with no further keystrokes.
    pub async fn set_typing(&self, is_typing: bool) -> ClientResult<()> {
        let payload = {
            let active = self.inner.active.lock().expect("active lock poisoned");
            let active = active
                .as_ref()
                .ok_or_else(|| ClientError::InvalidState("no chat selected".into()))?;
            active.codec.encode(&ClientFrame::Typing { is_typing })?
        };

        self.stop_typing_timer();
        self.inner
            .connection
            .send(OutboundFrame::new(FrameKind::Typing, payload))
            .await?;

        if is_typing {
            let inner = self.inner.clone();
            let delay = self.inner.config.typing_stop_delay;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let payload = {
                    let active = inner.active.lock().expect("active lock poisoned");
                    match active.as_ref() {
                        Some(active) => active
                            .codec
                            .encode(&ClientFrame::Typing { is_typing: false }),
                        None => return,
                    }
                };
                if let Ok(payload) = payload {
                    let frame = OutboundFrame::new(FrameKind::Typing, payload);
                    if let Err(e) = inner.connection.send(frame).await {
                        tracing::debug!("Typing auto-stop send failed: {}", e);
                    }
                }
            });
            *self
                .inner
                .typing_task
                .lock()
                .expect("typing task lock poisoned") = Some(handle);
        }
        Ok(())
    }

    /// Acknowledge every unread inbound message in the active chat: status
    /// flips locally, a read receipt goes out, the sidebar counter resets.
    pub async fn mark_active_chat_read(&self) {
        let (chat_id, unread, payload) = {
            let mut active = self.inner.active.lock().expect("active lock poisoned");
            let Some(active) = active.as_mut() else { return };
            let unread = active.reconciler.unread_inbound_ids();
            if unread.is_empty() {
                (active.chat_id.clone(), unread, None)
            } else {
                active.reconciler.apply_read_receipt(&unread);
                let payload = active
                    .codec
                    .encode(&ClientFrame::ReadReceipt {
                        message_ids: unread.clone(),
                    })
                    .ok();
                (active.chat_id.clone(), unread, payload)
            }
        };

        self.inner
            .directory
            .lock()
            .expect("directory lock poisoned")
            .mark_read(&chat_id);

        if let Some(payload) = payload {
            tracing::debug!("Acknowledging {} messages in chat {}", unread.len(), chat_id);
            let frame = OutboundFrame::new(FrameKind::ReadReceipt, payload);
            if let Err(e) = self.inner.connection.send(frame).await {
                tracing::debug!("Read receipt send failed, frame stays queued: {}", e);
            }
        }
    }

    /// Delete a message: the backend confirms first, then the local list
    /// drops it. A rejected delete leaves the list untouched.
    pub async fn delete_message(&self, message_id: &str) -> ClientResult<()> {
        let chat_id = self.require_active_chat()?;
        self.inner.history.delete_message(&chat_id, message_id).await?;

        let mut active = self.inner.active.lock().expect("active lock poisoned");
        if let Some(active) = active.as_mut().filter(|a| a.chat_id == chat_id) {
            active.reconciler.delete(message_id);
        }
        Ok(())
    }

    pub async fn report_message(&self, message_id: &str, reason: &str) -> ClientResult<()> {
        let chat_id = self.require_active_chat()?;
        self.inner
            .history
            .report_message(&chat_id, message_id, reason)
            .await
    }

    /// Snapshot of the active chat's ordered message list.
    pub fn messages(&self) -> Vec<Message> {
        self.inner
            .active
            .lock()
            .expect("active lock poisoned")
            .as_ref()
            .map(|a| a.reconciler.messages())
            .unwrap_or_default()
    }

    pub fn active_chat(&self) -> Option<String> {
        self.inner
            .active
            .lock()
            .expect("active lock poisoned")
            .as_ref()
            .map(|a| a.chat_id.clone())
    }

    pub fn has_more(&self) -> bool {
        self.inner
            .active
            .lock()
            .expect("active lock poisoned")
            .as_ref()
            .map(|a| a.reconciler.has_more())
            .unwrap_or(false)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn chats(&self) -> Vec<ChatSummary> {
        self.inner
            .directory
            .lock()
            .expect("directory lock poisoned")
            .chats()
            .to_vec()
    }

    /// Seed the sidebar with summaries fetched out of band.
    pub fn set_chats(&self, chats: Vec<ChatSummary>) {
        *self
            .inner
            .directory
            .lock()
            .expect("directory lock poisoned") = ChatDirectory::from_summaries(chats);
    }

    pub fn events(&self) -> Arc<SessionEventBus> {
        self.inner.bus.clone()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Trigger a reconnect of the active chat, e.g. from a manual retry
    /// button after the automatic attempts ran out.
    pub async fn reconnect(&self) -> ClientResult<()> {
        let chat_id = self.require_active_chat()?;
        self.connect_active(&chat_id).await
    }

    /// Tear the whole session down: socket, timers, and the event pump.
    pub fn shutdown(&self) {
        self.clear_session();
        self.pump_task.abort();
    }

    fn require_active_chat(&self) -> ClientResult<String> {
        self.inner
            .active
            .lock()
            .expect("active lock poisoned")
            .as_ref()
            .map(|a| a.chat_id.clone())
            .ok_or_else(|| ClientError::InvalidState("no chat selected".into()))
    }

    fn clear_session(&self) {
        self.inner.connection.disconnect();
        self.inner.connection.queue().clear();
        self.stop_typing_timer();
        for handle in self
            .inner
            .pending_sends
            .lock()
            .expect("pending sends lock poisoned")
            .drain(..)
        {
            handle.abort();
        }
        *self.inner.active.lock().expect("active lock poisoned") = None;
    }

    fn stop_typing_timer(&self) {
        if let Some(handle) = self
            .inner
            .typing_task
            .lock()
            .expect("typing task lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for ChatSessionCoordinator {
    fn drop(&mut self) {
        self.pump_task.abort();
    }
}

impl Inner {
    /// Event pump: consumes decoded socket events and folds them into the
    /// reconciler and the chat directory. Reconciled new messages go out on
    /// the bus; duplicates are dropped here and never reach subscribers.
    async fn pump(
        inner: Arc<Inner>,
        mut raw: tokio::sync::broadcast::Receiver<ServerEvent>,
    ) {
        loop {
            let event = match raw.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event pump lagged, {} events dropped", skipped);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };

            match event {
                ServerEvent::Message(message) => inner.admit_message(message),
                ServerEvent::ReadReceipt { message_ids } => {
                    let mut active = inner.active.lock().expect("active lock poisoned");
                    if let Some(active) = active.as_mut() {
                        active.reconciler.apply_read_receipt(&message_ids);
                    }
                }
                // Typing, heartbeat acks, and errors are handled at the
                // connection layer.
                _ => {}
            }
        }
    }

    fn admit_message(&self, message: Message) {
        let (published, chat_is_active) = {
            let mut active = self.active.lock().expect("active lock poisoned");
            match active.as_mut().filter(|a| a.chat_id == message.chat_id) {
                Some(active) => match active.reconciler.admit(message.clone()) {
                    AdmitOutcome::Duplicate => return,
                    AdmitOutcome::Replaced { index, .. }
                    | AdmitOutcome::Appended { index } => {
                        // Publish the reconciled entry, not the wire copy;
                        // the two differ when a replacement keeps the
                        // placeholder's timestamp.
                        let published = active
                            .reconciler
                            .message_at(index)
                            .cloned()
                            .unwrap_or(message);
                        (published, true)
                    }
                },
                // Traffic for another chat still updates the sidebar.
                None => (message, false),
            }
        };

        self.directory
            .lock()
            .expect("directory lock poisoned")
            .touch(&published, chat_is_active);
        self.bus.emit_new_message(published);
    }
}
