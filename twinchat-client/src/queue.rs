use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::errors::ClientResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    ChatMessage,
    Typing,
    ReadReceipt,
    Heartbeat,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::ChatMessage => "chat_message",
            FrameKind::Typing => "typing",
            FrameKind::ReadReceipt => "read_receipt",
            FrameKind::Heartbeat => "heartbeat",
        }
    }
}

/// One encoded wire payload waiting for transmission.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub kind: FrameKind,
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboundFrame {
    pub fn new(kind: FrameKind, payload: String) -> Self {
        Self {
            kind,
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// FIFO buffer for frames produced while the socket is down.
///
/// Frames drain strictly in insertion order on reconnect. A failed send puts
/// the frame back at the front of the remaining queue so nothing is dropped
/// and relative order is preserved.
pub struct OutboundMessageQueue {
    frames: Mutex<VecDeque<OutboundFrame>>,
}

impl OutboundMessageQueue {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enqueue(&self, frame: OutboundFrame) {
        tracing::debug!("Buffering {} frame while disconnected", frame.kind.as_str());
        self.frames
            .lock()
            .expect("queue lock poisoned")
            .push_back(frame);
    }

    /// Transmit immediately when a sender is available, otherwise buffer.
    /// Returns `true` when the frame went out on the wire.
    pub async fn enqueue_or_send<F, Fut>(
        &self,
        frame: OutboundFrame,
        send_fn: Option<F>,
    ) -> ClientResult<bool>
    where
        F: FnOnce(OutboundFrame) -> Fut,
        Fut: std::future::Future<Output = ClientResult<()>>,
    {
        match send_fn {
            Some(send) => match send(frame.clone()).await {
                Ok(()) => Ok(true),
                Err(e) => {
                    tracing::warn!(
                        "Send failed for {} frame, re-queueing: {}",
                        frame.kind.as_str(),
                        e
                    );
                    self.frames
                        .lock()
                        .expect("queue lock poisoned")
                        .push_front(frame);
                    Err(e)
                }
            },
            None => {
                self.enqueue(frame);
                Ok(false)
            }
        }
    }

    /// Drain the buffer in insertion order. Stops at the first failed send,
    /// putting that frame back at the front so the next flush resumes from
    /// its original position. Returns the number of frames transmitted.
    pub async fn flush<F, Fut>(&self, mut send_fn: F) -> ClientResult<usize>
    where
        F: FnMut(OutboundFrame) -> Fut,
        Fut: std::future::Future<Output = ClientResult<()>>,
    {
        let mut sent = 0;
        loop {
            let frame = {
                let mut frames = self.frames.lock().expect("queue lock poisoned");
                match frames.pop_front() {
                    Some(frame) => frame,
                    None => break,
                }
            };

            match send_fn(frame.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(
                        "Flush interrupted at {} frame ({} sent): {}",
                        frame.kind.as_str(),
                        sent,
                        e
                    );
                    self.frames
                        .lock()
                        .expect("queue lock poisoned")
                        .push_front(frame);
                    return Err(e);
                }
            }
        }
        if sent > 0 {
            tracing::info!("Flushed {} buffered frames", sent);
        }
        Ok(sent)
    }

    pub fn clear(&self) {
        self.frames.lock().expect("queue lock poisoned").clear();
    }
}

impl Default for OutboundMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    use crate::errors::ClientError;

    fn frame(payload: &str) -> OutboundFrame {
        OutboundFrame::new(FrameKind::ChatMessage, payload.to_string())
    }

    #[tokio::test]
    async fn test_flush_drains_fifo_exactly_once() {
        let queue = OutboundMessageQueue::new();
        queue.enqueue(frame("A"));
        queue.enqueue(frame("B"));
        queue.enqueue(frame("C"));

        let sent = Arc::new(AsyncMutex::new(Vec::new()));
        let sent_clone = sent.clone();
        let count = queue
            .flush(move |f| {
                let sent = sent_clone.clone();
                async move {
                    sent.lock().await.push(f.payload);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(*sent.lock().await, vec!["A", "B", "C"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_requeues_at_front() {
        let queue = OutboundMessageQueue::new();
        queue.enqueue(frame("A"));
        queue.enqueue(frame("B"));
        queue.enqueue(frame("C"));

        let sent = Arc::new(AsyncMutex::new(Vec::new()));
        let sent_clone = sent.clone();
        let result = queue
            .flush(move |f| {
                let sent = sent_clone.clone();
                async move {
                    if f.payload == "B" {
                        return Err(ClientError::ConnectionLost);
                    }
                    sent.lock().await.push(f.payload);
                    Ok(())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(*sent.lock().await, vec!["A"]);
        // B is back at the front, C untouched behind it.
        assert_eq!(queue.len(), 2);

        let sent_clone = sent.clone();
        let count = queue
            .flush(move |f| {
                let sent = sent_clone.clone();
                async move {
                    sent.lock().await.push(f.payload);
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(*sent.lock().await, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_enqueue_or_send_buffers_while_disconnected() {
        let queue = OutboundMessageQueue::new();
        type NoSend = fn(OutboundFrame) -> std::future::Ready<ClientResult<()>>;

        let transmitted = queue
            .enqueue_or_send(frame("A"), None::<NoSend>)
            .await
            .unwrap();
        assert!(!transmitted);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_or_send_transmits_when_connected() {
        let queue = OutboundMessageQueue::new();
        let sent = Arc::new(AsyncMutex::new(Vec::new()));
        let sent_clone = sent.clone();

        let transmitted = queue
            .enqueue_or_send(frame("A"), Some(move |f: OutboundFrame| {
                let sent = sent_clone.clone();
                async move {
                    sent.lock().await.push(f.payload);
                    Ok(())
                }
            }))
            .await
            .unwrap();

        assert!(transmitted);
        assert!(queue.is_empty());
        assert_eq!(*sent.lock().await, vec!["A"]);
    }
}
