use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};

use twinchat_client::{ClientConfig, ClientError, ClientResult, MessageHistory, MessagePage};
use twinchat_core::{Message, MessageStatus};

/// A mock WebSocket server standing in for the chat backend. Tests control
/// the frames sent to the client, inspect frames received from it, and can
/// close the active connection cleanly or drop it abruptly. The server keeps
/// accepting, so reconnects land on it again.
#[allow(dead_code)]
pub struct MockServer {
    pub addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
    to_client_tx: mpsc::Sender<String>,
    from_client_rx: mpsc::Receiver<String>,
    close_tx: mpsc::Sender<bool>,
    connections: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl MockServer {
    pub async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (to_client_tx, mut to_client_rx) = mpsc::channel::<String>(100);
        let (from_client_tx, from_client_rx) = mpsc::channel::<String>(100);
        let (close_tx, mut close_rx) = mpsc::channel::<bool>(10);
        let connections = Arc::new(AtomicUsize::new(0));
        let connections_counter = connections.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let ws = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => continue,
                };
                connections_counter.fetch_add(1, Ordering::SeqCst);
                let (mut ws_tx, mut ws_rx) = ws.split();

                loop {
                    tokio::select! {
                        cmd = close_rx.recv() => {
                            match cmd {
                                Some(true) => {
                                    let _ = ws_tx
                                        .send(WsMessage::Close(Some(CloseFrame {
                                            code: CloseCode::Normal,
                                            reason: "".into(),
                                        })))
                                        .await;
                                }
                                // `false` drops the stream without a close
                                // handshake, an unclean closure.
                                Some(false) => {}
                                None => return,
                            }
                            break;
                        }
                        outbound = to_client_rx.recv() => {
                            match outbound {
                                Some(text) => {
                                    let _ = ws_tx.send(WsMessage::Text(text)).await;
                                }
                                None => return,
                            }
                        }
                        inbound = ws_rx.next() => {
                            match inbound {
                                Some(Ok(WsMessage::Text(text))) => {
                                    let _ = from_client_tx.send(text).await;
                                }
                                Some(Ok(frame)) if frame.is_close() => break,
                                Some(Ok(_)) => {}
                                Some(Err(_)) | None => break,
                            }
                        }
                    }
                }
            }
        });

        Self {
            addr,
            handle,
            to_client_tx,
            from_client_rx,
            close_tx,
            connections,
        }
    }

    pub fn ws_base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// How many connections the server has accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn send_to_client(&self, text: &str) {
        self.to_client_tx.send(text.to_string()).await.unwrap();
    }

    /// Next text frame received from the client, within a timeout.
    pub async fn expect_client_frame(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(2), self.from_client_rx.recv())
            .await
            .expect("Timed out waiting for client frame")
            .unwrap()
    }

    /// Asserts that no frame arrives from the client within the window.
    pub async fn expect_no_client_frame(&mut self, window: Duration) {
        let result = tokio::time::timeout(window, self.from_client_rx.recv()).await;
        assert!(result.is_err(), "unexpected client frame: {:?}", result);
    }

    /// Close the current connection with a normal close frame.
    pub async fn close_clean(&self) {
        self.close_tx.send(true).await.unwrap();
    }

    /// Drop the current connection without a close handshake.
    pub async fn drop_connection(&self) {
        self.close_tx.send(false).await.unwrap();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Accepts TCP connections but never answers the WebSocket handshake, so
/// every attempt against it runs into the open timeout. Streams are parked,
/// not closed, and every accept is counted.
#[allow(dead_code)]
pub struct SilentServer {
    pub addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
    connections: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl SilentServer {
    pub async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();

        let handle = tokio::spawn(async move {
            let mut parked = Vec::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                parked.push(stream);
            }
        });

        Self {
            addr,
            handle,
            connections,
        }
    }

    pub fn ws_base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for SilentServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Polls a condition until it holds or the deadline passes.
#[allow(dead_code)]
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(deadline, async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Timed out waiting for condition");
}

/// Test config: mock server endpoint plus short timers so reconnect tests
/// finish quickly.
#[allow(dead_code)]
pub fn test_config(server: &MockServer) -> ClientConfig {
    ClientConfig {
        ws_base_url: server.ws_base_url(),
        api_base_url: "http://127.0.0.1:1/api".to_string(),
        reconnect_base_delay: Duration::from_millis(50),
        reconnect_max_delay: Duration::from_millis(400),
        ..Default::default()
    }
}

/// Waits until the status stream reports the expected value.
#[allow(dead_code)]
pub async fn wait_for_status(rx: &mut tokio::sync::watch::Receiver<bool>, expected: bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if *rx.borrow() == expected {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for connection status {}", expected));
}

/// `MessageHistory` returning fixed pages, keeping tests off HTTP.
#[allow(dead_code)]
pub struct CannedHistory {
    pub page: Option<MessagePage>,
}

#[async_trait]
impl MessageHistory for CannedHistory {
    async fn fetch_page(&self, _chat_id: &str, _cursor: Option<&str>) -> ClientResult<MessagePage> {
        self.page
            .clone()
            .ok_or_else(|| ClientError::HistoryFetch("canned failure".into()))
    }

    async fn delete_message(&self, _chat_id: &str, _message_id: &str) -> ClientResult<()> {
        Ok(())
    }

    async fn report_message(
        &self,
        _chat_id: &str,
        _message_id: &str,
        _reason: &str,
    ) -> ClientResult<()> {
        Ok(())
    }
}

/// Builds a server-authored message for seeding tests.
#[allow(dead_code)]
pub fn make_message(id: &str, chat_id: &str, text: &str, from_user: bool, secs: i64) -> Message {
    Message {
        id: id.to_string(),
        chat_id: chat_id.to_string(),
        text_content: text.to_string(),
        is_from_user: from_user,
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + ChronoDuration::seconds(secs),
        status: MessageStatus::Sent,
        reply_to_id: None,
    }
}
