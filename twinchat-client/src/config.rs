use std::time::Duration;

use url::Url;

use crate::errors::ClientResult;

/// Connection and protocol tuning for one client instance. Constructed once
/// and injected; there is no ambient global configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base socket endpoint, e.g. `ws://host/ws/chat`. The chat id is
    /// appended as a path segment. Use `wss` when the app is served over TLS.
    pub ws_base_url: String,
    /// Base REST endpoint for the message-history collaborator.
    pub api_base_url: String,
    /// A connection attempt that does not reach OPEN within this window is
    /// treated as failed and forced into the retry path.
    pub open_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// No two heartbeats go out closer together than this, regardless of
    /// what triggered them.
    pub heartbeat_min_gap: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// After this many failed reconnects the client stays disconnected until
    /// the caller explicitly reconnects.
    pub max_reconnect_attempts: u32,
    /// How long after the last keystroke the typing indicator auto-stops.
    pub typing_stop_delay: Duration,
    /// Send format-variant duplicates of outbound text for backends with
    /// inconsistent frame shapes. Turn off once the real wire format is
    /// confirmed.
    pub compat_duplicate_sends: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "ws://localhost:8000/ws/chat".to_string(),
            api_base_url: "http://localhost:8000/api".to_string(),
            open_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_min_gap: Duration::from_secs(20),
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(30_000),
            max_reconnect_attempts: 5,
            typing_stop_delay: Duration::from_secs(3),
            compat_duplicate_sends: true,
        }
    }
}

impl ClientConfig {
    /// Build the socket URL for one chat, with the bearer token as a query
    /// parameter.
    pub fn ws_url(&self, chat_id: &str, token: &str) -> ClientResult<Url> {
        let base = self.ws_base_url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{}/{}/", base, chat_id))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}
