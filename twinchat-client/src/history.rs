use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use twinchat_core::Message;

use crate::auth::TokenProvider;
use crate::errors::{ClientError, ClientResult};

/// One page of a cursor-paginated history fetch, as the backend returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagePage {
    pub results: Vec<Message>,
    /// Full URL of the next (older) page, or `None` when exhausted. The
    /// reconciler extracts the `cursor` query parameter from it.
    pub next: Option<String>,
}

/// Paginated message history and message-level actions, served over HTTP by
/// a collaborator outside this crate.
#[async_trait]
pub trait MessageHistory: Send + Sync {
    /// Fetch one page of messages, oldest-last, starting at `cursor`
    /// (or the newest page when `None`).
    async fn fetch_page(&self, chat_id: &str, cursor: Option<&str>) -> ClientResult<MessagePage>;

    async fn delete_message(&self, chat_id: &str, message_id: &str) -> ClientResult<()>;

    async fn report_message(
        &self,
        chat_id: &str,
        message_id: &str,
        reason: &str,
    ) -> ClientResult<()>;
}

/// `MessageHistory` over the backend's REST API.
pub struct HttpMessageHistory {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpMessageHistory {
    pub fn new(base_url: &str, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn bearer(&self) -> ClientResult<String> {
        self.tokens
            .access_token()
            .ok_or(ClientError::MissingAuthToken)
    }
}

#[async_trait]
impl MessageHistory for HttpMessageHistory {
    async fn fetch_page(&self, chat_id: &str, cursor: Option<&str>) -> ClientResult<MessagePage> {
        let token = self.bearer()?;
        let url = format!("{}/chats/{}/messages/", self.base_url, chat_id);

        let mut request = self.client.get(&url).bearer_auth(token);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ClientError::HistoryFetch(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response.json::<MessagePage>().await?)
    }

    async fn delete_message(&self, chat_id: &str, message_id: &str) -> ClientResult<()> {
        let token = self.bearer()?;
        let url = format!(
            "{}/chats/{}/messages/{}/",
            self.base_url, chat_id, message_id
        );
        let response = self.client.delete(&url).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::HistoryFetch(format!(
                "delete {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }

    async fn report_message(
        &self,
        chat_id: &str,
        message_id: &str,
        reason: &str,
    ) -> ClientResult<()> {
        let token = self.bearer()?;
        let url = format!(
            "{}/chats/{}/messages/{}/report/",
            self.base_url, chat_id, message_id
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::HistoryFetch(format!(
                "report {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}
