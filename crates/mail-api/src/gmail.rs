//! Gmail REST client
//!
//! Thin reqwest wrapper over three endpoints of `gmail/v1/users/me/messages`.
//! No retries and no token handling: the bearer token comes in with each
//! call and failures are classified for the gate.

use std::future::Future;
use std::pin::Pin;

use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::message::{MessageDetails, WireMessage};
use crate::{MailApi, ProviderError, Result, classify_status};

/// Public Gmail API host
pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

/// Gmail API client for the authorized user (`users/me`).
#[derive(Clone)]
pub struct GmailClient {
    http: reqwest::Client,
    base_url: Url,
}

impl GmailClient {
    pub fn new(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    /// `{base}/gmail/v1/users/me/messages[/extra...]`, each segment percent-encoded.
    fn messages_url(&self, extra: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::Network(format!("unusable API base URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["gmail", "v1", "users", "me", "messages"])
            .extend(extra);
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String> {
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(format!("reading response body: {e}")))?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }
        Ok(body)
    }

    fn decode<T: DeserializeOwned>(body: &str) -> Result<T> {
        serde_json::from_str(body).map_err(|e| ProviderError::Decode(e.to_string()))
    }

    async fn fetch_unread(
        &self,
        token: &str,
        after_epoch_millis: Option<u64>,
        max_results: u32,
    ) -> Result<Vec<String>> {
        let query = match after_epoch_millis {
            Some(millis) => format!("is:unread after:{}", millis / 1000),
            None => "is:unread".to_string(),
        };
        let mut url = self.messages_url(&[])?;
        url.query_pairs_mut()
            .append_pair("q", &query)
            .append_pair("maxResults", &max_results.to_string());

        let body = self.send(self.http.get(url).bearer_auth(token)).await?;
        let list: MessageList = Self::decode(&body)?;
        debug!(query, count = list.messages.len(), "listed unread messages");
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn fetch_message(&self, token: &str, id: &str) -> Result<MessageDetails> {
        let mut url = self.messages_url(&[id])?;
        url.query_pairs_mut().append_pair("format", "full");

        let body = self.send(self.http.get(url).bearer_auth(token)).await?;
        let message: WireMessage = Self::decode(&body)?;
        debug!(message_id = id, "fetched message");
        Ok(message.into())
    }

    async fn modify_unread(&self, token: &str, id: &str) -> Result<()> {
        let url = self.messages_url(&[id, "modify"])?;
        let request = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "removeLabelIds": ["UNREAD"] }));
        self.send(request).await?;
        debug!(message_id = id, "marked message read");
        Ok(())
    }
}

impl MailApi for GmailClient {
    fn list_unread<'a>(
        &'a self,
        token: &'a str,
        after_epoch_millis: Option<u64>,
        max_results: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>> {
        Box::pin(self.fetch_unread(token, after_epoch_millis, max_results))
    }

    fn get_message<'a>(
        &'a self,
        token: &'a str,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<MessageDetails>> + Send + 'a>> {
        Box::pin(self.fetch_message(token, id))
    }

    fn mark_read<'a>(
        &'a self,
        token: &'a str,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.modify_unread(token, id))
    }
}
