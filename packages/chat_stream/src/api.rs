//! HTTP surface of the chat backend: session CRUD and the synchronous
//! message call used when the duplex connection is unavailable.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{ChatError, ChatResult};
use crate::models::{MessagePair, Session, SessionId, SessionPage, SessionWithMessages};

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_sessions(&self, limit: u32, offset: u32) -> ChatResult<SessionPage>;

    async fn get_session(&self, session_id: SessionId) -> ChatResult<SessionWithMessages>;

    async fn create_session(&self, title: Option<&str>) -> ChatResult<Session>;

    async fn rename_session(&self, session_id: SessionId, title: &str) -> ChatResult<Session>;

    async fn delete_session(&self, session_id: SessionId) -> ChatResult<()>;

    /// Send a user message and wait for the complete assistant reply.
    async fn send_message(&self, session_id: SessionId, content: &str) -> ChatResult<MessagePair>;
}

/// [`ChatApi`] over reqwest with bearer authentication.
#[derive(Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

impl HttpChatApi {
    pub fn new(base_url: Url, token: impl Into<String>, timeout: Duration) -> ChatResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ChatError::from_reqwest)?;
        Ok(Self {
            client,
            base_url,
            token: token.into(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> ChatResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::Config(format!("invalid api base url: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> ChatResult<reqwest::Response> {
        debug!(%method, %url, "api request");
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp = request.send().await.map_err(ChatError::from_reqwest)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ChatError::AuthRequired);
        }
        Err(ChatError::Api {
            status: status.as_u16(),
            message: error_detail(&body).unwrap_or_else(|| status.to_string()),
        })
    }

    async fn json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> ChatResult<T> {
        self.execute(method, url, body)
            .await?
            .json()
            .await
            .map_err(ChatError::from_reqwest)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_sessions(&self, limit: u32, offset: u32) -> ChatResult<SessionPage> {
        let mut url = self.endpoint(&["chat", "sessions"])?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string());
        self.json(Method::GET, url, None).await
    }

    async fn get_session(&self, session_id: SessionId) -> ChatResult<SessionWithMessages> {
        let url = self.endpoint(&["chat", "sessions", &session_id.to_string()])?;
        self.json(Method::GET, url, None).await
    }

    async fn create_session(&self, title: Option<&str>) -> ChatResult<Session> {
        let url = self.endpoint(&["chat", "sessions"])?;
        let body = serde_json::json!({ "title": title });
        self.json(Method::POST, url, Some(body)).await
    }

    async fn rename_session(&self, session_id: SessionId, title: &str) -> ChatResult<Session> {
        let url = self.endpoint(&["chat", "sessions", &session_id.to_string()])?;
        let body = serde_json::json!({ "title": title });
        self.json(Method::PATCH, url, Some(body)).await
    }

    async fn delete_session(&self, session_id: SessionId) -> ChatResult<()> {
        let url = self.endpoint(&["chat", "sessions", &session_id.to_string()])?;
        self.execute(Method::DELETE, url, None).await?;
        Ok(())
    }

    async fn send_message(&self, session_id: SessionId, content: &str) -> ChatResult<MessagePair> {
        let url = self.endpoint(&["chat", "sessions", &session_id.to_string(), "messages"])?;
        let body = serde_json::json!({ "content": content });
        self.json(Method::POST, url, Some(body)).await
    }
}

/// Pull the human-readable reason out of an error body.
///
/// Accepts `{"detail": {"message": ..}}`, `{"detail": ".."}` and
/// `{"message": ..}`.
fn error_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let detail = value.get("detail").unwrap_or(&value);
    let message = match detail {
        serde_json::Value::String(s) => Some(s.as_str()),
        other => other.get("message").and_then(|m| m.as_str()),
    }?;
    (!message.is_empty()).then(|| message.to_string())
}
