//! reqwest-backed REST collaborators

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;
use url::Url;

use super::{ChatApi, RemoteMessage, SendReceipt, Session, Topic, TopicPatch};
use crate::channel::ModelSelection;
use crate::error::ApiError;

/// JSON-over-HTTP client for the backend's REST endpoints
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    base_url: Url,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpChatApi {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ApiError> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| ApiError::Network(format!("invalid base url: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            base_url,
            token,
            client: reqwest::Client::new(),
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::Network(e.to_string()))?;
        debug!(%method, %url, "REST request");
        let builder = self.client.request(method, url);
        Ok(match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn execute(builder: RequestBuilder) -> Result<Response, ApiError> {
        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ApiError::Http {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, ApiError> {
        Self::execute(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_session_by_agent(&self, agent_id: &str) -> Result<Session, ApiError> {
        let builder = self.request(Method::GET, &format!("api/agents/{agent_id}/session"))?;
        Self::json(builder).await
    }

    async fn create_topic(&self, session_id: &str, title: Option<&str>) -> Result<Topic, ApiError> {
        let builder = self
            .request(Method::POST, &format!("api/sessions/{session_id}/topics"))?
            .json(&json!({ "title": title }));
        Self::json(builder).await
    }

    async fn fetch_messages(&self, topic_id: &str) -> Result<Vec<RemoteMessage>, ApiError> {
        let builder = self.request(Method::GET, &format!("api/topics/{topic_id}/messages"))?;
        Self::json(builder).await
    }

    async fn update_topic(&self, topic_id: &str, patch: &TopicPatch) -> Result<Topic, ApiError> {
        let builder = self
            .request(Method::PATCH, &format!("api/topics/{topic_id}"))?
            .json(patch);
        Self::json(builder).await
    }

    async fn delete_topic(&self, topic_id: &str) -> Result<(), ApiError> {
        let builder = self.request(Method::DELETE, &format!("api/topics/{topic_id}"))?;
        Self::execute(builder).await.map(|_| ())
    }

    async fn send_message(
        &self,
        topic_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<SendReceipt, ApiError> {
        let builder = self
            .request(Method::POST, &format!("api/topics/{topic_id}/messages"))?
            .json(&json!({ "id": message_id, "content": content }));
        Self::json(builder).await
    }

    async fn abort_generation(
        &self,
        topic_id: &str,
        stream_id: Option<&str>,
    ) -> Result<(), ApiError> {
        let builder = self
            .request(Method::POST, &format!("api/topics/{topic_id}/abort"))?
            .json(&json!({ "streamId": stream_id }));
        Self::execute(builder).await.map(|_| ())
    }

    async fn update_channel_model(
        &self,
        topic_id: &str,
        selection: &ModelSelection,
    ) -> Result<(), ApiError> {
        let builder = self
            .request(Method::PUT, &format!("api/topics/{topic_id}/model"))?
            .json(selection);
        Self::execute(builder).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let api = HttpChatApi::new("https://api.example.com/v1", None).unwrap();
        assert_eq!(api.base_url.as_str(), "https://api.example.com/v1/");
    }

    #[test]
    fn test_request_paths_join_under_base() {
        let api = HttpChatApi::new("https://api.example.com/v1", Some("t".to_string())).unwrap();
        let request = api
            .request(Method::GET, "/api/topics/t1/messages")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://api.example.com/v1/api/topics/t1/messages"
        );
        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Bearer t"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpChatApi::new("not a url", None),
            Err(ApiError::Network(_))
        ));
    }
}
