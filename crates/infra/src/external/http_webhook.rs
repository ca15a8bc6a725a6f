//! Completion webhook delivery.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use vidflow_core::ExternalError;

use super::{WebhookSender, http_client, send};

#[derive(Debug, Clone)]
pub struct HttpWebhookSender {
    client: Client,
    bearer: Option<String>,
}

impl HttpWebhookSender {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            bearer: None,
        }
    }

    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn notify(&self, url: &str, payload: &serde_json::Value) -> Result<(), ExternalError> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(payload);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }

        let response = send(request).await?;
        debug!(url = %url, status = %response.status(), "webhook delivered");
        Ok(())
    }
}
