//! Content intake over HTTP.
//!
//! The source is asked for new items of a category and is told which
//! identifiers were admitted most recently, so it can avoid repeating them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use vidflow_core::{Category, ExternalError};

use super::{ContentIntake, ContentItem, classify_transport, http_client, send};

#[derive(Debug, Clone)]
pub struct HttpContentIntake {
    client: Client,
    url: String,
}

impl HttpContentIntake {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            url: url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IntakeResponse {
    #[serde(default)]
    items: Vec<ContentItem>,
}

#[async_trait]
impl ContentIntake for HttpContentIntake {
    async fn fetch_new(&self, category: &Category, recent: &[String]) -> Result<Vec<ContentItem>, ExternalError> {
        let payload = json!({
            "category": category.as_str(),
            "recent": recent,
        });

        let response: IntakeResponse = send(self.client.post(&self.url).json(&payload))
            .await?
            .json()
            .await
            .map_err(|e| classify_transport(&e))?;

        Ok(response
            .items
            .into_iter()
            .filter(|item| !item.identifier.trim().is_empty())
            .collect())
    }
}
