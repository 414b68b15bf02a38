//! HTTP client for the clusterops server

use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// An error reply from the server
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    pub status: StatusCode,
    /// Machine-readable error kind, e.g. `not_found`
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            // Opens wait out the server-side startup grace period
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid server URL")?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("Invalid path")
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let error = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => ApiError {
                status,
                kind: body.error,
                message: body.message,
            },
            Err(_) => ApiError {
                status,
                kind: "http_error".to_string(),
                message: format!("Server error ({}): {}", status, text),
            },
        };
        Err(error.into())
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path)?)
            .send()
            .await
            .context("Failed to send request")?;

        Self::check(response)
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }

    pub async fn get_text(&self, path: &str) -> Result<String> {
        let response = self
            .client
            .get(self.url(path)?)
            .send()
            .await
            .context("Failed to send request")?;

        Self::check(response)
            .await?
            .text()
            .await
            .context("Failed to read response")
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(self.url(path)?)
            .json(body)
            .send()
            .await
            .context("Failed to send request")?;

        Self::check(response)
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .delete(self.url(path)?)
            .send()
            .await
            .context("Failed to send request")?;

        Self::check(response)
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }
}
