//! External record source

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::models::SourceResponse;

/// Something that hands out raw records on request
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch `count` raw records from the endpoint at `base_url`
    async fn fetch(&self, base_url: &str, count: u32) -> Result<Vec<Value>>;
}

/// HTTP client for randomuser.me-compatible endpoints
pub struct RandomUserClient {
    client: Client,
}

impl RandomUserClient {
    /// Create a client whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Request URL for `count` records
    pub fn request_url(base_url: &str, count: u32) -> Result<Url> {
        let mut url = Url::parse(base_url)
            .map_err(|e| IngestError::config(format!("invalid source URL '{base_url}': {e}")))?;
        url.query_pairs_mut().append_pair("results", &count.to_string());
        Ok(url)
    }
}

#[async_trait]
impl RecordSource for RandomUserClient {
    async fn fetch(&self, base_url: &str, count: u32) -> Result<Vec<Value>> {
        let url = Self::request_url(base_url, count)?;
        debug!(%url, count, "fetching records");

        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::transport(format!("source responded with status {status}")));
        }

        let body: SourceResponse = response
            .json()
            .await
            .map_err(|e| IngestError::transport(format!("failed to parse source response: {e}")))?;

        debug!(received = body.results.len(), "fetched records");
        Ok(body.results)
    }
}
