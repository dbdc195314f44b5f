//! HTTP client for the external named-entity extraction model.
//!
//! # Configuration
//!
//! - `NER_BASE_URL`: model sidecar base URL (default `http://127.0.0.1:8071`)
//! - `DOCKET_NER_TIMEOUT_SECS`: per-request timeout (default 60)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use docket_core::{defaults, EntityExtractionService, Error, RawEntity, Result};

use crate::http;

#[derive(Debug, Clone)]
pub struct EntityClientConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for EntityClientConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::NER_BASE_URL.to_string(),
            timeout: Duration::from_secs(defaults::NER_TIMEOUT_SECS),
        }
    }
}

impl EntityClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("NER_BASE_URL") {
            if !url.is_empty() {
                config.base_url = url;
            }
        }
        if let Some(secs) = std::env::var("DOCKET_NER_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.timeout = Duration::from_secs(secs);
        }
        config
    }
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    text: &'a str,
}

/// Model sidecars answer either `{"entities": [...]}` or a bare list.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExtractResponse {
    Wrapped { entities: Vec<RawEntity> },
    Bare(Vec<RawEntity>),
}

impl ExtractResponse {
    fn into_entities(self) -> Vec<RawEntity> {
        match self {
            ExtractResponse::Wrapped { entities } => entities,
            ExtractResponse::Bare(entities) => entities,
        }
    }
}

pub struct HttpEntityClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpEntityClient {
    pub fn new(config: EntityClientConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client: http::client(config.timeout)?,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(EntityClientConfig::from_env())
    }
}

#[async_trait]
impl EntityExtractionService for HttpEntityClient {
    async fn extract(&self, text: &str) -> Result<Vec<RawEntity>> {
        let url = format!("{}/extract", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&ExtractRequest { text })
            .send()
            .await?;
        let response = http::check("entity extraction service", response).await?;
        let body: ExtractResponse = response
            .json()
            .await
            .map_err(|e| Error::Service(format!("unparseable entity response: {e}")))?;
        Ok(body.into_entities())
    }
}
