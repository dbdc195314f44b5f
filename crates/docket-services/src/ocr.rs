//! HTTP client for the external OCR engine.
//!
//! The engine reads the source file from object storage itself. A job is
//! started with `POST {base}/v1/jobs` and observed with
//! `GET {base}/v1/jobs/{job_id}`.
//!
//! # Configuration
//!
//! - `OCR_BASE_URL`: engine base URL (default `http://127.0.0.1:8070`)
//! - `DOCKET_OCR_REQUEST_TIMEOUT_SECS`: per-request timeout (default 30)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use docket_core::{defaults, Error, OcrPoll, OcrService, Result, SourceLocation};

use crate::http;

#[derive(Debug, Clone)]
pub struct OcrClientConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for OcrClientConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::OCR_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(defaults::OCR_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl OcrClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("OCR_BASE_URL") {
            if !url.is_empty() {
                config.base_url = url;
            }
        }
        if let Some(secs) = std::env::var("DOCKET_OCR_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.request_timeout = Duration::from_secs(secs);
        }
        config
    }
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    bucket: &'a str,
    key: &'a str,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

pub struct HttpOcrClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpOcrClient {
    pub fn new(config: OcrClientConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client: http::client(config.request_timeout)?,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(OcrClientConfig::from_env())
    }
}

#[async_trait]
impl OcrService for HttpOcrClient {
    async fn submit(&self, location: &SourceLocation) -> Result<String> {
        let url = format!("{}/v1/jobs", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&SubmitRequest {
                bucket: &location.bucket,
                key: &location.key,
            })
            .send()
            .await?;
        let response = http::check("OCR service", response).await?;
        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| Error::Service(format!("unparseable OCR submit response: {e}")))?;

        debug!(
            subsystem = "services",
            component = "ocr",
            location = %location,
            ocr_job_id = %body.job_id,
            "OCR job submitted"
        );
        Ok(body.job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<OcrPoll> {
        let url = format!("{}/v1/jobs/{}", self.base_url, job_id);
        let response = self.client.get(&url).send().await?;
        let response = http::check("OCR service", response).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Service(format!("unparseable OCR poll response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_core::{ErrorKind, OcrStatus};
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpOcrClient {
        HttpOcrClient::new(OcrClientConfig {
            base_url: server.uri(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_poll() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/jobs"))
            .and(body_json(serde_json::json!({"bucket": "intake", "key": "a.pdf"})))
            .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({"job_id": "j-1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/jobs/j-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "succeeded",
                "pages": 2,
                "text": "page one\u{000C}page two",
                "confidence": 0.97
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let job = client
            .submit(&SourceLocation::new("intake", "a.pdf"))
            .await
            .unwrap();
        assert_eq!(job, "j-1");

        let poll = client.poll(&job).await.unwrap();
        assert_eq!(poll.status, OcrStatus::Succeeded);
        assert_eq!(poll.pages, Some(2));
        assert_eq!(poll.text.as_deref(), Some("page one\u{000C}page two"));
    }

    #[tokio::test]
    async fn test_in_progress_poll_without_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/jobs/j-2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "in_progress"})),
            )
            .mount(&server)
            .await;

        let poll = client_for(&server).poll("j-2").await.unwrap();
        assert_eq!(poll, OcrPoll::in_progress());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/jobs"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .submit(&SourceLocation::new("intake", "a.pdf"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("overloaded"));
    }

    #[tokio::test]
    async fn test_request_timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/jobs/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = HttpOcrClient::new(OcrClientConfig {
            base_url: server.uri(),
            request_timeout: Duration::from_millis(100),
        })
        .unwrap();
        let err = client.poll("slow").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
