//! Shared response handling for the HTTP service clients.

use std::time::Duration;

use docket_core::{Error, Result};
use reqwest::{Response, StatusCode};

/// Build a client with a default per-request timeout.
pub(crate) fn client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))
}

/// Map a non-success status to the error taxonomy.
///
/// 429 and 5xx are transient. 400 and 422 mean the service rejected the
/// input, which retrying will not fix.
pub(crate) fn status_error(service: &str, status: StatusCode, body: &str) -> Error {
    let message = format!("{service} returned {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::Transient(message)
    } else if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
        Error::Validation(message)
    } else {
        Error::Request(message)
    }
}

/// Pass a successful response through, converting anything else.
pub(crate) async fn check(service: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(service, status, &body))
}
