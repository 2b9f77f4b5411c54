//! Blocking HTTP client for the script `fetch` binding.

use std::time::Duration;

use flowline_core::services::HttpClient;
use flowline_types::{ContextMap, HostError};
use serde_json::Value;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client over `reqwest::blocking`.
///
/// Non-success statuses map to [`HostError::Status`], which scripts
/// observe as thrown errors. JSON responses are parsed; anything else is
/// returned as `{"body": <text>}`.
pub struct BlockingHttpClient {
    client: reqwest::blocking::Client,
}

impl BlockingHttpClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("flowline/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }
}

impl Default for BlockingHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for BlockingHttpClient {
    fn fetch(
        &self,
        method: &str,
        url: &str,
        headers: &ContextMap,
        body: &ContextMap,
    ) -> Result<Value, HostError> {
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| HostError::Backend(format!("invalid http method: {method}")))?;

        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.header(name, value);
        }
        if !body.is_empty() {
            request = request.json(body);
        }

        let response = request
            .send()
            .map_err(|e| HostError::Backend(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| HostError::Backend(e.to_string()))?;

        if !status.is_success() {
            return Err(HostError::Status {
                code: status.as_u16(),
                message: text,
            });
        }

        match serde_json::from_str(&text) {
            Ok(value) => Ok(value),
            Err(_) => Ok(serde_json::json!({ "body": text })),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
