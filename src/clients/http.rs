// src/clients/http.rs
//! Shared HTTP adapter for the REST collaborators (backend, ML, faucet).
//!
//! Transport failures and non-success responses are turned into tagged
//! [`UpstreamError`]s carrying the request path, so the classifier can pick
//! resource-specific codes without looking at reqwest types.

use crate::errors::classifier::{Upstream, UpstreamError, UpstreamFailure};
use reqwest::{Client, Method, Response};
use serde::Serialize;
use serde_json::Value;
use std::error::Error as _;
use std::time::Duration;

/// JSON-over-HTTP client bound to one upstream and base URL.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    upstream: Upstream,
    timeout: Duration,
}

impl HttpClient {
    /// Creates a client for `upstream` rooted at `base_url`.
    ///
    /// # Arguments
    /// * `base_url` - Scheme and authority, with or without a trailing slash
    /// * `timeout` - Deadline applied to every individual request
    pub fn new(upstream: Upstream, base_url: &str, timeout: Duration) -> Self {
        HttpClient {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            upstream,
            timeout,
        }
    }

    pub fn upstream(&self) -> Upstream {
        self.upstream
    }

    /// Sends a request with an optional JSON body.
    ///
    /// # Returns
    /// The parsed JSON body, or `Value::Null` when the response has no JSON body.
    ///
    /// # Errors
    /// Any transport failure or non-2xx status, tagged with this client's upstream
    /// and the request path.
    pub async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Value, UpstreamError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method.clone(), &url).timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        log::debug!("{} {} {}", self.upstream, method, path);
        let response = request
            .send()
            .await
            .map_err(|e| transport_failure(self.upstream, &e).with_endpoint(path))?;

        if !response.status().is_success() {
            return Err(status_failure(self.upstream, response).await.with_endpoint(path));
        }
        let text = response
            .text()
            .await
            .map_err(|e| transport_failure(self.upstream, &e).with_endpoint(path))?;
        Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
    }
}

/// Maps a reqwest transport error onto the structured failure shapes.
pub fn transport_failure(upstream: Upstream, err: &reqwest::Error) -> UpstreamError {
    let failure = if err.is_timeout() {
        UpstreamFailure::Timeout
    } else if err.is_connect() {
        if looks_like_dns(err) {
            UpstreamFailure::Dns
        } else {
            UpstreamFailure::ConnectionRefused
        }
    } else if let Some(status) = err.status() {
        UpstreamFailure::Status {
            status: status.as_u16(),
            code: None,
            message: Some(err.to_string()),
        }
    } else {
        UpstreamFailure::Network(err.to_string())
    };
    let error = UpstreamError::new(upstream, failure);
    match err.url() {
        Some(url) => error.with_endpoint(url.path()),
        None => error,
    }
}

fn looks_like_dns(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string().to_lowercase();
        if text.contains("dns") || text.contains("lookup") || text.contains("resolve") {
            return true;
        }
        source = cause.source();
    }
    false
}

/// Reads an error response body and extracts the upstream's own error code.
///
/// Accepts the gateway envelope (`errorCode`/`errorMessage`) as well as the
/// plainer `code`/`message`/`error` shapes the other services emit.
async fn status_failure(upstream: Upstream, response: Response) -> UpstreamError {
    let status = response.status().as_u16();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| body.get(*name).and_then(Value::as_str))
            .map(str::to_string)
    };
    UpstreamError::new(
        upstream,
        UpstreamFailure::Status {
            status,
            code: field(&["errorCode", "code", "error_code"]),
            message: field(&["errorMessage", "message", "error", "detail"]),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::classifier::{classify, ErrorCode};
    use mockito::mock;

    fn client() -> HttpClient {
        HttpClient::new(
            Upstream::Ml,
            &mockito::server_url(),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_success_body_is_parsed() {
        let _m = mock("POST", "/http-test/score")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"similarity":0.93}"#)
            .create();
        let body = client()
            .send_json(Method::POST, "/http-test/score", Some(&serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(body["similarity"], 0.93);
    }

    #[tokio::test]
    async fn test_empty_success_body_is_null() {
        let _m = mock("PUT", "/http-test/empty").with_status(204).create();
        let body = client()
            .send_json::<Value>(Method::PUT, "/http-test/empty", None)
            .await
            .unwrap();
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn test_error_body_code_is_extracted() {
        let _m = mock("POST", "/http-test/verify")
            .with_status(400)
            .with_body(r#"{"code":"NO_NOSE_DETECTED","message":"nose not found"}"#)
            .create();
        let err = client()
            .send_json::<Value>(Method::POST, "/http-test/verify", None)
            .await
            .unwrap_err();
        assert_eq!(err.endpoint.as_deref(), Some("/http-test/verify"));
        assert_eq!(
            err.failure,
            UpstreamFailure::Status {
                status: 400,
                code: Some("NO_NOSE_DETECTED".into()),
                message: Some("nose not found".into()),
            }
        );
        assert_eq!(classify(&err).code, ErrorCode::FeatureNotDetected);
    }

    #[tokio::test]
    async fn test_refused_connection_is_retryable() {
        let client = HttpClient::new(Upstream::Backend, "http://127.0.0.1:1", Duration::from_secs(2));
        let err = client
            .send_json::<Value>(Method::GET, "/api/pets/1", None)
            .await
            .unwrap_err();
        let classified = classify(&err);
        assert!(classified.retryable);
        assert_eq!(classified.code, ErrorCode::BackendConnectionFailed);
    }
}
