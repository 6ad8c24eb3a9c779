//! Outbound HTTP on validated URLs.
//!
//! Redirects are never followed: the target of a redirect has not been
//! through URL validation.

use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::error::ExecError;

/// A (possibly truncated) HTTP response.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// The body was longer than the response cap.
    pub truncated: bool,
}

/// Thin wrapper over a `reqwest::Client` with the gateway's limits applied.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
    max_body_bytes: usize,
}

impl HttpClient {
    pub fn new(timeout: Duration, max_body_bytes: usize) -> Result<Self, ExecError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("warden/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExecError::Failed(format!("HTTP client setup: {e}")))?;
        Ok(Self {
            client,
            timeout,
            max_body_bytes,
        })
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, ExecError> {
        self.send(self.client.get(url)).await
    }

    pub async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<HttpResponse, ExecError> {
        let mut request = self.client.post(url).body(body);
        if let Some(ct) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, ct);
        }
        self.send(request).await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<HttpResponse, ExecError> {
        let mut response = request.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await.map_err(|e| self.map_error(e))? {
            let room = self.max_body_bytes.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        debug!(status, bytes = body.len(), truncated, "HTTP response received");
        Ok(HttpResponse {
            status,
            headers,
            body,
            truncated,
        })
    }

    fn map_error(&self, e: reqwest::Error) -> ExecError {
        if e.is_timeout() {
            ExecError::Timeout {
                secs: self.timeout.as_secs(),
            }
        } else if e.is_connect() {
            ExecError::Failed("connection failed".into())
        } else {
            ExecError::Failed(format!("HTTP request failed: {}", e.without_url()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::response::Redirect;
    use axum::routing::{get, post};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(max: usize) -> HttpClient {
        HttpClient::new(Duration::from_secs(5), max).unwrap()
    }

    #[tokio::test]
    async fn get_returns_status_and_body() {
        let base = serve(Router::new().route("/hello", get(|| async { "hi there" }))).await;
        let response = client(1024).get(&format!("{base}/hello")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hi there");
        assert!(!response.truncated);
        assert!(response.headers.iter().any(|(k, _)| k == "content-type"));
    }

    #[tokio::test]
    async fn post_sends_body() {
        let base = serve(Router::new().route("/echo", post(|body: String| async move { body }))).await;
        let response = client(1024)
            .post(&format!("{base}/echo"), b"payload".to_vec(), Some("text/plain"))
            .await
            .unwrap();
        assert_eq!(response.body, b"payload");
    }

    #[tokio::test]
    async fn body_is_capped() {
        let base = serve(Router::new().route("/big", get(|| async { "x".repeat(10_000) }))).await;
        let response = client(100).get(&format!("{base}/big")).await.unwrap();
        assert_eq!(response.body.len(), 100);
        assert!(response.truncated);
    }

    #[tokio::test]
    async fn redirects_are_not_followed() {
        let base = serve(Router::new().route(
            "/jump",
            get(|| async { Redirect::temporary("http://169.254.169.254/latest") }),
        ))
        .await;
        let response = client(1024).get(&format!("{base}/jump")).await.unwrap();
        assert_eq!(response.status, 307);
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let base = serve(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let client = HttpClient::new(Duration::from_millis(200), 1024).unwrap();
        let err = client.get(&format!("{base}/slow")).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn refused_connection_is_execution_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = client(1024).get(&format!("http://{addr}/")).await.unwrap_err();
        assert!(matches!(err, ExecError::Failed(_)));
    }
}
