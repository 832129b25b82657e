//! [`HttpClient`] over reqwest.

use crate::error::{StoreError, StoreResult};
use crate::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Basic-auth credentials for the remote server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Production HTTP client.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    base_url: String,
    client: reqwest::Client,
    credentials: Option<Credentials>,
}

impl ReqwestClient {
    /// Creates a client for `base_url` with a default request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
            credentials: None,
        })
    }

    /// Authenticates every request with `credentials`.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> StoreResult<HttpResponse> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, self.url_for(&request.path))
            .query(&request.query)
            .header(ACCEPT, "application/json");
        if let Some(credentials) = &self.credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(transport_error)?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joining() {
        let client = ReqwestClient::new("http://localhost:5984/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.url_for("products/_changes"),
            "http://localhost:5984/products/_changes"
        );
        assert_eq!(client.base_url(), "http://localhost:5984/");
    }

    #[test]
    fn credentials_are_redacted() {
        let creds = Credentials::new("pos", "secret");
        let debug = format!("{creds:?}");
        assert!(debug.contains("pos"));
        assert!(!debug.contains("secret"));
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let client =
            ReqwestClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = client
            .send(HttpRequest {
                method: HttpMethod::Get,
                path: "products".into(),
                query: Vec::new(),
                body: None,
                timeout: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
