//! HTTP client wrapper.
//!
//! A thin layer over reqwest that applies the runtime's user agent and
//! timeouts and converts transport failures into `PlexusError::Network`.

use crate::config::{AppConfig, NetworkConfig};
use crate::error::{PlexusError, Result};
use reqwest::{header, Client, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    timeout: Option<Duration>,
}

impl HttpClient {
    /// Client for short request/response calls.
    pub fn new() -> Result<Self> {
        Self::with_timeout(Some(NetworkConfig::REQUEST_TIMEOUT))
    }

    /// Client for streaming transfers: bounded connect time, no overall
    /// deadline.
    pub fn for_downloads() -> Result<Self> {
        Self::with_timeout(None)
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(AppConfig::USER_AGENT);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| PlexusError::Network {
            message: format!("Failed to create HTTP client: {}", e),
            source: Some(e),
        })?;

        Ok(Self { client, timeout })
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.send("GET", url, self.client.get(url)).await
    }

    /// GET starting at byte `offset`. An offset of zero sends no Range header.
    pub async fn get_from(&self, url: &str, offset: u64) -> Result<Response> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }
        self.send("GET", url, request).await
    }

    pub async fn post_json<T: serde::Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<Response> {
        self.send("POST", url, self.client.post(url).json(body)).await
    }

    pub async fn delete(&self, url: &str) -> Result<Response> {
        self.send("DELETE", url, self.client.delete(url)).await
    }

    async fn send(&self, verb: &str, url: &str, request: reqwest::RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PlexusError::Timeout(self.timeout.unwrap_or(NetworkConfig::CONNECT_TIMEOUT))
            } else {
                PlexusError::Network {
                    message: format!("{} {} failed: {}", verb, url, e),
                    source: Some(e),
                }
            }
        })?;
        debug!("{} {} -> {}", verb, url, response.status());
        Ok(response)
    }

    /// Check if an HTTP status code indicates a retryable error.
    pub fn is_retryable_status(status: StatusCode) -> bool {
        matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
    }
}

/// Fail with a `Network` error unless the response status is a success.
pub fn ensure_success(response: Response, url: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(PlexusError::Network {
            message: format!("{} returned {}", url, status),
            source: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_status_codes() {
        assert!(HttpClient::is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(HttpClient::is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!HttpClient::is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!HttpClient::is_retryable_status(StatusCode::OK));
    }

    #[test]
    fn test_client_timeouts() {
        assert_eq!(
            HttpClient::new().unwrap().timeout(),
            Some(NetworkConfig::REQUEST_TIMEOUT)
        );
        assert_eq!(HttpClient::for_downloads().unwrap().timeout(), None);
    }
}
