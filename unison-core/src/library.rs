//! Track Library HTTP Client
//!
//! Boundary to the upload/library collaborator. Attaches the stored bearer
//! token to every request; an expired token surfaces as `Unauthorized`,
//! which the session answers by clearing stored credentials and forcing
//! re-authentication.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Default connection timeout
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur when talking to the library service
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unauthorized - token expired or missing")]
    Unauthorized,

    #[error("track not found: {0}")]
    TrackNotFound(String),

    #[error("API error: {0}")]
    Api(String),
}

/// Track metadata as returned by the library service
#[derive(Debug, Clone, Deserialize)]
pub struct LibraryTrack {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_seconds: Option<f64>,
}

/// Client for the track library REST API
#[derive(Debug, Clone)]
pub struct LibraryClient {
    http: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl LibraryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
        }
    }

    /// Set the bearer token attached to outbound requests
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/api/v1/library{}", self.base_url, path);
        let mut req = self.http.get(&url);

        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }

        req
    }

    /// Fetch metadata for a single track
    pub async fn track(&self, track_id: &str) -> Result<LibraryTrack, LibraryError> {
        debug!("Fetching track metadata: {}", track_id);

        let resp = self.request(&format!("/tracks/{}", track_id)).send().await?;

        match resp.status() {
            StatusCode::OK => Ok(resp.json().await?),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!("Library rejected our token");
                Err(LibraryError::Unauthorized)
            }
            StatusCode::NOT_FOUND => Err(LibraryError::TrackNotFound(track_id.to_string())),
            status => Err(LibraryError::Api(format!(
                "unexpected response (HTTP {})",
                status.as_u16()
            ))),
        }
    }

    /// List all tracks available to this user
    pub async fn tracks(&self) -> Result<Vec<LibraryTrack>, LibraryError> {
        let resp = self.request("/tracks").send().await?;

        match resp.status() {
            StatusCode::OK => Ok(resp.json().await?),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(LibraryError::Unauthorized),
            status => Err(LibraryError::Api(format!(
                "unexpected response (HTTP {})",
                status.as_u16()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_construction() {
        let client = LibraryClient::new("https://library.example/");
        assert_eq!(client.base_url, "https://library.example");
        assert_eq!(client.bearer_token, None);

        let with_token = LibraryClient::new("https://library.example").with_token("abc");
        assert_eq!(with_token.bearer_token, Some("abc".to_string()));
    }
}
