//! # Upstream Client Module
//!
//! ## Purpose
//! Fetches single anime documents from the AniDB HTTP API and classifies
//! every failure so the worker can react correctly: transient failures are
//! retried with backoff, confirmed-missing identifiers are negative-cached,
//! and authentication failures halt fetching until an operator intervenes.
//!
//! ## Failure classification
//! AniDB reports most errors in-band: an HTTP 200 response whose body is a
//! small `<error>` document. The mapping implemented here:
//! - connect errors, timeouts, HTTP 429 and HTTP 5xx → `Transient`
//! - `<error>` body "Anime not found" (code 500) → `NotFound`
//! - `<error>` body mentioning a ban, the client registration, or login
//!   (codes 302/500/555/601) → `Auth`
//! - any other `<error>` body → `Transient`, so recoverable data is never
//!   silently dropped; the retry budget bounds the quota cost
//!
//! The ban check only applies to `<error>` documents; anime documents whose
//! description text happens to contain the word are served normally.

use crate::config::UpstreamConfig;
use crate::errors::Result;
use crate::AnimeId;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tokio::time::Duration;

/// Classified outcome of a failed upstream fetch
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Worth retrying with backoff
    #[error("Transient upstream failure: {details}")]
    Transient { details: String },

    /// Upstream confirmed the identifier does not exist
    #[error("Anime not found upstream")]
    NotFound,

    /// Ban or client/credential problem; fetching must stop
    #[error("Upstream authentication failure: {details}")]
    Auth { details: String },
}

/// A client able to fetch one raw document per identifier
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn fetch(&self, aid: AnimeId) -> std::result::Result<Vec<u8>, FetchError>;
}

/// AniDB HTTP API client
pub struct AniDbClient {
    config: UpstreamConfig,
    client: Client,
}

impl AniDbClient {
    /// Build the client with a fixed request timeout and identifying
    /// user-agent.
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("anidb-mirror/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl UpstreamClient for AniDbClient {
    async fn fetch(&self, aid: AnimeId) -> std::result::Result<Vec<u8>, FetchError> {
        let mut params: Vec<(&str, String)> = vec![
            ("request", "anime".to_string()),
            ("client", self.config.client.clone()),
            ("clientver", self.config.clientver.clone()),
            ("protover", self.config.protover.clone()),
            ("aid", aid.to_string()),
        ];

        // Credentials unlock mature-content fields upstream.
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            params.push(("user", user.clone()));
            params.push(("pass", pass.clone()));
        }

        tracing::debug!("Fetching aid {} from {}", aid, self.config.base_url);

        let response = self
            .client
            .get(&self.config.base_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| FetchError::Transient {
                details: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(FetchError::Transient {
                details: format!("HTTP {}", status),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Transient {
                details: format!("HTTP {}", status),
            });
        }

        let body = response.text().await.map_err(|e| FetchError::Transient {
            details: format!("Failed to read response body: {}", e),
        })?;

        if let Some(err) = classify_error_body(&body) {
            return Err(err);
        }

        Ok(body.into_bytes())
    }
}

/// Classify an in-band `<error>` document; `None` means the body is a
/// regular anime document.
pub fn classify_error_body(body: &str) -> Option<FetchError> {
    let head = body.trim_start().strip_prefix('\u{feff}').unwrap_or_else(|| body.trim_start());

    // Skip an XML declaration if present.
    let rest = if head.starts_with("<?") {
        match head.find("?>") {
            Some(idx) => head[idx + 2..].trim_start(),
            None => head,
        }
    } else {
        head
    };

    if !rest.starts_with("<error") {
        return None;
    }

    let lowered = rest.to_lowercase();
    if lowered.contains("banned") {
        Some(FetchError::Auth {
            details: "AniDB ban notice".to_string(),
        })
    } else if lowered.contains("anime not found") {
        Some(FetchError::NotFound)
    } else if lowered.contains("client") || lowered.contains("access denied") || lowered.contains("login")
    {
        Some(FetchError::Auth {
            details: first_line(rest).to_string(),
        })
    } else {
        Some(FetchError::Transient {
            details: first_line(rest).to_string(),
        })
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ANIME_BODY: &str = r#"<?xml version="1.0"?><anime id="1">
        <titles><title type="main">Seikai no Monshou</title></titles>
    </anime>"#;

    fn test_config(base_url: String) -> UpstreamConfig {
        UpstreamConfig {
            base_url,
            client: "kometa".to_string(),
            clientver: "1".to_string(),
            protover: "1".to_string(),
            username: None,
            password: None,
            timeout_seconds: 5,
        }
    }

    #[test]
    fn test_classify_regular_document_is_no_error() {
        assert!(classify_error_body(ANIME_BODY).is_none());
    }

    #[test]
    fn test_classify_does_not_trip_on_body_text() {
        let body = r#"<anime id="1"><description>banned in several countries</description></anime>"#;
        assert!(classify_error_body(body).is_none());
    }

    #[test]
    fn test_classify_not_found() {
        let body = r#"<error code="500">Anime not found</error>"#;
        assert!(matches!(classify_error_body(body), Some(FetchError::NotFound)));
    }

    #[test]
    fn test_classify_banned_as_auth() {
        let body = r#"<error code="555">Banned</error>"#;
        assert!(matches!(classify_error_body(body), Some(FetchError::Auth { .. })));
    }

    #[test]
    fn test_classify_client_error_as_auth() {
        let body = r#"<error>Client version missing or invalid</error>"#;
        assert!(matches!(classify_error_body(body), Some(FetchError::Auth { .. })));
    }

    #[test]
    fn test_classify_unknown_error_as_transient() {
        let body = r#"<error code="602">Server too busy, try again later</error>"#;
        assert!(matches!(
            classify_error_body(body),
            Some(FetchError::Transient { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_success_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("request", "anime"))
            .and(query_param("aid", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ANIME_BODY))
            .mount(&server)
            .await;

        let client = AniDbClient::new(test_config(server.uri())).unwrap();
        let bytes = client.fetch(1).await.unwrap();
        assert_eq!(bytes, ANIME_BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_fetch_maps_in_band_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"<error code="500">Anime not found</error>"#),
            )
            .mount(&server)
            .await;

        let client = AniDbClient::new(test_config(server.uri())).unwrap();
        assert!(matches!(client.fetch(404).await, Err(FetchError::NotFound)));
    }

    #[tokio::test]
    async fn test_fetch_maps_server_errors_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = AniDbClient::new(test_config(server.uri())).unwrap();
        assert!(matches!(
            client.fetch(1).await,
            Err(FetchError::Transient { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_maps_rate_limit_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = AniDbClient::new(test_config(server.uri())).unwrap();
        assert!(matches!(
            client.fetch(1).await,
            Err(FetchError::Transient { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_maps_ban_notice_to_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"<error code="555">Banned</error>"#),
            )
            .mount(&server)
            .await;

        let client = AniDbClient::new(test_config(server.uri())).unwrap();
        assert!(matches!(client.fetch(1).await, Err(FetchError::Auth { .. })));
    }
}
