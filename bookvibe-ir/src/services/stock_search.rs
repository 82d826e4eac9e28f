//! Stock photo search
//!
//! Queries one of the interchangeable stock-photo providers for a single
//! portrait-oriented image matching a text query. This client never surfaces
//! an error: zero results, non-2xx responses, network failures and malformed
//! payloads all resolve to the deterministic placeholder, so every caller is
//! guaranteed *some* URL.

use super::placeholder::placeholder_url;
use bookvibe_common::config::{StockConfig, StockProviderKind};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Stock search errors (internal; always converted to a fallback URL)
#[derive(Debug, Error)]
pub enum StockSearchError {
    #[error("API key not configured")]
    MissingKey,

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("No matching images")]
    NoResults,

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Outcome of a stock search
///
/// `fallback` is true only when a keyed provider was attempted and failed;
/// the deterministic provider returning a placeholder is its normal success
/// path, not a fallback.
#[derive(Debug, Clone)]
pub struct StockSearchResult {
    pub url: String,
    pub fallback: bool,
}

#[derive(Debug, Deserialize)]
struct PexelsResponse {
    #[serde(default)]
    photos: Vec<PexelsPhoto>,
}

#[derive(Debug, Deserialize)]
struct PexelsPhoto {
    src: PexelsSrc,
}

#[derive(Debug, Deserialize)]
struct PexelsSrc {
    large: Option<String>,
    medium: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnsplashResponse {
    #[serde(default)]
    results: Vec<UnsplashPhoto>,
}

#[derive(Debug, Deserialize)]
struct UnsplashPhoto {
    urls: UnsplashUrls,
}

#[derive(Debug, Deserialize)]
struct UnsplashUrls {
    regular: String,
}

/// Stock image search client
pub struct StockImageClient {
    http: reqwest::Client,
    config: StockConfig,
}

impl StockImageClient {
    pub fn new(config: StockConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    /// Search for one image matching `query`. Total: always yields a URL.
    pub async fn search(&self, query: &str) -> StockSearchResult {
        let attempt = match self.config.provider {
            StockProviderKind::Deterministic => {
                return StockSearchResult {
                    url: placeholder_url(query),
                    fallback: false,
                };
            }
            StockProviderKind::Pexels => self.search_pexels(query).await,
            StockProviderKind::Unsplash => self.search_unsplash(query).await,
        };

        match attempt {
            Ok(url) => {
                tracing::debug!(provider = ?self.config.provider, url = %url, "Stock search hit");
                StockSearchResult {
                    url,
                    fallback: false,
                }
            }
            // Missing key behaves like the deterministic provider: no network
            // call was made, so the placeholder is not a failure fallback.
            Err(StockSearchError::MissingKey) => {
                tracing::debug!(
                    provider = ?self.config.provider,
                    "No stock API key configured, using deterministic placeholder"
                );
                StockSearchResult {
                    url: placeholder_url(query),
                    fallback: false,
                }
            }
            Err(e) => {
                tracing::warn!(
                    provider = ?self.config.provider,
                    error = %e,
                    "Stock search failed, using deterministic placeholder"
                );
                StockSearchResult {
                    url: placeholder_url(query),
                    fallback: true,
                }
            }
        }
    }

    async fn search_pexels(&self, query: &str) -> Result<String, StockSearchError> {
        let key = self
            .config
            .key_for_selected()
            .ok_or(StockSearchError::MissingKey)?;

        let url = format!(
            "{}?query={}&per_page=1&orientation=portrait",
            self.config.pexels_api_url,
            urlencoding::encode(query)
        );

        let response = self
            .http
            .get(&url)
            .header("Authorization", key)
            .send()
            .await
            .map_err(|e| StockSearchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StockSearchError::Api(status.as_u16(), text));
        }

        let body: PexelsResponse = response
            .json()
            .await
            .map_err(|e| StockSearchError::Parse(e.to_string()))?;

        let photo = body.photos.into_iter().next().ok_or(StockSearchError::NoResults)?;
        photo
            .src
            .large
            .or(photo.src.medium)
            .ok_or_else(|| StockSearchError::Parse("photo without src urls".to_string()))
    }

    async fn search_unsplash(&self, query: &str) -> Result<String, StockSearchError> {
        let key = self
            .config
            .key_for_selected()
            .ok_or(StockSearchError::MissingKey)?;

        let url = format!(
            "{}?query={}&per_page=1&orientation=portrait&client_id={}",
            self.config.unsplash_api_url,
            urlencoding::encode(query),
            key
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| StockSearchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StockSearchError::Api(status.as_u16(), text));
        }

        let body: UnsplashResponse = response
            .json()
            .await
            .map_err(|e| StockSearchError::Parse(e.to_string()))?;

        body.results
            .into_iter()
            .next()
            .map(|p| p.urls.regular)
            .ok_or(StockSearchError::NoResults)
    }
}
