//! Generative image acquisition
//!
//! Resolves an image for a text prompt through an ordered cascade:
//!
//! 1. **Paid tier** (only when a key is configured): either a synchronous
//!    generate-now backend or an asynchronous create-then-poll task backend
//!    reached through the local relay.
//! 2. **Free tier**: a list of URL-templated services tried in order, each
//!    attempt bounded by a load timeout, with growing backoff between
//!    attempts. Exhaustion resolves to the deterministic placeholder, so the
//!    free tier never raises.
//!
//! The two paid shapes are mutually exclusive per configured backend type.
//! Provider seams (`PaidBackend`, `TaskTransport`, `ImageFetcher`) are traits
//! so the cascade and the polling protocol are testable without a network.

use super::placeholder::placeholder_url;
use async_trait::async_trait;
use bookvibe_common::config::{
    FreeProviderConfig, FreeTierConfig, GenerationConfig, PaidBackendKind,
};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Stylistic suffix appended to every paid-tier prompt
const PAID_PROMPT_SUFFIX: &str = ", cinematic, atmospheric, high quality, 4k";

/// Stylistic suffix templated into free-tier URLs
const FREE_PROMPT_SUFFIX: &str = " cinematic atmospheric high quality 8k masterpiece";

/// Seed range for free-tier requests
const FREE_SEED_RANGE: u32 = 10_000;

/// Backoff unit between free-tier attempts (multiplied by attempt number)
const FREE_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Generation errors
#[derive(Debug, Error)]
pub enum GenerateError {
    /// Missing credential or relay for the selected backend; never retried
    #[error("Generation backend not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Generation API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Malformed generation response: {0}")]
    Parse(String),

    /// Remote task reported FAILED
    #[error("Image generation failed: {0}")]
    TaskFailed(String),

    /// Poll budget exhausted without a terminal task status
    #[error("Timed out waiting for generated image")]
    Timeout,
}

/// Image-fetch probe errors (free tier)
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("Response is not an image: {0}")]
    NotAnImage(String),
}

// ============================================================================
// Paid tier backends
// ============================================================================

/// A paid text-to-image backend
#[async_trait]
pub trait PaidBackend: Send + Sync {
    /// Backend name for status labels and logs
    fn name(&self) -> &'static str;

    /// Generate one image for an (already suffix-augmented) prompt
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError>;
}

#[derive(Debug, Deserialize)]
struct SyncGenerationResponse {
    #[serde(default)]
    data: Vec<SyncGenerationImage>,
}

#[derive(Debug, Deserialize)]
struct SyncGenerationImage {
    url: String,
}

/// Synchronous "generate now" backend (OpenAI-images request shape)
pub struct SyncImageApi {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl SyncImageApi {
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone().unwrap_or_default(),
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl PaidBackend for SyncImageApi {
    fn name(&self) -> &'static str {
        "sync"
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "n": 1,
            "size": "1024x1024",
        });

        let response = self
            .http
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerateError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| {
                    v.pointer("/error/message")
                        .and_then(|m| m.as_str())
                        .map(String::from)
                })
                .unwrap_or_else(|| status.to_string());
            return Err(GenerateError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: SyncGenerationResponse = response
            .json()
            .await
            .map_err(|e| GenerateError::Parse(e.to_string()))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|image| image.url)
            .ok_or_else(|| GenerateError::Parse("response contained no images".to_string()))
    }
}

/// Task status as reported by the polling endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCEED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    /// Any other status keeps polling
    #[serde(other)]
    Other,
}

/// One poll of the task endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSnapshot {
    pub task_status: TaskStatus,
    #[serde(default)]
    pub output_images: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateTaskResponse {
    task_id: String,
}

/// Wire transport for the create/poll task protocol
///
/// The production transport talks to the relay over HTTP; tests substitute a
/// scripted one.
#[async_trait]
pub trait TaskTransport: Send + Sync {
    async fn create_task(&self, prompt: &str, model: &str) -> Result<String, GenerateError>;
    async fn poll_task(&self, task_id: &str) -> Result<TaskSnapshot, GenerateError>;
}

/// HTTP transport against the local relay
/// (`<relay>/generate`, `<relay>/task/<id>`)
pub struct HttpRelayTransport {
    http: reqwest::Client,
    relay_base: String,
}

impl HttpRelayTransport {
    pub fn new(relay_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            relay_base: relay_base.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TaskTransport for HttpRelayTransport {
    async fn create_task(&self, prompt: &str, model: &str) -> Result<String, GenerateError> {
        let url = format!("{}/generate", self.relay_base);
        let body = serde_json::json!({ "prompt": prompt, "model": model });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerateError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GenerateError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: CreateTaskResponse = response
            .json()
            .await
            .map_err(|e| GenerateError::Parse(e.to_string()))?;

        if parsed.task_id.is_empty() {
            return Err(GenerateError::Parse("create returned empty task_id".to_string()));
        }
        Ok(parsed.task_id)
    }

    async fn poll_task(&self, task_id: &str) -> Result<TaskSnapshot, GenerateError> {
        let url = format!("{}/task/{}", self.relay_base, task_id);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| GenerateError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GenerateError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| GenerateError::Parse(e.to_string()))
    }
}

/// Asynchronous task-based backend: create, then poll until terminal or the
/// poll budget is exhausted
pub struct TaskPollingClient {
    transport: Arc<dyn TaskTransport>,
    model: String,
    poll_interval: Duration,
    max_poll_attempts: u32,
}

impl TaskPollingClient {
    pub fn new(transport: Arc<dyn TaskTransport>, config: &GenerationConfig) -> Self {
        Self {
            transport,
            model: config.model.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_poll_attempts: config.max_poll_attempts,
        }
    }
}

#[async_trait]
impl PaidBackend for TaskPollingClient {
    fn name(&self) -> &'static str {
        "task"
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        let task_id = self.transport.create_task(prompt, &self.model).await?;
        tracing::info!(task_id = %task_id, "Generation task created");

        // First poll is immediate, subsequent polls wait out the interval
        for attempt in 0..self.max_poll_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.poll_interval).await;
            }

            let snapshot = match self.transport.poll_task(&task_id).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    if attempt + 1 == self.max_poll_attempts {
                        return Err(e);
                    }
                    tracing::warn!(
                        task_id = %task_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Task poll failed, retrying"
                    );
                    continue;
                }
            };

            tracing::debug!(
                task_id = %task_id,
                attempt = attempt + 1,
                max = self.max_poll_attempts,
                status = ?snapshot.task_status,
                "Task poll"
            );

            match snapshot.task_status {
                TaskStatus::Succeeded => {
                    return snapshot
                        .output_images
                        .into_iter()
                        .next()
                        .ok_or_else(|| {
                            GenerateError::Parse(
                                "task succeeded without output images".to_string(),
                            )
                        });
                }
                TaskStatus::Failed => {
                    return Err(GenerateError::TaskFailed(
                        snapshot
                            .error_message
                            .unwrap_or_else(|| "unknown error".to_string()),
                    ));
                }
                TaskStatus::Pending | TaskStatus::Running | TaskStatus::Other => {}
            }
        }

        Err(GenerateError::Timeout)
    }
}

// ============================================================================
// Free tier
// ============================================================================

/// Probes whether a URL actually serves an image
///
/// The free services render the image directly into the URL response, so
/// success/failure is observed by fetching the URL, not by parsing a JSON
/// envelope.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<(), FetchError>;
}

/// HTTP image probe: the fetch succeeds when the response is 2xx, declares an
/// image content type, and carries a non-empty body
pub struct HttpImageFetcher {
    http: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<(), FetchError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("image/") {
            return Err(FetchError::NotAnImage(content_type));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        if bytes.is_empty() {
            return Err(FetchError::NotAnImage("empty body".to_string()));
        }
        Ok(())
    }
}

/// One free URL-templated provider
#[derive(Debug, Clone)]
pub struct FreeProvider {
    pub name: String,
    base_url: String,
}

impl FreeProvider {
    pub fn from_config(config: &FreeProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Template the suffix-augmented prompt and seed into the provider URL
    pub fn image_url(&self, prompt: &str, seed: u32) -> String {
        let augmented = format!("{}{}", prompt, FREE_PROMPT_SUFFIX);
        format!(
            "{}/prompt/{}?width=960&height=600&seed={}&nologo=true",
            self.base_url,
            urlencoding::encode(&augmented),
            seed
        )
    }
}

// ============================================================================
// Client
// ============================================================================

/// Cascade policy for `GenerativeImageClient::generate`
#[derive(Debug, Clone, Copy)]
pub struct GeneratePolicy {
    /// When false, a paid-tier failure propagates to the caller instead of
    /// falling through to the free tier
    pub allow_free_fallback: bool,
}

enum PaidTier {
    /// No API key; paid tier skipped entirely
    Disabled,
    /// Key present but the backend is unusable (e.g. task backend without a
    /// relay); fails as a configuration error without a network call
    Invalid(String),
    Ready(Arc<dyn PaidBackend>),
}

/// Generative image client: paid tier, then free cascade, then placeholder
pub struct GenerativeImageClient {
    paid: PaidTier,
    free_providers: Vec<FreeProvider>,
    fetcher: Arc<dyn ImageFetcher>,
    load_timeout: Duration,
}

impl GenerativeImageClient {
    pub fn from_config(generation: &GenerationConfig, free: &FreeTierConfig) -> Self {
        let paid = if !generation.paid_configured() {
            PaidTier::Disabled
        } else {
            match generation.backend {
                PaidBackendKind::Sync => {
                    PaidTier::Ready(Arc::new(SyncImageApi::new(generation)))
                }
                PaidBackendKind::Task => match generation.relay_base.as_deref() {
                    Some(base) if base.starts_with("http://") || base.starts_with("https://") => {
                        PaidTier::Ready(Arc::new(TaskPollingClient::new(
                            Arc::new(HttpRelayTransport::new(base)),
                            generation,
                        )))
                    }
                    Some(base) => PaidTier::Invalid(format!(
                        "task backend relay base must be an absolute http(s) URL, got '{}'",
                        base
                    )),
                    None => PaidTier::Invalid(
                        "task backend requires a configured relay base".to_string(),
                    ),
                },
            }
        };

        Self {
            paid,
            free_providers: free.providers.iter().map(FreeProvider::from_config).collect(),
            fetcher: Arc::new(HttpImageFetcher::new()),
            load_timeout: Duration::from_secs(free.load_timeout_secs),
        }
    }

    /// Test/composition seam: explicit parts instead of config-built ones
    pub fn with_parts(
        paid: Option<Arc<dyn PaidBackend>>,
        free_providers: Vec<FreeProvider>,
        fetcher: Arc<dyn ImageFetcher>,
        load_timeout: Duration,
    ) -> Self {
        Self {
            paid: match paid {
                Some(backend) => PaidTier::Ready(backend),
                None => PaidTier::Disabled,
            },
            free_providers,
            fetcher,
            load_timeout,
        }
    }

    /// Whether the paid tier should be attempted at all (a key is configured,
    /// even if the backend turns out to be misconfigured)
    pub fn paid_available(&self) -> bool {
        !matches!(self.paid, PaidTier::Disabled)
    }

    /// Paid tier only; fails without touching the free tier
    pub async fn generate_paid(&self, prompt: &str) -> Result<String, GenerateError> {
        let backend = match &self.paid {
            PaidTier::Disabled => {
                return Err(GenerateError::NotConfigured(
                    "no generation API key configured".to_string(),
                ));
            }
            PaidTier::Invalid(reason) => {
                return Err(GenerateError::NotConfigured(reason.clone()));
            }
            PaidTier::Ready(backend) => backend,
        };

        let augmented = format!("{}{}", prompt, PAID_PROMPT_SUFFIX);
        tracing::info!(backend = backend.name(), "Generating image via paid backend");
        backend.generate(&augmented).await
    }

    /// Free cascade without the placeholder terminal: `None` means every free
    /// provider was exhausted. `on_attempt` observes each provider attempt.
    pub async fn free_cascade(
        &self,
        prompt: &str,
        on_attempt: &mut (dyn FnMut(&str, usize) + Send),
    ) -> Option<String> {
        for (attempt, provider) in self.free_providers.iter().enumerate() {
            if attempt > 0 {
                // Growing backoff spreads retries across providers
                tokio::time::sleep(FREE_RETRY_BACKOFF * attempt as u32).await;
            }

            on_attempt(&provider.name, attempt);

            // ThreadRng is not Send; keep it out of the await scope
            let seed = rand::thread_rng().gen_range(0..FREE_SEED_RANGE);
            let url = provider.image_url(prompt, seed);
            tracing::info!(provider = %provider.name, attempt = attempt + 1, "Free generation attempt");

            match tokio::time::timeout(self.load_timeout, self.fetcher.fetch(&url)).await {
                Ok(Ok(())) => {
                    tracing::info!(provider = %provider.name, "Free generation succeeded");
                    return Some(url);
                }
                Ok(Err(e)) => {
                    tracing::warn!(provider = %provider.name, error = %e, "Free generation failed");
                }
                Err(_) => {
                    tracing::warn!(provider = %provider.name, "Free generation timed out");
                }
            }
        }

        None
    }

    /// Free tier with the placeholder terminal; never errors
    pub async fn generate_free(
        &self,
        prompt: &str,
        on_attempt: &mut (dyn FnMut(&str, usize) + Send),
    ) -> String {
        match self.free_cascade(prompt, on_attempt).await {
            Some(url) => url,
            None => {
                tracing::warn!("All free providers exhausted, using deterministic placeholder");
                placeholder_url(prompt)
            }
        }
    }

    /// Full cascade per policy
    ///
    /// Fails only when `allow_free_fallback` is false and the paid tier
    /// failed; otherwise always resolves to a URL.
    pub async fn generate(
        &self,
        prompt: &str,
        policy: GeneratePolicy,
    ) -> Result<String, GenerateError> {
        match self.generate_paid(prompt).await {
            Ok(url) => Ok(url),
            Err(e) if !policy.allow_free_fallback => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Paid tier failed, falling through to free tier");
                Ok(self.generate_free(prompt, &mut |_, _| {}).await)
            }
        }
    }
}
