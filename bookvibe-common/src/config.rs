//! Configuration loading
//!
//! BookVibe configuration is an immutable value constructed once at startup
//! by a layered merge, highest precedence first:
//!
//! 1. Persisted user settings (`settings.toml` in the platform config dir)
//! 2. Injected overrides (`BOOKVIBE_*` environment variables)
//! 3. Compiled defaults
//!
//! A missing or unparseable settings file logs a warning and falls through to
//! the lower layers; it never prevents startup. The merged value is passed by
//! reference into every component and never mutated during a resolution batch.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Stock photo search provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StockProviderKind {
    /// No network search; deterministic placeholder URLs only
    #[default]
    Deterministic,
    Pexels,
    Unsplash,
}

impl StockProviderKind {
    /// Parse a provider name, case-insensitive. `"picsum"` is accepted as an
    /// alias for the deterministic provider. Unknown names fall back to
    /// deterministic rather than failing startup.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "pexels" => StockProviderKind::Pexels,
            "unsplash" => StockProviderKind::Unsplash,
            "picsum" | "deterministic" | "" => StockProviderKind::Deterministic,
            other => {
                tracing::warn!("Unknown stock provider '{}', using deterministic", other);
                StockProviderKind::Deterministic
            }
        }
    }
}

/// Paid generative backend protocol shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaidBackendKind {
    /// Single request/response with an image URL in the payload
    Sync,
    /// Create-then-poll task protocol, routed through the local relay
    #[default]
    Task,
}

impl PaidBackendKind {
    /// Parse a backend name, case-insensitive, with the provider-name aliases
    /// used by the browser config ("openai" = sync, "modelscope" = task).
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "sync" | "openai" => PaidBackendKind::Sync,
            "task" | "modelscope" | "" => PaidBackendKind::Task,
            other => {
                tracing::warn!("Unknown generation backend '{}', using task", other);
                PaidBackendKind::Task
            }
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for the resolver service
    pub bind: String,
}

/// Stock photo search settings
#[derive(Debug, Clone)]
pub struct StockConfig {
    pub provider: StockProviderKind,
    pub pexels_api_key: Option<String>,
    pub unsplash_api_key: Option<String>,
    pub pexels_api_url: String,
    pub unsplash_api_url: String,
    /// Explicit bound on the stock-search HTTP call
    pub request_timeout_secs: u64,
}

impl StockConfig {
    /// Key for the selected provider, if the selection needs one and it is set
    pub fn key_for_selected(&self) -> Option<&str> {
        let key = match self.provider {
            StockProviderKind::Deterministic => return None,
            StockProviderKind::Pexels => self.pexels_api_key.as_deref(),
            StockProviderKind::Unsplash => self.unsplash_api_key.as_deref(),
        };
        key.filter(|k| !k.trim().is_empty())
    }
}

/// Paid generative backend settings
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// API key for the paid backend; absent/empty = paid tier disabled
    pub api_key: Option<String>,
    pub backend: PaidBackendKind,
    /// Direct endpoint for the sync backend
    pub api_url: String,
    pub model: String,
    /// Relay base URL for the task backend (`<relay>/generate`,
    /// `<relay>/task/<id>`); required for the task backend, which disallows
    /// direct cross-origin calls. Always absolute http(s); relative values
    /// are rejected at load time.
    pub relay_base: Option<String>,
    pub poll_interval_secs: u64,
    pub max_poll_attempts: u32,
}

impl GenerationConfig {
    /// Whether the paid tier is configured at all
    pub fn paid_configured(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false)
    }
}

/// One free URL-templated image generation endpoint
#[derive(Debug, Clone)]
pub struct FreeProviderConfig {
    pub name: String,
    /// Base URL; the prompt and seed are templated into
    /// `<base>/prompt/<encoded>?width=960&height=600&seed=<seed>&nologo=true`
    pub base_url: String,
}

/// Free generation tier settings
#[derive(Debug, Clone)]
pub struct FreeTierConfig {
    pub providers: Vec<FreeProviderConfig>,
    /// Per-attempt bound on the image fetch
    pub load_timeout_secs: u64,
}

/// Stagger delay bounds for the free tier (base delay is drawn uniformly from
/// `[base_min_ms, base_max_ms]` and multiplied by the record index)
#[derive(Debug, Clone)]
pub struct StaggerConfig {
    pub base_min_ms: u64,
    pub base_max_ms: u64,
}

/// Merged, immutable BookVibe configuration
#[derive(Debug, Clone)]
pub struct BookVibeConfig {
    pub server: ServerConfig,
    pub stock: StockConfig,
    pub generation: GenerationConfig,
    pub free: FreeTierConfig,
    pub stagger: StaggerConfig,
}

impl Default for BookVibeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: "127.0.0.1:5790".to_string(),
            },
            stock: StockConfig {
                provider: StockProviderKind::Deterministic,
                pexels_api_key: None,
                unsplash_api_key: None,
                pexels_api_url: "https://api.pexels.com/v1/search".to_string(),
                unsplash_api_url: "https://api.unsplash.com/search/photos".to_string(),
                request_timeout_secs: 15,
            },
            generation: GenerationConfig {
                api_key: None,
                backend: PaidBackendKind::Task,
                api_url: "https://api-inference.modelscope.cn/v1/images/generations"
                    .to_string(),
                model: "Tongyi-MAI/Z-Image-Turbo".to_string(),
                relay_base: None,
                poll_interval_secs: 5,
                max_poll_attempts: 60,
            },
            free: FreeTierConfig {
                providers: vec![
                    FreeProviderConfig {
                        name: "Pollinations.ai".to_string(),
                        base_url: "https://image.pollinations.ai".to_string(),
                    },
                    FreeProviderConfig {
                        name: "Pollinations.ai (alternate)".to_string(),
                        base_url: "https://pollinations.ai".to_string(),
                    },
                ],
                load_timeout_secs: 30,
            },
            stagger: StaggerConfig {
                base_min_ms: 2000,
                base_max_ms: 5000,
            },
        }
    }
}

/// On-disk settings file schema (all fields optional; only present fields
/// override the lower layers)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsFile {
    pub bind: Option<String>,
    pub stock_provider: Option<String>,
    pub pexels_api_key: Option<String>,
    pub unsplash_api_key: Option<String>,
    pub pexels_api_url: Option<String>,
    pub unsplash_api_url: Option<String>,
    pub aigc_api_key: Option<String>,
    pub aigc_backend: Option<String>,
    pub aigc_api_url: Option<String>,
    pub aigc_model: Option<String>,
    pub relay_base: Option<String>,
}

impl BookVibeConfig {
    /// Load configuration with the full layering: defaults, then environment
    /// overrides, then the persisted settings file at the platform path.
    pub fn load() -> Self {
        Self::load_with(settings_file_path().as_deref())
    }

    /// Load with an explicit settings file path (None = no file layer)
    pub fn load_with(settings_path: Option<&Path>) -> Self {
        let mut config = Self::default();
        config.apply_env();

        if let Some(path) = settings_path {
            match load_settings_file(path) {
                Ok(Some(settings)) => {
                    tracing::info!("Loaded user settings from {}", path.display());
                    config.apply_settings(settings);
                }
                Ok(None) => {
                    tracing::debug!("No settings file at {}", path.display());
                }
                Err(e) => {
                    tracing::warn!(
                        "Ignoring unreadable settings file {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }

        config
    }

    /// Overlay `BOOKVIBE_*` environment variables
    fn apply_env(&mut self) {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        if let Some(v) = var("BOOKVIBE_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = var("BOOKVIBE_STOCK_PROVIDER") {
            self.stock.provider = StockProviderKind::from_name(&v);
        }
        if let Some(v) = var("BOOKVIBE_PEXELS_API_KEY") {
            self.stock.pexels_api_key = Some(v);
        }
        if let Some(v) = var("BOOKVIBE_UNSPLASH_API_KEY") {
            self.stock.unsplash_api_key = Some(v);
        }
        if let Some(v) = var("BOOKVIBE_AIGC_API_KEY") {
            self.generation.api_key = Some(v);
        }
        if let Some(v) = var("BOOKVIBE_AIGC_BACKEND") {
            self.generation.backend = PaidBackendKind::from_name(&v);
        }
        if let Some(v) = var("BOOKVIBE_AIGC_API_URL") {
            self.generation.api_url = v;
        }
        if let Some(v) = var("BOOKVIBE_AIGC_MODEL") {
            self.generation.model = v;
        }
        if let Some(v) = var("BOOKVIBE_RELAY_BASE") {
            if let Some(base) = valid_relay_base(&v) {
                self.generation.relay_base = Some(base);
            }
        }
    }

    /// Overlay the persisted settings file (highest precedence)
    fn apply_settings(&mut self, s: SettingsFile) {
        let non_empty = |v: Option<String>| v.filter(|x| !x.trim().is_empty());

        if let Some(v) = non_empty(s.bind) {
            self.server.bind = v;
        }
        if let Some(v) = non_empty(s.stock_provider) {
            self.stock.provider = StockProviderKind::from_name(&v);
        }
        if let Some(v) = non_empty(s.pexels_api_key) {
            self.stock.pexels_api_key = Some(v);
        }
        if let Some(v) = non_empty(s.unsplash_api_key) {
            self.stock.unsplash_api_key = Some(v);
        }
        if let Some(v) = non_empty(s.pexels_api_url) {
            self.stock.pexels_api_url = v;
        }
        if let Some(v) = non_empty(s.unsplash_api_url) {
            self.stock.unsplash_api_url = v;
        }
        if let Some(v) = non_empty(s.aigc_api_key) {
            self.generation.api_key = Some(v);
        }
        if let Some(v) = non_empty(s.aigc_backend) {
            self.generation.backend = PaidBackendKind::from_name(&v);
        }
        if let Some(v) = non_empty(s.aigc_api_url) {
            self.generation.api_url = v;
        }
        if let Some(v) = non_empty(s.aigc_model) {
            self.generation.model = v;
        }
        if let Some(v) = non_empty(s.relay_base) {
            if let Some(base) = valid_relay_base(&v) {
                self.generation.relay_base = Some(base);
            }
        }
    }
}

/// Platform path of the persisted settings file
/// (`~/.config/bookvibe/settings.toml` on Linux)
pub fn settings_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("bookvibe").join("settings.toml"))
}

/// The resolver joins `<relay>/generate` and `<relay>/task/<id>` onto this
/// base with its own HTTP client, so only absolute http(s) URLs are usable.
/// Relative paths (valid for a page-relative browser fetch) are rejected
/// with a warning rather than carried into a backend that cannot call them.
fn valid_relay_base(base: &str) -> Option<String> {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Some(trimmed.to_string())
    } else {
        tracing::warn!(
            "Ignoring relay base '{}': must be an absolute http(s) URL",
            trimmed
        );
        None
    }
}

fn load_settings_file(path: &Path) -> crate::Result<Option<SettingsFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let settings = toml::from_str(&content)
        .map_err(|e| crate::Error::Config(format!("Invalid settings file: {}", e)))?;
    Ok(Some(settings))
}
