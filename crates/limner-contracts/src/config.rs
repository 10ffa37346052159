//! Run configuration
//!
//! Loaded from a single TOML file. String values written exactly as `${NAME}`
//! are replaced by the environment variable `NAME` when it is set, before the
//! document is deserialized into typed sections.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROMPT_MAX_LENGTH: usize = 1000;
pub const DEFAULT_MIN_DESCRIPTION_CHARS: usize = 20;
pub const DEFAULT_PROMPTS_KEY: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub image_generation: ImageGenerationConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

/// Entity catalog endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationConfig {
    pub provider: String,
    #[serde(rename = "dall-e", default)]
    pub dalle: DalleConfig,
    #[serde(rename = "stability-ai", default)]
    pub stability: StabilityConfig,
}

/// OpenAI images endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DalleConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_openai_api_base")]
    pub api_base: String,
    #[serde(default = "default_dalle_model")]
    pub model: String,
    #[serde(default = "default_dalle_size")]
    pub size: String,
    #[serde(default = "default_dalle_quality")]
    pub quality: String,
    #[serde(default = "default_dalle_style")]
    pub style: String,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout: u64,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay: Option<f64>,
}

impl Default for DalleConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: default_openai_api_base(),
            model: default_dalle_model(),
            size: default_dalle_size(),
            quality: default_dalle_quality(),
            style: default_dalle_style(),
            timeout: default_provider_timeout_secs(),
            max_retries: None,
            retry_delay: None,
        }
    }
}

/// Stability v1 text-to-image settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_stability_base_url")]
    pub base_url: String,
    #[serde(default = "default_stability_model")]
    pub model: String,
    #[serde(default = "default_stability_dim")]
    pub width: u32,
    #[serde(default = "default_stability_dim")]
    pub height: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f64,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_samples")]
    pub samples: u32,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout: u64,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay: Option<f64>,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_stability_base_url(),
            model: default_stability_model(),
            width: default_stability_dim(),
            height: default_stability_dim(),
            cfg_scale: default_cfg_scale(),
            steps: default_steps(),
            samples: default_samples(),
            negative_prompt: None,
            timeout: default_provider_timeout_secs(),
            max_retries: None,
            retry_delay: None,
        }
    }
}

/// Retry and pacing policy shared by all providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff in seconds; attempt `n` waits `retry_delay * 2^n`.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    /// Pause in seconds between generated entities.
    #[serde(default = "default_batch_delay")]
    pub batch_delay: f64,
    /// Used only for the estimated cost reported after a run.
    #[serde(default = "default_cost_per_image")]
    pub cost_per_image: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            batch_delay: default_batch_delay(),
            cost_per_image: default_cost_per_image(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub base_path: PathBuf,
    /// Download timeout in seconds for remote image locators.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default)]
    pub conversions: ConversionsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sizes: Vec<u32>,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl ConversionsConfig {
    /// Conversions live under `{base}/conversions` unless a path is configured.
    pub fn root(&self, base: &Path) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| base.join("conversions"))
    }

    pub fn is_active(&self) -> bool {
        self.enabled && !self.sizes.is_empty()
    }
}

/// Per-entity-type prompt shaping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// May contain a `{category}` placeholder.
    #[serde(default)]
    pub entity_prefix: String,
    #[serde(default)]
    pub include_category: bool,
    /// Dotted path into the entity record, e.g. `school.name`.
    #[serde(default)]
    pub category_field: Option<String>,
    #[serde(default = "default_prompt_max_length")]
    pub max_length: usize,
    /// Cleaned descriptions shorter than this are dropped from the prompt.
    #[serde(default = "default_min_description_chars")]
    pub min_description_chars: usize,
    #[serde(default)]
    pub template: Option<String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            entity_prefix: String::new(),
            include_category: false,
            category_field: None,
            max_length: DEFAULT_PROMPT_MAX_LENGTH,
            min_description_chars: DEFAULT_MIN_DESCRIPTION_CHARS,
            template: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default)]
    pub template: Option<String>,
    #[serde(flatten)]
    pub entity_types: BTreeMap<String, PromptConfig>,
}

impl PromptsConfig {
    /// The entity type's own table, else the `default` table, else built-in defaults.
    pub fn for_entity_type(&self, entity_type: &str) -> PromptConfig {
        self.entity_types
            .get(entity_type)
            .or_else(|| self.entity_types.get(DEFAULT_PROMPTS_KEY))
            .cloned()
            .unwrap_or_default()
    }

    /// A per-type template wins over the global one; empty templates count as absent.
    pub fn template_for(&self, entity_type: &str) -> Option<String> {
        let own = self.for_entity_type(entity_type).template;
        own.filter(|value| !value.trim().is_empty()).or_else(|| {
            self.template
                .clone()
                .filter(|value| !value.trim().is_empty())
        })
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("configuration file not found: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("failed to parse configuration {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let mut document: toml::Value = toml::from_str(raw)?;
        substitute_env_vars(&mut document);
        let config: Self = document.try_into()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.output.conversions.sizes.contains(&0) {
            bail!("output.conversions.sizes must be positive pixel sizes");
        }
        Ok(())
    }
}

/// Replaces `${NAME}` string values with the environment value, recursively.
/// Unset variables leave the placeholder in place.
pub fn substitute_env_vars(value: &mut toml::Value) {
    match value {
        toml::Value::String(text) => {
            if let Some(name) = env_placeholder(text) {
                if let Ok(resolved) = std::env::var(name) {
                    *text = resolved;
                }
            }
        }
        toml::Value::Array(items) => items.iter_mut().for_each(substitute_env_vars),
        toml::Value::Table(table) => table
            .iter_mut()
            .for_each(|(_, value)| substitute_env_vars(value)),
        _ => {}
    }
}

/// The variable name if `text` is exactly `${NAME}`.
pub fn env_placeholder(text: &str) -> Option<&str> {
    text.strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|name| !name.is_empty())
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_provider_timeout_secs() -> u64 {
    60
}
fn default_openai_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_dalle_model() -> String {
    "dall-e-3".to_string()
}
fn default_dalle_size() -> String {
    "1024x1024".to_string()
}
fn default_dalle_quality() -> String {
    "standard".to_string()
}
fn default_dalle_style() -> String {
    "vivid".to_string()
}
fn default_stability_base_url() -> String {
    "https://api.stability.ai/v1/generation".to_string()
}
fn default_stability_model() -> String {
    "stable-diffusion-xl-1024-v1-0".to_string()
}
fn default_stability_dim() -> u32 {
    1024
}
fn default_cfg_scale() -> f64 {
    7.0
}
fn default_steps() -> u32 {
    30
}
fn default_samples() -> u32 {
    1
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> f64 {
    5.0
}
fn default_batch_delay() -> f64 {
    2.0
}
fn default_prompt_max_length() -> usize {
    DEFAULT_PROMPT_MAX_LENGTH
}
fn default_cost_per_image() -> f64 {
    0.04
}
fn default_min_description_chars() -> usize {
    DEFAULT_MIN_DESCRIPTION_CHARS
}
