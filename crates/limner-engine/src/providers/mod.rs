//! Text-to-image backends.
//!
//! Every backend turns a prompt into an [`ImageLocator`]; the caller never
//! needs to know which variant produced it.

mod openai;
pub(crate) mod retry;
mod stability;

use std::env;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use limner_contracts::config::env_placeholder;
use limner_contracts::{Config, ImageLocator};
use reqwest::blocking::Response as HttpResponse;
use serde_json::Value;

pub use openai::{parse_image_url, DalleProvider};
pub use retry::RetryPolicy;
pub use stability::{parse_artifact, StabilityProvider};

pub trait ImageProvider: Send + Sync {
    /// Registered name, also used as the output directory segment.
    fn name(&self) -> &str;

    /// Runs the full retry policy; an error means every attempt failed.
    fn generate(&self, prompt: &str, negative_prompt: Option<&str>) -> Result<ImageLocator>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Dalle,
    Stability,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Dalle, ProviderKind::Stability];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dalle => "dall-e",
            Self::Stability => "stability-ai",
        }
    }

    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::Dalle => "OPENAI_API_KEY",
            Self::Stability => "STABILITY_API_KEY",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                anyhow!(
                    "unknown image provider '{}'; available providers: {}",
                    value.trim(),
                    available_providers().join(", ")
                )
            })
    }
}

pub fn available_providers() -> Vec<&'static str> {
    ProviderKind::ALL.iter().map(|kind| kind.as_str()).collect()
}

/// Builds the named backend from its configuration section plus the shared
/// `[generation]` retry policy.
pub fn create_provider(name: &str, config: &Config) -> Result<Box<dyn ImageProvider>> {
    let kind = ProviderKind::from_str(name)?;
    let provider: Box<dyn ImageProvider> = match kind {
        ProviderKind::Dalle => Box::new(DalleProvider::from_config(
            &config.image_generation.dalle,
            &config.generation,
        )?),
        ProviderKind::Stability => Box::new(StabilityProvider::from_config(
            &config.image_generation.stability,
            &config.generation,
        )?),
    };
    tracing::debug!(provider = provider.name(), "image provider ready");
    Ok(provider)
}

/// The configured key wins unless it is empty or an unresolved `${VAR}`
/// placeholder; otherwise the provider's environment variable is consulted.
pub(crate) fn resolve_api_key(configured: Option<&str>, env_key: &str) -> Option<String> {
    configured
        .map(str::trim)
        .filter(|value| !value.is_empty() && env_placeholder(value).is_none())
        .map(str::to_string)
        .or_else(|| non_empty_env(env_key))
}

pub(crate) fn require_api_key(kind: ProviderKind, configured: Option<&str>) -> Result<String> {
    match resolve_api_key(configured, kind.api_key_env()) {
        Some(key) => Ok(key),
        None => bail!(
            "{kind} API key missing: set image_generation.{kind}.api_key or {}",
            kind.api_key_env()
        ),
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Decodes a provider's JSON body. Error statuses carry an excerpt of the
/// body, since backends put the rejection reason there.
pub(crate) fn read_json_response(
    kind: ProviderKind,
    endpoint: &str,
    response: HttpResponse,
) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("{kind} response body read failed ({endpoint})"))?;
    if !status.is_success() {
        bail!(
            "{kind} request failed ({}): {}",
            status.as_u16(),
            body_excerpt(&body)
        );
    }
    serde_json::from_str(&body)
        .with_context(|| format!("{kind} returned invalid JSON ({endpoint})"))
}

const BODY_EXCERPT_CHARS: usize = 512;

/// Single-line, bounded view of a response body for error messages.
pub(crate) fn body_excerpt(body: &str) -> String {
    let flat = body.split_whitespace().collect::<Vec<&str>>().join(" ");
    if flat.chars().count() <= BODY_EXCERPT_CHARS {
        return flat;
    }
    let head = flat.chars().take(BODY_EXCERPT_CHARS).collect::<String>();
    format!("{head}...")
}
