use std::time::Duration;

use anyhow::{Context, Result};
use limner_contracts::config::{DalleConfig, GenerationConfig};
use limner_contracts::ImageLocator;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use super::{read_json_response, require_api_key, ImageProvider, ProviderKind, RetryPolicy};

/// OpenAI images endpoint. Results are remote URLs that expire, so they must
/// be downloaded promptly by the artifact store.
pub struct DalleProvider {
    api_key: String,
    api_base: String,
    model: String,
    size: String,
    quality: String,
    style: String,
    retry: RetryPolicy,
    http: HttpClient,
}

impl DalleProvider {
    pub fn from_config(config: &DalleConfig, generation: &GenerationConfig) -> Result<Self> {
        let api_key = require_api_key(ProviderKind::Dalle, config.api_key.as_deref())?;
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .context("failed to build dall-e HTTP client")?;
        Ok(Self {
            api_key,
            api_base: config.api_base.trim().trim_end_matches('/').to_string(),
            model: config.model.clone(),
            size: config.size.clone(),
            quality: config.quality.clone(),
            style: config.style.clone(),
            retry: RetryPolicy::from_config(generation, config.max_retries, config.retry_delay),
            http,
        })
    }

    fn request_payload(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "prompt": prompt,
            "size": self.size,
            "quality": self.quality,
            "style": self.style,
            "n": 1,
        })
    }

    fn request_once(&self, payload: &Value) -> Result<String> {
        let endpoint = format!("{}/images/generations", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .with_context(|| format!("dall-e request failed ({endpoint})"))?;
        let parsed = read_json_response(ProviderKind::Dalle, &endpoint, response)?;
        parse_image_url(&parsed)
    }
}

impl ImageProvider for DalleProvider {
    fn name(&self) -> &str {
        ProviderKind::Dalle.as_str()
    }

    // The images API has no negative prompt; it is accepted and ignored.
    fn generate(&self, prompt: &str, _negative_prompt: Option<&str>) -> Result<ImageLocator> {
        let payload = self.request_payload(prompt);
        let url = self.retry.run(self.name(), |attempt| {
            tracing::debug!(attempt = attempt + 1, model = %self.model, "requesting dall-e image");
            self.request_once(&payload)
        })?;
        Ok(ImageLocator::RemoteUrl(url))
    }
}

/// Extracts `data[0].url` from an images response.
pub fn parse_image_url(payload: &Value) -> Result<String> {
    payload
        .get("data")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|row| row.get("url"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .context("dall-e response contained no image url")
}
