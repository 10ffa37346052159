use std::time::Duration;

use anyhow::{bail, Context, Result};
use limner_contracts::config::{GenerationConfig, StabilityConfig};
use limner_contracts::ImageLocator;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use super::{read_json_response, require_api_key, ImageProvider, ProviderKind, RetryPolicy};

/// Stability text-to-image endpoint. Images come back inline as base64 PNG.
pub struct StabilityProvider {
    api_key: String,
    base_url: String,
    model: String,
    width: u32,
    height: u32,
    cfg_scale: f64,
    steps: u32,
    samples: u32,
    negative_prompt: Option<String>,
    retry: RetryPolicy,
    http: HttpClient,
}

impl StabilityProvider {
    pub fn from_config(config: &StabilityConfig, generation: &GenerationConfig) -> Result<Self> {
        let api_key = require_api_key(ProviderKind::Stability, config.api_key.as_deref())?;
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .context("failed to build stability-ai HTTP client")?;
        Ok(Self {
            api_key,
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            model: config.model.clone(),
            width: config.width,
            height: config.height,
            cfg_scale: config.cfg_scale,
            steps: config.steps,
            samples: config.samples,
            negative_prompt: config
                .negative_prompt
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            retry: RetryPolicy::from_config(generation, config.max_retries, config.retry_delay),
            http,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/{}/text-to-image", self.base_url, self.model)
    }

    fn request_payload(&self, prompt: &str, negative_prompt: Option<&str>) -> Value {
        let mut text_prompts = vec![json!({"text": prompt, "weight": 1})];
        let negative = negative_prompt
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .or(self.negative_prompt.as_deref());
        if let Some(negative) = negative {
            text_prompts.push(json!({"text": negative, "weight": -1}));
        }
        json!({
            "text_prompts": text_prompts,
            "cfg_scale": self.cfg_scale,
            "height": self.height,
            "width": self.width,
            "steps": self.steps,
            "samples": self.samples,
        })
    }

    fn request_once(&self, payload: &Value) -> Result<String> {
        let endpoint = self.endpoint();
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
            .json(payload)
            .send()
            .with_context(|| format!("stability-ai request failed ({endpoint})"))?;
        let parsed = read_json_response(ProviderKind::Stability, &endpoint, response)?;
        parse_artifact(&parsed)
    }
}

impl ImageProvider for StabilityProvider {
    fn name(&self) -> &str {
        ProviderKind::Stability.as_str()
    }

    fn generate(&self, prompt: &str, negative_prompt: Option<&str>) -> Result<ImageLocator> {
        let payload = self.request_payload(prompt, negative_prompt);
        let encoded = self.retry.run(self.name(), |attempt| {
            tracing::debug!(attempt = attempt + 1, model = %self.model, "requesting stability-ai image");
            self.request_once(&payload)
        })?;
        Ok(ImageLocator::embedded_png(encoded))
    }
}

/// Extracts `artifacts[0].base64`. A success status with no artifact is still
/// a failed attempt.
pub fn parse_artifact(payload: &Value) -> Result<String> {
    let encoded = payload
        .get("artifacts")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|row| row.get("base64"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if encoded.is_empty() {
        bail!("stability-ai response contained no image artifact");
    }
    Ok(encoded.to_string())
}
