use std::thread;
use std::time::Duration;

use anyhow::Result;
use limner_contracts::config::GenerationConfig;

/// Bounded retry with exponential backoff: attempt `n` (from 0) is followed by
/// a wait of `retry_delay * 2^n` when another attempt remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Shared policy from `[generation]`, with optional per-provider overrides.
    pub fn from_config(
        generation: &GenerationConfig,
        max_retries: Option<u32>,
        retry_delay_s: Option<f64>,
    ) -> Self {
        Self::new(
            max_retries.unwrap_or(generation.max_retries),
            seconds(retry_delay_s.unwrap_or(generation.retry_delay)),
        )
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.retry_delay.saturating_mul(factor)
    }

    pub fn run<T>(&self, label: &str, op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        self.run_with_sleep(label, op, thread::sleep)
    }

    fn run_with_sleep<T>(
        &self,
        label: &str,
        mut op: impl FnMut(u32) -> Result<T>,
        mut sleep: impl FnMut(Duration),
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        provider = label,
                        attempt = attempt + 1,
                        of = self.total_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "generation attempt failed: {err:#}"
                    );
                    sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(
                        provider = label,
                        attempts = self.total_attempts(),
                        "generation failed: {err:#}"
                    );
                    return Err(err.context(format!(
                        "{label} generation failed after {} retries",
                        self.max_retries
                    )));
                }
            }
        }
    }
}

pub(crate) fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}
