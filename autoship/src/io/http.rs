//! Best-effort JSON delivery with bounded exponential backoff.
//!
//! Used for both directions of the store/agent wire: dispatching execution
//! requests and delivering execution results. Delivery failures are reported
//! to the caller, who logs and drops them.

use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Backoff schedule for transient HTTP failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            request_timeout_secs: 30,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("retry max_attempts must be > 0"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(anyhow!("retry multiplier must be >= 1.0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("retry request_timeout_secs must be > 0"));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-indexed):
    /// `min(base * multiplier^(attempt - 1), max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// POST `body` as JSON to `url`, retrying transport errors and non-2xx responses.
///
/// Returns the last error once every attempt has failed.
pub async fn post_json_with_retry<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &T,
    policy: &RetryPolicy,
) -> Result<()> {
    let attempts = policy.max_attempts.max(1);
    let mut last_err = anyhow!("no attempts made");
    for attempt in 1..=attempts {
        let mut request = client
            .post(url)
            .timeout(policy.request_timeout())
            .json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url, attempt, "delivered");
                return Ok(());
            }
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                last_err = anyhow!("POST {url} returned {status}: {}", text.trim());
            }
            Err(err) => {
                last_err = anyhow!(err).context(format!("POST {url}"));
            }
        }
        if attempt < attempts {
            let delay = policy.delay(attempt);
            warn!(url, attempt, delay_ms = delay.as_millis() as u64, err = %last_err, "delivery failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
    Err(last_err)
}
