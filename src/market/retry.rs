//! Backoff for market requests. Only transient failures are retried: network
//! errors, timeouts and the HTTP statuses an exchange uses for overload.

use std::future::Future;

use anyhow::Result;
use rand::Rng;
use serde_json::json;
use thiserror::Error;
use tokio::time::{sleep, Duration};

use crate::logging::{self, obj, v_str, Domain};

/// Non-success answer from a market endpoint.
#[derive(Debug, Error)]
#[error("{endpoint} answered {status}: {body}")]
pub struct HttpStatusError {
    pub endpoint: String,
    pub status: u16,
    pub body: String,
}

impl HttpStatusError {
    pub fn is_transient(&self) -> bool {
        matches!(self.status, 408 | 418 | 429 | 500 | 502 | 503 | 504)
    }
}

/// Whether another attempt could succeed.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(status) = err.downcast_ref::<HttpStatusError>() {
        return status.is_transient();
    }
    if let Some(net) = err.downcast_ref::<reqwest::Error>() {
        return net.is_timeout() || net.is_connect() || net.is_request();
    }
    false
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Doubling delay, capped, then spread by ±jitter_factor.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = (self.base_delay_ms as f64 * 2f64.powi(attempt as i32)).min(self.max_delay_ms as f64);
        let spread = capped * self.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<F, Fut, T>(&self, name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= self.max_retries || !is_transient(&err) {
                return Err(err);
            }
            let delay = self.delay(attempt);
            attempt += 1;
            logging::warn(
                Domain::Market,
                "retry",
                obj(&[
                    ("operation", v_str(name)),
                    ("attempt", json!(attempt)),
                    ("max_retries", json!(self.max_retries)),
                    ("delay_ms", json!(delay.as_millis() as u64)),
                    ("msg", v_str(&format!("{:#}", err))),
                ]),
            );
            sleep(delay).await;
        }
    }
}
