//! Bounded persistence calls: a timeout on every attempt, plus a small
//! retry budget owned by the coordinator.

use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

use rand::Rng;
use serde_json::{json, Map, Value};
use tokio::time::{sleep, timeout, Duration};

use crate::config::Config;
use crate::error::PersistenceError;
use crate::logging::{log, log_persistence, obj, v_str, Domain, Level};

/// Retry configuration
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    /// Bound on each individual attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay_ms: 20,
            max_delay_ms: 500,
            jitter_factor: 0.3,
            attempt_timeout: Duration::from_millis(2000),
        }
    }
}

impl RetryConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_retries: cfg.persist_retries,
            attempt_timeout: cfg.persist_timeout(),
            ..Default::default()
        }
    }

    /// Calculate delay with exponential backoff and jitter
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (clamped + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

fn retry_fields(op: &str, attempt: u32, max_attempts: u32, error: &str, delay: Duration) -> Map<String, Value> {
    obj(&[
        ("op", v_str(op)),
        ("attempt", json!(attempt)),
        ("max_attempts", json!(max_attempts)),
        ("error", v_str(error)),
        ("delay_ms", json!(delay.as_millis() as u64)),
    ])
}

/// Retry a fallible async operation with exponential backoff
pub async fn retry_async<F, Fut, T, E>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                log(
                    Level::Warn,
                    Domain::Store,
                    "retry_scheduled",
                    retry_fields(operation_name, attempt + 1, config.max_retries + 1, &e.to_string(), delay),
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run one persistence call under a deadline.
pub async fn with_timeout<T, Fut>(limit: Duration, op: &str, fut: Fut) -> Result<T, PersistenceError>
where
    Fut: Future<Output = Result<T, PersistenceError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PersistenceError::Timeout {
            op: op.to_string(),
            ms: limit.as_millis() as u64,
        }),
    }
}

/// Timeout on every attempt, retried per `config`, each attempt logged.
pub async fn persist_call<F, Fut, T>(
    config: &RetryConfig,
    op: &str,
    player_id: &str,
    mut operation: F,
) -> Result<T, PersistenceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PersistenceError>>,
{
    retry_async(config, op, |attempt| {
        let fut = operation();
        async move {
            let started = Instant::now();
            let result = with_timeout(config.attempt_timeout, op, fut).await;
            let elapsed = started.elapsed().as_secs_f64() * 1000.0;
            match &result {
                Ok(_) => log_persistence(op, player_id, attempt, elapsed, None),
                Err(e) => log_persistence(op, player_id, attempt, elapsed, Some(&e.to_string())),
            }
            result
        }
    })
    .await
}
