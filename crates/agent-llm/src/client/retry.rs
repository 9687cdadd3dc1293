use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use agent_core::{tools::ToolSchema, Message};

use crate::provider::{LLMError, LLMProvider, LLMStream, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total tries including the first one. Values below 1 are treated as 1.
    pub max_attempts: u32,
    pub max_backoff_secs: f64,
    /// Fraction of the base delay added or subtracted at random, in `[0, 1)`.
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_backoff_secs: 30.0,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryConfig {
    /// Delay after a failure at `attempt` (zero-based):
    /// `min(2^attempt, max_backoff)` shifted by up to `jitter_ratio` of itself.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let cap = self.max_backoff_secs.max(0.0);
        let base = 2f64.powi(attempt.min(62) as i32).min(cap);
        let jitter = self.jitter_ratio.clamp(0.0, 0.99);

        let offset = if jitter > 0.0 && base > 0.0 {
            base * jitter * rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };

        Duration::from_secs_f64((base + offset).max(0.0))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Wraps a provider and repeats calls that failed with a transient error.
pub struct RetryProvider<P: LLMProvider> {
    inner: P,
    config: RetryConfig,
}

impl<P: LLMProvider> RetryProvider<P> {
    pub fn new(inner: P, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.attempts();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(LLMError::Cancelled);
            }

            let error = match call().await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_retryable() => return Err(error),
                Err(error) => error,
            };

            if attempt + 1 >= attempts {
                log::error!(
                    "{} {} failed after {} attempts: {}",
                    self.inner.name(),
                    operation,
                    attempts,
                    error
                );
                return Err(LLMError::MaxRetriesExceeded {
                    attempts,
                    source: Box::new(error),
                });
            }

            let delay = self.config.backoff(attempt);
            log::warn!(
                "{} {} attempt {}/{} failed: {}. Retrying in {:.2}s",
                self.inner.name(),
                operation,
                attempt + 1,
                attempts,
                error,
                delay.as_secs_f64()
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(LLMError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

#[async_trait]
impl<P: LLMProvider> LLMProvider for RetryProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn supports_tools(&self) -> bool {
        self.inner.supports_tools()
    }

    async fn ask(&self, prompt: &str, cancel: &CancellationToken) -> Result<LLMStream> {
        self.with_retry("ask", cancel, || self.inner.ask(prompt, cancel))
            .await
    }

    async fn ask_blocking(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        self.with_retry("ask_blocking", cancel, || {
            self.inner.ask_blocking(prompt, cancel)
        })
        .await
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<LLMStream> {
        self.with_retry("chat_stream", cancel, || {
            self.inner.chat_stream(messages, tools, cancel)
        })
        .await
    }

    async fn is_ready(&self) -> bool {
        self.inner.is_ready().await
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        self.inner.list_models().await
    }
}
