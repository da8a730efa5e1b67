//! Turns a change set into a short natural-language description.

pub mod completion;
pub mod parse;
pub mod prompt;
pub mod select;

pub use completion::{CommandCompletion, CompletionError, CompletionRequest, CompletionService};
pub use parse::{normalize_description, parse_description};
pub use prompt::{build_prompt, DESCRIPTION_SCHEMA};

use canopy_core::{ChangeSet, StatusProvider};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichConfig {
    pub rich_budget_chars: usize,
    pub light_budget_chars: usize,
    pub max_rich_files: usize,
    pub max_light_files: usize,
    pub max_words: usize,
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub max_output_tokens: u32,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            rich_budget_chars: 2_400,
            light_budget_chars: 700,
            max_rich_files: 4,
            max_light_files: 16,
            max_words: 10,
            max_retries: 2,
            retry_delay: Duration::from_millis(750),
            timeout: Duration::from_secs(20),
            max_output_tokens: 64,
        }
    }
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("nothing to describe")]
    NoChanges,
    #[error("enrichment failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Stateless describer. Per-resource dedup and single-flight are owned by the
/// caller; this only handles prompt assembly, the call and its retries.
#[derive(Clone)]
pub struct Enricher {
    service: Arc<dyn CompletionService>,
    config: EnrichConfig,
}

impl Enricher {
    pub fn new(service: Arc<dyn CompletionService>, config: EnrichConfig) -> Self {
        Self { service, config }
    }

    pub fn config(&self) -> &EnrichConfig {
        &self.config
    }

    pub async fn describe(
        &self,
        changes: &ChangeSet,
        status: &dyn StatusProvider,
    ) -> Result<String, EnrichError> {
        if changes.is_clean() {
            return Err(EnrichError::NoChanges);
        }
        let prompt = build_prompt(changes, status, &self.config, Utc::now()).await;
        let request = CompletionRequest {
            prompt,
            schema: DESCRIPTION_SCHEMA.to_string(),
            max_output_tokens: self.config.max_output_tokens,
            timeout: self.config.timeout,
        };

        let attempts = self.config.max_retries + 1;
        let mut last = String::new();
        for attempt in 1..=attempts {
            match self.service.complete(&request).await {
                Ok(raw) => match parse_description(&raw, self.config.max_words) {
                    Some(description) => return Ok(description),
                    None => last = format!("unparseable response: {}", preview(&raw)),
                },
                Err(err) => last = err.to_string(),
            }
            debug!(
                event = "enrich_attempt_failed",
                root = %changes.root.display(),
                attempt,
                error = %last
            );
            if attempt < attempts {
                tokio::time::sleep(retry_delay(self.config.retry_delay, attempt)).await;
            }
        }
        Err(EnrichError::Exhausted { attempts, last })
    }
}

/// Delay after failed attempt `attempt` (1-based): base, 2x base, 4x base...
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

fn preview(raw: &str) -> String {
    prompt::truncate_chars(raw.trim(), 80)
}
