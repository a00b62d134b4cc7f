//! Runtime settings derived from [`AppConfig`].

use runloop_config::AppConfig;
use std::collections::HashMap;
use std::time::Duration;

use crate::llm::RetryPolicy;

/// Settings every run of one [`RunExecutor`](crate::RunExecutor) shares.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Default step cap when the run does not set one
    pub max_steps: u32,
    /// Relative deadline applied when the run has no `expires_at`
    pub run_timeout: Option<Duration>,
    pub tool_concurrency: usize,
    pub llm_concurrency: usize,
    pub output_poll_interval: Duration,
    pub flush_timeout: Duration,
    pub event_buffer: usize,
    pub temperature: f32,
    pub retry: RetryPolicy,
    pub truncation: TruncationSettings,
}

#[derive(Debug, Clone)]
pub struct TruncationSettings {
    pub enabled: bool,
    pub max_input_tokens: usize,
    pub shorten_attempts: u32,
    pub per_model: HashMap<String, usize>,
}

impl TruncationSettings {
    pub fn max_input_tokens_for(&self, model: &str) -> usize {
        self.per_model
            .get(model)
            .copied()
            .unwrap_or(self.max_input_tokens)
    }
}

impl EngineSettings {
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_truncation(mut self, enabled: bool) -> Self {
        self.truncation.enabled = enabled;
        self
    }

    pub fn with_max_input_tokens(mut self, max_input_tokens: usize) -> Self {
        self.truncation.max_input_tokens = max_input_tokens;
        self
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        let engine = &config.engine;
        Self {
            max_steps: engine.max_steps,
            run_timeout: engine.run_timeout_secs.map(Duration::from_secs),
            tool_concurrency: engine.tool_concurrency.max(1),
            llm_concurrency: engine.llm_concurrency.max(1),
            output_poll_interval: Duration::from_millis(engine.output_poll_interval_ms),
            flush_timeout: Duration::from_millis(engine.flush_timeout_ms),
            event_buffer: engine.event_buffer.max(1),
            temperature: config.default_temperature,
            retry: RetryPolicy {
                max_attempts: config.llm_retry.max_attempts.max(1),
                initial_backoff: Duration::from_millis(config.llm_retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(config.llm_retry.max_backoff_ms),
            },
            truncation: TruncationSettings {
                enabled: config.truncation.enabled,
                max_input_tokens: config.truncation.max_input_tokens,
                shorten_attempts: config.truncation.shorten_attempts,
                per_model: config
                    .truncation
                    .models
                    .iter()
                    .map(|(model, limits)| (model.clone(), limits.max_input_tokens))
                    .collect(),
            },
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runloop_config::ModelLimits;

    #[test]
    fn derived_from_config() {
        let mut config = AppConfig::default();
        config.engine.run_timeout_secs = Some(90);
        config.truncation.models.insert(
            "small".into(),
            ModelLimits {
                max_input_tokens: 1024,
            },
        );

        let settings = EngineSettings::from(&config);
        assert_eq!(settings.max_steps, 25);
        assert_eq!(settings.run_timeout, Some(Duration::from_secs(90)));
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.truncation.max_input_tokens_for("small"), 1024);
        assert_eq!(settings.truncation.max_input_tokens_for("large"), 8192);
    }

    #[test]
    fn builder_overrides() {
        let settings = EngineSettings::default()
            .with_max_steps(3)
            .with_truncation(false);
        assert_eq!(settings.max_steps, 3);
        assert!(!settings.truncation.enabled);
    }
}
