//! Explicit configuration values for the validation run.
//!
//! Every component receives its configuration at construction. Nothing in
//! this crate reads ambient/global state beyond the API credential, which
//! the provider adapter picks up from the environment once, at startup.

use std::time::Duration;

/// Remote classifier endpoint configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Model identifier sent to the chat-completions endpoint.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling parameter.
    pub top_p: f32,
    /// Cap on generated tokens per classification.
    pub max_tokens: u32,
    /// Base request timeout for the first attempt. Subsequent attempts get
    /// `timeout_step` added per retry.
    pub timeout: Duration,
    /// Extra timeout granted per retry attempt.
    pub timeout_step: Duration,
    /// Total attempts per case before the failure sentinel is returned.
    pub max_retries: u32,
    /// Fixed delay applied after a rate-limit response.
    pub retry_delay: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            model: "deepseek-chat".to_string(),
            temperature: 0.1,
            top_p: 0.9,
            max_tokens: 1000,
            timeout: Duration::from_secs(90),
            timeout_step: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(60),
        }
    }
}

/// Batch scheduling configuration.
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Cases per batch (the last batch may be shorter).
    pub batch_size: usize,
    /// Admission gate size: maximum in-flight remote calls.
    pub max_concurrent: usize,
    /// Force a buffer-reclamation pass every this many batches.
    pub memory_cleanup_every: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_concurrent: 10,
            memory_cleanup_every: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_production_values() {
        let api = ApiConfig::default();
        assert_eq!(api.max_retries, 3);
        assert_eq!(api.timeout, Duration::from_secs(90));

        let proc = ProcessingConfig::default();
        assert_eq!(proc.batch_size, 100);
        assert_eq!(proc.max_concurrent, 10);
    }
}
