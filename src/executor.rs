//! Request Executor: one classification request per case, with retry,
//! incremental timeout, and per-failure-class backoff.
//!
//! Every invocation owns its retry state; the executor itself is shared
//! immutably across concurrent case tasks.

use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{error, warn};

use crate::config::ApiConfig;
use crate::gateway::{ChatProvider, ChatRequest, FailureKind, Message, ProviderError};

/// Placeholder payload recorded when every attempt failed. Kept as valid
/// JSON with an empty classifications array so downstream parsing always
/// sees one syntactically well-formed record per case.
pub const FAILURE_SENTINEL: &str =
    r#"{"razonamiento": "ERROR: max retries exhausted after incremental-timeout attempts", "clasificaciones": []}"#;

/// Wait policy between attempts, one rule per failure class.
///
/// Delay computation is a pure function of (class, attempt, jitter sample)
/// so the timing rules are unit-testable without a clock.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Exponential base for timeout/network/other backoff.
    pub base_delay: Duration,
    /// Fixed server-dictated delay after a rate-limit response.
    pub rate_limit_delay: Duration,
    /// Linear escalation added per attempt after a rate-limit response.
    pub rate_limit_step: Duration,
    /// Upper bound of the random jitter contribution per attempt index.
    pub jitter_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            rate_limit_delay: Duration::from_secs(60),
            rate_limit_step: Duration::from_secs(15),
            jitter_step: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Derive the policy from endpoint configuration.
    pub fn from_api_config(api: &ApiConfig) -> Self {
        Self {
            rate_limit_delay: api.retry_delay,
            ..Self::default()
        }
    }

    /// Compute the wait before the attempt following `attempt` (0-based),
    /// given that attempt failed with `kind`. `jitter_unit` is a sample in
    /// `[0, 1)`; the jitter contribution is bounded by
    /// `attempt * jitter_step`.
    ///
    /// Rate limits get a fixed delay plus linear escalation. The server
    /// dictates the cadence, exponential growth gains nothing. Network
    /// failures double the exponential term.
    ///
    /// Arithmetic saturates at `Duration::MAX`: attempt counts are
    /// operator-configurable, and an absurd wait must stay a wait, not a
    /// panic.
    pub fn wait_for(&self, kind: FailureKind, attempt: u32, jitter_unit: f64) -> Duration {
        match kind {
            FailureKind::RateLimit => self
                .rate_limit_delay
                .saturating_add(self.rate_limit_step.saturating_mul(attempt)),
            FailureKind::Timeout | FailureKind::Other => self
                .backoff(attempt)
                .saturating_add(self.jitter(attempt, jitter_unit)),
            FailureKind::Network => self
                .backoff(attempt)
                .saturating_mul(2)
                .saturating_add(self.jitter(attempt, jitter_unit)),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        // Saturate rather than panic: the exponential term leaves
        // Duration's range around attempt 64 with a 2s base.
        let exponent = attempt.saturating_add(1).min(i32::MAX as u32) as i32;
        Duration::try_from_secs_f64(base.powi(exponent)).unwrap_or(Duration::MAX)
    }

    fn jitter(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let bound = self.jitter_step.as_secs_f64() * attempt as f64;
        Duration::try_from_secs_f64(bound * jitter_unit.clamp(0.0, 1.0))
            .unwrap_or(Duration::MAX)
    }
}

/// Outcome of one case's full attempt sequence.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Raw model output, or [`FAILURE_SENTINEL`] after exhaustion.
    pub raw_text: String,
    /// True only when every attempt failed.
    pub failed: bool,
    /// Attempts actually performed.
    pub attempts: u32,
}

/// Issues classification requests with bounded retries.
pub struct RequestExecutor<P: ChatProvider> {
    provider: P,
    api: ApiConfig,
    policy: RetryPolicy,
}

impl<P: ChatProvider> RequestExecutor<P> {
    pub fn new(provider: P, api: ApiConfig) -> Self {
        let policy = RetryPolicy::from_api_config(&api);
        Self::with_policy(provider, api, policy)
    }

    pub fn with_policy(provider: P, api: ApiConfig, policy: RetryPolicy) -> Self {
        Self {
            provider,
            api,
            policy,
        }
    }

    /// Run one classification, retrying transient failures. Never returns
    /// an error: exhausting `max_retries` yields the failure sentinel so
    /// the case stays present in downstream stages.
    pub async fn execute(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        case_id: &str,
    ) -> ExecutionOutcome {
        self.execute_inner(system_prompt, user_prompt, case_id, None)
            .await
    }

    /// Like [`Self::execute`], but each attempt's network call is admitted
    /// through `gate`. The permit is released before any inter-attempt
    /// wait, so a case backing off after a rate limit does not pin a
    /// concurrency slot for the duration of its delay.
    pub async fn execute_gated(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        case_id: &str,
        gate: &Semaphore,
    ) -> ExecutionOutcome {
        self.execute_inner(system_prompt, user_prompt, case_id, Some(gate))
            .await
    }

    async fn execute_inner(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        case_id: &str,
        gate: Option<&Semaphore>,
    ) -> ExecutionOutcome {
        let max_retries = self.api.max_retries.max(1);

        for attempt in 0..max_retries {
            // Each retry gets a longer deadline: slow responses near the
            // limit are the dominant transient failure.
            let timeout = self
                .api
                .timeout
                .saturating_add(self.api.timeout_step.saturating_mul(attempt));

            let request = ChatRequest::new(
                self.api.model.clone(),
                vec![
                    Message::system(system_prompt),
                    Message::user(user_prompt),
                ],
            )
            .temperature(self.api.temperature)
            .top_p(self.api.top_p)
            .max_tokens(self.api.max_tokens)
            .json()
            .timeout(timeout);

            // The permit covers exactly one network call; it drops before
            // the backoff wait below.
            let result = match gate {
                Some(gate) => match gate.acquire().await {
                    Ok(_permit) => self.provider.chat(&request).await,
                    // acquire() only errors after close(), which no caller
                    // does; treat it like any other terminal condition.
                    Err(_) => Err(ProviderError::config("admission gate closed")),
                },
                None => self.provider.chat(&request).await,
            };

            match result {
                Ok(response) => {
                    return ExecutionOutcome {
                        raw_text: response.content.trim().to_string(),
                        failed: false,
                        attempts: attempt + 1,
                    };
                }
                Err(err) => {
                    let kind = err.failure_kind();

                    if attempt + 1 == max_retries {
                        error!(
                            case_id,
                            attempts = max_retries,
                            code = err.code(),
                            error = %err,
                            "classification failed terminally"
                        );
                        return ExecutionOutcome {
                            raw_text: FAILURE_SENTINEL.to_string(),
                            failed: true,
                            attempts: max_retries,
                        };
                    }

                    let jitter_unit = rand::thread_rng().gen::<f64>();
                    let wait = self.policy.wait_for(kind, attempt, jitter_unit);
                    warn!(
                        case_id,
                        attempt = attempt + 1,
                        max_retries,
                        kind = ?kind,
                        wait_secs = wait.as_secs_f64(),
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }

        // max_retries >= 1, so the loop always returns.
        ExecutionOutcome {
            raw_text: FAILURE_SENTINEL.to_string(),
            failed: true,
            attempts: max_retries,
        }
    }
}
