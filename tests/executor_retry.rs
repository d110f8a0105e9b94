use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use triage_harness::config::ApiConfig;
use triage_harness::executor::{RequestExecutor, RetryPolicy, FAILURE_SENTINEL};
use triage_harness::gateway::DeepSeekAdapter;

fn fast_config() -> ApiConfig {
    ApiConfig {
        timeout: Duration::from_secs(5),
        timeout_step: Duration::from_secs(0),
        max_retries: 3,
        retry_delay: Duration::from_secs(0),
        ..ApiConfig::default()
    }
}

fn zero_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::ZERO,
        rate_limit_delay: Duration::ZERO,
        rate_limit_step: Duration::ZERO,
        jitter_step: Duration::ZERO,
    }
}

struct FlipResponder {
    calls: Arc<AtomicUsize>,
    first: ResponseTemplate,
    second: ResponseTemplate,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            self.first.clone()
        } else {
            self.second.clone()
        }
    }
}

#[tokio::test]
async fn exhausting_retries_against_rate_limits_yields_sentinel_not_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "rate limit exceeded", "code": "rate_limit" }
        })))
        .expect(3)
        .mount(&server)
        .await;

    let adapter =
        DeepSeekAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let executor = RequestExecutor::with_policy(adapter, fast_config(), zero_policy());

    let outcome = executor.execute("sistema", "texto", "case-1").await;
    assert!(outcome.failed);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.raw_text, FAILURE_SENTINEL);

    // The sentinel must stay parseable downstream.
    let value: serde_json::Value = serde_json::from_str(&outcome.raw_text).unwrap();
    assert!(value["clasificaciones"].as_array().unwrap().is_empty());

    server.verify().await;
}

#[tokio::test]
async fn backoff_waits_do_not_pin_an_admission_slot() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "rate limit exceeded", "code": "rate_limit" }
        })))
        .mount(&server)
        .await;

    let adapter =
        DeepSeekAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let config = ApiConfig {
        max_retries: 2,
        ..fast_config()
    };
    let policy = RetryPolicy {
        rate_limit_delay: Duration::from_millis(500),
        ..zero_policy()
    };
    let executor = Arc::new(RequestExecutor::with_policy(adapter, config, policy));
    let gate = Arc::new(Semaphore::new(1));

    let task = {
        let executor = Arc::clone(&executor);
        let gate = Arc::clone(&gate);
        tokio::spawn(async move { executor.execute_gated("sistema", "texto", "case-4", &gate).await })
    };

    // By now the first attempt has finished and the case sits in its
    // 500ms rate-limit wait; the single slot must be free again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let free_during_wait = gate.try_acquire();
    assert!(free_during_wait.is_ok());
    drop(free_during_wait);

    let outcome = task.await.unwrap();
    assert!(outcome.failed);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(gate.available_permits(), 1);
}

#[tokio::test]
async fn transient_failure_then_success_returns_content() {
    let server = MockServer::start().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let first = ResponseTemplate::new(500).set_body_json(json!({
        "error": { "message": "transient error", "code": "internal" }
    }));
    let body = r#"{"razonamiento": "ok", "clasificaciones": [{"codigo": "9", "justificacion": "robo"}]}"#;
    let second = ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": body },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
    }));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls: Arc::clone(&calls),
            first,
            second,
        })
        .mount(&server)
        .await;

    let adapter =
        DeepSeekAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let executor = RequestExecutor::with_policy(adapter, fast_config(), zero_policy());

    let outcome = executor.execute("sistema", "texto", "case-2").await;
    assert!(!outcome.failed);
    assert_eq!(outcome.attempts, 2);
    assert!(outcome.raw_text.contains("\"codigo\": \"9\""));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn first_attempt_success_makes_exactly_one_request() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "  {\"razonamiento\": \"ok\", \"clasificaciones\": []}  " },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter =
        DeepSeekAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let executor = RequestExecutor::with_policy(adapter, fast_config(), zero_policy());

    let outcome = executor.execute("sistema", "texto", "case-3").await;
    assert!(!outcome.failed);
    assert_eq!(outcome.attempts, 1);
    // Content comes back trimmed.
    assert!(outcome.raw_text.starts_with('{'));
    assert!(outcome.raw_text.ends_with('}'));

    server.verify().await;
}
