//! Circuit breaker, retry and timeout wrapper for direct upstream calls.
//!
//! One breaker per upstream server, independent of session state. When the
//! circuit is open, or when retries and timeouts are exhausted, the caller
//! receives a structured fallback object instead of an error — `fallback:
//! true` is a signal to branch on, not a success.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use serde::Serialize;
use serde_json::Value;
use tokio_retry::{
    Retry,
    strategy::{ExponentialBackoff, jitter},
};

use crate::{GatewayError, GatewayResult, config::CircuitBreakerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_probes: usize,
}

/// Sliding-window circuit breaker for one upstream server.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                half_open_probes: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(CircuitState::Open)
    }

    /// Whether a call may pass through right now. An open circuit flips to
    /// half-open once the wait duration has elapsed; half-open admits a
    /// bounded number of probes.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let waited = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.open_wait);
                if waited {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_probes = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_probes < self.config.half_open_max_probes {
                    inner.half_open_probes += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.window.clear();
                inner.opened_at = None;
            }
            CircuitState::Closed => {
                Self::push_outcome(&mut inner, self.config.window_size, true);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                Self::push_outcome(&mut inner, self.config.window_size, false);
                let window = &inner.window;
                if window.len() >= self.config.window_size {
                    let failures = window.iter().filter(|success| !**success).count();
                    let rate = failures as f64 / window.len() as f64;
                    if rate >= self.config.failure_rate_threshold {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(Instant::now());
                        inner.window.clear();
                    }
                }
            }
            CircuitState::Open => {}
        }
    }

    fn push_outcome(inner: &mut BreakerInner, window_size: usize, success: bool) {
        inner.window.push_back(success);
        while inner.window.len() > window_size {
            inner.window.pop_front();
        }
    }
}

/// Structured result returned instead of an error when the circuit is open
/// or the call could not complete.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fallback {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub server: String,
    pub fallback: bool,
}

impl Fallback {
    fn unavailable(server: &str, tool: Option<&str>) -> Self {
        Self {
            error: "Service temporarily unavailable".to_string(),
            tool: tool.map(str::to_string),
            server: server.to_string(),
            fallback: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardedOutcome {
    Ok(Value),
    Fallback(Fallback),
}

impl GuardedOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self, GuardedOutcome::Fallback(_))
    }
}

/// The kind of direct upstream call being guarded. Only read-style calls
/// are retried; all kinds carry a hard timeout that counts as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamCall {
    ExecuteTool,
    ListTools,
    HealthCheck,
}

impl UpstreamCall {
    fn timeout(self, config: &CircuitBreakerConfig) -> Duration {
        match self {
            UpstreamCall::ExecuteTool => config.execute_timeout,
            UpstreamCall::ListTools => config.list_timeout,
            UpstreamCall::HealthCheck => config.health_timeout,
        }
    }

    fn is_idempotent(self) -> bool {
        matches!(self, UpstreamCall::ListTools | UpstreamCall::HealthCheck)
    }
}

/// Per-server breakers plus the retry/timeout policy around guarded calls.
pub struct ResilientCaller {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl ResilientCaller {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn breaker(&self, server_id: &str) -> Arc<CircuitBreaker> {
        if let Ok(breakers) = self.breakers.read()
            && let Some(breaker) = breakers.get(server_id)
        {
            return breaker.clone();
        }
        let breaker = Arc::new(CircuitBreaker::new(self.config.clone()));
        if let Ok(mut breakers) = self.breakers.write() {
            return breakers
                .entry(server_id.to_string())
                .or_insert(breaker)
                .clone();
        }
        breaker
    }

    /// Run `operation` under the server's breaker. Never returns an error:
    /// short-circuits and exhausted calls yield a [`Fallback`].
    pub async fn call<F, Fut>(
        &self,
        server_id: &str,
        tool: Option<&str>,
        kind: UpstreamCall,
        operation: F,
    ) -> GuardedOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = GatewayResult<Value>>,
    {
        let breaker = self.breaker(server_id);
        if !breaker.try_acquire() {
            tracing::warn!(server_id, ?kind, "circuit open, short-circuiting to fallback");
            return GuardedOutcome::Fallback(Fallback::unavailable(server_id, tool));
        }

        let timeout = kind.timeout(&self.config);
        let run_once = || async {
            match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::UpstreamTimeout(timeout)),
            }
        };
        let result = if kind.is_idempotent() && self.config.retry_max_attempts > 0 {
            let strategy = ExponentialBackoff::from_millis(
                self.config.retry_base_delay.as_millis() as u64,
            )
            .max_delay(self.config.retry_max_delay)
            .take(self.config.retry_max_attempts)
            .map(jitter);
            Retry::spawn(strategy, run_once).await
        } else {
            run_once().await
        };

        match result {
            Ok(value) => {
                breaker.record_success();
                GuardedOutcome::Ok(value)
            }
            Err(error) => {
                breaker.record_failure();
                tracing::warn!(
                    server_id,
                    ?kind,
                    error = %error,
                    "guarded upstream call failed, returning fallback"
                );
                GuardedOutcome::Fallback(Fallback::unavailable(server_id, tool))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            window_size: 4,
            failure_rate_threshold: 0.5,
            open_wait: Duration::from_millis(50),
            half_open_max_probes: 1,
            execute_timeout: Duration::from_millis(200),
            list_timeout: Duration::from_millis(200),
            health_timeout: Duration::from_millis(200),
            retry_max_attempts: 0,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn opens_after_failure_rate_over_full_window() {
        let breaker = CircuitBreaker::new(test_config());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_success();
        breaker.record_failure();
        // 3 failures out of 4: over the 50% threshold.
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..4 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.try_acquire());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn half_open_bounds_probes() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..4 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.try_acquire());
        // Only one probe allowed through.
        assert!(!breaker.try_acquire());
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_without_calling_upstream() {
        let mut config = test_config();
        // Long enough that the open circuit cannot flip to half-open while
        // this test runs.
        config.open_wait = Duration::from_secs(60);
        let caller = ResilientCaller::new(config);
        let calls = AtomicUsize::new(0);

        for _ in 0..4 {
            let outcome = caller
                .call("srv", Some("tool"), UpstreamCall::ExecuteTool, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::UpstreamConnectionFailed("down".into()))
                })
                .await;
            assert!(outcome.is_fallback());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(caller.breaker("srv").state(), CircuitState::Open);

        // While open the operation must not be invoked.
        let outcome = caller
            .call("srv", Some("tool"), UpstreamCall::ExecuteTool, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"ok": true}))
            })
            .await;
        assert!(outcome.is_fallback());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn recovers_after_wait_and_successful_probe() {
        let caller = ResilientCaller::new(test_config());
        for _ in 0..4 {
            caller.breaker("srv").record_failure();
        }
        assert_eq!(caller.breaker("srv").state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let outcome = caller
            .call("srv", None, UpstreamCall::ExecuteTool, || async {
                Ok(json!({"ok": true}))
            })
            .await;
        assert_eq!(outcome, GuardedOutcome::Ok(json!({"ok": true})));
        assert_eq!(caller.breaker("srv").state(), CircuitState::Closed);

        let outcome = caller
            .call("srv", None, UpstreamCall::ExecuteTool, || async {
                Ok(json!({"ok": 2}))
            })
            .await;
        assert!(!outcome.is_fallback());
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let caller = ResilientCaller::new(test_config());
        let outcome = caller
            .call("srv", Some("slow"), UpstreamCall::ExecuteTool, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            })
            .await;
        match outcome {
            GuardedOutcome::Fallback(fallback) => {
                assert_eq!(fallback.error, "Service temporarily unavailable");
                assert_eq!(fallback.tool.as_deref(), Some("slow"));
                assert_eq!(fallback.server, "srv");
                assert!(fallback.fallback);
            }
            GuardedOutcome::Ok(_) => panic!("expected fallback"),
        }
    }

    #[tokio::test]
    async fn idempotent_calls_are_retried() {
        let mut config = test_config();
        config.retry_max_attempts = 3;
        let caller = ResilientCaller::new(config);
        let calls = AtomicUsize::new(0);

        let outcome = caller
            .call("srv", None, UpstreamCall::ListTools, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(GatewayError::UpstreamConnectionFailed("flaky".into()))
                } else {
                    Ok(json!({"tools": []}))
                }
            })
            .await;
        assert_eq!(outcome, GuardedOutcome::Ok(json!({"tools": []})));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn tool_execution_is_not_retried() {
        let mut config = test_config();
        config.retry_max_attempts = 3;
        let caller = ResilientCaller::new(config);
        let calls = AtomicUsize::new(0);

        let outcome = caller
            .call("srv", Some("t"), UpstreamCall::ExecuteTool, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::UpstreamConnectionFailed("down".into()))
            })
            .await;
        assert!(outcome.is_fallback());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fallback_serializes_with_flag() {
        let fallback = Fallback::unavailable("srv", Some("search"));
        assert_eq!(
            serde_json::to_value(&fallback).unwrap(),
            json!({
                "error": "Service temporarily unavailable",
                "tool": "search",
                "server": "srv",
                "fallback": true,
            })
        );
    }
}
