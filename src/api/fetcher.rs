//! Single-resource fetch with timeout, bounded retry, and 429 cooldown.

use crate::api::proxy_pool::ProxyPool;
use crate::api::sleeper::Sleeper;
use crate::api::transport::{FetchRequest, Transport, TransportResponse};
use crate::metrics::IngestCounters;
use crate::util::env::env_parse;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Tunables for [`RateLimitedFetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub cooldown: Duration,
    /// Delay after a successful request when only one route exists.
    pub success_delay_single: Duration,
    /// Delay after a successful request when load is spread over proxies.
    pub success_delay_multi: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 5,
            backoff_base: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(300),
            cooldown: Duration::from_secs(30),
            success_delay_single: Duration::from_millis(250),
            success_delay_multi: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            timeout: Duration::from_secs(env_parse("KZ_API_TIMEOUT_SECS", d.timeout.as_secs())),
            max_attempts: env_parse("KZ_API_MAX_ATTEMPTS", d.max_attempts).max(1),
            backoff_base: Duration::from_millis(env_parse(
                "KZ_API_BACKOFF_MS",
                d.backoff_base.as_millis() as u64,
            )),
            max_backoff: Duration::from_secs(env_parse(
                "INGEST_MAX_BACKOFF_SECS",
                d.max_backoff.as_secs(),
            )),
            cooldown: Duration::from_secs(env_parse("KZ_API_COOLDOWN_SECS", d.cooldown.as_secs())),
            success_delay_single: Duration::from_millis(env_parse(
                "KZ_API_DELAY_MS",
                d.success_delay_single.as_millis() as u64,
            )),
            success_delay_multi: Duration::from_millis(env_parse(
                "KZ_API_PROXY_DELAY_MS",
                d.success_delay_multi.as_millis() as u64,
            )),
        }
    }

    /// `base * 2^(attempt-1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        exponential_backoff(self.backoff_base, attempt, self.max_backoff)
    }
}

pub fn exponential_backoff(base: Duration, attempt: u32, ceiling: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << shift).min(ceiling)
}

/// Why a fetch produced no payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchOutcome {
    #[error("not found")]
    NotFound,
    #[error("rate limited after retries")]
    RateLimited,
    #[error("transient error: {0}")]
    TransientError(String),
}

pub struct RateLimitedFetcher {
    transport: Arc<dyn Transport>,
    pool: Arc<ProxyPool>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    counters: Arc<IngestCounters>,
}

impl RateLimitedFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        pool: Arc<ProxyPool>,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
        counters: Arc<IngestCounters>,
    ) -> Self {
        Self {
            transport,
            pool,
            policy,
            sleeper,
            counters,
        }
    }

    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn success_delay(&self) -> Duration {
        if self.pool.is_parallel() {
            self.policy.success_delay_multi
        } else {
            self.policy.success_delay_single
        }
    }

    pub async fn fetch(&self, request: &FetchRequest) -> Result<Value, FetchOutcome> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut rate_limited_last = false;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let route = self.pool.next();
            self.counters.inc_api_calls();
            let result =
                tokio::time::timeout(self.policy.timeout, self.transport.get(&route, request))
                    .await;

            let failure = match result {
                Ok(Ok(TransportResponse::Ok(payload))) => {
                    self.sleeper.sleep(self.success_delay()).await;
                    return Ok(payload);
                }
                Ok(Ok(TransportResponse::NotFound)) => {
                    self.counters.inc_not_found();
                    return Err(FetchOutcome::NotFound);
                }
                Ok(Ok(TransportResponse::RateLimited { retry_after })) => {
                    self.counters.inc_rate_limit_hits();
                    self.pool.force_rotate();
                    rate_limited_last = true;
                    let wait = retry_after
                        .map(|ra| ra.max(self.policy.cooldown))
                        .unwrap_or(self.policy.cooldown);
                    warn!(
                        kind = %request.kind,
                        route = route.label(),
                        attempt,
                        wait_secs = wait.as_secs(),
                        "rate limited; rotating and cooling down"
                    );
                    if attempt < max_attempts {
                        self.sleeper.sleep(wait).await;
                    }
                    continue;
                }
                Ok(Ok(TransportResponse::Status(code)))
                    if (400..500).contains(&code) && code != 408 =>
                {
                    // Client errors do not get better on retry. 408 is a timeout.
                    self.counters.inc_transient_errors();
                    return Err(FetchOutcome::TransientError(format!("http status {code}")));
                }
                Ok(Ok(TransportResponse::Status(code))) => format!("http status {code}"),
                Ok(Err(e)) => e.to_string(),
                Err(_) => "request timed out".to_string(),
            };

            rate_limited_last = false;
            self.counters.inc_transient_errors();
            self.pool.force_rotate();
            let wait = self.policy.backoff(attempt);
            debug!(
                kind = %request.kind,
                route = route.label(),
                attempt,
                error = %failure,
                backoff_ms = wait.as_millis() as u64,
                "fetch attempt failed"
            );
            last_error = failure;
            if attempt < max_attempts {
                self.sleeper.sleep(wait).await;
            }
        }

        if rate_limited_last {
            Err(FetchOutcome::RateLimited)
        } else {
            Err(FetchOutcome::TransientError(last_error))
        }
    }
}
