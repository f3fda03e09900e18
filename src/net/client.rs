//! Unified API client: one instance per external service.
//!
//! `get` runs the full execution chain: cache probe, breaker gate, rate-limit
//! acquire, transport call, retry with backoff, partial-response
//! continuation. `get_with_fallback` additionally converts eligible failures
//! into replayed payloads or fallback marker data instead of errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::HttpProfile;

use super::breaker::CircuitBreaker;
use super::cache::{cache_key, TtlCache};
use super::error::ApiError;
use super::fallback::{FallbackInfo, FallbackManager, FallbackStrategy};
use super::rate_limit::RateLimiter;
use super::retry::{parse_retry_after, RetryPolicy};
use super::transport::{HttpRequest, Transport};

const ERROR_BODY_CAP: usize = 512;

/// Continuation state reported by a partial-response probe.
#[derive(Debug, Clone)]
pub struct PartialState {
    pub received: usize,
    pub expected: usize,
    pub page_state: Option<String>,
}

pub type PartialProbe = Arc<dyn Fn(&Value) -> Option<PartialState> + Send + Sync>;

/// Counter snapshot handed to the QC report.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub api_calls: u64,
    pub cache_hits: u64,
    pub fallback_count: u64,
}

#[derive(Default)]
struct Counters {
    api_calls: AtomicU64,
    cache_hits: AtomicU64,
    fallback_count: AtomicU64,
}

pub enum ApiOutcome {
    Payload(Value),
    Fallback(FallbackInfo),
}

pub struct ApiClient {
    name: String,
    base_url: String,
    transport: Arc<dyn Transport>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    cache: Option<TtlCache>,
    last_good: Mutex<HashMap<String, Value>>,
    fallback: FallbackManager,
    partial_retry_max: u32,
    partial_probe: Option<PartialProbe>,
    headers: Vec<(String, String)>,
    counters: Counters,
}

impl ApiClient {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        profile: &HttpProfile,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let cache = profile
            .cache
            .enabled
            .then(|| TtlCache::from_settings(&profile.cache));
        Self {
            name: name.into(),
            base_url: base_url.into(),
            transport,
            limiter: RateLimiter::new(profile.max_calls, profile.period_seconds, profile.jitter),
            retry: RetryPolicy::from_settings(&profile.retry),
            breaker: CircuitBreaker::from_settings(&profile.breaker),
            cache,
            last_good: Mutex::new(HashMap::new()),
            fallback: FallbackManager::from_labels(&profile.fallback_strategies),
            partial_retry_max: profile.partial_retry_max,
            partial_probe: None,
            headers: Vec::new(),
            counters: Counters::default(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_partial_probe(mut self, probe: PartialProbe) -> Self {
        self.partial_probe = Some(probe);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            api_calls: self.counters.api_calls.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            fallback_count: self.counters.fallback_count.load(Ordering::Relaxed),
        }
    }

    fn absolute_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{}{}", self.base_url, endpoint)
        }
    }

    /// Execute a GET. Cache hits bypass throttling and retries entirely.
    pub async fn get(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Value, ApiError> {
        let url = self.absolute_url(endpoint);
        let key = cache_key(&url, params);

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&key) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(client = %self.name, url = %url, "cache_hit");
                return Ok(hit);
            }
        }

        let mut payload = self.get_uncached(&url, params).await?;
        payload = self.continue_if_partial(&url, params, payload).await?;

        if let Some(cache) = &self.cache {
            cache.put(&key, payload.clone());
        }
        self.last_good.lock().insert(key, payload.clone());
        Ok(payload)
    }

    /// Like [`Self::get`], but matched failures become data instead of
    /// errors: a replayed payload for the `cache` strategy, a
    /// [`FallbackInfo`] for the typed-empty strategies.
    pub async fn get_with_fallback(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<ApiOutcome, ApiError> {
        let error = match self.get(endpoint, params).await {
            Ok(payload) => return Ok(ApiOutcome::Payload(payload)),
            Err(error) => error,
        };

        for strategy in self.fallback.strategies_for(&error) {
            match strategy {
                FallbackStrategy::Cache => {
                    let key = cache_key(&self.absolute_url(endpoint), params);
                    if let Some(payload) = self.last_good.lock().get(&key).cloned() {
                        warn!(client = %self.name, error = %error, "fallback_cache_replay");
                        self.counters.fallback_count.fetch_add(1, Ordering::Relaxed);
                        return Ok(ApiOutcome::Payload(payload));
                    }
                    // Nothing stored for this key; try the next strategy.
                }
                FallbackStrategy::Partial => {
                    // Partial continuation already ran inside get(); reaching
                    // here means the continuation budget is spent.
                }
                strategy => {
                    warn!(
                        client = %self.name,
                        strategy = strategy.label(),
                        error = %error,
                        "fallback_record_emitted"
                    );
                    self.counters.fallback_count.fetch_add(1, Ordering::Relaxed);
                    let attempts = match &error {
                        ApiError::CircuitOpen => 0,
                        e if self.retry.is_retryable(e) => self.retry.total + 1,
                        _ => 1,
                    };
                    return Ok(ApiOutcome::Fallback(FallbackInfo::from_error(
                        strategy, &error, attempts,
                    )));
                }
            }
        }
        Err(error)
    }

    /// Resolve a marker-record fallback for a failure observed outside the
    /// client (e.g. mid-pagination). Returns `None` when no typed-empty
    /// strategy matches, in which case the caller propagates the error.
    pub fn fallback_info(&self, error: &ApiError) -> Option<FallbackInfo> {
        for strategy in self.fallback.strategies_for(error) {
            if matches!(
                strategy,
                FallbackStrategy::Cache | FallbackStrategy::Partial
            ) {
                continue;
            }
            self.counters.fallback_count.fetch_add(1, Ordering::Relaxed);
            let attempts = match error {
                ApiError::CircuitOpen => 0,
                e if self.retry.is_retryable(e) => self.retry.total + 1,
                _ => 1,
            };
            warn!(
                client = %self.name,
                strategy = strategy.label(),
                error = %error,
                "fallback_record_emitted"
            );
            return Some(FallbackInfo::from_error(strategy, error, attempts));
        }
        None
    }

    async fn get_uncached(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<Value, ApiError> {
        let mut attempt: u32 = 0;
        loop {
            self.breaker.check()?;
            self.limiter.acquire().await;
            self.counters.api_calls.fetch_add(1, Ordering::Relaxed);

            let request = HttpRequest {
                url: url.to_string(),
                params: params.to_vec(),
                headers: self.headers.clone(),
            };
            let error = match self.transport.execute(&request).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    self.breaker.record_success();
                    return Ok(parse_payload(&response.body));
                }
                Ok(response) => {
                    let retry_after = response
                        .retry_after
                        .as_deref()
                        .and_then(parse_retry_after);
                    let mut body = response.body;
                    if body.len() > ERROR_BODY_CAP {
                        let mut cap = ERROR_BODY_CAP;
                        while !body.is_char_boundary(cap) {
                            cap -= 1;
                        }
                        body.truncate(cap);
                    }
                    ApiError::Http {
                        status: response.status,
                        retry_after,
                        body,
                    }
                }
                Err(error) => error,
            };

            self.breaker.record_failure();
            if self.retry.is_retryable(&error) && attempt < self.retry.total {
                let delay = self.retry.backoff_delay(attempt, error.retry_after_sec());
                warn!(
                    client = %self.name,
                    url = %url,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(error);
        }
    }

    /// Advance the `page_state` token while the probe reports a short
    /// payload, merging continuation items into the first payload.
    async fn continue_if_partial(
        &self,
        url: &str,
        params: &[(String, String)],
        mut payload: Value,
    ) -> Result<Value, ApiError> {
        let Some(probe) = &self.partial_probe else {
            return Ok(payload);
        };
        let mut continuations: u32 = 0;
        while let Some(partial) = probe(&payload) {
            if partial.received >= partial.expected {
                break;
            }
            let error = ApiError::Partial {
                received: partial.received,
                expected: partial.expected,
                page_state: partial.page_state.clone(),
            };
            if self.fallback.strategy_for(&error) != Some(FallbackStrategy::Partial)
                || continuations >= self.partial_retry_max
            {
                return Err(error);
            }
            continuations += 1;

            let mut next_params: Vec<(String, String)> = params
                .iter()
                .filter(|(k, _)| k != "page_state")
                .cloned()
                .collect();
            if let Some(token) = &partial.page_state {
                next_params.push(("page_state".to_string(), token.clone()));
            }
            debug!(
                client = %self.name,
                received = partial.received,
                expected = partial.expected,
                continuation = continuations,
                "partial_continuation"
            );
            let next = self.get_uncached(url, &next_params).await?;
            merge_partial(&mut payload, &next);
        }
        Ok(payload)
    }
}

fn parse_payload(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

/// Envelope heuristic shared with the paginators: the items array is the
/// first array-valued key that is not `page_meta`.
pub fn items_array_key(payload: &Value) -> Option<String> {
    let map = payload.as_object()?;
    map.iter()
        .find(|(key, value)| key.as_str() != "page_meta" && value.is_array())
        .map(|(key, _)| key.clone())
}

fn merge_partial(base: &mut Value, continuation: &Value) {
    let Some(key) = items_array_key(base) else {
        return;
    };
    let extra = continuation
        .get(&key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if let Some(items) = base.get_mut(&key).and_then(Value::as_array_mut) {
        items.extend(extra);
    }
    // Adopt the continuation's paging metadata so the probe sees progress.
    if let Some(meta) = continuation.get("page_meta") {
        if let Some(map) = base.as_object_mut() {
            map.insert("page_meta".to_string(), meta.clone());
        }
    }
}
