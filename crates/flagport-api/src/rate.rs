//! Adaptive rate governor
//!
//! Tracks remaining capacity per route category from response headers and
//! spaces requests so the destination's limits are never hit on purpose. A
//! hard rejection (429) is answered with a synchronous backoff and the same
//! request is sent again.
//!
//! # Headers
//! - `x-ratelimit-global-remaining`: requests left in the account-wide bucket
//! - `x-ratelimit-route-remaining`: requests left in this route's bucket
//! - `x-ratelimit-reset`: epoch milliseconds at which the buckets refill
//! - `retry-after`: seconds to wait (used when no reset is given)

use crate::clock::Clock;
use crate::error::Result;
use crate::request::{ApiRequest, RouteCategory};
use crate::transport::{ApiResponse, HttpTransport};
use dashmap::DashMap;
use rand::Rng;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Remaining capacity at or below which requests are spread over the reset window
pub const PROACTIVE_THRESHOLD: u64 = 3;

const GLOBAL_REMAINING: &str = "x-ratelimit-global-remaining";
const ROUTE_REMAINING: &str = "x-ratelimit-route-remaining";
const RESET: &str = "x-ratelimit-reset";
const RETRY_AFTER: &str = "retry-after";

/// Governor tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorConfig {
    /// Remaining capacity above which only `min_spacing` is applied
    pub proactive_threshold: u64,
    /// Minimum gap before every request
    pub min_spacing: Duration,
    /// Upper bound of the random jitter added to computed waits
    pub max_jitter: Duration,
    /// Floor for the wait after a 429
    pub min_rejection_wait: Duration,
}

impl GovernorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With jitter bound
    #[inline]
    #[must_use]
    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// With minimum spacing
    #[inline]
    #[must_use]
    pub fn with_min_spacing(mut self, min_spacing: Duration) -> Self {
        self.min_spacing = min_spacing;
        self
    }

    /// With proactive threshold
    #[inline]
    #[must_use]
    pub fn with_proactive_threshold(mut self, threshold: u64) -> Self {
        self.proactive_threshold = threshold;
        self
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            proactive_threshold: PROACTIVE_THRESHOLD,
            min_spacing: Duration::from_millis(50),
            max_jitter: Duration::from_millis(100),
            min_rejection_wait: Duration::from_millis(1000),
        }
    }
}

/// Last known limits for one route category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitState {
    /// Account-wide requests left
    pub global_remaining: Option<u64>,
    /// Route requests left
    pub route_remaining: Option<u64>,
    /// Epoch ms at which capacity refills
    pub reset_ms: Option<i64>,
    /// Epoch ms of the last merge
    pub last_updated_ms: i64,
}

impl RateLimitState {
    /// Tightest known remaining capacity
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> Option<u64> {
        match (self.global_remaining, self.route_remaining) {
            (Some(global), Some(route)) => Some(global.min(route)),
            (global, route) => global.or(route),
        }
    }
}

/// Counters over the governor's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GovernorStats {
    /// Requests sent (including resubmissions)
    pub requests: u64,
    /// 429 responses received
    pub rejections: u64,
    /// Total time spent waiting, in ms
    pub waited_ms: u64,
}

/// Per-route rate governor, shared by every API call site
#[derive(Debug)]
pub struct RateGovernor {
    config: GovernorConfig,
    clock: Arc<dyn Clock>,
    states: DashMap<RouteCategory, RateLimitState>,
    requests: AtomicU64,
    rejections: AtomicU64,
    waited_ms: AtomicU64,
}

impl RateGovernor {
    /// Create governor with default tuning
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(clock, GovernorConfig::default())
    }

    /// Create governor with explicit tuning
    #[must_use]
    pub fn with_config(clock: Arc<dyn Clock>, config: GovernorConfig) -> Self {
        Self {
            config,
            clock,
            states: DashMap::new(),
            requests: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            waited_ms: AtomicU64::new(0),
        }
    }

    /// Clock used for all waits
    #[inline]
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Tuning in effect
    #[inline]
    #[must_use]
    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Snapshot of a route's state, if any response has been seen for it
    #[must_use]
    pub fn state(&self, route: RouteCategory) -> Option<RateLimitState> {
        self.states.get(&route).map(|entry| *entry.value())
    }

    /// Lifetime counters
    #[must_use]
    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            requests: self.requests.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            waited_ms: self.waited_ms.load(Ordering::Relaxed),
        }
    }

    /// Delay to apply before the next request on `route`
    ///
    /// With plenty of capacity (or nothing known) this is the minimum spacing.
    /// Near exhaustion the time to reset is divided over the remaining
    /// requests; with nothing left the wait runs to the reset itself.
    #[must_use]
    pub fn schedule(&self, route: RouteCategory) -> Duration {
        let min = self.config.min_spacing;
        let Some(state) = self.state(route) else {
            return min;
        };
        let Some(remaining) = state.remaining() else {
            return min;
        };
        if remaining > self.config.proactive_threshold {
            return min;
        }

        let until_reset = state
            .reset_ms
            .map_or(0, |reset| reset - self.clock.now_ms());
        if until_reset <= 0 {
            return min;
        }

        let until_reset = until_reset.unsigned_abs();
        let base = if remaining == 0 {
            until_reset
        } else {
            until_reset.div_ceil(remaining)
        };

        (Duration::from_millis(base) + self.jitter()).max(min)
    }

    /// Merge the rate-limit headers of a response into the route's state
    ///
    /// Headers that are absent leave the previous values in place.
    pub fn observe(&self, route: RouteCategory, response: &ApiResponse) {
        let now = self.clock.now_ms();
        let global = parse_header::<u64>(response, GLOBAL_REMAINING);
        let route_remaining = parse_header::<u64>(response, ROUTE_REMAINING);
        let reset = parse_header::<i64>(response, RESET)
            .or_else(|| {
                retry_after_ms(response)
                    .map(|ms| now.saturating_add(i64::try_from(ms).unwrap_or(i64::MAX)))
            });

        let mut entry = self.states.entry(route).or_insert_with(|| RateLimitState {
            last_updated_ms: now,
            ..RateLimitState::default()
        });

        if global.is_none() && route_remaining.is_none() && reset.is_none() {
            return;
        }

        let state = entry.value_mut();
        if global.is_some() {
            state.global_remaining = global;
        }
        if route_remaining.is_some() {
            state.route_remaining = route_remaining;
        }
        if reset.is_some() {
            state.reset_ms = reset;
        }
        state.last_updated_ms = now;
    }

    /// Wait after a 429: the largest of `retry-after`, time to reset, and the
    /// rejection floor, plus jitter
    #[must_use]
    pub fn backoff_after_rejection(&self, response: &ApiResponse) -> Duration {
        let retry_after = retry_after_ms(response).unwrap_or(0);
        let until_reset = parse_header::<i64>(response, RESET)
            .map_or(0, |reset| (reset - self.clock.now_ms()).max(0).unsigned_abs());
        let floor = u64::try_from(self.config.min_rejection_wait.as_millis()).unwrap_or(u64::MAX);

        Duration::from_millis(retry_after.max(until_reset).max(floor)) + self.jitter()
    }

    /// Send `request` through `transport`, honouring the route's limits
    ///
    /// A 429 is answered by sleeping for [`Self::backoff_after_rejection`] and
    /// resubmitting the identical request. There is no retry cap: a migration
    /// that waits out a long throttle is preferred over one that gives up
    /// halfway. Cancel the process to stop it.
    ///
    /// # Errors
    /// Transport failures only
    pub async fn dispatch(
        &self,
        transport: &dyn HttpTransport,
        request: &ApiRequest,
    ) -> Result<ApiResponse> {
        let mut rejections = 0u32;
        loop {
            let delay = self.schedule(request.route);
            if delay > self.config.min_spacing {
                tracing::debug!(
                    route = %request.route,
                    delay_ms = duration_ms(delay),
                    "spacing request ahead of rate-limit reset"
                );
            }
            self.wait(delay).await;

            self.requests.fetch_add(1, Ordering::Relaxed);
            let response = transport.send(request).await?;
            self.observe(request.route, &response);

            if response.status != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            rejections += 1;
            self.rejections.fetch_add(1, Ordering::Relaxed);
            let wait = self.backoff_after_rejection(&response);
            tracing::warn!(
                route = %request.route,
                method = %request.method,
                path = %request.path,
                rejections,
                wait_ms = duration_ms(wait),
                "rate limited; backing off before resubmitting"
            );
            self.wait(wait).await;
        }
    }

    async fn wait(&self, delay: Duration) {
        self.waited_ms.fetch_add(duration_ms(delay), Ordering::Relaxed);
        self.clock.sleep(delay).await;
    }

    fn jitter(&self) -> Duration {
        let max = duration_ms(self.config.max_jitter);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_header<T: std::str::FromStr>(response: &ApiResponse, name: &str) -> Option<T> {
    response.header(name).and_then(|v| v.trim().parse().ok())
}

fn retry_after_ms(response: &ApiResponse) -> Option<u64> {
    parse_header::<u64>(response, RETRY_AFTER).map(|secs| secs.saturating_mul(1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use reqwest::header::{HeaderMap, HeaderValue};
    use serde_json::{json, Value};

    #[derive(Debug, Default)]
    struct ManualClock {
        now: Mutex<i64>,
        sleeps: Mutex<Vec<Duration>>,
    }

    impl ManualClock {
        fn at(now: i64) -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(now),
                sleeps: Mutex::new(Vec::new()),
            })
        }

        fn advance(&self, by: Duration) {
            *self.now.lock() += i64::try_from(by.as_millis()).unwrap();
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now_ms(&self) -> i64 {
            *self.now.lock()
        }

        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().push(duration);
            self.advance(duration);
        }
    }

    struct Scripted {
        responses: Mutex<Vec<ApiResponse>>,
        seen: Mutex<Vec<Option<Value>>>,
    }

    #[async_trait]
    impl HttpTransport for Scripted {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
            self.seen.lock().push(request.body.clone());
            Ok(self.responses.lock().remove(0))
        }
    }

    fn quiet() -> GovernorConfig {
        GovernorConfig::new().with_max_jitter(Duration::ZERO)
    }

    fn response(status: u16, headers: &[(&'static str, String)]) -> ApiResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        ApiResponse::new(StatusCode::from_u16(status).unwrap(), map, Value::Null)
    }

    fn limits(route: u64, reset: i64) -> ApiResponse {
        response(
            200,
            &[(ROUTE_REMAINING, route.to_string()), (RESET, reset.to_string())],
        )
    }

    #[test]
    fn unknown_route_uses_min_spacing() {
        let governor = RateGovernor::with_config(ManualClock::at(0), quiet());
        assert_eq!(governor.schedule(RouteCategory::Flags), Duration::from_millis(50));
    }

    #[test]
    fn plenty_of_capacity_uses_min_spacing() {
        let governor = RateGovernor::with_config(ManualClock::at(0), quiet());
        governor.observe(RouteCategory::Flags, &limits(20, 10_000));
        assert_eq!(governor.schedule(RouteCategory::Flags), Duration::from_millis(50));
    }

    #[test]
    fn low_capacity_spreads_requests_over_reset_window() {
        let governor = RateGovernor::with_config(ManualClock::at(0), quiet());
        governor.observe(RouteCategory::Flags, &limits(3, 1_000));
        assert_eq!(governor.schedule(RouteCategory::Flags), Duration::from_millis(334));
    }

    #[test]
    fn global_bucket_tightens_route_bucket() {
        let governor = RateGovernor::with_config(ManualClock::at(0), quiet());
        let resp = response(
            200,
            &[
                (GLOBAL_REMAINING, "1".to_string()),
                (ROUTE_REMAINING, "50".to_string()),
                (RESET, "2000".to_string()),
            ],
        );
        governor.observe(RouteCategory::Segments, &resp);
        assert_eq!(governor.schedule(RouteCategory::Segments), Duration::from_millis(2000));
    }

    #[test]
    fn exhausted_capacity_waits_until_reset() {
        let governor = RateGovernor::with_config(ManualClock::at(500), quiet());
        governor.observe(RouteCategory::Flags, &limits(0, 4_500));
        assert_eq!(governor.schedule(RouteCategory::Flags), Duration::from_millis(4000));
    }

    #[test]
    fn past_reset_falls_back_to_min_spacing() {
        let clock = ManualClock::at(0);
        let governor = RateGovernor::with_config(clock.clone(), quiet());
        governor.observe(RouteCategory::Flags, &limits(0, 1_000));
        clock.advance(Duration::from_millis(1_500));
        assert_eq!(governor.schedule(RouteCategory::Flags), Duration::from_millis(50));
    }

    #[test]
    fn missing_headers_keep_prior_state() {
        let governor = RateGovernor::with_config(ManualClock::at(0), quiet());
        governor.observe(RouteCategory::Flags, &limits(2, 1_000));
        let before = governor.state(RouteCategory::Flags).unwrap();

        governor.observe(RouteCategory::Flags, &response(200, &[]));
        assert_eq!(governor.state(RouteCategory::Flags).unwrap(), before);
    }

    #[test]
    fn first_response_creates_state_lazily() {
        let governor = RateGovernor::with_config(ManualClock::at(7), quiet());
        assert!(governor.state(RouteCategory::Views).is_none());
        governor.observe(RouteCategory::Views, &response(200, &[]));
        let state = governor.state(RouteCategory::Views).unwrap();
        assert_eq!(state.remaining(), None);
        assert_eq!(state.last_updated_ms, 7);
    }

    #[test]
    fn retry_after_sets_reset_when_no_reset_header() {
        let governor = RateGovernor::with_config(ManualClock::at(1_000), quiet());
        let resp = response(
            200,
            &[(ROUTE_REMAINING, "0".to_string()), (RETRY_AFTER, "3".to_string())],
        );
        governor.observe(RouteCategory::Members, &resp);
        assert_eq!(governor.state(RouteCategory::Members).unwrap().reset_ms, Some(4_000));
    }

    #[test]
    fn huge_retry_after_saturates_reset() {
        let governor = RateGovernor::with_config(ManualClock::at(1_000), quiet());
        let resp = response(200, &[(RETRY_AFTER, u64::MAX.to_string())]);
        governor.observe(RouteCategory::Flags, &resp);
        assert_eq!(governor.state(RouteCategory::Flags).unwrap().reset_ms, Some(i64::MAX));
    }

    #[test]
    fn rejection_backoff_takes_the_largest_wait() {
        let governor = RateGovernor::with_config(ManualClock::at(0), quiet());

        let retry_after = response(429, &[(RETRY_AFTER, "2".to_string())]);
        assert_eq!(governor.backoff_after_rejection(&retry_after), Duration::from_millis(2_000));

        let reset = response(
            429,
            &[(RETRY_AFTER, "2".to_string()), (RESET, "5000".to_string())],
        );
        assert_eq!(governor.backoff_after_rejection(&reset), Duration::from_millis(5_000));

        let bare = response(429, &[]);
        assert_eq!(governor.backoff_after_rejection(&bare), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let config = GovernorConfig::new().with_max_jitter(Duration::from_millis(100));
        let governor = RateGovernor::with_config(ManualClock::at(0), config);
        for _ in 0..50 {
            let wait = governor.backoff_after_rejection(&response(429, &[]));
            assert!(wait >= Duration::from_millis(1_000));
            assert!(wait <= Duration::from_millis(1_100));
        }
    }

    #[tokio::test]
    async fn dispatch_resubmits_same_body_after_rejection() {
        let clock = ManualClock::at(0);
        let governor = RateGovernor::with_config(clock.clone(), quiet());
        let transport = Scripted {
            responses: Mutex::new(vec![
                response(429, &[(RETRY_AFTER, "1".to_string())]),
                response(429, &[]),
                response(201, &[]),
            ]),
            seen: Mutex::new(Vec::new()),
        };

        let gateway = crate::request::ApiGateway::new("api.test", "t").unwrap();
        let request = gateway.post(RouteCategory::Flags, "/api/v2/flags/p", json!({"key": "f1"}));

        let resp = governor.dispatch(&transport, &request).await.unwrap();
        assert_eq!(resp.code(), 201);

        let seen = transport.seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|b| b.as_ref() == Some(&json!({"key": "f1"}))));

        let stats = governor.stats();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.rejections, 2);
        assert!(clock.now_ms() >= 2_000);
    }

    proptest! {
        #[test]
        fn never_sends_before_reset_once_exhausted(
            start in 0i64..10_000,
            window in 1i64..120_000,
            budget in 1u64..20,
        ) {
            let clock = ManualClock::at(start);
            let governor = RateGovernor::with_config(clock.clone(), GovernorConfig::default());
            let reset = start + window;

            for remaining in (0..=budget).rev() {
                let delay = governor.schedule(RouteCategory::Flags);
                clock.advance(delay);
                governor.observe(RouteCategory::Flags, &limits(remaining, reset));
            }

            let delay = governor.schedule(RouteCategory::Flags);
            clock.advance(delay);
            prop_assert!(clock.now_ms() >= reset);
        }
    }
}
