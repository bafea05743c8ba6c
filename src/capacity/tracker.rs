use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::capacity::budget::RateBudget;
use crate::headers::{RateLimitSnapshot, SNAPSHOT_STALENESS};

/// Usage ratio at or above which a provider is considered exhausted.
pub const EXHAUSTED_RATIO: f64 = 0.95;
/// Usage ratio at or above which a provider is considered low.
pub const LOW_RATIO: f64 = 0.80;
/// Usage ratio at or above which a provider is approaching its limits.
pub const APPROACHING_RATIO: f64 = 0.50;
/// Ceiling for throttle-driven cooldowns.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(600);

const WARN_RATIO: f64 = 0.80;

/// Derived health of a provider's capacity, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityState {
    Available,
    Approaching,
    Low,
    Exhausted,
    Cooldown,
}

impl CapacityState {
    /// Ordering key for candidate sorting; lower is healthier.
    pub fn severity(self) -> u8 {
        match self {
            CapacityState::Available => 0,
            CapacityState::Approaching => 1,
            CapacityState::Low => 2,
            CapacityState::Exhausted => 3,
            CapacityState::Cooldown => 4,
        }
    }

    /// Whether a provider in this state may be handed out by a routing decision.
    pub fn usable(self) -> bool {
        !matches!(self, CapacityState::Exhausted | CapacityState::Cooldown)
    }
}

/// Point-in-time provider summary for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider: String,
    pub state: CapacityState,
    pub tier: u8,
    pub available_tokens: u64,
    pub cooldown_remaining: Option<Duration>,
    pub consecutive_failures: u32,
    pub enabled: bool,
}

#[derive(Debug)]
struct Window {
    used_tokens: u64,
    used_requests: u64,
    started: Instant,
    period: Duration,
    warned: bool,
}

impl Window {
    fn new(period: Duration) -> Self {
        Self {
            used_tokens: 0,
            used_requests: 0,
            started: Instant::now(),
            period,
            warned: false,
        }
    }

    /// Lazy rollover: the count resets exactly when the wall clock has crossed
    /// the window boundary since the last reset, never mid-window.
    fn rollover_if_expired(&mut self, now: Instant) {
        if !self.period.is_zero() && now.duration_since(self.started) >= self.period {
            self.used_tokens = 0;
            self.used_requests = 0;
            self.started = now;
            self.warned = false;
        }
    }

    fn ratio_against(&self, cap: Option<u64>) -> Option<f64> {
        let cap = cap?;
        (cap > 0).then(|| self.used_tokens as f64 / cap as f64)
    }

    fn request_ratio_against(&self, cap: Option<u64>) -> Option<f64> {
        let cap = cap?;
        (cap > 0).then(|| self.used_requests as f64 / cap as f64)
    }
}

/// Authoritative remaining values reported by the upstream; these override
/// local counts while fresh.
#[derive(Debug, Default)]
struct Authoritative {
    tokens_remaining_minute: Option<u64>,
    tokens_limit_minute: Option<u64>,
    requests_remaining_minute: Option<u64>,
    requests_limit_minute: Option<u64>,
    tokens_remaining_day: Option<u64>,
    tokens_limit_day: Option<u64>,
    requests_remaining_day: Option<u64>,
    requests_limit_day: Option<u64>,
    captured: Option<Instant>,
}

impl Authoritative {
    fn is_fresh(&self, staleness: Duration, now: Instant) -> bool {
        self.captured
            .map(|at| now.duration_since(at) <= staleness)
            .unwrap_or(false)
    }
}

#[derive(Debug)]
struct UsageState {
    minute: Window,
    day: Window,
    rolling: Option<Window>,
    authoritative: Authoritative,
    cooldown_until: Option<Instant>,
    consecutive_failures: u32,
}

/// Live capacity model for one provider: static budget plus mutable usage
/// counters and throttle state.
///
/// All mutation happens under this tracker's own lock; callers never hold it
/// across network I/O.
pub struct CapacityTracker {
    budget: RateBudget,
    state: Mutex<UsageState>,
    enabled: AtomicBool,
    staleness: Duration,
}

impl CapacityTracker {
    pub fn new(budget: RateBudget) -> Self {
        let state = UsageState {
            minute: Window::new(budget.minute_period()),
            day: Window::new(budget.day_period()),
            rolling: budget.rolling.as_ref().map(|r| Window::new(r.period())),
            authoritative: Authoritative::default(),
            cooldown_until: None,
            consecutive_failures: 0,
        };
        Self {
            budget,
            state: Mutex::new(state),
            enabled: AtomicBool::new(true),
            staleness: SNAPSHOT_STALENESS,
        }
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn budget(&self) -> &RateBudget {
        &self.budget
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UsageState> {
        // A poisoned usage lock means a panic mid-update; the counters are
        // still structurally valid, so keep serving.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a completed request's token usage into every active window.
    ///
    /// Expired windows are lazily rolled over first. `rolling_hours` overrides
    /// the configured rolling window duration for this observation.
    pub fn record_completed_request(&self, in_tok: u64, out_tok: u64, rolling_hours: Option<f64>) {
        let now = Instant::now();
        let total = in_tok.saturating_add(out_tok);
        let mut st = self.lock();

        if let (Some(window), Some(hours)) = (st.rolling.as_mut(), rolling_hours) {
            window.period = Duration::from_secs_f64(hours * 3600.0);
        }
        st.minute.rollover_if_expired(now);
        st.day.rollover_if_expired(now);
        if let Some(window) = st.rolling.as_mut() {
            window.rollover_if_expired(now);
        }

        st.minute.used_tokens = st.minute.used_tokens.saturating_add(total);
        st.minute.used_requests = st.minute.used_requests.saturating_add(1);
        st.day.used_tokens = st.day.used_tokens.saturating_add(total);
        st.day.used_requests = st.day.used_requests.saturating_add(1);
        if let Some(window) = st.rolling.as_mut() {
            window.used_tokens = window.used_tokens.saturating_add(total);
            window.used_requests = window.used_requests.saturating_add(1);
        }

        // Keep authoritative remaining values conservative between header
        // updates.
        if let Some(rem) = st.authoritative.tokens_remaining_minute.as_mut() {
            *rem = rem.saturating_sub(total);
        }
        if let Some(rem) = st.authoritative.tokens_remaining_day.as_mut() {
            *rem = rem.saturating_sub(total);
        }
        if let Some(rem) = st.authoritative.requests_remaining_minute.as_mut() {
            *rem = rem.saturating_sub(1);
        }
        if let Some(rem) = st.authoritative.requests_remaining_day.as_mut() {
            *rem = rem.saturating_sub(1);
        }

        self.warn_on_threshold(&mut st);
    }

    fn warn_on_threshold(&self, st: &mut UsageState) {
        let minute_ratio = st
            .minute
            .ratio_against(self.budget.tokens_per_minute)
            .into_iter()
            .chain(st.minute.request_ratio_against(self.budget.requests_per_minute))
            .fold(0.0_f64, f64::max);
        if minute_ratio >= WARN_RATIO && !st.minute.warned {
            st.minute.warned = true;
            warn!(
                provider = self.budget.provider.as_str(),
                window = "minute",
                used_pct = (minute_ratio * 100.0) as u64,
                "provider usage crossed warning threshold"
            );
        }
        let day_ratio = st
            .day
            .ratio_against(self.budget.tokens_per_day)
            .into_iter()
            .chain(st.day.request_ratio_against(self.budget.requests_per_day))
            .fold(0.0_f64, f64::max);
        if day_ratio >= WARN_RATIO && !st.day.warned {
            st.day.warned = true;
            warn!(
                provider = self.budget.provider.as_str(),
                window = "day",
                used_pct = (day_ratio * 100.0) as u64,
                "provider usage crossed warning threshold"
            );
        }
    }

    /// Register a throttling failure and escalate the cooldown.
    ///
    /// The cooldown doubles per consecutive failure, capped at
    /// [`MAX_COOLDOWN`], and only a subsequent success clears the streak.
    pub fn record_throttled(&self, base: Duration) -> Duration {
        let now = Instant::now();
        let mut st = self.lock();
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        let exponent = st.consecutive_failures.saturating_sub(1).min(10);
        let cooldown = base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(MAX_COOLDOWN);
        st.cooldown_until = Some(now + cooldown);
        warn!(
            provider = self.budget.provider.as_str(),
            consecutive_failures = st.consecutive_failures,
            cooldown_secs = cooldown.as_secs(),
            "provider throttled, entering cooldown"
        );
        cooldown
    }

    /// Clear the failure streak and any active cooldown; called on any
    /// non-throttled response.
    pub fn clear_failure_streak(&self) {
        let mut st = self.lock();
        if st.consecutive_failures > 0 || st.cooldown_until.is_some() {
            debug!(
                provider = self.budget.provider.as_str(),
                "failure streak cleared"
            );
        }
        st.consecutive_failures = 0;
        st.cooldown_until = None;
    }

    /// Overwrite local remaining estimates with authoritative values from a
    /// normalized response snapshot.
    pub fn apply_snapshot(&self, snapshot: &RateLimitSnapshot) {
        let mut st = self.lock();
        let auth = &mut st.authoritative;
        macro_rules! merge {
            ($field:ident) => {
                if snapshot.$field.is_some() {
                    auth.$field = snapshot.$field;
                }
            };
        }
        merge!(tokens_remaining_minute);
        merge!(tokens_limit_minute);
        merge!(requests_remaining_minute);
        merge!(requests_limit_minute);
        merge!(tokens_remaining_day);
        merge!(tokens_limit_day);
        merge!(requests_remaining_day);
        merge!(requests_limit_day);
        auth.captured = Some(snapshot.captured_at);
    }

    fn max_usage_ratio(&self, st: &mut UsageState, now: Instant) -> f64 {
        st.minute.rollover_if_expired(now);
        st.day.rollover_if_expired(now);
        if let Some(window) = st.rolling.as_mut() {
            window.rollover_if_expired(now);
        }

        let fresh = st.authoritative.is_fresh(self.staleness, now);
        let mut max = 0.0_f64;
        let mut consider = |ratio: Option<f64>| {
            if let Some(r) = ratio {
                max = max.max(r.clamp(0.0, 1.0));
            }
        };

        // Minute windows, authoritative first.
        consider(authoritative_ratio(
            fresh,
            st.authoritative.tokens_remaining_minute,
            st.authoritative.tokens_limit_minute.or(self.budget.tokens_per_minute),
        ).or_else(|| st.minute.ratio_against(self.budget.tokens_per_minute)));
        consider(authoritative_ratio(
            fresh,
            st.authoritative.requests_remaining_minute,
            st.authoritative.requests_limit_minute.or(self.budget.requests_per_minute),
        ).or_else(|| st.minute.request_ratio_against(self.budget.requests_per_minute)));

        // Day windows.
        consider(authoritative_ratio(
            fresh,
            st.authoritative.tokens_remaining_day,
            st.authoritative.tokens_limit_day.or(self.budget.tokens_per_day),
        ).or_else(|| st.day.ratio_against(self.budget.tokens_per_day)));
        consider(authoritative_ratio(
            fresh,
            st.authoritative.requests_remaining_day,
            st.authoritative.requests_limit_day.or(self.budget.requests_per_day),
        ).or_else(|| st.day.request_ratio_against(self.budget.requests_per_day)));

        // Rolling window is tracked locally only.
        if let (Some(window), Some(rolling)) = (st.rolling.as_ref(), self.budget.rolling.as_ref()) {
            consider(window.ratio_against(rolling.tokens));
            consider(window.request_ratio_against(rolling.requests));
        }

        max
    }

    /// Derive the current capacity state.
    ///
    /// COOLDOWN outranks any ratio-derived status; a disabled provider is
    /// reported exhausted. Otherwise the maximum usage ratio across every
    /// configured window is mapped through fixed thresholds.
    pub fn classify(&self) -> CapacityState {
        if !self.is_enabled() {
            return CapacityState::Exhausted;
        }
        let now = Instant::now();
        let mut st = self.lock();
        if let Some(until) = st.cooldown_until {
            if until > now {
                return CapacityState::Cooldown;
            }
        }
        let ratio = self.max_usage_ratio(&mut st, now);
        if ratio >= EXHAUSTED_RATIO {
            CapacityState::Exhausted
        } else if ratio >= LOW_RATIO {
            CapacityState::Low
        } else if ratio >= APPROACHING_RATIO {
            CapacityState::Approaching
        } else {
            CapacityState::Available
        }
    }

    /// Estimated tokens left before a token window is exhausted:
    /// min(limit − used) across the minute and day token windows,
    /// authoritative-first. Without any token cap, the context window bounds
    /// the estimate.
    pub fn estimate_available_tokens(&self) -> u64 {
        let now = Instant::now();
        let mut st = self.lock();
        st.minute.rollover_if_expired(now);
        st.day.rollover_if_expired(now);

        let fresh = st.authoritative.is_fresh(self.staleness, now);
        let minute = if fresh && st.authoritative.tokens_remaining_minute.is_some() {
            st.authoritative.tokens_remaining_minute
        } else {
            self.budget
                .tokens_per_minute
                .map(|cap| cap.saturating_sub(st.minute.used_tokens))
        };
        let day = if fresh && st.authoritative.tokens_remaining_day.is_some() {
            st.authoritative.tokens_remaining_day
        } else {
            self.budget
                .tokens_per_day
                .map(|cap| cap.saturating_sub(st.day.used_tokens))
        };

        match (minute, day) {
            (Some(m), Some(d)) => m.min(d),
            (Some(m), None) => m,
            (None, Some(d)) => d,
            (None, None) => self.budget.context_window,
        }
    }

    /// Whether a request of the estimated size fits both the context window
    /// and the remaining budget.
    pub fn can_admit(&self, est_tokens: u64) -> bool {
        est_tokens <= self.budget.context_window && est_tokens <= self.estimate_available_tokens()
    }

    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let st = self.lock();
        let until = st.cooldown_until?;
        let now = Instant::now();
        (until > now).then(|| until.duration_since(now))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Point-in-time summary for monitoring output.
    pub fn status(&self) -> ProviderStatus {
        ProviderStatus {
            provider: self.budget.provider.clone(),
            state: self.classify(),
            tier: self.budget.tier,
            available_tokens: self.estimate_available_tokens(),
            cooldown_remaining: self.cooldown_remaining(),
            consecutive_failures: self.consecutive_failures(),
            enabled: self.is_enabled(),
        }
    }
}

fn authoritative_ratio(fresh: bool, remaining: Option<u64>, limit: Option<u64>) -> Option<f64> {
    if !fresh {
        return None;
    }
    let remaining = remaining?;
    let limit = limit?;
    (limit > 0).then(|| 1.0 - remaining as f64 / limit as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers;
    use reqwest::header::{HeaderMap, HeaderValue};
    use std::thread;

    fn budget_with_minute_cap(cap: u64) -> RateBudget {
        RateBudget::new("test", 200_000).with_tokens_per_minute(cap)
    }

    #[test]
    fn test_window_resets_only_at_boundary() {
        let mut budget = budget_with_minute_cap(1_000);
        budget.minute_reset_secs = 0.2;
        let tracker = CapacityTracker::new(budget);

        tracker.record_completed_request(60, 40, None);
        assert_eq!(tracker.estimate_available_tokens(), 900);

        // Mid-window: never decreasing back to the cap.
        tracker.record_completed_request(50, 0, None);
        assert_eq!(tracker.estimate_available_tokens(), 850);

        thread::sleep(Duration::from_millis(250));

        // First record at/after the boundary resets the count to zero first.
        tracker.record_completed_request(10, 0, None);
        assert_eq!(tracker.estimate_available_tokens(), 990);
    }

    #[test]
    fn test_classify_is_monotone_in_usage() {
        let cases = [
            (10_000, CapacityState::Available),
            (60_000, CapacityState::Approaching),
            (85_000, CapacityState::Low),
            (96_000, CapacityState::Exhausted),
        ];
        for (used, expected) in cases {
            let tracker = CapacityTracker::new(budget_with_minute_cap(100_000));
            tracker.record_completed_request(used, 0, None);
            assert_eq!(tracker.classify(), expected, "used={}", used);
        }
    }

    #[test]
    fn test_cooldown_escalates_and_caps() {
        let tracker = CapacityTracker::new(budget_with_minute_cap(100_000));
        let base = Duration::from_secs(60);
        assert_eq!(tracker.record_throttled(base), Duration::from_secs(60));
        assert_eq!(tracker.record_throttled(base), Duration::from_secs(120));
        assert_eq!(tracker.record_throttled(base), Duration::from_secs(240));
        assert_eq!(tracker.record_throttled(base), Duration::from_secs(480));
        // Capped from here on.
        assert_eq!(tracker.record_throttled(base), Duration::from_secs(600));
        assert_eq!(tracker.record_throttled(base), Duration::from_secs(600));
        assert_eq!(tracker.classify(), CapacityState::Cooldown);
    }

    #[test]
    fn test_cooldown_outranks_ratio_and_clears_on_success() {
        let tracker = CapacityTracker::new(budget_with_minute_cap(100_000));
        tracker.record_throttled(Duration::from_secs(60));
        assert_eq!(tracker.classify(), CapacityState::Cooldown);

        tracker.clear_failure_streak();
        assert_eq!(tracker.classify(), CapacityState::Available);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn test_disabled_reports_exhausted() {
        let tracker = CapacityTracker::new(budget_with_minute_cap(100_000));
        tracker.set_enabled(false);
        assert_eq!(tracker.classify(), CapacityState::Exhausted);
        tracker.set_enabled(true);
        assert_eq!(tracker.classify(), CapacityState::Available);
    }

    fn snapshot_of(remaining: u64, limit: u64) -> headers::RateLimitSnapshot {
        let mut h = HeaderMap::new();
        h.insert(
            "x-ratelimit-remaining-tokens",
            HeaderValue::from_str(&remaining.to_string()).unwrap(),
        );
        h.insert(
            "x-ratelimit-limit-tokens",
            HeaderValue::from_str(&limit.to_string()).unwrap(),
        );
        headers::parse(&h).unwrap()
    }

    #[test]
    fn test_authoritative_remaining_overrides_local_counts() {
        let tracker = CapacityTracker::new(budget_with_minute_cap(100_000));
        // Locally idle, but the provider says only 4% remains.
        tracker.apply_snapshot(&snapshot_of(4_000, 100_000));
        assert_eq!(tracker.classify(), CapacityState::Exhausted);
        assert_eq!(tracker.estimate_available_tokens(), 4_000);
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_remaining() {
        let tracker = CapacityTracker::new(budget_with_minute_cap(300_000));
        tracker.apply_snapshot(&snapshot_of(250_000, 300_000));
        assert_eq!(tracker.estimate_available_tokens(), 250_000);
        assert_eq!(tracker.classify(), CapacityState::Available);
    }

    #[test]
    fn test_completed_requests_decrement_authoritative_remaining() {
        let tracker = CapacityTracker::new(budget_with_minute_cap(100_000));
        tracker.apply_snapshot(&snapshot_of(10_000, 100_000));
        tracker.record_completed_request(2_000, 500, None);
        assert_eq!(tracker.estimate_available_tokens(), 7_500);
    }

    #[test]
    fn test_stale_snapshot_falls_back_to_local_counts() {
        let tracker =
            CapacityTracker::new(budget_with_minute_cap(100_000)).with_staleness(Duration::ZERO);
        tracker.apply_snapshot(&snapshot_of(0, 100_000));
        thread::sleep(Duration::from_millis(5));
        // Authoritative data is instantly stale, so the idle local counter wins.
        assert_eq!(tracker.classify(), CapacityState::Available);
    }

    #[test]
    fn test_can_admit_bounds() {
        let tracker = CapacityTracker::new(budget_with_minute_cap(100_000));
        assert!(tracker.can_admit(50_000));
        // Exceeds the context window.
        assert!(!tracker.can_admit(300_000));
        tracker.record_completed_request(95_000, 0, None);
        assert!(!tracker.can_admit(50_000));
        assert!(tracker.can_admit(5_000));
    }

    #[test]
    fn test_rolling_window_counts_toward_ratio() {
        let budget = RateBudget::new("test", 200_000).with_rolling(crate::capacity::RollingLimit {
            hours: 5.0,
            tokens: Some(10_000),
            requests: None,
        });
        let tracker = CapacityTracker::new(budget);
        tracker.record_completed_request(9_600, 0, None);
        assert_eq!(tracker.classify(), CapacityState::Exhausted);
    }
}
