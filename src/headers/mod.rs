//! Rate-limit header normalization.
//!
//! Upstream providers report remaining budget through mutually incompatible
//! header vocabularies. This module turns any of them into one canonical
//! [`RateLimitSnapshot`] via a single ordered mapping table: adding a provider
//! vocabulary is a table edit, not new code.
//!
//! Missing or malformed values are tolerated field-by-field; a partial parse
//! is a valid snapshot.

use chrono::DateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Snapshots older than this are unusable for proactive decisions.
pub const SNAPSHOT_STALENESS: Duration = Duration::from_secs(120);

/// Once a near-limit trigger has been acted on for a provider, repeat
/// triggers are suppressed for this long.
pub const TRIGGER_SUPPRESSION: Duration = Duration::from_secs(60);

/// Canonical rate-limit fields a provider header can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    TokensRemainingMinute,
    TokensLimitMinute,
    RequestsRemainingMinute,
    RequestsLimitMinute,
    TokensRemainingDay,
    TokensLimitDay,
    RequestsRemainingDay,
    RequestsLimitDay,
    ResetAfter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Count,
    Seconds,
}

/// Ordered header-name → canonical-field mapping. First match per field wins,
/// so more specific vocabularies come first.
static HEADER_TABLE: &[(&str, Field, Unit)] = &[
    // Anthropic family
    ("anthropic-ratelimit-tokens-remaining", Field::TokensRemainingMinute, Unit::Count),
    ("anthropic-ratelimit-tokens-limit", Field::TokensLimitMinute, Unit::Count),
    ("anthropic-ratelimit-requests-remaining", Field::RequestsRemainingMinute, Unit::Count),
    ("anthropic-ratelimit-requests-limit", Field::RequestsLimitMinute, Unit::Count),
    ("anthropic-ratelimit-tokens-reset", Field::ResetAfter, Unit::Seconds),
    ("anthropic-ratelimit-requests-reset", Field::ResetAfter, Unit::Seconds),
    // Daily variants (checked before the generic OpenAI family so the
    // suffixed names are not shadowed by prefix-sharing minute names)
    ("x-ratelimit-remaining-tokens-day", Field::TokensRemainingDay, Unit::Count),
    ("x-ratelimit-limit-tokens-day", Field::TokensLimitDay, Unit::Count),
    ("x-ratelimit-remaining-requests-day", Field::RequestsRemainingDay, Unit::Count),
    ("x-ratelimit-limit-requests-day", Field::RequestsLimitDay, Unit::Count),
    // OpenAI-compatible family (OpenAI, Groq, DeepSeek, OpenRouter, ...)
    ("x-ratelimit-remaining-tokens", Field::TokensRemainingMinute, Unit::Count),
    ("x-ratelimit-limit-tokens", Field::TokensLimitMinute, Unit::Count),
    ("x-ratelimit-remaining-requests", Field::RequestsRemainingMinute, Unit::Count),
    ("x-ratelimit-limit-requests", Field::RequestsLimitMinute, Unit::Count),
    ("x-ratelimit-reset-tokens", Field::ResetAfter, Unit::Seconds),
    ("x-ratelimit-reset-requests", Field::ResetAfter, Unit::Seconds),
];

/// Normalized remaining/limit/reset values extracted from one response.
#[derive(Debug, Clone)]
pub struct RateLimitSnapshot {
    pub tokens_remaining_minute: Option<u64>,
    pub tokens_limit_minute: Option<u64>,
    pub requests_remaining_minute: Option<u64>,
    pub requests_limit_minute: Option<u64>,
    pub tokens_remaining_day: Option<u64>,
    pub tokens_limit_day: Option<u64>,
    pub requests_remaining_day: Option<u64>,
    pub requests_limit_day: Option<u64>,
    /// Seconds until the reporting window resets, normalized from whatever
    /// shape the provider used (plain seconds, `6m0s`, epoch, ISO-8601).
    pub reset_after: Option<Duration>,
    pub captured_at: Instant,
}

impl RateLimitSnapshot {
    fn empty() -> Self {
        Self {
            tokens_remaining_minute: None,
            tokens_limit_minute: None,
            requests_remaining_minute: None,
            requests_limit_minute: None,
            tokens_remaining_day: None,
            tokens_limit_day: None,
            requests_remaining_day: None,
            requests_limit_day: None,
            reset_after: None,
            captured_at: Instant::now(),
        }
    }

    fn has_data(&self) -> bool {
        self.tokens_remaining_minute.is_some()
            || self.tokens_limit_minute.is_some()
            || self.requests_remaining_minute.is_some()
            || self.requests_limit_minute.is_some()
            || self.tokens_remaining_day.is_some()
            || self.tokens_limit_day.is_some()
            || self.requests_remaining_day.is_some()
            || self.requests_limit_day.is_some()
            || self.reset_after.is_some()
    }

    /// Whether the snapshot is recent enough for proactive decisions.
    pub fn is_fresh(&self, staleness: Duration) -> bool {
        self.captured_at.elapsed() <= staleness
    }
}

/// Why a snapshot tripped the near-limit check.
#[derive(Debug, Clone, PartialEq)]
pub struct NearLimit {
    /// The window that triggered, e.g. "minute_tokens".
    pub window: &'static str,
    /// Remaining fraction of that window (0.0 = empty).
    pub ratio: f64,
}

/// Extract a canonical snapshot from response headers.
///
/// Returns `None` when no known header carried a parseable value.
pub fn parse(headers: &HeaderMap) -> Option<RateLimitSnapshot> {
    let mut snapshot = RateLimitSnapshot::empty();

    for &(name, field, unit) in HEADER_TABLE {
        let raw = match header_value(headers, name) {
            Some(v) => v,
            None => continue,
        };
        match (field, unit) {
            (Field::ResetAfter, Unit::Seconds) => {
                if snapshot.reset_after.is_none() {
                    snapshot.reset_after = parse_reset_seconds(raw);
                }
            }
            (field, Unit::Count) => {
                let slot = count_slot(&mut snapshot, field);
                if slot.is_none() {
                    *slot = parse_count(raw);
                }
            }
            _ => {}
        }
    }

    snapshot.has_data().then_some(snapshot)
}

fn count_slot(snapshot: &mut RateLimitSnapshot, field: Field) -> &mut Option<u64> {
    match field {
        Field::TokensRemainingMinute => &mut snapshot.tokens_remaining_minute,
        Field::TokensLimitMinute => &mut snapshot.tokens_limit_minute,
        Field::RequestsRemainingMinute => &mut snapshot.requests_remaining_minute,
        Field::RequestsLimitMinute => &mut snapshot.requests_limit_minute,
        Field::TokensRemainingDay => &mut snapshot.tokens_remaining_day,
        Field::TokensLimitDay => &mut snapshot.tokens_limit_day,
        Field::RequestsRemainingDay => &mut snapshot.requests_remaining_day,
        Field::RequestsLimitDay => &mut snapshot.requests_limit_day,
        Field::ResetAfter => unreachable!("reset is not a count field"),
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    (!value.is_empty()).then_some(value)
}

fn parse_count(raw: &str) -> Option<u64> {
    // Some providers report counts as floats ("0.0").
    raw.parse::<u64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u64))
}

static DURATION_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+(?:\.\d+)?)s)?(?:(\d+)ms)?$").expect("valid regex")
});

/// Normalize a reset value to seconds-from-now.
///
/// Accepted shapes: plain seconds ("30", "1.5"), Go-style durations ("6m0s",
/// "1h2m"), epoch timestamps, ISO-8601 instants.
fn parse_reset_seconds(raw: &str) -> Option<Duration> {
    if let Ok(secs) = raw.parse::<u64>() {
        // Values this large are epoch timestamps, not durations.
        if secs > 1_000_000_000 {
            let now = chrono::Utc::now().timestamp().max(0) as u64;
            return Some(Duration::from_secs(secs.saturating_sub(now)));
        }
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = raw.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::from_secs_f64(secs));
        }
        return None;
    }
    if let Some(caps) = DURATION_SUFFIX.captures(raw) {
        let hours: u64 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let minutes: u64 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let seconds: f64 = caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0.0);
        let millis: u64 = caps.get(4).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        if caps.get(1).is_some() || caps.get(2).is_some() || caps.get(3).is_some() || caps.get(4).is_some() {
            let total = (hours * 3600 + minutes * 60) as f64 + seconds + millis as f64 / 1000.0;
            return Some(Duration::from_secs_f64(total));
        }
        return None;
    }
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        let delta = instant.timestamp() - chrono::Utc::now().timestamp();
        return Some(Duration::from_secs(delta.max(0) as u64));
    }
    None
}

/// Best-effort `Retry-After` parsing: integer seconds or an HTTP-date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = header_value(headers, "retry-after")?;
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = date.timestamp() - chrono::Utc::now().timestamp();
    Some(Duration::from_secs(delta.max(0) as u64))
}

/// Check whether any window is at or below `threshold` remaining fraction.
///
/// Windows are checked in priority order (minute tokens, minute requests,
/// daily counters); the first trigger wins. Windows missing either remaining
/// or limit are skipped.
pub fn is_near_limit(snapshot: &RateLimitSnapshot, threshold: f64) -> Option<NearLimit> {
    let windows: [(&'static str, Option<u64>, Option<u64>); 4] = [
        ("minute_tokens", snapshot.tokens_remaining_minute, snapshot.tokens_limit_minute),
        ("minute_requests", snapshot.requests_remaining_minute, snapshot.requests_limit_minute),
        ("day_tokens", snapshot.tokens_remaining_day, snapshot.tokens_limit_day),
        ("day_requests", snapshot.requests_remaining_day, snapshot.requests_limit_day),
    ];
    for (window, remaining, limit) in windows {
        if let (Some(remaining), Some(limit)) = (remaining, limit) {
            if limit == 0 {
                continue;
            }
            let ratio = remaining as f64 / limit as f64;
            if ratio <= threshold {
                return Some(NearLimit { window, ratio });
            }
        }
    }
    None
}

/// Debounces near-limit triggers per provider so one observation leads to one
/// switch, not a switch per in-flight request.
#[derive(Debug)]
pub struct TriggerSuppressor {
    window: Duration,
    last_acted: Mutex<HashMap<String, Instant>>,
}

impl TriggerSuppressor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_acted: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true (and records the trigger) when no trigger for this
    /// provider was acted on within the suppression window.
    pub fn should_act(&self, provider: &str) -> bool {
        let mut last = match self.last_acted.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        let now = Instant::now();
        match last.get(provider) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                last.insert(provider.to_string(), now);
                true
            }
        }
    }
}

impl Default for TriggerSuppressor {
    fn default() -> Self {
        Self::new(TRIGGER_SUPPRESSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers_of(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn test_parse_anthropic_family() {
        let headers = headers_of(&[
            ("anthropic-ratelimit-tokens-remaining", "50000"),
            ("anthropic-ratelimit-tokens-limit", "300000"),
            ("anthropic-ratelimit-requests-remaining", "45"),
            ("anthropic-ratelimit-requests-limit", "50"),
            ("anthropic-ratelimit-tokens-reset", "2030-01-01T00:00:00Z"),
        ]);
        let snap = parse(&headers).unwrap();
        assert_eq!(snap.tokens_remaining_minute, Some(50_000));
        assert_eq!(snap.tokens_limit_minute, Some(300_000));
        assert_eq!(snap.requests_remaining_minute, Some(45));
        assert_eq!(snap.requests_limit_minute, Some(50));
        assert!(snap.reset_after.unwrap() > Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_openai_family() {
        let headers = headers_of(&[
            ("x-ratelimit-remaining-tokens", "150000"),
            ("x-ratelimit-limit-tokens", "2000000"),
            ("x-ratelimit-reset-tokens", "6m30s"),
        ]);
        let snap = parse(&headers).unwrap();
        assert_eq!(snap.tokens_remaining_minute, Some(150_000));
        assert_eq!(snap.tokens_limit_minute, Some(2_000_000));
        assert_eq!(snap.reset_after, Some(Duration::from_secs(390)));
    }

    #[test]
    fn test_parse_daily_family_not_shadowed() {
        let headers = headers_of(&[
            ("x-ratelimit-remaining-requests-day", "900"),
            ("x-ratelimit-limit-requests-day", "1000"),
            ("x-ratelimit-remaining-requests", "55"),
            ("x-ratelimit-limit-requests", "60"),
        ]);
        let snap = parse(&headers).unwrap();
        assert_eq!(snap.requests_remaining_day, Some(900));
        assert_eq!(snap.requests_limit_day, Some(1000));
        assert_eq!(snap.requests_remaining_minute, Some(55));
    }

    #[test]
    fn test_first_match_per_field_wins() {
        // Both vocabularies present: the earlier table entry takes the field.
        let headers = headers_of(&[
            ("anthropic-ratelimit-tokens-remaining", "111"),
            ("x-ratelimit-remaining-tokens", "222"),
        ]);
        let snap = parse(&headers).unwrap();
        assert_eq!(snap.tokens_remaining_minute, Some(111));
    }

    #[test]
    fn test_malformed_fields_skipped_individually() {
        let headers = headers_of(&[
            ("x-ratelimit-remaining-tokens", "not-a-number"),
            ("x-ratelimit-limit-tokens", "2000000"),
        ]);
        let snap = parse(&headers).unwrap();
        assert!(snap.tokens_remaining_minute.is_none());
        assert_eq!(snap.tokens_limit_minute, Some(2_000_000));
    }

    #[test]
    fn test_parse_returns_none_without_known_headers() {
        let headers = headers_of(&[("content-type", "application/json")]);
        assert!(parse(&headers).is_none());
    }

    #[test]
    fn test_reset_value_shapes() {
        assert_eq!(parse_reset_seconds("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_reset_seconds("1.5"), Some(Duration::from_secs_f64(1.5)));
        assert_eq!(parse_reset_seconds("6m0s"), Some(Duration::from_secs(360)));
        assert_eq!(parse_reset_seconds("1h2m3s"), Some(Duration::from_secs(3723)));
        assert_eq!(parse_reset_seconds("250ms"), Some(Duration::from_millis(250)));
        assert!(parse_reset_seconds("garbage").is_none());
        // Epoch timestamps collapse to a duration from now.
        let future_epoch = (chrono::Utc::now().timestamp() + 90).to_string();
        let parsed = parse_reset_seconds(&future_epoch).unwrap();
        assert!(parsed >= Duration::from_secs(88) && parsed <= Duration::from_secs(92));
    }

    #[test]
    fn test_retry_after_seconds_and_http_date() {
        let headers = headers_of(&[("retry-after", "0")]);
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(0)));

        let date = (chrono::Utc::now() + chrono::Duration::seconds(120)).to_rfc2822();
        let headers = headers_of(&[("retry-after", &date)]);
        let parsed = parse_retry_after(&headers).unwrap();
        assert!(parsed >= Duration::from_secs(118) && parsed <= Duration::from_secs(122));
    }

    #[test]
    fn test_near_limit_thresholds() {
        let headers = headers_of(&[
            ("x-ratelimit-remaining-tokens", "50000"),
            ("x-ratelimit-limit-tokens", "300000"),
        ]);
        let snap = parse(&headers).unwrap();
        let near = is_near_limit(&snap, 0.2).unwrap();
        assert_eq!(near.window, "minute_tokens");
        assert!((near.ratio - 0.1666).abs() < 0.01);

        let headers = headers_of(&[
            ("x-ratelimit-remaining-tokens", "250000"),
            ("x-ratelimit-limit-tokens", "300000"),
        ]);
        let snap = parse(&headers).unwrap();
        assert!(is_near_limit(&snap, 0.2).is_none());
    }

    #[test]
    fn test_near_limit_priority_order() {
        let headers = headers_of(&[
            ("x-ratelimit-remaining-tokens", "0"),
            ("x-ratelimit-limit-tokens", "300000"),
            ("x-ratelimit-remaining-requests", "0"),
            ("x-ratelimit-limit-requests", "60"),
        ]);
        let snap = parse(&headers).unwrap();
        // Minute tokens outrank minute requests.
        assert_eq!(is_near_limit(&snap, 0.2).unwrap().window, "minute_tokens");
    }

    #[test]
    fn test_snapshot_freshness() {
        let headers = headers_of(&[("x-ratelimit-remaining-tokens", "10")]);
        let snap = parse(&headers).unwrap();
        assert!(snap.is_fresh(SNAPSHOT_STALENESS));
        assert!(!snap.is_fresh(Duration::ZERO));
    }

    #[test]
    fn test_trigger_suppressor_debounces() {
        let suppressor = TriggerSuppressor::new(Duration::from_secs(60));
        assert!(suppressor.should_act("anthropic"));
        assert!(!suppressor.should_act("anthropic"));
        // Independent per provider.
        assert!(suppressor.should_act("groq"));
    }
}
