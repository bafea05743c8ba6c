use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_minute_reset() -> f64 {
    60.0
}

fn default_day_reset() -> f64 {
    86_400.0
}

fn default_tier() -> u8 {
    2
}

/// A provider-specific capacity window defined by a fixed duration rather
/// than calendar minute/day boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingLimit {
    /// Window duration in hours.
    pub hours: f64,
    #[serde(default)]
    pub tokens: Option<u64>,
    #[serde(default)]
    pub requests: Option<u64>,
}

impl RollingLimit {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.hours * 3600.0)
    }
}

/// Static per-provider rate limits, loaded once at startup.
///
/// All caps are optional: a provider that reports no token-per-minute limit
/// simply has no minute token window tracked against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateBudget {
    /// Provider id (e.g. "anthropic").
    pub provider: String,
    /// Maximum context window in tokens.
    pub context_window: u64,
    /// Maximum output tokens per request, if the provider enforces one.
    #[serde(default)]
    pub max_output: Option<u64>,
    #[serde(default)]
    pub tokens_per_minute: Option<u64>,
    #[serde(default)]
    pub requests_per_minute: Option<u64>,
    #[serde(default)]
    pub tokens_per_day: Option<u64>,
    #[serde(default)]
    pub requests_per_day: Option<u64>,
    /// Optional rolling window with its own caps.
    #[serde(default)]
    pub rolling: Option<RollingLimit>,
    /// Reset interval of the minute window, in seconds.
    #[serde(default = "default_minute_reset")]
    pub minute_reset_secs: f64,
    /// Reset interval of the day window, in seconds.
    #[serde(default = "default_day_reset")]
    pub day_reset_secs: f64,
    /// Ordinal quality/cost rank; lower is preferred.
    #[serde(default = "default_tier")]
    pub tier: u8,
    /// Plan label (e.g. "pay-as-you-go"), informational only.
    #[serde(default)]
    pub plan: Option<String>,
}

impl RateBudget {
    pub fn new(provider: impl Into<String>, context_window: u64) -> Self {
        Self {
            provider: provider.into(),
            context_window,
            max_output: None,
            tokens_per_minute: None,
            requests_per_minute: None,
            tokens_per_day: None,
            requests_per_day: None,
            rolling: None,
            minute_reset_secs: default_minute_reset(),
            day_reset_secs: default_day_reset(),
            tier: default_tier(),
            plan: None,
        }
    }

    pub fn with_tokens_per_minute(mut self, cap: u64) -> Self {
        self.tokens_per_minute = Some(cap);
        self
    }

    pub fn with_requests_per_minute(mut self, cap: u64) -> Self {
        self.requests_per_minute = Some(cap);
        self
    }

    pub fn with_tokens_per_day(mut self, cap: u64) -> Self {
        self.tokens_per_day = Some(cap);
        self
    }

    pub fn with_requests_per_day(mut self, cap: u64) -> Self {
        self.requests_per_day = Some(cap);
        self
    }

    pub fn with_rolling(mut self, rolling: RollingLimit) -> Self {
        self.rolling = Some(rolling);
        self
    }

    pub fn with_tier(mut self, tier: u8) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    pub fn minute_period(&self) -> Duration {
        Duration::from_secs_f64(self.minute_reset_secs)
    }

    pub fn day_period(&self) -> Duration {
        Duration::from_secs_f64(self.day_reset_secs)
    }
}
