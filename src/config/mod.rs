//! Settings document for the routing runtime.
//!
//! Loaded once at startup from YAML (or built programmatically): per-provider
//! static budgets and endpoints, workload→provider chains, the tier→workload
//! fallback precedence for untagged providers, and runtime tunables.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::capacity::RateBudget;
use crate::{Error, ErrorContext, Result};

fn default_true() -> bool {
    true
}

fn default_request_path() -> String {
    "/v1/chat/completions".to_string()
}

/// One upstream provider: wire endpoint, routing flags, and its rate budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Endpoint base URL (e.g. "https://api.anthropic.com").
    pub base_url: String,
    /// Request path appended to `base_url`.
    #[serde(default = "default_request_path")]
    pub path: String,
    /// Workload tags this provider explicitly serves. Untagged providers fall
    /// back to the tier→workload precedence in [`RouterSettings`].
    #[serde(default)]
    pub workloads: Vec<String>,
    /// The provider reports unreasonable retry hints; ignore `Retry-After`.
    #[serde(default)]
    pub ignore_retry_hints: bool,
    /// The provider disguises auth failures as HTTP 400.
    #[serde(default)]
    pub auth_error_as_400: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub budget: RateBudget,
}

impl ProviderConfig {
    pub fn name(&self) -> &str {
        &self.budget.provider
    }

    pub fn endpoint_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.path)
    }
}

/// Runtime knobs with production defaults; every field is optional in the
/// settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub max_retries: u32,
    pub base_backoff_secs: f64,
    pub max_backoff_secs: f64,
    pub attempt_timeout_secs: u64,
    /// Concurrency cap for premium-tier providers.
    pub premium_concurrency: usize,
    /// Concurrency cap for everything else.
    pub standard_concurrency: usize,
    /// Credential age beyond which a proactive refresh happens before sending.
    pub proactive_refresh_age_secs: u64,
    /// Remaining fraction at which a provider counts as near its limit.
    pub proactive_threshold: f64,
    /// Requests at or below this size may stay on a LOW provider.
    pub small_request_tokens: u64,
    /// Base cooldown applied on the first throttle of a streak.
    pub base_cooldown_secs: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_secs: 1.0,
            max_backoff_secs: 60.0,
            attempt_timeout_secs: 120,
            premium_concurrency: 4,
            standard_concurrency: 8,
            proactive_refresh_age_secs: 2_700,
            proactive_threshold: 0.2,
            small_request_tokens: 2_048,
            base_cooldown_secs: 60,
        }
    }
}

impl Tunables {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.base_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.max_backoff_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn proactive_refresh_age(&self) -> Duration {
        Duration::from_secs(self.proactive_refresh_age_secs)
    }

    pub fn base_cooldown(&self) -> Duration {
        Duration::from_secs(self.base_cooldown_secs)
    }
}

/// Root settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterSettings {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Workload → ordered provider preference chain. Chain membership also
    /// tags the named providers for that workload.
    #[serde(default)]
    pub workloads: HashMap<String, Vec<String>>,
    /// Workload → maximum tier an untagged provider may serve. This is the
    /// fallback precedence for providers with no explicit workload tags.
    #[serde(default)]
    pub fallback_tiers: HashMap<String, u8>,
    #[serde(default)]
    pub tunables: Tunables,
}

impl RouterSettings {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let settings: RouterSettings = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (idx, provider) in self.providers.iter().enumerate() {
            if provider.name().is_empty() {
                return Err(Error::configuration_with_context(
                    "provider name must not be empty",
                    ErrorContext::new()
                        .with_field_path(format!("providers[{}].provider", idx))
                        .with_source("settings"),
                ));
            }
            if !seen.insert(provider.name().to_string()) {
                return Err(Error::configuration_with_context(
                    format!("duplicate provider \"{}\"", provider.name()),
                    ErrorContext::new()
                        .with_field_path(format!("providers[{}]", idx))
                        .with_source("settings"),
                ));
            }
            if let Err(err) = url::Url::parse(&provider.base_url) {
                return Err(Error::configuration_with_context(
                    format!("invalid base_url \"{}\": {}", provider.base_url, err),
                    ErrorContext::new()
                        .with_field_path(format!("providers[{}].base_url", idx))
                        .with_source("settings"),
                ));
            }
        }
        for (workload, chain) in &self.workloads {
            for name in chain {
                if !seen.contains(name) {
                    return Err(Error::configuration_with_context(
                        format!(
                            "workload \"{}\" references unknown provider \"{}\"",
                            workload, name
                        ),
                        ErrorContext::new()
                            .with_field_path(format!("workloads.{}", workload))
                            .with_source("settings"),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name() == name)
    }

    /// Effective workload tags for a provider: explicit tags plus membership
    /// in any workload chain.
    pub fn workload_tags(&self, provider_name: &str) -> Vec<String> {
        let mut tags: Vec<String> = self
            .provider(provider_name)
            .map(|p| p.workloads.clone())
            .unwrap_or_default();
        for (workload, chain) in &self.workloads {
            if chain.iter().any(|n| n == provider_name) && !tags.contains(workload) {
                tags.push(workload.clone());
            }
        }
        tags
    }
}
