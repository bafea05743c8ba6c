//! Capacity registry: owns every provider's capacity model and answers
//! "who can serve workload W with N tokens right now".
//!
//! The registry is an explicitly constructed, dependency-injected instance
//! with a defined lifecycle; tests run independent registries concurrently.
//! Whole-registry scans take a read lock that is never held across network
//! I/O; per-provider mutation goes through each entry's own tracker lock.

use reqwest::header::HeaderMap;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

use crate::capacity::{CapacityState, CapacityTracker, ProviderStatus};
use crate::config::RouterSettings;
use crate::headers::{self, NearLimit};
use crate::{Error, ErrorContext, Result};

/// Registry record for one provider. Created once at startup, mutated in
/// place, never destroyed (a provider may only be disabled).
pub struct ProviderEntry {
    name: String,
    tracker: CapacityTracker,
    workload_tags: Vec<String>,
    has_credentials: AtomicBool,
}

impl ProviderEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracker(&self) -> &CapacityTracker {
        &self.tracker
    }

    pub fn has_credentials(&self) -> bool {
        self.has_credentials.load(Ordering::Relaxed)
    }

    fn serves(&self, workload: &str, fallback_tiers: &HashMap<String, u8>) -> bool {
        if !self.workload_tags.is_empty() {
            return self.workload_tags.iter().any(|tag| tag == workload);
        }
        // Untagged providers serve a workload only up to the configured tier.
        fallback_tiers
            .get(workload)
            .map(|max_tier| self.tracker.budget().tier <= *max_tier)
            .unwrap_or(false)
    }
}

/// An eligible provider at selection time.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: String,
    pub state: CapacityState,
    pub tier: u8,
    pub available_tokens: u64,
}

/// Aggregates all per-provider capacity models.
pub struct CapacityRegistry {
    settings: RouterSettings,
    entries: RwLock<HashMap<String, Arc<ProviderEntry>>>,
    initialized: AtomicBool,
}

impl CapacityRegistry {
    pub fn new(settings: RouterSettings) -> Self {
        Self {
            settings,
            entries: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Construct and populate in one step.
    pub fn from_settings(settings: RouterSettings) -> Result<Self> {
        let registry = Self::new(settings);
        registry.initialize_from_config()?;
        Ok(registry)
    }

    /// Load limits and workload tags per provider. Idempotent: repeat calls
    /// leave existing entries (and their live counters) untouched.
    pub fn initialize_from_config(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.settings.providers.is_empty() {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(Error::configuration_with_context(
                "no providers configured",
                ErrorContext::new().with_source("registry"),
            ));
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for provider in &self.settings.providers {
            let name = provider.name().to_string();
            let tracker = CapacityTracker::new(provider.budget.clone());
            tracker.set_enabled(provider.enabled);
            let entry = ProviderEntry {
                name: name.clone(),
                tracker,
                workload_tags: self.settings.workload_tags(&name),
                has_credentials: AtomicBool::new(false),
            };
            entries.insert(name, Arc::new(entry));
        }
        info!(providers = entries.len(), "capacity registry initialized");
        Ok(())
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn entry(&self, provider: &str) -> Option<Arc<ProviderEntry>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(provider)
            .cloned()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn tier_of(&self, provider: &str) -> Option<u8> {
        self.entry(provider).map(|e| e.tracker().budget().tier)
    }

    /// Ordered eligible candidates for a workload: tagged (or tier-eligible)
    /// providers that hold credentials, are not in cooldown or exhausted, and
    /// can admit the estimated request size. Healthiest status first, then
    /// lower tier, then most available tokens.
    pub fn available_for_workload(
        &self,
        workload: &str,
        est_tokens: u64,
        require_credentials: bool,
    ) -> Vec<Candidate> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut candidates: Vec<Candidate> = entries
            .values()
            .filter(|entry| entry.serves(workload, &self.settings.fallback_tiers))
            .filter(|entry| !require_credentials || entry.has_credentials())
            .filter_map(|entry| {
                let state = entry.tracker.classify();
                if !state.usable() || !entry.tracker.can_admit(est_tokens) {
                    return None;
                }
                Some(Candidate {
                    provider: entry.name.clone(),
                    state,
                    tier: entry.tracker.budget().tier,
                    available_tokens: entry.tracker.estimate_available_tokens(),
                })
            })
            .collect();
        candidates.sort_by_key(|c| (c.state.severity(), c.tier, Reverse(c.available_tokens)));
        candidates
    }

    /// Least-bad registry-wide fallback when a workload has no eligible
    /// candidate: any enabled, credentialed provider not in cooldown,
    /// exhausted ones included.
    pub fn least_bad_fallback(&self) -> Option<Candidate> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut candidates: Vec<Candidate> = entries
            .values()
            .filter(|entry| entry.tracker.is_enabled() && entry.has_credentials())
            .filter_map(|entry| {
                let state = entry.tracker.classify();
                (state != CapacityState::Cooldown).then(|| Candidate {
                    provider: entry.name.clone(),
                    state,
                    tier: entry.tracker.budget().tier,
                    available_tokens: entry.tracker.estimate_available_tokens(),
                })
            })
            .collect();
        candidates.sort_by_key(|c| (c.state.severity(), c.tier, Reverse(c.available_tokens)));
        candidates.into_iter().next()
    }

    /// Record a completed request's usage and, when response headers are
    /// supplied, fold the normalized snapshot back in. Returns a near-limit
    /// trigger when the fresh snapshot says the provider is close to a cap.
    pub fn record_request(
        &self,
        provider: &str,
        in_tok: u64,
        out_tok: u64,
        headers: Option<&HeaderMap>,
    ) -> Option<NearLimit> {
        let entry = self.entry(provider)?;
        entry.tracker.record_completed_request(in_tok, out_tok, None);
        entry.tracker.clear_failure_streak();

        let snapshot = headers.and_then(headers::parse)?;
        entry.tracker.apply_snapshot(&snapshot);
        let near = headers::is_near_limit(&snapshot, self.settings.tunables.proactive_threshold);
        if let Some(ref trigger) = near {
            debug!(
                provider,
                window = trigger.window,
                remaining_pct = (trigger.ratio * 100.0) as u64,
                "provider reports near-limit budget"
            );
        }
        near
    }

    /// Fold response headers in without touching usage counters or the
    /// failure streak; used on failure paths where headers still carry
    /// authoritative budget data.
    pub fn record_headers(&self, provider: &str, headers: &HeaderMap) {
        if let (Some(entry), Some(snapshot)) = (self.entry(provider), headers::parse(headers)) {
            entry.tracker.apply_snapshot(&snapshot);
        }
    }

    /// Register a throttling failure; the provider enters (or escalates) its
    /// cooldown. Returns the applied cooldown duration.
    pub fn record_throttle(&self, provider: &str) -> Option<Duration> {
        let entry = self.entry(provider)?;
        Some(entry.tracker.record_throttled(self.settings.tunables.base_cooldown()))
    }

    pub fn clear_failure_streak(&self, provider: &str) {
        if let Some(entry) = self.entry(provider) {
            entry.tracker.clear_failure_streak();
        }
    }

    /// Administrative enable/disable. Disabled providers classify as
    /// exhausted and are never handed out.
    pub fn set_enabled(&self, provider: &str, enabled: bool) {
        if let Some(entry) = self.entry(provider) {
            entry.tracker.set_enabled(enabled);
        }
    }

    /// Mark whether a credential source is attached for a provider.
    pub fn set_credentials(&self, provider: &str, present: bool) {
        if let Some(entry) = self.entry(provider) {
            entry.has_credentials.store(present, Ordering::Relaxed);
        }
    }

    /// Per-provider status summary for monitoring, ordered by tier then name.
    pub fn status_report(&self) -> Vec<ProviderStatus> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut report: Vec<ProviderStatus> =
            entries.values().map(|entry| entry.tracker.status()).collect();
        report.sort_by(|a, b| (a.tier, a.provider.as_str()).cmp(&(b.tier, b.provider.as_str())));
        report
    }
}
