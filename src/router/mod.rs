//! Workload-aware provider selection.
//!
//! The router prefers stability: a healthy current provider is kept across
//! calls, and a switch only happens when capacity degrades (reactively on a
//! throttle, proactively on a near-limit budget report). Tie-breaks rotate
//! through equally-ranked candidates with a per-(workload, tier) cursor.
//!
//! Selection itself is a pure function of the candidate list; all clocks and
//! counters live behind the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use reqwest::header::HeaderMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::capacity::CapacityState;
use crate::headers::TriggerSuppressor;
use crate::registry::{Candidate, CapacityRegistry};

/// Outcome of one selection call.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Chosen provider, or `None` when no model is available at all.
    pub provider: Option<String>,
    pub workload: String,
    pub reason: String,
    /// Capacity status of the chosen provider at selection time.
    pub status: Option<CapacityState>,
    /// Whether this decision fell back outside the workload's own candidates.
    pub fallback: bool,
    pub fallback_from: Option<String>,
}

impl RoutingDecision {
    pub fn selected(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn is_routable(&self) -> bool {
        self.provider.is_some()
    }

    fn unavailable(workload: &str) -> Self {
        Self {
            provider: None,
            workload: workload.to_string(),
            reason: "no model available".to_string(),
            status: None,
            fallback: false,
            fallback_from: None,
        }
    }
}

/// Proactive vs reactive switch counts for one workload.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SwitchStats {
    pub proactive: u64,
    pub reactive: u64,
}

#[derive(Default)]
struct WorkloadState {
    current: Option<String>,
    /// Round-robin cursors, one per tier.
    cursors: HashMap<u8, usize>,
    stats: SwitchStats,
    /// Set when a near-limit trigger asks for a proactive switch on the next
    /// selection.
    pending_switch: bool,
    degraded_warned: bool,
}

/// Per-workload provider selection over a [`CapacityRegistry`].
pub struct Router {
    registry: Arc<CapacityRegistry>,
    state: Mutex<HashMap<String, WorkloadState>>,
    suppressor: TriggerSuppressor,
}

impl Router {
    pub fn new(registry: Arc<CapacityRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(HashMap::new()),
            suppressor: TriggerSuppressor::default(),
        }
    }

    pub fn registry(&self) -> &Arc<CapacityRegistry> {
        &self.registry
    }

    /// Pick a provider for a workload call.
    ///
    /// A caller-supplied `current` (or the sticky last choice) is kept while
    /// its status is AVAILABLE or APPROACHING, and even at LOW for small
    /// requests. Otherwise candidates are taken from the registry, first
    /// restricted to the current provider's tier, then widened; a final
    /// registry-wide pass accepts anything not in cooldown before reporting
    /// "no model available".
    pub fn select_model(
        &self,
        workload: &str,
        est_tokens: u64,
        current: Option<&str>,
    ) -> RoutingDecision {
        let small =
            est_tokens <= self.registry.settings().tunables.small_request_tokens;

        let mut states = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ws = states.entry(workload.to_string()).or_default();
        let effective_current = current
            .map(str::to_string)
            .or_else(|| ws.current.clone());

        if !ws.pending_switch {
            if let Some(cur) = effective_current.as_deref() {
                if let Some(entry) = self.registry.entry(cur) {
                    if entry.has_credentials() && entry.tracker().can_admit(est_tokens) {
                        let status = entry.tracker().classify();
                        let keep = matches!(
                            status,
                            CapacityState::Available | CapacityState::Approaching
                        ) || (status == CapacityState::Low && small);
                        if keep {
                            ws.current = Some(cur.to_string());
                            ws.degraded_warned = false;
                            return RoutingDecision {
                                provider: Some(cur.to_string()),
                                workload: workload.to_string(),
                                reason: "current provider healthy".to_string(),
                                status: Some(status),
                                fallback: false,
                                fallback_from: None,
                            };
                        }
                    }
                }
            }
        }
        ws.pending_switch = false;

        let candidates = self.registry.available_for_workload(workload, est_tokens, true);
        let previous_tier = effective_current
            .as_deref()
            .and_then(|cur| self.registry.tier_of(cur));

        // Prefer a different provider in the same tier before widening; fall
        // back to the degraded current only when nothing else is eligible.
        let mut chosen: Option<&Candidate> = None;
        if let Some(tier) = previous_tier {
            chosen = pick_candidate(
                &candidates,
                |c| c.tier == tier && Some(c.provider.as_str()) != effective_current.as_deref(),
                ws,
            );
        }
        if chosen.is_none() {
            chosen = pick_candidate(
                &candidates,
                |c| Some(c.provider.as_str()) != effective_current.as_deref(),
                ws,
            );
        }
        if chosen.is_none() {
            chosen = pick_candidate(&candidates, |_| true, ws);
        }

        if let Some(candidate) = chosen {
            let switched = effective_current
                .as_deref()
                .map(|cur| cur != candidate.provider)
                .unwrap_or(false);
            if switched {
                info!(
                    workload,
                    from = effective_current.as_deref().unwrap_or(""),
                    to = candidate.provider.as_str(),
                    status = ?candidate.state,
                    "switching provider"
                );
            }
            ws.current = Some(candidate.provider.clone());
            ws.degraded_warned = false;
            return RoutingDecision {
                provider: Some(candidate.provider.clone()),
                workload: workload.to_string(),
                reason: if switched {
                    "current provider degraded".to_string()
                } else {
                    "selected from candidates".to_string()
                },
                status: Some(candidate.state),
                fallback: false,
                fallback_from: if switched { effective_current.clone() } else { None },
            };
        }

        // Nothing eligible for the workload: least-bad registry-wide fallback
        // rather than refusal. One warning per degradation episode.
        if let Some(candidate) = self.registry.least_bad_fallback() {
            if !ws.degraded_warned {
                ws.degraded_warned = true;
                warn!(
                    workload,
                    provider = candidate.provider.as_str(),
                    status = ?candidate.state,
                    "all workload candidates exhausted, using least-bad provider"
                );
            }
            ws.current = Some(candidate.provider.clone());
            return RoutingDecision {
                provider: Some(candidate.provider.clone()),
                workload: workload.to_string(),
                reason: "registry-wide fallback".to_string(),
                status: Some(candidate.state),
                fallback: true,
                fallback_from: effective_current,
            };
        }

        ws.current = None;
        RoutingDecision::unavailable(workload)
    }

    /// Record a successful call and fold its response headers into the
    /// registry. A fresh near-limit report schedules a proactive switch for
    /// the workload's next selection.
    pub fn record_success(
        &self,
        workload: &str,
        provider: &str,
        in_tok: u64,
        out_tok: u64,
        headers: Option<&HeaderMap>,
    ) {
        let near = self.registry.record_request(provider, in_tok, out_tok, headers);
        if let Some(trigger) = near {
            self.apply_trigger(workload, provider, &trigger);
        }
    }

    /// Evaluate already-recorded response headers for a near-limit trigger.
    /// Used by dispatch paths that feed usage into the registry themselves.
    pub fn evaluate_proactive(&self, workload: &str, provider: &str, headers: &HeaderMap) {
        let Some(snapshot) = crate::headers::parse(headers) else {
            return;
        };
        let threshold = self.registry.settings().tunables.proactive_threshold;
        if let Some(trigger) = crate::headers::is_near_limit(&snapshot, threshold) {
            self.apply_trigger(workload, provider, &trigger);
        }
    }

    fn apply_trigger(&self, workload: &str, provider: &str, trigger: &crate::headers::NearLimit) {
        if !self.suppressor.should_act(provider) {
            return;
        }
        let mut states = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ws = states.entry(workload.to_string()).or_default();
        ws.pending_switch = true;
        ws.stats.proactive += 1;
        info!(
            workload,
            provider,
            window = trigger.window,
            remaining_pct = (trigger.ratio * 100.0) as u64,
            "proactive switch scheduled"
        );
    }

    /// Record a throttle against a provider on behalf of a workload.
    pub fn record_throttle(&self, workload: &str, provider: &str) {
        self.registry.record_throttle(provider);
        let mut states = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ws = states.entry(workload.to_string()).or_default();
        ws.stats.reactive += 1;
    }

    /// React to a throttle: put the provider into cooldown, then immediately
    /// return a replacement decision for the workload that was using it.
    /// Callers retry the failed request once against the replacement.
    pub fn on_throttle(&self, provider: &str) -> Option<RoutingDecision> {
        self.registry.record_throttle(provider);
        self.reroute_away_from(provider)
    }

    /// Replacement decision for whichever workload was using a provider,
    /// without touching its throttle state. Used when the cooldown was
    /// already recorded by the dispatching client.
    pub fn reroute_away_from(&self, provider: &str) -> Option<RoutingDecision> {
        let workload = {
            let mut states = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let (workload, ws) = states
                .iter_mut()
                .find(|(_, ws)| ws.current.as_deref() == Some(provider))?;
            ws.stats.reactive += 1;
            ws.current = None;
            workload.clone()
        };

        Some(self.select_model(&workload, 0, None))
    }

    pub fn switch_stats(&self, workload: &str) -> SwitchStats {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(workload)
            .map(|ws| ws.stats)
            .unwrap_or_default()
    }
}

/// Pure tie-break over an ordered candidate list: take the healthiest
/// (status, tier) group among candidates passing `filter`, then rotate
/// through that group with the workload's per-tier cursor.
fn pick_candidate<'a, F>(
    candidates: &'a [Candidate],
    filter: F,
    ws: &mut WorkloadState,
) -> Option<&'a Candidate>
where
    F: Fn(&Candidate) -> bool,
{
    let pool: Vec<&Candidate> = candidates.iter().filter(|c| filter(c)).collect();
    let first = pool.first()?;
    let best_key = (first.state.severity(), first.tier);
    let ties: Vec<&&Candidate> = pool
        .iter()
        .filter(|c| (c.state.severity(), c.tier) == best_key)
        .collect();
    let cursor = ws.cursors.entry(first.tier).or_insert(0);
    let chosen: &Candidate = ties[*cursor % ties.len()];
    *cursor += 1;
    Some(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::RateBudget;
    use crate::config::{ProviderConfig, RouterSettings};

    fn provider(name: &str, tier: u8, tokens_per_minute: u64) -> ProviderConfig {
        ProviderConfig {
            base_url: format!("https://{}.example.com", name),
            path: "/v1/chat/completions".to_string(),
            workloads: vec!["coding".to_string()],
            ignore_retry_hints: false,
            auth_error_as_400: false,
            enabled: true,
            budget: RateBudget::new(name, 200_000)
                .with_tokens_per_minute(tokens_per_minute)
                .with_tier(tier),
        }
    }

    fn router_of(providers: Vec<ProviderConfig>) -> Router {
        let settings = RouterSettings {
            providers,
            ..Default::default()
        };
        let registry = Arc::new(CapacityRegistry::from_settings(settings).unwrap());
        for name in registry.provider_names() {
            registry.set_credentials(&name, true);
        }
        Router::new(registry)
    }

    #[test]
    fn test_selection_is_sticky_while_healthy() {
        let router = router_of(vec![provider("a", 1, 100_000), provider("b", 1, 100_000)]);
        let first = router.select_model("coding", 1_000, None);
        let chosen = first.selected().unwrap().to_string();
        for _ in 0..5 {
            let again = router.select_model("coding", 1_000, None);
            assert_eq!(again.selected().unwrap(), chosen);
            assert!(!again.fallback);
        }
    }

    #[test]
    fn test_switches_when_current_degrades() {
        let router = router_of(vec![provider("a", 1, 100_000), provider("b", 1, 100_000)]);
        let first = router.select_model("coding", 5_000, None);
        let chosen = first.selected().unwrap().to_string();

        // Degrade the chosen provider to LOW.
        router.registry().record_request(&chosen, 85_000, 0, None);

        let next = router.select_model("coding", 5_000, None);
        assert_ne!(next.selected().unwrap(), chosen);
        assert_eq!(next.fallback_from.as_deref(), Some(chosen.as_str()));
    }

    #[test]
    fn test_low_current_kept_for_small_requests() {
        let router = router_of(vec![provider("a", 1, 100_000), provider("b", 1, 100_000)]);
        let chosen = router.select_model("coding", 1_000, None).provider.unwrap();
        router.registry().record_request(&chosen, 85_000, 0, None);

        // Below the small-request threshold the LOW provider is kept.
        let small = router.select_model("coding", 500, None);
        assert_eq!(small.selected().unwrap(), chosen);
    }

    #[test]
    fn test_same_tier_preferred_before_widening() {
        let router = router_of(vec![
            provider("a1", 1, 100_000),
            provider("a2", 1, 100_000),
            provider("b", 0, 100_000),
        ]);
        let first = router.select_model("coding", 1_000, Some("a1"));
        assert_eq!(first.selected().unwrap(), "a1");

        router.registry().record_request("a1", 96_000, 0, None);
        let next = router.select_model("coding", 5_000, Some("a1"));
        // Same-tier sibling wins over the lower-tier (better-ranked) b.
        assert_eq!(next.selected().unwrap(), "a2");
    }

    #[test]
    fn test_round_robin_tie_break_advances() {
        let router = router_of(vec![
            provider("a", 1, 100_000),
            provider("b", 1, 100_000),
            provider("c", 1, 100_000),
        ]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let decision = router.select_model("coding", 1_000, None);
            let chosen = decision.provider.unwrap();
            seen.insert(chosen.clone());
            // Force a reselection by knocking the chosen provider out.
            router.registry().record_throttle(&chosen);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_three_tier_throttle_scenario() {
        let router = router_of(vec![
            provider("a", 5, 100_000),
            provider("b", 5, 100_000),
            provider("c", 2, 100_000),
        ]);
        let decision = router.select_model("coding", 1_000, None);
        // Tier 2 outranks tier 5 on a fresh registry.
        assert_eq!(decision.selected().unwrap(), "c");

        let replacement = router.on_throttle("c").unwrap();
        let replacement_name = replacement.selected().unwrap();
        assert_ne!(replacement_name, "c");
        assert!(["a", "b"].contains(&replacement_name));

        let c_entry = router.registry().entry("c").unwrap();
        assert_eq!(c_entry.tracker().classify(), CapacityState::Cooldown);
        assert!(c_entry.tracker().cooldown_remaining().unwrap() >= std::time::Duration::from_secs(50));
        assert_eq!(router.switch_stats("coding").reactive, 1);
    }

    #[test]
    fn test_no_model_available_is_explicit() {
        let router = router_of(vec![provider("a", 1, 100_000)]);
        router.registry().record_throttle("a");
        let decision = router.select_model("coding", 1_000, None);
        assert!(!decision.is_routable());
        assert_eq!(decision.reason, "no model available");
    }

    #[test]
    fn test_exhausted_candidates_fall_back_least_bad() {
        let router = router_of(vec![provider("a", 1, 100_000)]);
        // Exhaust a's minute budget without throttling it.
        router.registry().record_request("a", 96_000, 0, None);
        let decision = router.select_model("coding", 50_000, None);
        assert!(decision.fallback);
        assert_eq!(decision.selected().unwrap(), "a");
        assert_eq!(decision.status, Some(CapacityState::Exhausted));
    }

    #[test]
    fn test_proactive_switch_after_near_limit_report() {
        let router = router_of(vec![provider("a", 1, 400_000), provider("b", 1, 400_000)]);
        let chosen = router.select_model("coding", 1_000, None).provider.unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-ratelimit-remaining-tokens",
            reqwest::header::HeaderValue::from_static("50000"),
        );
        headers.insert(
            "x-ratelimit-limit-tokens",
            reqwest::header::HeaderValue::from_static("300000"),
        );
        router.record_success("coding", &chosen, 500, 200, Some(&headers));

        assert_eq!(router.switch_stats("coding").proactive, 1);
        let next = router.select_model("coding", 1_000, None);
        assert_ne!(next.selected().unwrap(), chosen);
    }
}
