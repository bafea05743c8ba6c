//! Capacity-aware rotation over a caller-supplied fixed provider list.
//!
//! A simpler alternative entry point to the router for callers that hold an
//! explicit provider order: dwell on the current member for a fixed number of
//! calls, skip unhealthy members, and when everything looks unhealthy fall
//! back to the least-recently-failed member rather than refusing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::registry::CapacityRegistry;

/// Local consecutive errors after which a member is skipped.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;
/// A member with local errors becomes retry-eligible again this long after
/// its last error.
const ERROR_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone)]
struct MemberHealth {
    consecutive_errors: u32,
    last_error: Option<Instant>,
}

struct RotationState {
    index: usize,
    calls_on_current: u32,
    health: HashMap<String, MemberHealth>,
}

/// Cycles a fixed provider list, skipping members the registry marks
/// unusable or that keep erroring locally.
pub struct RotationWrapper {
    registry: Arc<CapacityRegistry>,
    members: Vec<String>,
    rotate_every: u32,
    state: Mutex<RotationState>,
}

impl RotationWrapper {
    pub fn new(registry: Arc<CapacityRegistry>, members: Vec<String>, rotate_every: u32) -> Self {
        Self {
            registry,
            members,
            rotate_every: rotate_every.max(1),
            state: Mutex::new(RotationState {
                index: 0,
                calls_on_current: 0,
                health: HashMap::new(),
            }),
        }
    }

    fn member_healthy(&self, name: &str, health: &HashMap<String, MemberHealth>) -> bool {
        if let Some(entry) = self.registry.entry(name) {
            if !entry.tracker().classify().usable() {
                return false;
            }
        }
        match health.get(name) {
            Some(h) if h.consecutive_errors >= MAX_CONSECUTIVE_ERRORS => h
                .last_error
                .map(|at| at.elapsed() >= ERROR_RETRY_AFTER)
                .unwrap_or(true),
            _ => true,
        }
    }

    /// The member the next call should use.
    ///
    /// Stays on the current member for `rotate_every` calls, then advances.
    /// Unhealthy members are skipped; when every member is unhealthy the
    /// least-recently-failed one is returned instead of nothing.
    pub fn next_provider(&self) -> Option<String> {
        if self.members.is_empty() {
            return None;
        }
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if st.calls_on_current >= self.rotate_every {
            st.index = (st.index + 1) % self.members.len();
            st.calls_on_current = 0;
        }

        for offset in 0..self.members.len() {
            let idx = (st.index + offset) % self.members.len();
            let name = &self.members[idx];
            if self.member_healthy(name, &st.health) {
                if idx != st.index {
                    debug!(from = self.members[st.index].as_str(), to = name.as_str(), "rotation skipped unhealthy member");
                    st.calls_on_current = 0;
                }
                st.index = idx;
                st.calls_on_current += 1;
                return Some(name.clone());
            }
        }

        // Everyone is unhealthy: pick the member whose last failure is oldest.
        let fallback_idx = (0..self.members.len()).max_by_key(|idx| {
            st.health
                .get(&self.members[*idx])
                .and_then(|h| h.last_error)
                .map(|at| at.elapsed())
                .unwrap_or(Duration::MAX)
        })?;
        let name = self.members[fallback_idx].clone();
        warn!(member = name.as_str(), "all rotation members unhealthy, using least-recently-failed");
        st.index = fallback_idx;
        st.calls_on_current += 1;
        Some(name)
    }

    /// Record a mid-call failure for a member. For a 429-flavored failure the
    /// next healthy member is returned so the caller can try it once before
    /// surfacing the error.
    pub fn record_failure(&self, member: &str, rate_limited: bool) -> Option<String> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let health = st.health.entry(member.to_string()).or_default();
        health.consecutive_errors = health.consecutive_errors.saturating_add(1);
        health.last_error = Some(Instant::now());

        if !rate_limited {
            return None;
        }

        let current_idx = self.members.iter().position(|m| m == member)?;
        for offset in 1..self.members.len() {
            let idx = (current_idx + offset) % self.members.len();
            let name = &self.members[idx];
            if name != member && self.member_healthy(name, &st.health) {
                st.index = idx;
                st.calls_on_current = 1;
                return Some(name.clone());
            }
        }
        None
    }

    pub fn record_success(&self, member: &str) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.health.remove(member);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::RateBudget;
    use crate::config::{ProviderConfig, RouterSettings};

    fn provider(name: &str) -> ProviderConfig {
        ProviderConfig {
            base_url: format!("https://{}.example.com", name),
            path: "/v1/chat/completions".to_string(),
            workloads: vec![],
            ignore_retry_hints: false,
            auth_error_as_400: false,
            enabled: true,
            budget: RateBudget::new(name, 200_000).with_tokens_per_minute(100_000),
        }
    }

    fn registry_of(names: &[&str]) -> Arc<CapacityRegistry> {
        let settings = RouterSettings {
            providers: names.iter().map(|n| provider(n)).collect(),
            ..Default::default()
        };
        Arc::new(CapacityRegistry::from_settings(settings).unwrap())
    }

    #[test]
    fn test_dwells_then_advances() {
        let registry = registry_of(&["a", "b", "c"]);
        let members = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let rotation = RotationWrapper::new(registry, members, 2);

        assert_eq!(rotation.next_provider().as_deref(), Some("a"));
        assert_eq!(rotation.next_provider().as_deref(), Some("a"));
        assert_eq!(rotation.next_provider().as_deref(), Some("b"));
        assert_eq!(rotation.next_provider().as_deref(), Some("b"));
        assert_eq!(rotation.next_provider().as_deref(), Some("c"));
    }

    #[test]
    fn test_skips_cooldown_member() {
        let registry = registry_of(&["a", "b"]);
        registry.record_throttle("a");
        let members = vec!["a".to_string(), "b".to_string()];
        let rotation = RotationWrapper::new(registry, members, 3);

        assert_eq!(rotation.next_provider().as_deref(), Some("b"));
    }

    #[test]
    fn test_skips_member_with_local_error_streak() {
        let registry = registry_of(&["a", "b"]);
        let members = vec!["a".to_string(), "b".to_string()];
        let rotation = RotationWrapper::new(registry, members, 10);

        assert_eq!(rotation.next_provider().as_deref(), Some("a"));
        for _ in 0..3 {
            rotation.record_failure("a", false);
        }
        assert_eq!(rotation.next_provider().as_deref(), Some("b"));

        // Success clears the streak.
        rotation.record_success("a");
        let rotation2 = RotationWrapper::new(registry_of(&["a", "b"]), vec!["a".to_string()], 10);
        assert_eq!(rotation2.next_provider().as_deref(), Some("a"));
    }

    #[test]
    fn test_all_unhealthy_falls_back_to_least_recently_failed() {
        let registry = registry_of(&["a", "b"]);
        let members = vec!["a".to_string(), "b".to_string()];
        let rotation = RotationWrapper::new(registry, members, 10);

        for _ in 0..3 {
            rotation.record_failure("a", false);
        }
        std::thread::sleep(Duration::from_millis(10));
        for _ in 0..3 {
            rotation.record_failure("b", false);
        }
        // a failed earlier than b, so a is least-recently-failed.
        assert_eq!(rotation.next_provider().as_deref(), Some("a"));
    }

    #[test]
    fn test_rate_limited_failure_suggests_next_member() {
        let registry = registry_of(&["a", "b", "c"]);
        let members = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let rotation = RotationWrapper::new(registry, members, 5);

        assert_eq!(rotation.next_provider().as_deref(), Some("a"));
        let next = rotation.record_failure("a", true);
        assert_eq!(next.as_deref(), Some("b"));

        // A plain error does not trigger the one-shot failover.
        assert_eq!(rotation.record_failure("b", false), None);
    }
}
