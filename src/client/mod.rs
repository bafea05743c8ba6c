//! Resilient request client.
//!
//! Executes one provider call end-to-end: tier-class admission through a
//! process-wide semaphore, a bounded retry loop for throttles and transient
//! 5xx, proactive and reactive credential refresh, and feedback of response
//! headers and token usage into the capacity registry.
//!
//! Within one request flow the ordering is strict: refresh check → send →
//! retry loop. The suspension points are exactly the semaphore acquire, the
//! backoff sleep, the network attempt, and a credential refresh; every one of
//! them is a plain cancellable `await`, so dropping the future abandons
//! further retries immediately. Each attempt carries its own timeout,
//! independent of the overall retry budget.

pub mod backoff;

pub use backoff::{is_auth_status, is_retryable_status, BackoffPolicy};

use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credentials::{self, CredentialSource};
use crate::headers;
use crate::registry::CapacityRegistry;
use crate::router::{Router, RoutingDecision};
use crate::transport::HttpTransport;
use crate::{Error, ErrorContext, Result};

/// Remaining validity (seconds) below which a stored expiry triggers a
/// proactive refresh, for credentials whose token carries no issue time.
const EXPIRY_REFRESH_MARGIN_SECS: i64 = 300;

/// Coarse concurrency class derived from a provider's tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierClass {
    Premium,
    Standard,
}

impl TierClass {
    pub fn from_tier(tier: u8) -> Self {
        if tier <= 2 {
            TierClass::Premium
        } else {
            TierClass::Standard
        }
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    url: String,
    tier: u8,
    ignore_retry_hints: bool,
    auth_error_as_400: bool,
}

/// A provider response with dispatch metadata. Failed statuses are data, not
/// errors: the retry budget may be exhausted and the last response returned
/// as-is for the caller to inspect.
#[derive(Debug)]
pub struct ProviderResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
    pub elapsed: Duration,
    pub retries: u32,
    pub request_id: String,
}

impl ProviderResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Extract (input, output) token counts from the common usage shapes.
    pub fn usage_tokens(&self) -> (u64, u64) {
        let json: serde_json::Value = match serde_json::from_str(&self.body) {
            Ok(v) => v,
            Err(_) => return (0, 0),
        };
        let usage = match json.get("usage") {
            Some(u) => u,
            None => return (0, 0),
        };
        let read = |keys: [&str; 2]| {
            keys.iter()
                .find_map(|k| usage.get(*k).and_then(|v| v.as_u64()))
                .unwrap_or(0)
        };
        (
            read(["input_tokens", "prompt_tokens"]),
            read(["output_tokens", "completion_tokens"]),
        )
    }
}

/// Dispatches provider calls with admission control, bounded retries, and
/// credential refresh, feeding observations back into the registry.
pub struct ResilientClient {
    transport: HttpTransport,
    registry: Arc<CapacityRegistry>,
    credentials: HashMap<String, Arc<dyn CredentialSource>>,
    endpoints: HashMap<String, Endpoint>,
    premium_gate: Arc<Semaphore>,
    standard_gate: Arc<Semaphore>,
    policy: BackoffPolicy,
    attempt_timeout: Duration,
    proactive_refresh_age: Duration,
}

impl ResilientClient {
    pub fn new(registry: Arc<CapacityRegistry>) -> Result<Self> {
        let tunables = registry.settings().tunables.clone();
        let endpoints = registry
            .settings()
            .providers
            .iter()
            .map(|p| {
                (
                    p.name().to_string(),
                    Endpoint {
                        url: p.endpoint_url(),
                        tier: p.budget.tier,
                        ignore_retry_hints: p.ignore_retry_hints,
                        auth_error_as_400: p.auth_error_as_400,
                    },
                )
            })
            .collect();

        Ok(Self {
            transport: HttpTransport::new()?,
            registry,
            credentials: HashMap::new(),
            endpoints,
            premium_gate: Arc::new(Semaphore::new(tunables.premium_concurrency.max(1))),
            standard_gate: Arc::new(Semaphore::new(tunables.standard_concurrency.max(1))),
            policy: BackoffPolicy {
                max_retries: tunables.max_retries,
                base: tunables.base_backoff(),
                max: tunables.max_backoff(),
            },
            attempt_timeout: tunables.attempt_timeout(),
            proactive_refresh_age: tunables.proactive_refresh_age(),
        })
    }

    /// Attach a credential source for a provider and mark it credentialed in
    /// the registry.
    pub fn with_credentials(
        mut self,
        provider: &str,
        source: Arc<dyn CredentialSource>,
    ) -> Self {
        self.registry.set_credentials(provider, true);
        self.credentials.insert(provider.to_string(), source);
        self
    }

    async fn acquire(&self, class: TierClass) -> Result<OwnedSemaphorePermit> {
        let gate = match class {
            TierClass::Premium => &self.premium_gate,
            TierClass::Standard => &self.standard_gate,
        };
        gate.clone().acquire_owned().await.map_err(|_| {
            Error::runtime_with_context(
                "admission semaphore closed",
                ErrorContext::new().with_source("admission"),
            )
        })
    }

    /// Current token for a provider, proactively refreshed when its decoded
    /// issue time (or stored expiry) says it is about to go stale. The
    /// `refreshed` marker guarantees at most one refresh per request flow.
    async fn prepared_token(
        &self,
        provider: &str,
        refreshed: &mut bool,
    ) -> Result<Option<String>> {
        let source = match self.credentials.get(provider) {
            Some(source) => source,
            None => return Ok(None),
        };
        let current = match source.get_valid_access_token().await? {
            Some(token) => token,
            None => return Ok(None),
        };

        let needs_refresh = match credentials::token_age(&current) {
            Some(age) => age >= self.proactive_refresh_age,
            None => source
                .expires_at()
                .map(|expiry| {
                    (expiry - chrono::Utc::now()).num_seconds() <= EXPIRY_REFRESH_MARGIN_SECS
                })
                .unwrap_or(false),
        };
        if needs_refresh && !*refreshed {
            *refreshed = true;
            match source.refresh_access_token(true).await {
                Ok(Some(fresh)) => {
                    debug!(provider, "credential refreshed proactively");
                    return Ok(Some(fresh));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(provider, error = %err, "proactive credential refresh failed");
                }
            }
        }
        Ok(Some(current))
    }

    async fn reactive_refresh(&self, provider: &str) -> Option<String> {
        let source = self.credentials.get(provider)?;
        match source.refresh_access_token(true).await {
            Ok(Some(fresh)) => {
                info!(provider, "credential refreshed after auth failure");
                Some(fresh)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(provider, error = %err, "reactive credential refresh failed");
                None
            }
        }
    }

    /// Execute one logical request against a provider.
    ///
    /// Retryable statuses (429 and common transient 5xx) are retried up to
    /// the configured budget with exponential backoff, an upstream
    /// `Retry-After` hint (unless the provider is flagged for unreasonable
    /// hints), and up to 25% jitter. On budget exhaustion the last response
    /// is returned as-is. Auth-shaped failures get one refresh-and-retry;
    /// a second failure surfaces unmodified.
    pub async fn execute(
        &self,
        provider: &str,
        body: &serde_json::Value,
    ) -> Result<ProviderResponse> {
        let endpoint = self.endpoints.get(provider).ok_or_else(|| {
            Error::configuration_with_context(
                format!("unknown provider \"{}\"", provider),
                ErrorContext::new().with_source("client"),
            )
        })?;

        let _permit = self.acquire(TierClass::from_tier(endpoint.tier)).await?;
        let request_id = Uuid::new_v4().to_string();
        let start = Instant::now();
        let mut refreshed = false;
        let mut token = self.prepared_token(provider, &mut refreshed).await?;
        let mut attempt: u32 = 0;
        let mut retries: u32 = 0;

        loop {
            let resp = self
                .transport
                .post_json(
                    &endpoint.url,
                    body,
                    token.as_deref(),
                    &request_id,
                    Some(self.attempt_timeout),
                )
                .await?;
            let status = resp.status().as_u16();
            let resp_headers = resp.headers().clone();

            // Budget data arrives on success and failure alike.
            self.registry.record_headers(provider, &resp_headers);

            if is_retryable_status(status) {
                self.registry.record_throttle(provider);
                if attempt >= self.policy.max_retries {
                    let body_text = resp.text().await.unwrap_or_default();
                    info!(
                        provider,
                        http_status = status,
                        retries,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "retry budget exhausted, returning last response"
                    );
                    return Ok(ProviderResponse {
                        status,
                        headers: resp_headers,
                        body: body_text,
                        elapsed: start.elapsed(),
                        retries,
                        request_id,
                    });
                }
                // Close the failed response before sleeping.
                drop(resp);
                let hint = if endpoint.ignore_retry_hints {
                    None
                } else {
                    headers::parse_retry_after(&resp_headers)
                };
                let wait = self.policy.delay_for_attempt(attempt, hint);
                debug!(
                    provider,
                    http_status = status,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    "retrying after transient failure"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
                retries += 1;
                continue;
            }

            if is_auth_status(status, endpoint.auth_error_as_400) && !refreshed {
                refreshed = true;
                if let Some(fresh) = self.reactive_refresh(provider).await {
                    drop(resp);
                    token = Some(fresh);
                    retries += 1;
                    continue;
                }
            }

            let body_text = resp.text().await.unwrap_or_default();
            let response = ProviderResponse {
                status,
                headers: resp_headers,
                body: body_text,
                elapsed: start.elapsed(),
                retries,
                request_id,
            };

            if response.is_success() {
                let (in_tok, out_tok) = response.usage_tokens();
                let _ = self
                    .registry
                    .record_request(provider, in_tok, out_tok, Some(&response.headers));
                info!(
                    provider,
                    http_status = status,
                    retries,
                    duration_ms = response.elapsed.as_millis() as u64,
                    "request completed"
                );
            } else {
                // Non-throttled failure: reachability proof, never a cooldown.
                self.registry.clear_failure_streak(provider);
                info!(
                    provider,
                    http_status = status,
                    retries,
                    duration_ms = response.elapsed.as_millis() as u64,
                    "request failed"
                );
            }
            return Ok(response);
        }
    }

    /// Route a workload call through a [`Router`], dispatch it, and on a
    /// final throttled response retry once against the router's replacement
    /// decision.
    pub async fn execute_routed(
        &self,
        router: &Router,
        workload: &str,
        est_tokens: u64,
        body: &serde_json::Value,
    ) -> Result<(RoutingDecision, ProviderResponse)> {
        let decision = router.select_model(workload, est_tokens, None);
        let provider = match decision.selected() {
            Some(p) => p.to_string(),
            None => {
                return Err(Error::runtime_with_context(
                    format!("no model available for workload \"{}\"", workload),
                    ErrorContext::new().with_source("router"),
                ))
            }
        };

        let response = self.execute(&provider, body).await?;
        if response.is_success() {
            router.evaluate_proactive(workload, &provider, &response.headers);
            return Ok((decision, response));
        }

        if response.status == 429 {
            // The retry loop already recorded the cooldown; ask the router
            // for a replacement and try it once.
            if let Some(replacement) = router.reroute_away_from(&provider) {
                if let Some(next) = replacement.selected().map(str::to_string) {
                    let retry = self.execute(&next, body).await?;
                    if retry.is_success() {
                        router.evaluate_proactive(workload, &next, &retry.headers);
                    }
                    return Ok((replacement, retry));
                }
            }
        }

        Ok((decision, response))
    }
}
