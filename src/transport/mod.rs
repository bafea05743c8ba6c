//! Thin HTTP transport over `reqwest`.
//!
//! Builds one shared connection pool with production-friendly, env-overridable
//! defaults and executes single provider calls. Retry, admission, and
//! credential policy live above this layer in [`crate::client`].

use reqwest::Proxy;
use std::env;
use std::time::Duration;

use crate::Result;

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let timeout_secs = env_u64("AI_ROUTER_HTTP_TIMEOUT_SECS", 120);

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(
                env_u64("AI_ROUTER_HTTP_POOL_MAX_IDLE_PER_HOST", 32) as usize
            )
            .pool_idle_timeout(Some(Duration::from_secs(env_u64(
                "AI_ROUTER_HTTP_POOL_IDLE_TIMEOUT_SECS",
                90,
            ))))
            // Conservative HTTP/2 keepalive defaults for long-lived connections.
            .http2_adaptive_window(true)
            .http2_keep_alive_interval(Some(Duration::from_secs(30)))
            .http2_keep_alive_timeout(Duration::from_secs(10));

        if let Ok(proxy_url) = env::var("AI_ROUTER_PROXY_URL") {
            if let Ok(proxy) = Proxy::all(&proxy_url) {
                builder = builder.proxy(proxy);
            }
        }

        let client = builder
            .build()
            .map_err(|e| crate::Error::Transport(TransportError::Other(e.to_string())))?;

        Ok(Self { client })
    }

    /// Execute one POST attempt against a provider endpoint.
    ///
    /// `attempt_timeout` bounds this attempt independently of any retry
    /// budget above it.
    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        bearer: Option<&str>,
        request_id: &str,
        attempt_timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let mut req = self.client.post(url).json(body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        if let Some(timeout) = attempt_timeout {
            req = req.timeout(timeout);
        }
        // Correlation id. Providers may ignore it, but applications can use
        // it for linkage.
        req = req.header("x-ai-router-request-id", request_id);

        req.send()
            .await
            .map_err(|e| crate::Error::Transport(TransportError::Http(e)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Other(String),
}
