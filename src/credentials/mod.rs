//! Credential collaborator contract.
//!
//! OAuth web flows live outside this crate; only the token-refresh contract
//! is consumed here. The bundled [`StaticKeySource`] serves providers with
//! plain API keys (keyring entry first, then a `<PROVIDER>_API_KEY`
//! environment variable).

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use keyring::Entry;
use std::env;
use std::time::Duration;

use crate::Result;

/// Supplies and refreshes the access token for one provider.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Current token, if one is available.
    async fn get_valid_access_token(&self) -> Result<Option<String>>;

    /// Obtain a fresh token. `force` bypasses any validity caching the
    /// implementation may do.
    async fn refresh_access_token(&self, force: bool) -> Result<Option<String>>;

    /// Known expiry of the current token, when the token itself carries no
    /// issue time.
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Static API-key source: keyring first, environment variable second.
pub struct StaticKeySource {
    provider_id: String,
}

impl StaticKeySource {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
        }
    }

    fn lookup(&self) -> Option<String> {
        if let Ok(entry) = Entry::new("ai-router", &self.provider_id) {
            if let Ok(key) = entry.get_password() {
                return Some(key);
            }
        }
        let env_var = format!("{}_API_KEY", self.provider_id.to_uppercase().replace('-', "_"));
        env::var(env_var).ok()
    }
}

#[async_trait]
impl CredentialSource for StaticKeySource {
    async fn get_valid_access_token(&self) -> Result<Option<String>> {
        Ok(self.lookup())
    }

    async fn refresh_access_token(&self, _force: bool) -> Result<Option<String>> {
        // Static keys do not rotate; a refresh is a fresh lookup.
        Ok(self.lookup())
    }
}

/// Decode the `iat` claim from a JWT-shaped access token.
pub fn decode_issued_at(token: &str) -> Option<i64> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    parts.next()?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("iat")?.as_i64()
}

/// Age of a JWT-shaped token based on its issue time.
pub fn token_age(token: &str) -> Option<Duration> {
    let issued_at = decode_issued_at(token)?;
    let age = Utc::now().timestamp() - issued_at;
    Some(Duration::from_secs(age.max(0) as u64))
}
