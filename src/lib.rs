//! # ai-router-rust
//!
//! Capacity-aware routing runtime for multi-provider AI model traffic.
//!
//! ## Overview
//!
//! This library routes outbound requests to one of several interchangeable
//! upstream model providers, each with its own rate budget, authentication
//! lifecycle, and failure behavior. It tracks real-time consumption against
//! each provider's limits, proactively moves traffic away from a provider
//! before it throttles, absorbs transient failures with bounded retries, and
//! refreshes expiring credentials without interrupting in-flight work.
//!
//! It is not a server-side load balancer and not a queueing scheduler: it
//! makes a synchronous selection at call time and leaves dispatch policy to
//! the caller. Usage is not persisted across restarts.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ai_router_rust::{CapacityRegistry, ResilientClient, Router, RouterSettings};
//!
//! #[tokio::main]
//! async fn main() -> ai_router_rust::Result<()> {
//!     let settings = RouterSettings::load("router.yaml")?;
//!     let registry = Arc::new(CapacityRegistry::from_settings(settings)?);
//!     let router = Router::new(registry.clone());
//!     let client = ResilientClient::new(registry)?;
//!
//!     let body = serde_json::json!({ "messages": [] });
//!     let (decision, response) = client
//!         .execute_routed(&router, "coding", 4_096, &body)
//!         .await?;
//!     println!("{} -> HTTP {}", decision.provider.unwrap(), response.status);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`capacity`] | Per-provider rate budgets, usage windows, derived status |
//! | [`headers`] | Normalization of heterogeneous rate-limit response headers |
//! | [`registry`] | Aggregation of all capacity models; eligibility queries |
//! | [`router`] | Workload-aware provider selection with sticky choices |
//! | [`client`] | Resilient dispatch: admission, retries, credential refresh |
//! | [`rotation`] | Capacity-aware rotation over a fixed provider list |
//! | [`credentials`] | Credential collaborator contract and static-key source |
//! | [`config`] | Settings document: budgets, workload chains, tunables |
//! | [`telemetry`] | Periodic status summaries for monitoring |

pub mod capacity;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod headers;
pub mod registry;
pub mod rotation;
pub mod router;
pub mod telemetry;
pub mod transport;

// Re-export main types for convenience
pub use capacity::{CapacityState, CapacityTracker, ProviderStatus, RateBudget};
pub use client::{BackoffPolicy, ProviderResponse, ResilientClient, TierClass};
pub use config::{ProviderConfig, RouterSettings, Tunables};
pub use credentials::{CredentialSource, StaticKeySource};
pub use error::{Error, ErrorContext};
pub use headers::RateLimitSnapshot;
pub use registry::{Candidate, CapacityRegistry, ProviderEntry};
pub use rotation::RotationWrapper;
pub use router::{Router, RoutingDecision, SwitchStats};
pub use telemetry::{StatusEvent, StatusSink};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
