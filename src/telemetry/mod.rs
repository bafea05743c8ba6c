//! Status telemetry.
//!
//! A [`StatusSink`] receives periodic per-provider capacity summaries for
//! monitoring. Sink failures are always swallowed: telemetry never affects
//! routing or retry correctness.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::capacity::ProviderStatus;
use crate::registry::CapacityRegistry;
use crate::Result;

/// A telemetry event emitted by the runtime.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// Periodic per-provider capacity summary.
    Summary(Vec<ProviderStatus>),
}

/// Destination for status events.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn report(&self, event: StatusEvent) -> Result<()>;
}

/// Default sink: drops everything.
pub struct NoopStatusSink;

#[async_trait]
impl StatusSink for NoopStatusSink {
    async fn report(&self, _event: StatusEvent) -> Result<()> {
        Ok(())
    }
}

/// Sink that logs summaries through `tracing`.
pub struct TracingStatusSink;

#[async_trait]
impl StatusSink for TracingStatusSink {
    async fn report(&self, event: StatusEvent) -> Result<()> {
        let StatusEvent::Summary(statuses) = event;
        for status in statuses {
            info!(
                provider = status.provider.as_str(),
                state = ?status.state,
                tier = status.tier,
                available_tokens = status.available_tokens,
                in_cooldown = status.cooldown_remaining.is_some(),
                "provider status"
            );
        }
        Ok(())
    }
}

/// In-memory sink for tests.
pub struct InMemoryStatusSink {
    events: Arc<RwLock<Vec<StatusEvent>>>,
}

impl InMemoryStatusSink {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.read().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStatusSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusSink for InMemoryStatusSink {
    async fn report(&self, event: StatusEvent) -> Result<()> {
        if let Ok(mut events) = self.events.write() {
            events.push(event);
        }
        Ok(())
    }
}

/// Spawn a background task that reports the registry's status summary on a
/// fixed interval. Sink errors are swallowed.
pub fn spawn_status_reporter(
    registry: Arc<CapacityRegistry>,
    sink: Arc<dyn StatusSink>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = registry.status_report();
            let _ = sink.report(StatusEvent::Summary(report)).await;
        }
    })
}
