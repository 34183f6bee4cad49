//! Registry Watcher
//!
//! Consumes change notifications for `isInitialized` one at a time. Every
//! notification whose value is exactly `false` runs one cycle:
//!
//! ```text
//! read localIp ──► ensure tunnel ──► public address ──► write publicIp
//!                                                        isInitialized = true
//!                                                        lastUpdated
//! ```
//!
//! Any other value, including the `true` written by the cycle itself, is ignored.

use crate::registry::{EventStream, Registry, RegistryError, RegistryEvent, StreamKeys};
use crate::tunnel::{EnsureOutcome, TunnelError, TunnelManager};
use chrono::{DateTime, Local};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Format of the `lastUpdated` field
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Error types for a single cycle
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Local address missing or not a string: {0}")]
    InvalidLocalAddress(Value),
}

/// What a single notification led to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Value was not exactly `false`
    Ignored,
    /// Cycle ran but produced no writeback
    Skipped(String),
    /// Results written back to the registry
    Published {
        public_address: String,
        updated_at: String,
    },
}

/// `lastUpdated` rendering of a local time
pub fn format_timestamp(at: DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Whether a notification should start a cycle
pub fn is_trigger(event: &RegistryEvent) -> bool {
    event.value == Value::Bool(false)
}

/// Orchestrates the tunnel in response to registry notifications
pub struct RegistryWatcher {
    registry: Arc<dyn Registry>,
    tunnel: Arc<TunnelManager>,
    keys: StreamKeys,
}

impl RegistryWatcher {
    pub fn new(registry: Arc<dyn Registry>, tunnel: Arc<TunnelManager>, keys: StreamKeys) -> Self {
        Self {
            registry,
            tunnel,
            keys,
        }
    }

    /// Subscribe to the trigger key and process events until `shutdown` resolves
    pub async fn watch<F>(&self, shutdown: F) -> Result<(), RegistryError>
    where
        F: Future<Output = ()>,
    {
        let events = self.registry.subscribe(&self.keys.is_initialized).await?;
        self.run(events, shutdown).await;
        Ok(())
    }

    /// Process events in arrival order until the stream closes or `shutdown` resolves.
    ///
    /// Each event is handled to completion before the next is received. A cycle
    /// still in flight when `shutdown` resolves is abandoned without writeback
    /// of the remaining fields.
    pub async fn run<F>(&self, mut events: EventStream, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let event = tokio::select! {
                _ = &mut shutdown => {
                    info!("Listener stopped.");
                    return;
                }
                event = events.recv() => event,
            };

            let Some(event) = event else {
                warn!("Subscription closed, watcher exiting");
                return;
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Listener stopped during a cycle.");
                    return;
                }
                _ = self.handle_event(&event) => {}
            }
        }
    }

    /// Handle one notification; failures are logged and contained to this event
    pub async fn handle_event(&self, event: &RegistryEvent) -> CycleOutcome {
        if !is_trigger(event) {
            debug!("Ignoring {} at {}", event.value, event.path);
            return CycleOutcome::Ignored;
        }

        info!("isInitialized reset to false, starting cycle");
        match self.run_cycle().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Cycle failed: {}", e);
                CycleOutcome::Skipped(e.to_string())
            }
        }
    }

    async fn run_cycle(&self) -> Result<CycleOutcome, WatcherError> {
        let local_address = match self.registry.get(&self.keys.local_address).await? {
            Value::String(address) if !address.trim().is_empty() => address,
            other => return Err(WatcherError::InvalidLocalAddress(other)),
        };
        info!("Local address retrieved: {}", local_address);

        let public_address = match self.tunnel.ensure_tunnel(&local_address)? {
            EnsureOutcome::Launched { .. } => self.tunnel.wait_until_ready().await,
            EnsureOutcome::AlreadyRunning => self.tunnel.get_public_address().await,
        };

        let Some(public_address) = public_address else {
            warn!("No public address available, skipping writeback");
            return Ok(CycleOutcome::Skipped("no public address".to_string()));
        };

        self.registry
            .set(&self.keys.public_address, Value::String(public_address.clone()))
            .await?;

        self.registry
            .set(&self.keys.is_initialized, Value::Bool(true))
            .await?;
        info!("isInitialized set to true");

        let updated_at = format_timestamp(Local::now());
        self.registry
            .set(&self.keys.last_updated, Value::String(updated_at.clone()))
            .await?;

        Ok(CycleOutcome::Published {
            public_address,
            updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_only_literal_false_triggers() {
        assert!(is_trigger(&RegistryEvent::new("/", json!(false))));

        for value in [json!(true), json!(null), json!("false"), json!(0), json!({"isInitialized": false})] {
            assert!(!is_trigger(&RegistryEvent::new("/", value)));
        }
    }

    #[test]
    fn test_format_timestamp() {
        let at = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(format_timestamp(at), "2024-03-07 09:05:01");
    }
}
