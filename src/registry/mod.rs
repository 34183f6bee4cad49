//! Registry Access
//!
//! The registry is a remote hierarchical key-value store that acts as both the
//! control signal (`isInitialized`) and the place results are published to.
//!
//! - `firebase`: Realtime Database over REST + server-sent events
//! - `memory`: in-process store with an operation journal, used by tests
//! - `auth`: service account token minting for the REST interface

pub mod auth;
pub mod firebase;
pub mod memory;
pub mod sse;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

pub use firebase::FirebaseRegistry;
pub use memory::InMemoryRegistry;

/// Capacity of the channel between a subscription task and its consumer
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Stream of change notifications for one subscribed key
pub type EventStream = mpsc::Receiver<RegistryEvent>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Credentials invalid: {0}")]
    Credentials(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Registry returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed registry payload: {0}")]
    Decode(String),

    #[error("Subscription closed")]
    Closed,
}

/// One change notification delivered by a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEvent {
    /// Path of the change relative to the subscribed key ("/" for the key itself)
    pub path: String,
    /// New value at `path`
    pub value: Value,
}

impl RegistryEvent {
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }
}

/// Registry paths used by the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamKeys {
    pub local_address: String,
    pub is_initialized: String,
    pub public_address: String,
    pub last_updated: String,
}

impl Default for StreamKeys {
    fn default() -> Self {
        Self {
            local_address: "/streamData/localIp".to_string(),
            is_initialized: "/streamData/isInitialized".to_string(),
            public_address: "/streamData/publicIp".to_string(),
            last_updated: "/streamData/lastUpdated".to_string(),
        }
    }
}

/// Remote key-value store seam
#[async_trait]
pub trait Registry: Send + Sync {
    /// Read the value at `key` (`Value::Null` when absent)
    async fn get(&self, key: &str) -> Result<Value, RegistryError>;

    /// Overwrite the value at `key`
    async fn set(&self, key: &str, value: Value) -> Result<(), RegistryError>;

    /// Subscribe to changes on `key`.
    ///
    /// The first event reflects the current value (initial sync); later events
    /// follow every change in the order the registry reports them.
    async fn subscribe(&self, key: &str) -> Result<EventStream, RegistryError>;
}
