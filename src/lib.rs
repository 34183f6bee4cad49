//! Tunnel Bridge
//!
//! Watches a registry flag and exposes a local service through a tunnel when
//! the flag is reset, publishing the resulting public address back.
//!
//! # Architecture
//!
//! ```text
//! Registry ──► RegistryWatcher ──► TunnelManager ──► tunnel process
//! (SSE feed)         │                   │
//!                    │                   └── control API (public URL)
//!                    └── writes publicIp / isInitialized / lastUpdated
//! ```

pub mod config;
pub mod registry;
pub mod tunnel;
pub mod watcher;

pub use config::Config;
pub use registry::{
    FirebaseRegistry, InMemoryRegistry, Registry, RegistryError, RegistryEvent, StreamKeys,
};
pub use tunnel::{
    CommandLauncher, ControlClient, EnsureOutcome, ReadinessPolicy, TunnelError, TunnelLauncher,
    TunnelManager, TunnelProcess, TunnelState,
};
pub use watcher::{CycleOutcome, RegistryWatcher, WatcherError};
