//! Configuration management

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder shipped in old deployments instead of a real database URL
const PLACEHOLDER_DATABASE_URL: &str = "xxx";

pub const DEFAULT_CONTROL_URL: &str = "http://127.0.0.1:4040/api/tunnels";

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Realtime database base URL (required)
    pub database_url: String,

    /// Service account key file
    pub credentials_path: PathBuf,

    /// Tunnel executable name or path
    pub tunnel_bin: PathBuf,

    /// Tunnel control API endpoint
    pub control_url: String,

    /// Port appended to the local address when building the tunnel target
    pub target_port: u16,

    /// Upper bound on the readiness poll after a launch
    pub ready_timeout: Duration,

    /// Pause before re-opening a dropped registry subscription
    pub resubscribe_delay: Duration,

    /// Silence on the subscription stream after which it is reopened
    pub stream_idle_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = match lookup("BRIDGE_DATABASE_URL") {
            Some(url) if !url.trim().is_empty() && url.trim() != PLACEHOLDER_DATABASE_URL => {
                url.trim().trim_end_matches('/').to_string()
            }
            Some(_) => bail!("BRIDGE_DATABASE_URL is empty or still set to the placeholder"),
            None => bail!("BRIDGE_DATABASE_URL must be set to the realtime database URL"),
        };

        let credentials_path = lookup("BRIDGE_CREDENTIALS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./serviceAccountKey.json"));

        let tunnel_bin = lookup("BRIDGE_TUNNEL_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ngrok"));

        let control_url =
            lookup("BRIDGE_CONTROL_URL").unwrap_or_else(|| DEFAULT_CONTROL_URL.to_string());

        let target_port = lookup("BRIDGE_TARGET_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(80);

        let ready_timeout = lookup("BRIDGE_READY_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));

        let resubscribe_delay = lookup("BRIDGE_RESUBSCRIBE_DELAY_SECS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));

        // The database sends keep-alive frames roughly every 30 seconds
        let stream_idle_timeout = lookup("BRIDGE_STREAM_IDLE_SECS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(90));

        Ok(Self {
            database_url,
            credentials_path,
            tunnel_bin,
            control_url,
            target_port,
            ready_timeout,
            resubscribe_delay,
            stream_idle_timeout,
        })
    }
}
