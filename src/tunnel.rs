//! Tunnel Process Management
//!
//! Owns the single external tunnel process:
//! - **Launch**: idempotent, only when no live process exists
//! - **Readiness**: bounded poll of the control API after a launch
//! - **Discovery**: public URL from the first tunnel the control API reports
//!
//! Liveness is checked lazily; there is no background health check. The process
//! is never killed, so it keeps running after the bridge exits.

use parking_lot::Mutex;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Error types for tunnel operations
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Failed to launch tunnel: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Control API unreachable: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Control API returned status {0}")]
    Status(u16),

    #[error("Malformed control API response: {0}")]
    Decode(String),

    #[error("Control API reports no tunnels")]
    NoTunnels,

    #[error("Control API reports a tunnel without a public URL")]
    EmptyPublicUrl,
}

/// Observable state of the tunnel handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Never launched
    Absent,
    /// Launched, control API has not confirmed a public URL yet
    Starting,
    /// Running with a confirmed public URL
    Alive,
    /// Process exited
    Dead,
}

/// Result of `ensure_tunnel`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    Launched { target: String },
    AlreadyRunning,
}

/// A running tunnel process
pub trait TunnelProcess: Send {
    /// Check exit status without blocking
    fn is_alive(&mut self) -> bool;

    /// OS process id, when known
    fn id(&self) -> Option<u32>;
}

/// Starts tunnel processes pointed at a target URL
pub trait TunnelLauncher: Send + Sync {
    fn launch(&self, target: &str) -> Result<Box<dyn TunnelProcess>, TunnelError>;
}

/// Launches the tunnel executable as `<bin> http <target>`
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    binary: PathBuf,
}

impl CommandLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

struct ChildProcess {
    child: Child,
}

impl TunnelProcess for ChildProcess {
    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("Tunnel process exited: {}", status);
                false
            }
            Err(e) => {
                warn!("Failed to poll tunnel process: {}", e);
                false
            }
        }
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

impl TunnelLauncher for CommandLauncher {
    fn launch(&self, target: &str) -> Result<Box<dyn TunnelProcess>, TunnelError> {
        let child = Command::new(&self.binary)
            .arg("http")
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()?;

        Ok(Box::new(ChildProcess { child }))
    }
}

/// Control API listing
#[derive(Debug, Deserialize)]
pub struct TunnelList {
    pub tunnels: Vec<TunnelDescriptor>,
}

/// One tunnel reported by the control API
#[derive(Debug, Deserialize)]
pub struct TunnelDescriptor {
    #[serde(default)]
    pub public_url: String,
}

impl TunnelList {
    /// Public URL of the first tunnel; blank URLs count as no address
    pub fn first_public_url(&self) -> Result<&str, TunnelError> {
        let first = self.tunnels.first().ok_or(TunnelError::NoTunnels)?;
        let url = first.public_url.trim();
        if url.is_empty() {
            return Err(TunnelError::EmptyPublicUrl);
        }
        Ok(url)
    }
}

/// Client for the tunnel's local control API
#[derive(Debug, Clone)]
pub struct ControlClient {
    url: String,
    client: reqwest::Client,
}

impl ControlClient {
    pub fn new(url: impl Into<String>) -> Result<Self, TunnelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }

    /// Fetch the tunnel listing
    pub async fn tunnels(&self) -> Result<TunnelList, TunnelError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(TunnelError::Status(response.status().as_u16()));
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| TunnelError::Decode(e.to_string()))
    }

    /// Public URL of the first listed tunnel
    pub async fn public_url(&self) -> Result<String, TunnelError> {
        let list = self.tunnels().await?;
        list.first_public_url().map(str::to_string)
    }
}

/// Bounded poll used after a launch instead of a fixed settling delay
#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(2),
        }
    }
}

struct Slot {
    process: Box<dyn TunnelProcess>,
    confirmed: bool,
}

/// Lifecycle owner for the tunnel process
pub struct TunnelManager {
    launcher: Arc<dyn TunnelLauncher>,
    control: ControlClient,
    target_port: u16,
    readiness: ReadinessPolicy,
    slot: Mutex<Option<Slot>>,
    launches: AtomicU64,
}

/// Tunnel target for a local address
pub fn target_url(local_address: &str, port: u16) -> String {
    format!("http://{}:{}", local_address, port)
}

impl TunnelManager {
    pub fn new(
        launcher: Arc<dyn TunnelLauncher>,
        control: ControlClient,
        target_port: u16,
        readiness: ReadinessPolicy,
    ) -> Self {
        Self {
            launcher,
            control,
            target_port,
            readiness,
            slot: Mutex::new(None),
            launches: AtomicU64::new(0),
        }
    }

    /// Number of processes launched so far
    pub fn launch_count(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    /// Current state, probing the process if one exists
    pub fn state(&self) -> TunnelState {
        let mut slot = self.slot.lock();
        let Some(s) = slot.as_mut() else {
            return TunnelState::Absent;
        };

        if !s.process.is_alive() {
            TunnelState::Dead
        } else if s.confirmed {
            TunnelState::Alive
        } else {
            TunnelState::Starting
        }
    }

    /// Launch a tunnel to `local_address` unless one is already running
    pub fn ensure_tunnel(&self, local_address: &str) -> Result<EnsureOutcome, TunnelError> {
        let mut slot = self.slot.lock();

        if let Some(existing) = slot.as_mut() {
            if existing.process.is_alive() {
                info!("Tunnel is already running");
                return Ok(EnsureOutcome::AlreadyRunning);
            }
            warn!("Tunnel process is no longer running, relaunching");
        }

        let target = target_url(local_address, self.target_port);
        info!("Starting tunnel to {}", target);

        let process = self.launcher.launch(&target)?;
        info!("Tunnel process started (pid {:?})", process.id());

        *slot = Some(Slot {
            process,
            confirmed: false,
        });
        self.launches.fetch_add(1, Ordering::Relaxed);

        Ok(EnsureOutcome::Launched { target })
    }

    /// Query the control API once for the public address
    pub async fn get_public_address(&self) -> Option<String> {
        match self.control.public_url().await {
            Ok(url) => {
                info!("Public address retrieved: {}", url);
                self.mark_confirmed();
                Some(url)
            }
            Err(e) => {
                warn!("Error retrieving public address: {}", e);
                None
            }
        }
    }

    /// Poll the control API with backoff until it reports a tunnel or the
    /// readiness timeout passes
    pub async fn wait_until_ready(&self) -> Option<String> {
        let deadline = Instant::now() + self.readiness.timeout;
        let mut interval = self.readiness.initial_interval;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.control.public_url().await {
                Ok(url) => {
                    info!("Public address retrieved: {} (after {} attempts)", url, attempts);
                    self.mark_confirmed();
                    return Some(url);
                }
                Err(e) => debug!("Tunnel not ready yet: {}", e),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Tunnel did not become ready within {:?} ({} attempts)",
                    self.readiness.timeout, attempts
                );
                return None;
            }

            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = (interval * 2).min(self.readiness.max_interval);
        }
    }

    fn mark_confirmed(&self) {
        if let Some(slot) = self.slot.lock().as_mut() {
            slot.confirmed = true;
        }
    }
}
