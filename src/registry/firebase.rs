//! Realtime Database registry
//!
//! Reads and writes go through the REST interface (`GET`/`PUT {base}{key}.json`).
//! Subscriptions hold a `text/event-stream` request open in a background task
//! and forward `put`/`patch` notifications over a channel. When the stream ends
//! the task reconnects after a fixed delay, which yields a fresh initial sync.
//! A stream that stays silent past the idle timeout is treated as ended.

use super::auth::{ServiceAccountKey, TokenSource};
use super::sse::{SseParser, StreamMessage};
use super::{EventStream, Registry, RegistryError, RegistryEvent, EVENT_CHANNEL_CAPACITY};
use crate::config::Config;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Key read once at startup to confirm access
const STARTUP_CHECK_KEY: &str = "/streamData";

/// Why a single stream connection ended
enum StreamEnd {
    /// Nobody is listening anymore; stop for good
    ReceiverDropped,
    /// Server closed or revoked the stream; reconnect
    Reconnect(String),
}

/// Authenticated handle to a Realtime Database instance
pub struct FirebaseRegistry {
    base_url: String,
    client: reqwest::Client,
    tokens: Arc<TokenSource>,
    resubscribe_delay: Duration,
    stream_idle_timeout: Duration,
}

impl FirebaseRegistry {
    /// Load credentials, mint a token and verify the database answers.
    ///
    /// Any failure here is fatal to the caller.
    pub async fn connect(config: &Config) -> Result<Self, RegistryError> {
        let key = ServiceAccountKey::load(&config.credentials_path)?;

        // No overall timeout on the client: subscriptions are long-lived
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        let tokens = Arc::new(TokenSource::new(key, client.clone())?);
        let registry = Self {
            base_url: config.database_url.clone(),
            client,
            tokens,
            resubscribe_delay: config.resubscribe_delay,
            stream_idle_timeout: config.stream_idle_timeout,
        };

        registry.check_access().await?;
        info!(
            "Connected to {} as {}",
            registry.base_url,
            registry.tokens.client_email()
        );
        Ok(registry)
    }

    fn url(&self, key: &str) -> String {
        key_url(&self.base_url, key)
    }

    async fn check_access(&self) -> Result<(), RegistryError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .get(self.url(STARTUP_CHECK_KEY))
            .query(&[("access_token", token.as_str()), ("shallow", "true")])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check_status(response).await.map(|_| ())
    }
}

/// REST URL of `key` under `base_url`
pub fn key_url(base_url: &str, key: &str) -> String {
    let key = key.trim_end_matches('/');
    if key.is_empty() {
        format!("{}/.json", base_url)
    } else if key.starts_with('/') {
        format!("{}{}.json", base_url, key)
    } else {
        format!("{}/{}.json", base_url, key)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(RegistryError::Status { status, body })
}

#[async_trait]
impl Registry for FirebaseRegistry {
    async fn get(&self, key: &str) -> Result<Value, RegistryError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .get(self.url(key))
            .query(&[("access_token", token.as_str())])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| RegistryError::Decode(format!("{}: {}", key, e)))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), RegistryError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .put(self.url(key))
            .query(&[("access_token", token.as_str())])
            .json(&value)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        check_status(response).await?;
        debug!("Wrote {} = {}", key, value);
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> Result<EventStream, RegistryError> {
        info!("Listening for changes on {}", key);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let tokens = Arc::clone(&self.tokens);
        let url = self.url(key);
        let key = key.to_string();
        let delay = self.resubscribe_delay;
        let idle_timeout = self.stream_idle_timeout;

        tokio::spawn(async move {
            loop {
                match stream_once(&client, &url, &tokens, idle_timeout, &tx).await {
                    Ok(StreamEnd::ReceiverDropped) => {
                        debug!("Subscription to {} dropped by consumer", key);
                        return;
                    }
                    Ok(StreamEnd::Reconnect(reason)) => {
                        info!("Subscription to {} ended ({}), reconnecting", key, reason);
                    }
                    Err(e) => {
                        warn!("Subscription to {} failed: {}", key, e);
                    }
                }

                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(delay).await;
            }
        });

        Ok(rx)
    }
}

/// Hold one event-stream request open until it ends
async fn stream_once(
    client: &reqwest::Client,
    url: &str,
    tokens: &TokenSource,
    idle_timeout: Duration,
    tx: &mpsc::Sender<RegistryEvent>,
) -> Result<StreamEnd, RegistryError> {
    let token = tokens.access_token().await?;
    let response = client
        .get(url)
        .query(&[("access_token", token.as_str())])
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await?;
    let response = check_status(response).await?;

    let mut parser = SseParser::new();
    let mut bytes_stream = response.bytes_stream();
    loop {
        let chunk = match tokio::time::timeout(idle_timeout, bytes_stream.next()).await {
            Ok(Some(chunk)) => chunk?,
            Ok(None) => return Ok(StreamEnd::Reconnect("stream closed".to_string())),
            Err(_) => return Ok(StreamEnd::Reconnect("idle timeout".to_string())),
        };
        for frame in parser.push(&chunk) {
            let message = match StreamMessage::from_frame(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Skipping stream frame: {}", e);
                    continue;
                }
            };

            match message {
                StreamMessage::Put(event) | StreamMessage::Patch(event) => {
                    trace!("Stream event at {}: {}", event.path, event.value);
                    if tx.send(event).await.is_err() {
                        return Ok(StreamEnd::ReceiverDropped);
                    }
                }
                StreamMessage::KeepAlive => trace!("Stream keep-alive"),
                StreamMessage::Cancel(reason) => {
                    return Ok(StreamEnd::Reconnect(format!("cancelled: {}", reason)));
                }
                StreamMessage::AuthRevoked => {
                    tokens.invalidate().await;
                    return Ok(StreamEnd::Reconnect("auth revoked".to_string()));
                }
                StreamMessage::Unknown(event) => debug!("Ignoring stream event '{}'", event),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_url() {
        let base = "https://demo-default-rtdb.firebaseio.com";
        assert_eq!(
            key_url(base, "/streamData/localIp"),
            "https://demo-default-rtdb.firebaseio.com/streamData/localIp.json"
        );
        assert_eq!(
            key_url(base, "streamData/isInitialized"),
            "https://demo-default-rtdb.firebaseio.com/streamData/isInitialized.json"
        );
        assert_eq!(key_url(base, "/"), "https://demo-default-rtdb.firebaseio.com/.json");
    }
}
