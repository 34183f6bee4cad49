//! In-memory registry
//!
//! Mirrors the subscription semantics of the realtime database: a subscriber
//! first receives the current value, then one event per write to its key.

use super::{EventStream, Registry, RegistryError, RegistryEvent, EVENT_CHANNEL_CAPACITY};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Registry operation recorded by the journal
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Get(String),
    Set(String, Value),
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Value>,
    subscribers: Vec<(String, mpsc::Sender<RegistryEvent>)>,
    journal: Vec<Operation>,
}

/// Process-local registry
#[derive(Default)]
pub struct InMemoryRegistry {
    inner: Mutex<Inner>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value without journaling or notifying subscribers
    pub fn seed(&self, key: &str, value: Value) {
        self.inner.lock().values.insert(key.to_string(), value);
    }

    /// Current value at `key` without journaling
    pub fn peek(&self, key: &str) -> Value {
        self.inner
            .lock()
            .values
            .get(key)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Every get/set performed through the `Registry` trait, in order
    pub fn journal(&self) -> Vec<Operation> {
        self.inner.lock().journal.clone()
    }

    /// Only the writes from the journal
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.journal()
            .into_iter()
            .filter_map(|op| match op {
                Operation::Set(key, value) => Some((key, value)),
                Operation::Get(_) => None,
            })
            .collect()
    }

    /// Keys read through the `Registry` trait
    pub fn reads(&self) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter_map(|op| match op {
                Operation::Get(key) => Some(key),
                Operation::Set(..) => None,
            })
            .collect()
    }

    /// Write a value as an external client would: notify subscribers, skip the journal
    pub async fn external_set(&self, key: &str, value: Value) {
        let senders = self.store(key, value.clone());
        Self::notify(senders, value).await;
    }

    fn store(&self, key: &str, value: Value) -> Vec<mpsc::Sender<RegistryEvent>> {
        let mut inner = self.inner.lock();
        inner.values.insert(key.to_string(), value);
        inner.subscribers.retain(|(_, tx)| !tx.is_closed());
        inner
            .subscribers
            .iter()
            .filter(|(subscribed, _)| subscribed == key)
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    async fn notify(senders: Vec<mpsc::Sender<RegistryEvent>>, value: Value) {
        for tx in senders {
            // A dropped receiver only means the subscriber went away
            let _ = tx.send(RegistryEvent::new("/", value.clone())).await;
        }
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn get(&self, key: &str) -> Result<Value, RegistryError> {
        let mut inner = self.inner.lock();
        inner.journal.push(Operation::Get(key.to_string()));
        Ok(inner.values.get(key).cloned().unwrap_or(Value::Null))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), RegistryError> {
        self.inner
            .lock()
            .journal
            .push(Operation::Set(key.to_string(), value.clone()));
        let senders = self.store(key, value.clone());
        Self::notify(senders, value).await;
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> Result<EventStream, RegistryError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let current = {
            let mut inner = self.inner.lock();
            inner.subscribers.push((key.to_string(), tx.clone()));
            inner.values.get(key).cloned().unwrap_or(Value::Null)
        };
        tx.send(RegistryEvent::new("/", current))
            .await
            .map_err(|_| RegistryError::Closed)?;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribe_delivers_initial_value() {
        let registry = InMemoryRegistry::new();
        registry.seed("/flag", json!(false));

        let mut events = registry.subscribe("/flag").await.unwrap();
        let first = events.recv().await.unwrap();
        assert_eq!(first, RegistryEvent::new("/", json!(false)));
    }

    #[tokio::test]
    async fn test_set_notifies_only_matching_subscribers() {
        let registry = InMemoryRegistry::new();
        let mut flag = registry.subscribe("/flag").await.unwrap();
        let mut other = registry.subscribe("/other").await.unwrap();

        // Drain initial syncs
        assert_eq!(flag.recv().await.unwrap().value, Value::Null);
        assert_eq!(other.recv().await.unwrap().value, Value::Null);

        registry.set("/flag", json!(true)).await.unwrap();
        assert_eq!(flag.recv().await.unwrap().value, json!(true));
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_journal_skips_external_writes() {
        let registry = InMemoryRegistry::new();
        registry.external_set("/flag", json!(false)).await;
        registry.get("/flag").await.unwrap();
        registry.set("/flag", json!(true)).await.unwrap();

        assert_eq!(
            registry.journal(),
            vec![
                Operation::Get("/flag".to_string()),
                Operation::Set("/flag".to_string(), json!(true)),
            ]
        );
        assert_eq!(registry.peek("/flag"), json!(true));
    }
}
