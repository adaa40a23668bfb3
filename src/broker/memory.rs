//! In-memory broker with Redis-like stream and TTL semantics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Broker, StreamEntry};
use crate::error::BrokerError;

#[derive(Debug)]
enum Value {
    Text(String),
    Stream(Vec<StreamEntry>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    /// Last issued stream ID; IDs are `<seq>-0` and strictly increasing.
    last_seq: u64,
}

impl Inner {
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let expired = self
            .slots
            .get(key)
            .is_some_and(|slot| slot.expires_at <= Instant::now());
        if expired {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }
}

/// In-memory broker.
///
/// Stream trimming is exact rather than approximate; everything else matches
/// the Redis backend closely enough for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live (non-expired) key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        let mut inner = self.lock();
        inner.live(key).is_some()
    }

    /// Number of entries in a stream (0 if missing).
    pub fn stream_len(&self, key: &str) -> usize {
        let mut inner = self.lock();
        match inner.live(key).map(|slot| &slot.value) {
            Some(Value::Stream(entries)) => entries.len(),
            _ => 0,
        }
    }

    /// Append a raw entry, bypassing field encoding. Used to inject malformed
    /// entries in tests.
    pub fn append_raw(&self, stream: &str, fields: HashMap<String, String>) -> String {
        let mut inner = self.lock();
        inner.last_seq += 1;
        let id = format!("{}-0", inner.last_seq);
        let expires_at = Instant::now() + Duration::from_secs(3600);
        let slot = inner.slots.entry(stream.to_string()).or_insert(Slot {
            value: Value::Stream(Vec::new()),
            expires_at,
        });
        if let Value::Stream(entries) = &mut slot.value {
            entries.push(StreamEntry {
                id: id.clone(),
                fields,
            });
        }
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another test thread panicked mid-update.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_id(id: &str) -> (u64, u64) {
    let (ms, seq) = id.split_once('-').unwrap_or((id, "0"));
    (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0))
}

fn wrong_type(command: &str, key: &str) -> BrokerError {
    BrokerError::Command {
        command: command.to_string(),
        reason: format!("WRONGTYPE key {key} holds the wrong kind of value"),
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: usize,
        ttl: Duration,
    ) -> Result<String, BrokerError> {
        let mut inner = self.lock();
        inner.last_seq += 1;
        let id = format!("{}-0", inner.last_seq);
        let expires_at = Instant::now() + ttl;

        let entry = StreamEntry {
            id: id.clone(),
            fields: fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        };

        let exists = inner.live(stream).is_some();
        if !exists {
            inner.slots.insert(
                stream.to_string(),
                Slot {
                    value: Value::Stream(Vec::new()),
                    expires_at,
                },
            );
        }

        let slot = inner
            .slots
            .get_mut(stream)
            .ok_or_else(|| wrong_type("XADD", stream))?;
        let Value::Stream(entries) = &mut slot.value else {
            return Err(wrong_type("XADD", stream));
        };
        entries.push(entry);
        if entries.len() > max_len {
            let excess = entries.len() - max_len;
            entries.drain(..excess);
        }
        slot.expires_at = expires_at;

        Ok(id)
    }

    async fn read_after(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut inner = self.lock();
        let after = parse_id(after_id);
        match inner.live(stream).map(|slot| &slot.value) {
            None => Ok(Vec::new()),
            Some(Value::Text(_)) => Err(wrong_type("XREAD", stream)),
            Some(Value::Stream(entries)) => Ok(entries
                .iter()
                .filter(|e| parse_id(&e.id) > after)
                .take(count)
                .cloned()
                .collect()),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        inner.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Text(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut inner = self.lock();
        match inner.live(key).map(|slot| &slot.value) {
            None => Ok(None),
            Some(Value::Text(v)) => Ok(Some(v.clone())),
            Some(Value::Stream(_)) => Err(wrong_type("GET", key)),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        for key in keys {
            inner.slots.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn reads_entries_after_position() {
        let broker = MemoryBroker::new();
        let first = broker
            .append("s", &[("n", "1".to_string())], 100, TTL)
            .await
            .unwrap();
        broker
            .append("s", &[("n", "2".to_string())], 100, TTL)
            .await
            .unwrap();

        let all = broker.read_after("s", super::super::STREAM_START, 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let rest = broker.read_after("s", &first, 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].fields["n"], "2");
    }

    #[tokio::test]
    async fn trims_to_max_len() {
        let broker = MemoryBroker::new();
        for i in 0..5 {
            broker
                .append("s", &[("n", i.to_string())], 3, TTL)
                .await
                .unwrap();
        }
        assert_eq!(broker.stream_len("s"), 3);
        let entries = broker.read_after("s", "0-0", 10).await.unwrap();
        assert_eq!(entries[0].fields["n"], "2");
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire() {
        let broker = MemoryBroker::new();
        broker.set("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(broker.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(broker.get("k").await.unwrap().is_none());
        assert!(!broker.contains_key("k"));
    }

    #[tokio::test]
    async fn missing_stream_reads_empty() {
        let broker = MemoryBroker::new();
        assert!(broker.read_after("nope", "0-0", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_type_is_an_error() {
        let broker = MemoryBroker::new();
        broker.set("k", "v", TTL).await.unwrap();
        assert!(broker.read_after("k", "0-0", 10).await.is_err());
    }
}
