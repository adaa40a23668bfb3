//! Test broker that fails a set number of calls before delegating.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{Broker, MemoryBroker, StreamEntry};
use crate::error::BrokerError;

#[derive(Default)]
pub struct FlakyBroker {
    pub inner: MemoryBroker,
    append_failures: AtomicUsize,
    get_failures: Mutex<Option<(String, usize)>>,
}

impl FlakyBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` appends.
    pub fn fail_appends(self, count: usize) -> Self {
        self.append_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` gets of keys starting with `prefix`.
    pub fn fail_gets(self, prefix: &str, count: usize) -> Self {
        *self.get_failures.lock().unwrap() = Some((prefix.to_string(), count));
        self
    }

    fn transient(command: &str) -> BrokerError {
        BrokerError::Connection(format!("transient {command} failure"))
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: usize,
        ttl: Duration,
    ) -> Result<String, BrokerError> {
        let failed = self
            .append_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Self::transient("XADD"));
        }
        self.inner.append(stream, fields, max_len, ttl).await
    }

    async fn read_after(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        self.inner.read_after(stream, after_id, count).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        {
            let mut failures = self.get_failures.lock().unwrap();
            if let Some((prefix, remaining)) = failures.as_mut() {
                if *remaining > 0 && key.starts_with(prefix.as_str()) {
                    *remaining -= 1;
                    return Err(Self::transient("GET"));
                }
            }
        }
        self.inner.get(key).await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), BrokerError> {
        self.inner.delete(keys).await
    }
}
