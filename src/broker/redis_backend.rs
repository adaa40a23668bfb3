//! Redis broker — streams via XADD/XREAD, records via SET EX.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{info, warn};

use super::{Broker, StreamEntry};
use crate::error::BrokerError;

/// Redis-backed broker.
///
/// Holds a single `ConnectionManager`; clones share the same multiplexed
/// connection and reconnect transparently.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client =
            redis::Client::open(url).map_err(|e| BrokerError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        info!(url = %redact_url(url), "Connected to Redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: usize,
        ttl: Duration,
    ) -> Result<String, BrokerError> {
        let mut conn = self.conn.clone();

        let mut xadd = redis::cmd("XADD");
        xadd.arg(stream).arg("MAXLEN").arg("~").arg(max_len).arg("*");
        for (name, value) in fields {
            xadd.arg(*name).arg(value);
        }

        let (id,): (String,) = redis::pipe()
            .atomic()
            .add_command(xadd)
            .cmd("EXPIRE")
            .arg(stream)
            .arg(ttl.as_secs().max(1))
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(id)
    }

    async fn read_after(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default().count(count);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[after_id], &options)
            .await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = HashMap::with_capacity(id.map.len());
                for (name, value) in &id.map {
                    match redis::from_redis_value::<String>(value) {
                        Ok(v) => {
                            fields.insert(name.clone(), v);
                        }
                        Err(e) => {
                            warn!(stream, entry = %id.id, field = %name, error = %e, "Dropping non-string stream field");
                        }
                    }
                }
                entries.push(StreamEntry { id: id.id, fields });
            }
        }
        Ok(entries)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), BrokerError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }
}

/// Strip credentials from a Redis URL before logging it.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_password() {
        assert_eq!(
            redact_url("redis://:hunter2@cache:6379/0"),
            "redis://***@cache:6379/0"
        );
        assert_eq!(redact_url("redis://cache:6379"), "redis://cache:6379");
    }
}
