//! Message bus — two append-only streams per job.
//!
//! - `job:{id}:out` — worker → dispatcher (progress, questions, terminal messages)
//! - `job:{id}:in` — dispatcher → worker (answers)
//!
//! Reads poll at a fixed interval instead of blocking on the broker, so every
//! wait goes through a cancellable `tokio::select!`. Delivery is at-least-once;
//! consumers must tolerate a duplicate after a restart.

mod message;

pub use message::{BusMessage, DecodeError};

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{Broker, STREAM_START, StreamEntry};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::keys;

/// Maximum entries fetched per poll.
const READ_BATCH: usize = 100;

/// Stream of messages from one job's outbound stream.
pub type BusStream = Pin<Box<dyn Stream<Item = BusMessage> + Send>>;

/// Bidirectional per-job message bus.
#[derive(Clone)]
pub struct MessageBus {
    broker: Arc<dyn Broker>,
    config: BusConfig,
}

impl MessageBus {
    pub fn new(broker: Arc<dyn Broker>, config: BusConfig) -> Self {
        Self { broker, config }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Append a message to its job's outbound stream.
    pub async fn publish(&self, message: &BusMessage) -> Result<String, BusError> {
        let stream = keys::outbound_stream(message.job_id());
        self.append(&stream, message).await
    }

    /// Append an answer to a job's inbound stream.
    pub async fn publish_answer(
        &self,
        job_id: &str,
        question_id: &str,
        content: &str,
    ) -> Result<String, BusError> {
        let answer = BusMessage::Answer {
            job_id: job_id.to_string(),
            text: String::new(),
            question_id: question_id.to_string(),
            content: content.to_string(),
        };
        let stream = keys::inbound_stream(job_id);
        self.append(&stream, &answer).await
    }

    async fn append(&self, stream: &str, message: &BusMessage) -> Result<String, BusError> {
        let id = self
            .broker
            .append(
                stream,
                &message.to_fields(),
                self.config.stream_max_len,
                self.config.key_ttl,
            )
            .await
            .map_err(|source| BusError::Publish {
                stream: stream.to_string(),
                source,
            })?;

        debug!(
            stream,
            entry = %id,
            kind = message.type_name(),
            "Published bus message"
        );
        Ok(id)
    }

    /// Subscribe to a job's outbound stream from its first entry.
    ///
    /// The stream ends right after yielding a Done or Error message, or when
    /// `cancel` fires. Broker read errors are logged and retried on the next
    /// poll; undecodable entries are skipped.
    pub fn subscribe(&self, job_id: &str, cancel: CancellationToken) -> BusStream {
        let state = Subscription {
            broker: Arc::clone(&self.broker),
            stream: keys::outbound_stream(job_id),
            cursor: STREAM_START.to_string(),
            buffered: VecDeque::new(),
            finished: false,
            poll_interval: self.config.poll_interval,
            cancel,
        };

        Box::pin(futures::stream::unfold(state, |mut state| async move {
            state.next_message().await.map(|msg| (msg, state))
        }))
    }

    /// Wait for an answer on a job's inbound stream.
    ///
    /// Returns the first Answer (matching `question_id` when given), or `None`
    /// once `timeout` has elapsed or `cancel` fires, whichever comes first.
    pub async fn read_answer(
        &self,
        job_id: &str,
        question_id: Option<&str>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<BusMessage> {
        let stream = keys::inbound_stream(job_id);
        let deadline = Instant::now() + timeout;
        let mut cursor = STREAM_START.to_string();

        loop {
            match self.broker.read_after(&stream, &cursor, READ_BATCH).await {
                Ok(entries) => {
                    for entry in entries {
                        cursor.clone_from(&entry.id);
                        let Some(message) = decode_entry(&stream, &entry) else {
                            continue;
                        };
                        if let BusMessage::Answer {
                            question_id: ref qid,
                            ..
                        } = message
                        {
                            if question_id.is_none_or(|wanted| wanted == qid.as_str()) {
                                return Some(message);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(stream = %stream, error = %e, "Answer poll failed");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(job_id, ?timeout, "No answer before timeout");
                return None;
            }
            let wait = self.config.poll_interval.min(deadline - now);

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Delete both of a job's streams.
    pub async fn cleanup(&self, job_id: &str) -> Result<(), BusError> {
        self.broker
            .delete(&[keys::outbound_stream(job_id), keys::inbound_stream(job_id)])
            .await
            .map_err(|source| BusError::Cleanup {
                job_id: job_id.to_string(),
                source,
            })?;
        debug!(job_id, "Deleted job streams");
        Ok(())
    }
}

/// Poll state for one outbound-stream subscription.
struct Subscription {
    broker: Arc<dyn Broker>,
    stream: String,
    cursor: String,
    buffered: VecDeque<BusMessage>,
    finished: bool,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl Subscription {
    async fn next_message(&mut self) -> Option<BusMessage> {
        loop {
            if self.finished || self.cancel.is_cancelled() {
                return None;
            }

            if let Some(message) = self.buffered.pop_front() {
                if message.is_terminal() {
                    self.finished = true;
                    self.buffered.clear();
                }
                return Some(message);
            }

            match self
                .broker
                .read_after(&self.stream, &self.cursor, READ_BATCH)
                .await
            {
                Ok(entries) => {
                    for entry in &entries {
                        self.cursor.clone_from(&entry.id);
                        if let Some(message) = decode_entry(&self.stream, entry) {
                            self.buffered.push_back(message);
                        }
                    }
                    if !self.buffered.is_empty() {
                        continue;
                    }
                }
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "Stream poll failed");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

fn decode_entry(stream: &str, entry: &StreamEntry) -> Option<BusMessage> {
    match BusMessage::from_fields(&entry.fields) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(stream, entry = %entry.id, error = %e, "Skipping malformed stream entry");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use futures::StreamExt;

    use super::*;
    use crate::broker::MemoryBroker;

    fn test_bus() -> (MessageBus, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new());
        let config = BusConfig {
            poll_interval: Duration::from_millis(10),
            ..BusConfig::default()
        };
        (MessageBus::new(broker.clone(), config), broker)
    }

    fn progress(job_id: &str, step: u32) -> BusMessage {
        BusMessage::Progress {
            job_id: job_id.into(),
            text: format!("step {step}"),
            step,
            total: 5,
        }
    }

    fn done(job_id: &str) -> BusMessage {
        BusMessage::Done {
            job_id: job_id.into(),
            text: "PR created".into(),
            summary: String::new(),
            pr_url: None,
        }
    }

    #[tokio::test]
    async fn subscription_ends_after_terminal_message() {
        let (bus, _) = test_bus();
        bus.publish(&progress("j1", 1)).await.unwrap();
        bus.publish(&done("j1")).await.unwrap();
        // Never delivered: written after the terminal message.
        bus.publish(&progress("j1", 2)).await.unwrap();

        let received: Vec<BusMessage> = bus
            .subscribe("j1", CancellationToken::new())
            .collect()
            .await;

        assert_eq!(received, vec![progress("j1", 1), done("j1")]);
    }

    #[tokio::test]
    async fn subscription_waits_for_late_messages() {
        let (bus, _) = test_bus();
        let mut stream = bus.subscribe("j1", CancellationToken::new());

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            publisher.publish(&progress("j1", 1)).await.unwrap();
            publisher.publish(&done("j1")).await.unwrap();
        });

        assert_eq!(stream.next().await, Some(progress("j1", 1)));
        assert_eq!(stream.next().await, Some(done("j1")));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn subscription_skips_malformed_entries() {
        let (bus, broker) = test_bus();
        let mut garbage = HashMap::new();
        garbage.insert("type".to_string(), "progress".to_string());
        broker.append_raw("job:j1:out", garbage);
        bus.publish(&done("j1")).await.unwrap();

        let received: Vec<BusMessage> = bus
            .subscribe("j1", CancellationToken::new())
            .collect()
            .await;
        assert_eq!(received, vec![done("j1")]);
    }

    #[tokio::test]
    async fn error_with_bad_step_still_ends_subscription() {
        let (bus, broker) = test_bus();
        let mut fields = HashMap::new();
        fields.insert("type".to_string(), "error".to_string());
        fields.insert("jobId".to_string(), "j1".to_string());
        fields.insert("text".to_string(), "crashed".to_string());
        fields.insert("step".to_string(), "n/a".to_string());
        broker.append_raw("job:j1:out", fields);

        let received = tokio::time::timeout(
            Duration::from_secs(2),
            bus.subscribe("j1", CancellationToken::new()).collect::<Vec<_>>(),
        )
        .await
        .expect("subscription should end on the error entry");
        assert_eq!(received.len(), 1);
        assert!(received[0].is_terminal());
    }

    #[tokio::test]
    async fn cancellation_stops_an_idle_subscription() {
        let (bus, _) = test_bus();
        let cancel = CancellationToken::new();
        let mut stream = bus.subscribe("idle", cancel.clone());

        cancel.cancel();
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("subscription should stop promptly");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn read_answer_returns_matching_answer() {
        let (bus, _) = test_bus();
        bus.publish_answer("j1", "q-old", "no").await.unwrap();
        bus.publish_answer("j1", "q-2", "yes").await.unwrap();

        let answer = bus
            .read_answer("j1", Some("q-2"), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(answer, BusMessage::Answer { ref content, .. } if content == "yes"));
    }

    #[tokio::test(start_paused = true)]
    async fn read_answer_times_out_after_deadline() {
        let (bus, _) = test_bus();
        let started = Instant::now();

        let answer = bus
            .read_answer("j1", None, Duration::from_secs(120), &CancellationToken::new())
            .await;

        assert!(answer.is_none());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(120));
        assert!(waited < Duration::from_secs(121));
    }

    #[tokio::test]
    async fn read_answer_honours_cancellation() {
        let (bus, _) = test_bus();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let answer = tokio::time::timeout(
            Duration::from_secs(1),
            bus.read_answer("j1", None, Duration::from_secs(600), &cancel),
        )
        .await
        .expect("cancelled wait should return immediately");
        assert!(answer.is_none());
    }

    #[tokio::test]
    async fn cleanup_removes_both_streams() {
        let (bus, broker) = test_bus();
        bus.publish(&progress("j1", 1)).await.unwrap();
        bus.publish_answer("j1", "q", "yes").await.unwrap();
        assert!(broker.contains_key("job:j1:out"));
        assert!(broker.contains_key("job:j1:in"));

        bus.cleanup("j1").await.unwrap();
        assert!(!broker.contains_key("job:j1:out"));
        assert!(!broker.contains_key("job:j1:in"));
    }
}
