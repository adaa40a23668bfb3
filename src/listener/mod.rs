//! Bus listener — one background task per running job.
//!
//! Each task subscribes to its job's outbound stream and relays every message
//! to the conversation that owns the job. A terminal message tears the job
//! down: notify, remove conversation state, delete the streams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusMessage, MessageBus};
use crate::channels::JobNotifier;
use crate::conversation::{ConversationState, ConversationStore};
use crate::error::StateError;

/// Lookup attempts for a terminal message before giving up on its state.
const TERMINAL_LOOKUP_ATTEMPTS: u32 = 5;

/// First retry delay for a terminal lookup; doubles each attempt.
const TERMINAL_LOOKUP_BACKOFF: Duration = Duration::from_millis(100);

/// Running subscription tasks keyed by job ID.
type TaskTable = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// Fans job traffic out to chat conversations.
#[derive(Clone)]
pub struct BusListener {
    bus: MessageBus,
    store: ConversationStore,
    notifier: Arc<dyn JobNotifier>,
    tasks: TaskTable,
    cancel: CancellationToken,
}

impl BusListener {
    pub fn new(
        bus: MessageBus,
        store: ConversationStore,
        notifier: Arc<dyn JobNotifier>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            store,
            notifier,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            cancel,
        }
    }

    /// Start relaying a job's messages. Tracking an already-tracked job that
    /// is still running is a warning no-op.
    pub fn track_job(&self, job_id: &str) {
        let mut tasks = lock(&self.tasks);
        if let Some(existing) = tasks.get(job_id) {
            if !existing.is_finished() {
                warn!(job_id, "Job is already tracked");
                return;
            }
        }

        let relay = JobRelay {
            job_id: job_id.to_string(),
            bus: self.bus.clone(),
            store: self.store.clone(),
            notifier: Arc::clone(&self.notifier),
        };
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(relay.run(cancel));
        tasks.insert(job_id.to_string(), handle);
        info!(job_id, "Tracking job");
    }

    /// Number of table entries, finished or not.
    pub fn tracked_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_tracking(&self, job_id: &str) -> bool {
        lock(&self.tasks)
            .get(job_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Drop handles of tasks that have finished. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut tasks = lock(&self.tasks);
        let before = tasks.len();
        tasks.retain(|_, handle| !handle.is_finished());
        let removed = before - tasks.len();
        if removed > 0 {
            debug!(removed, remaining = tasks.len(), "Swept finished job tasks");
        }
        removed
    }

    /// Sweep periodically until shutdown.
    pub fn spawn_sweep_task(&self, interval: Duration) -> JoinHandle<()> {
        let listener = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = listener.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        listener.sweep();
                    }
                }
            }
        })
    }

    /// Cancel every subscription and wait for the tasks to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<(String, JoinHandle<()>)> = lock(&self.tasks).drain().collect();
        let count = handles.len();
        for (job_id, handle) in handles {
            if let Err(e) = handle.await {
                warn!(job_id = %job_id, error = %e, "Job task ended abnormally");
            }
        }
        info!(stopped = count, "Bus listener stopped");
    }
}

fn lock(tasks: &TaskTable) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
    // A panic while holding the lock leaves the map itself intact.
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything one job's task needs.
struct JobRelay {
    job_id: String,
    bus: MessageBus,
    store: ConversationStore,
    notifier: Arc<dyn JobNotifier>,
}

impl JobRelay {
    async fn run(self, cancel: CancellationToken) {
        let mut stream = self.bus.subscribe(&self.job_id, cancel.clone());
        while let Some(message) = stream.next().await {
            self.handle(message, &cancel).await;
        }
        debug!(job_id = %self.job_id, "Job subscription ended");
    }

    async fn handle(&self, message: BusMessage, cancel: &CancellationToken) {
        let state = match self.lookup_state(&message, cancel).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                warn!(
                    job_id = %self.job_id,
                    kind = message.type_name(),
                    "No conversation for job; dropping message"
                );
                if message.is_terminal() {
                    self.cleanup_streams().await;
                }
                return;
            }
            Err(e) if message.is_terminal() => {
                error!(
                    job_id = %self.job_id,
                    error = %e,
                    "Conversation lookup failed for final message; deleting streams only"
                );
                self.cleanup_streams().await;
                return;
            }
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Conversation lookup failed; dropping message");
                return;
            }
        };

        match message {
            BusMessage::Progress {
                text, step, total, ..
            } => {
                if let Err(e) = self.notifier.progress(&state, step, total, &text).await {
                    warn!(job_id = %self.job_id, error = %e, "Failed to deliver progress");
                }
            }
            BusMessage::Detail { text, .. } => {
                if let Err(e) = self.notifier.detail(&state, &text).await {
                    warn!(job_id = %self.job_id, error = %e, "Failed to deliver detail");
                }
            }
            BusMessage::Question {
                text, question_id, ..
            } => {
                if let Err(e) = self.notifier.question(&state, &question_id, &text).await {
                    warn!(job_id = %self.job_id, error = %e, "Failed to deliver question");
                }
                if let Err(e) = self
                    .store
                    .set_pending_question(&state.platform, &state.channel_id, &question_id)
                    .await
                {
                    warn!(job_id = %self.job_id, error = %e, "Failed to record pending question");
                }
            }
            BusMessage::Done {
                text,
                summary,
                pr_url,
                ..
            } => {
                if let Err(e) = self
                    .notifier
                    .done(&state, &text, &summary, pr_url.as_deref())
                    .await
                {
                    warn!(job_id = %self.job_id, error = %e, "Failed to deliver completion");
                }
                info!(job_id = %self.job_id, pr_url = ?pr_url, "Job finished");
                self.finish(&state).await;
            }
            BusMessage::Error {
                text,
                step,
                total,
                step_name,
                ..
            } => {
                let friendly = friendly_error(step, total, step_name.as_deref());
                if let Err(e) = self.notifier.error(&state, &friendly, &text).await {
                    warn!(job_id = %self.job_id, error = %e, "Failed to deliver error");
                }
                warn!(job_id = %self.job_id, error = %text, "Job failed");
                self.finish(&state).await;
            }
            BusMessage::Answer { .. } => {
                debug!(job_id = %self.job_id, "Ignoring answer on outbound stream");
            }
        }
    }

    /// Resolve the job's conversation. A terminal message is the last chance
    /// to tear the job down, so its lookup is retried with backoff.
    async fn lookup_state(
        &self,
        message: &BusMessage,
        cancel: &CancellationToken,
    ) -> Result<Option<ConversationState>, StateError> {
        let attempts = if message.is_terminal() {
            TERMINAL_LOOKUP_ATTEMPTS
        } else {
            1
        };
        let mut delay = TERMINAL_LOOKUP_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.store.get_by_job_id(&self.job_id).await {
                Err(e) if attempt < attempts => {
                    warn!(job_id = %self.job_id, attempt, error = %e, "Conversation lookup failed; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn finish(&self, state: &ConversationState) {
        if let Err(e) = self.store.remove(&state.platform, &state.channel_id).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to remove conversation state");
        }
        self.cleanup_streams().await;
    }

    async fn cleanup_streams(&self) {
        if let Err(e) = self.bus.cleanup(&self.job_id).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to delete job streams");
        }
    }
}

/// Human-readable failure line for an Error message.
fn friendly_error(step: Option<u32>, total: Option<u32>, step_name: Option<&str>) -> String {
    let step_name = step_name.filter(|s| !s.is_empty());
    match (step, total, step_name) {
        (Some(step), Some(total), Some(name)) => {
            format!("The job failed at step {step}/{total} ({name}).")
        }
        (Some(step), Some(total), None) => format!("The job failed at step {step}/{total}."),
        (_, _, Some(name)) => format!("The job failed while {name}."),
        _ => "The job failed.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::broker::{FlakyBroker, MemoryBroker};
    use crate::config::BusConfig;
    use crate::error::ChannelError;

    /// Notifier that records each call as a short string.
    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) -> Result<(), ChannelError> {
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    #[async_trait]
    impl JobNotifier for RecordingNotifier {
        async fn progress(
            &self,
            _: &ConversationState,
            step: u32,
            total: u32,
            text: &str,
        ) -> Result<(), ChannelError> {
            self.record(format!("progress {step}/{total} {text}"))
        }

        async fn detail(&self, _: &ConversationState, text: &str) -> Result<(), ChannelError> {
            self.record(format!("detail {text}"))
        }

        async fn question(
            &self,
            _: &ConversationState,
            question_id: &str,
            text: &str,
        ) -> Result<(), ChannelError> {
            self.record(format!("question {question_id} {text}"))
        }

        async fn done(
            &self,
            _: &ConversationState,
            text: &str,
            _: &str,
            _: Option<&str>,
        ) -> Result<(), ChannelError> {
            self.record(format!("done {text}"))
        }

        async fn error(
            &self,
            _: &ConversationState,
            friendly: &str,
            raw: &str,
        ) -> Result<(), ChannelError> {
            self.record(format!("error {friendly} | {raw}"))
        }
    }

    struct Harness {
        broker: Arc<MemoryBroker>,
        bus: MessageBus,
        store: ConversationStore,
        notifier: Arc<RecordingNotifier>,
        listener: BusListener,
    }

    fn harness() -> Harness {
        let broker = Arc::new(MemoryBroker::new());
        let config = BusConfig {
            poll_interval: Duration::from_millis(5),
            ..BusConfig::default()
        };
        let bus = MessageBus::new(broker.clone(), config.clone());
        let store = ConversationStore::new(broker.clone(), config.key_ttl, config.clarification_ttl);
        let notifier = Arc::new(RecordingNotifier::default());
        let listener = BusListener::new(
            bus.clone(),
            store.clone(),
            notifier.clone(),
            CancellationToken::new(),
        );
        Harness {
            broker,
            bus,
            store,
            notifier,
            listener,
        }
    }

    fn state(job_id: &str) -> ConversationState {
        ConversationState {
            job_id: job_id.into(),
            channel_id: "C1".into(),
            user_id: "u1".into(),
            platform: "cli".into(),
            project: "backend".into(),
            ticket_id: "42".into(),
            started_at: Utc::now(),
            pending_question_id: None,
        }
    }

    fn progress(job_id: &str, step: u32) -> BusMessage {
        BusMessage::Progress {
            job_id: job_id.into(),
            text: format!("step {step}"),
            step,
            total: 5,
        }
    }

    async fn wait_until_idle(listener: &BusListener, job_id: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while listener.is_tracking(job_id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job task should finish");
    }

    #[tokio::test]
    async fn relays_progress_then_done_and_tears_down() {
        let h = harness();
        h.store.set(&state("j1")).await.unwrap();
        h.bus.publish(&progress("j1", 1)).await.unwrap();
        h.bus.publish(&progress("j1", 2)).await.unwrap();
        h.bus
            .publish(&BusMessage::Done {
                job_id: "j1".into(),
                text: "PR created".into(),
                summary: String::new(),
                pr_url: None,
            })
            .await
            .unwrap();

        h.listener.track_job("j1");
        wait_until_idle(&h.listener, "j1").await;

        assert_eq!(
            h.notifier.calls(),
            vec!["progress 1/5 step 1", "progress 2/5 step 2", "done PR created"]
        );
        assert!(h.store.get("cli", "C1").await.unwrap().is_none());
        assert!(!h.broker.contains_key("job-index:j1"));
        assert!(!h.broker.contains_key("job:j1:out"));
    }

    #[tokio::test]
    async fn question_sets_pending_question() {
        let h = harness();
        h.store.set(&state("j1")).await.unwrap();
        h.listener.track_job("j1");

        h.bus
            .publish(&BusMessage::Question {
                job_id: "j1".into(),
                text: "Open a PR?".into(),
                question_id: "q-1".into(),
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let current = h.store.get("cli", "C1").await.unwrap().unwrap();
                if current.pending_question_id.is_some() {
                    break current;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pending question should be recorded");

        assert_eq!(h.notifier.calls(), vec!["question q-1 Open a PR?"]);
        h.listener.shutdown().await;
    }

    #[tokio::test]
    async fn error_message_gets_friendly_text() {
        let h = harness();
        h.store.set(&state("j1")).await.unwrap();
        h.bus
            .publish(&BusMessage::Error {
                job_id: "j1".into(),
                text: "cargo test failed".into(),
                step: Some(3),
                total: Some(5),
                step_name: Some("running tests".into()),
            })
            .await
            .unwrap();

        h.listener.track_job("j1");
        wait_until_idle(&h.listener, "j1").await;

        assert_eq!(
            h.notifier.calls(),
            vec!["error The job failed at step 3/5 (running tests). | cargo test failed"]
        );
        assert!(h.store.get("cli", "C1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphaned_messages_are_dropped() {
        let h = harness();
        h.bus.publish(&progress("ghost", 1)).await.unwrap();
        h.bus
            .publish(&BusMessage::Done {
                job_id: "ghost".into(),
                text: "done".into(),
                summary: String::new(),
                pr_url: None,
            })
            .await
            .unwrap();

        h.listener.track_job("ghost");
        wait_until_idle(&h.listener, "ghost").await;

        assert!(h.notifier.calls().is_empty());
        assert!(!h.broker.contains_key("job:ghost:out"));
    }

    #[tokio::test]
    async fn duplicate_tracking_is_a_noop() {
        let h = harness();
        h.listener.track_job("j1");
        h.listener.track_job("j1");
        assert_eq!(h.listener.tracked_count(), 1);
        h.listener.shutdown().await;
        assert_eq!(h.listener.tracked_count(), 0);
    }

    #[tokio::test]
    async fn sweep_removes_finished_tasks() {
        let h = harness();
        h.store.set(&state("j1")).await.unwrap();
        h.bus
            .publish(&BusMessage::Done {
                job_id: "j1".into(),
                text: "ok".into(),
                summary: String::new(),
                pr_url: None,
            })
            .await
            .unwrap();
        h.listener.track_job("j1");
        h.listener.track_job("j2");
        wait_until_idle(&h.listener, "j1").await;

        assert_eq!(h.listener.sweep(), 1);
        assert_eq!(h.listener.tracked_count(), 1);
        assert!(h.listener.is_tracking("j2"));
        h.listener.shutdown().await;
    }

    #[test]
    fn friendly_error_variants() {
        assert_eq!(
            friendly_error(Some(2), Some(4), Some("cloning")),
            "The job failed at step 2/4 (cloning)."
        );
        assert_eq!(friendly_error(Some(2), Some(4), None), "The job failed at step 2/4.");
        assert_eq!(friendly_error(None, None, Some("cloning")), "The job failed while cloning.");
        assert_eq!(friendly_error(None, None, Some("")), "The job failed.");
    }

    #[tokio::test]
    async fn final_message_survives_a_failed_state_lookup() {
        let broker = Arc::new(FlakyBroker::new().fail_gets("job-index:", 1));
        let config = BusConfig {
            poll_interval: Duration::from_millis(5),
            ..BusConfig::default()
        };
        let bus = MessageBus::new(broker.clone(), config.clone());
        let store = ConversationStore::new(broker.clone(), config.key_ttl, config.clarification_ttl);
        let notifier = Arc::new(RecordingNotifier::default());
        let listener = BusListener::new(
            bus.clone(),
            store.clone(),
            notifier.clone(),
            CancellationToken::new(),
        );

        store.set(&state("j1")).await.unwrap();
        bus.publish(&BusMessage::Done {
            job_id: "j1".into(),
            text: "PR created".into(),
            summary: String::new(),
            pr_url: None,
        })
        .await
        .unwrap();

        listener.track_job("j1");
        wait_until_idle(&listener, "j1").await;

        assert_eq!(notifier.calls(), vec!["done PR created"]);
        assert!(store.get("cli", "C1").await.unwrap().is_none());
        assert!(!broker.inner.contains_key("job:j1:out"));
    }
}
