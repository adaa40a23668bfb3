//! Fix handler — turns a resolved fix request into a running worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::conversation::{ConversationState, ConversationStore};
use crate::error::StateError;
use crate::intent::IntentContext;
use crate::listener::BusListener;
use crate::spawner::{JobSpawner, SpawnRequest};

/// What happened to a fix request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixOutcome {
    Started { job_id: String },
    /// The channel already has a job.
    Busy { job_id: String },
    /// An earlier spawn failed; fixing is off until restart.
    Disabled,
    SpawnFailed { reason: String },
}

impl FixOutcome {
    /// Chat reply for this outcome.
    pub fn reply(&self, ticket_id: &str, project: &str) -> String {
        match self {
            FixOutcome::Started { job_id } => {
                format!("On it: fixing #{ticket_id} in {project} (job {job_id}).")
            }
            FixOutcome::Busy { job_id } => format!(
                "Job {job_id} is still running in this chat. Wait for it to finish before starting another."
            ),
            FixOutcome::Disabled => {
                "Fixing tickets is unavailable: the worker backend failed earlier.".to_string()
            }
            FixOutcome::SpawnFailed { reason } => {
                format!("Couldn't start a worker ({reason}). Fixing is disabled until restart.")
            }
        }
    }
}

pub struct FixHandler {
    /// `None` when no backend could be set up at startup.
    spawner: Option<Arc<dyn JobSpawner>>,
    store: ConversationStore,
    listener: BusListener,
    disabled: AtomicBool,
}

impl FixHandler {
    pub fn new(
        spawner: Arc<dyn JobSpawner>,
        store: ConversationStore,
        listener: BusListener,
    ) -> Self {
        Self {
            spawner: Some(spawner),
            store,
            listener,
            disabled: AtomicBool::new(false),
        }
    }

    /// A handler with no worker backend. Every fix request is refused.
    pub fn disabled(store: ConversationStore, listener: BusListener) -> Self {
        Self {
            spawner: None,
            store,
            listener,
            disabled: AtomicBool::new(true),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Check for a conflicting job, spawn, record state, start relaying.
    pub async fn handle(
        &self,
        ctx: &IntentContext,
        ticket_id: &str,
        project: &str,
    ) -> Result<FixOutcome, StateError> {
        let Some(spawner) = self.spawner.as_ref().filter(|_| !self.is_disabled()) else {
            return Ok(FixOutcome::Disabled);
        };

        if let Some(active) = self.store.get(&ctx.platform, &ctx.channel_id).await? {
            info!(
                channel_id = %ctx.channel_id,
                job_id = %active.job_id,
                "Channel already has an active job"
            );
            return Ok(FixOutcome::Busy {
                job_id: active.job_id,
            });
        }

        let request = SpawnRequest {
            ticket_id: ticket_id.to_string(),
            project: project.to_string(),
            channel_id: ctx.channel_id.clone(),
            user_id: ctx.user_id.clone(),
            platform: ctx.platform.clone(),
        };

        let job_id = match spawner.spawn(&request).await {
            Ok(job_id) => job_id,
            Err(e) => {
                error!(
                    backend = spawner.backend(),
                    error = %e,
                    "Worker spawn failed; disabling fix requests"
                );
                self.disabled.store(true, Ordering::SeqCst);
                return Ok(FixOutcome::SpawnFailed {
                    reason: e.to_string(),
                });
            }
        };

        let state = ConversationState {
            job_id: job_id.clone(),
            channel_id: ctx.channel_id.clone(),
            user_id: ctx.user_id.clone(),
            platform: ctx.platform.clone(),
            project: project.to_string(),
            ticket_id: ticket_id.to_string(),
            started_at: Utc::now(),
            pending_question_id: None,
        };
        let stored = self.store.set(&state).await;

        // Track even without state so the streams still get cleaned up.
        self.listener.track_job(&job_id);

        if let Err(e) = stored {
            warn!(job_id = %job_id, error = %e, "Job started but conversation state was not saved");
            return Err(e);
        }

        info!(
            job_id = %job_id,
            ticket = ticket_id,
            project,
            platform = %ctx.platform,
            channel_id = %ctx.channel_id,
            "Started fix job"
        );
        Ok(FixOutcome::Started { job_id })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::bus::MessageBus;
    use crate::channels::ChannelManager;
    use crate::config::BusConfig;
    use crate::error::SpawnError;

    struct StubSpawner {
        fail: bool,
        requests: Mutex<Vec<SpawnRequest>>,
    }

    #[async_trait]
    impl JobSpawner for StubSpawner {
        fn backend(&self) -> &'static str {
            "stub"
        }

        async fn spawn(&self, request: &SpawnRequest) -> Result<String, SpawnError> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(SpawnError::Unavailable {
                    backend: "stub".into(),
                    reason: "no cluster".into(),
                });
            }
            Ok(format!("job{:05}", self.requests.lock().unwrap().len()))
        }
    }

    fn handler(fail: bool) -> (FixHandler, Arc<StubSpawner>, ConversationStore) {
        let broker = Arc::new(MemoryBroker::new());
        let config = BusConfig::default();
        let bus = MessageBus::new(broker.clone(), config.clone());
        let store = ConversationStore::new(broker, config.key_ttl, config.clarification_ttl);
        let listener = BusListener::new(
            bus,
            store.clone(),
            Arc::new(ChannelManager::new()),
            CancellationToken::new(),
        );
        let spawner = Arc::new(StubSpawner {
            fail,
            requests: Mutex::new(Vec::new()),
        });
        (
            FixHandler::new(spawner.clone(), store.clone(), listener),
            spawner,
            store,
        )
    }

    fn ctx(channel: &str) -> IntentContext {
        IntentContext {
            raw_text: "fix #42 in backend".into(),
            user_id: "u1".into(),
            channel_id: channel.into(),
            platform: "cli".into(),
        }
    }

    #[tokio::test]
    async fn starts_job_and_records_state() {
        let (handler, spawner, store) = handler(false);
        let outcome = handler.handle(&ctx("C1"), "42", "backend").await.unwrap();

        let FixOutcome::Started { job_id } = outcome else {
            panic!("expected Started, got {outcome:?}");
        };
        let state = store.get("cli", "C1").await.unwrap().unwrap();
        assert_eq!(state.job_id, job_id);
        assert_eq!(state.ticket_id, "42");
        assert_eq!(spawner.requests.lock().unwrap()[0].project, "backend");
        assert!(handler.listener.is_tracking(&job_id));
        handler.listener.shutdown().await;
    }

    #[tokio::test]
    async fn second_request_in_same_channel_is_busy() {
        let (handler, spawner, _) = handler(false);
        handler.handle(&ctx("C1"), "42", "backend").await.unwrap();
        let outcome = handler.handle(&ctx("C1"), "43", "backend").await.unwrap();

        assert!(matches!(outcome, FixOutcome::Busy { .. }));
        assert_eq!(spawner.requests.lock().unwrap().len(), 1);

        // Other channels are unaffected.
        let other = handler.handle(&ctx("C2"), "43", "backend").await.unwrap();
        assert!(matches!(other, FixOutcome::Started { .. }));
        handler.listener.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_failure_disables_fixing() {
        let (handler, spawner, store) = handler(true);

        let first = handler.handle(&ctx("C1"), "42", "backend").await.unwrap();
        assert!(matches!(first, FixOutcome::SpawnFailed { .. }));
        assert!(handler.is_disabled());
        assert!(store.get("cli", "C1").await.unwrap().is_none());

        let second = handler.handle(&ctx("C2"), "42", "backend").await.unwrap();
        assert_eq!(second, FixOutcome::Disabled);
        assert_eq!(spawner.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_state_frees_the_channel() {
        let (handler, _, _) = handler(false);
        handler.handle(&ctx("C1"), "42", "backend").await.unwrap();

        tokio::time::advance(Duration::from_secs(2 * 60 * 60 + 1)).await;
        let outcome = handler.handle(&ctx("C1"), "43", "backend").await.unwrap();
        assert!(matches!(outcome, FixOutcome::Started { .. }));
        handler.listener.shutdown().await;
    }

    #[test]
    fn replies_mention_job_and_ticket() {
        let started = FixOutcome::Started {
            job_id: "abcd1234".into(),
        };
        assert_eq!(
            started.reply("42", "backend"),
            "On it: fixing #42 in backend (job abcd1234)."
        );
        assert!(FixOutcome::Busy {
            job_id: "abcd1234".into()
        }
        .reply("42", "backend")
        .contains("abcd1234"));
    }
}
