//! Conversation state — which job is active in which chat channel.
//!
//! Records live at `conversation:{platform}:{channel}` with a reverse index at
//! `job-index:{jobId}` pointing back to the conversation key. Both carry the
//! bus TTL so a job that dies without a terminal message eventually frees its
//! channel.
//!
//! There is no broker-level lock: callers check `get` before `set`, which is
//! sufficient for a single dispatcher instance.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::error::StateError;
use crate::keys;

/// The active job bound to a chat channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub job_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub platform: String,
    pub project: String,
    pub ticket_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_question_id: Option<String>,
}

impl ConversationState {
    pub fn conversation_key(&self) -> String {
        keys::conversation(&self.platform, &self.channel_id)
    }
}

/// A low-confidence interpretation waiting for the user to confirm it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingClarification {
    /// Canonical command to run if the user confirms.
    pub suggested_text: String,
    pub original_input: String,
    pub user_id: String,
}

/// Broker-backed conversation store.
#[derive(Clone)]
pub struct ConversationStore {
    broker: Arc<dyn Broker>,
    ttl: Duration,
    clarification_ttl: Duration,
}

impl ConversationStore {
    pub fn new(broker: Arc<dyn Broker>, ttl: Duration, clarification_ttl: Duration) -> Self {
        Self {
            broker,
            ttl,
            clarification_ttl,
        }
    }

    /// Store the record for its channel, replacing any existing one, and
    /// write the reverse index.
    pub async fn set(&self, state: &ConversationState) -> Result<(), StateError> {
        self.write_record(state).await?;
        self.index_job(state).await
    }

    /// Write the reverse index entry for a record.
    pub async fn index_job(&self, state: &ConversationState) -> Result<(), StateError> {
        let key = keys::job_index(&state.job_id);
        self.broker
            .set(&key, &state.conversation_key(), self.ttl)
            .await
            .map_err(|source| StateError::Broker { key, source })
    }

    /// Current record for a channel.
    pub async fn get(
        &self,
        platform: &str,
        channel_id: &str,
    ) -> Result<Option<ConversationState>, StateError> {
        self.read_json(&keys::conversation(platform, channel_id))
            .await
    }

    /// Reverse lookup by job ID.
    ///
    /// Returns `None` when the index is missing, or when the channel has since
    /// been taken over by a different job.
    pub async fn get_by_job_id(
        &self,
        job_id: &str,
    ) -> Result<Option<ConversationState>, StateError> {
        let index_key = keys::job_index(job_id);
        let Some(conversation_key) = self.read_raw(&index_key).await? else {
            return Ok(None);
        };

        match self.read_json::<ConversationState>(&conversation_key).await? {
            Some(state) if state.job_id == job_id => Ok(Some(state)),
            Some(state) => {
                debug!(
                    job_id,
                    current_job = %state.job_id,
                    "Channel now belongs to a different job"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Record the question the channel's job is waiting on.
    /// Returns false if the channel has no record.
    pub async fn set_pending_question(
        &self,
        platform: &str,
        channel_id: &str,
        question_id: &str,
    ) -> Result<bool, StateError> {
        let Some(mut state) = self.get(platform, channel_id).await? else {
            warn!(platform, channel_id, question_id, "No conversation to attach question to");
            return Ok(false);
        };
        state.pending_question_id = Some(question_id.to_string());
        // Refresh the index too, or it could expire ahead of the record.
        self.set(&state).await?;
        Ok(true)
    }

    /// Clear the pending question. Returns false if the channel has no record.
    pub async fn clear_pending_question(
        &self,
        platform: &str,
        channel_id: &str,
    ) -> Result<bool, StateError> {
        let Some(mut state) = self.get(platform, channel_id).await? else {
            return Ok(false);
        };
        if state.pending_question_id.take().is_some() {
            self.set(&state).await?;
        }
        Ok(true)
    }

    /// Delete a channel's record and its reverse index entry.
    pub async fn remove(&self, platform: &str, channel_id: &str) -> Result<(), StateError> {
        let key = keys::conversation(platform, channel_id);
        let mut doomed = vec![key.clone()];
        if let Some(state) = self.read_json::<ConversationState>(&key).await? {
            doomed.push(keys::job_index(&state.job_id));
        }
        self.broker
            .delete(&doomed)
            .await
            .map_err(|source| StateError::Broker { key, source })
    }

    /// Cache a clarification prompt for a channel.
    pub async fn set_clarification(
        &self,
        platform: &str,
        channel_id: &str,
        pending: &PendingClarification,
    ) -> Result<(), StateError> {
        let key = keys::clarification(platform, channel_id);
        let json = serde_json::to_string(pending).map_err(|e| StateError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.broker
            .set(&key, &json, self.clarification_ttl)
            .await
            .map_err(|source| StateError::Broker { key, source })
    }

    pub async fn get_clarification(
        &self,
        platform: &str,
        channel_id: &str,
    ) -> Result<Option<PendingClarification>, StateError> {
        self.read_json(&keys::clarification(platform, channel_id))
            .await
    }

    pub async fn clear_clarification(
        &self,
        platform: &str,
        channel_id: &str,
    ) -> Result<(), StateError> {
        let key = keys::clarification(platform, channel_id);
        self.broker
            .delete(std::slice::from_ref(&key))
            .await
            .map_err(|source| StateError::Broker { key, source })
    }

    async fn write_record(&self, state: &ConversationState) -> Result<(), StateError> {
        let key = state.conversation_key();
        let json = serde_json::to_string(state).map_err(|e| StateError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.broker
            .set(&key, &json, self.ttl)
            .await
            .map_err(|source| StateError::Broker { key, source })
    }

    async fn read_raw(&self, key: &str) -> Result<Option<String>, StateError> {
        self.broker
            .get(key)
            .await
            .map_err(|source| StateError::Broker {
                key: key.to_string(),
                source,
            })
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StateError> {
        let Some(raw) = self.read_raw(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StateError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }
}
