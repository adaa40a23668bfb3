//! Channel trait and message types.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use uuid::Uuid;

use crate::error::ChannelError;

/// A chat message received from a platform.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: Uuid,
    /// Platform name ("telegram", "cli", ...).
    pub platform: String,
    /// Conversation the message arrived in.
    pub channel_id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub content: String,
    /// Platform-specific extras (e.g. the question a button press answers).
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(
        platform: impl Into<String>,
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            platform: platform.into(),
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            user_name: None,
            content: content.into(),
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Question ID carried by an interactive answer (button press), if any.
    pub fn answered_question_id(&self) -> Option<&str> {
        self.metadata.get("question_id").and_then(|v| v.as_str())
    }
}

/// Stream of inbound messages from one channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A chat platform adapter.
///
/// `start` and `send_message` are required; the job-notification methods
/// default to plain-text renderings through `send_message`.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Platform name; used as the `platform` component of state keys.
    fn name(&self) -> &str;

    /// Begin receiving messages.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Send plain text to a conversation.
    async fn send_message(&self, channel_id: &str, text: &str) -> Result<(), ChannelError>;

    async fn send_progress(
        &self,
        channel_id: &str,
        step: u32,
        total: u32,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.send_message(channel_id, &format!("[{step}/{total}] {text}"))
            .await
    }

    /// Low-priority detail line; silent unless a platform opts in.
    async fn send_detail(&self, _channel_id: &str, _text: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Ask an interactive question the human can answer.
    async fn send_question(
        &self,
        channel_id: &str,
        _question_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.send_message(channel_id, &format!("{text}\n(reply yes or no)"))
            .await
    }

    async fn send_done(
        &self,
        channel_id: &str,
        text: &str,
        summary: &str,
        pr_url: Option<&str>,
    ) -> Result<(), ChannelError> {
        let mut message = format!("Done: {text}");
        if !summary.is_empty() {
            message.push_str(&format!("\n{summary}"));
        }
        if let Some(url) = pr_url {
            message.push_str(&format!("\n{url}"));
        }
        self.send_message(channel_id, &message).await
    }

    /// Report a failure. `friendly` is for humans; `raw` is the worker's text.
    async fn send_error(
        &self,
        channel_id: &str,
        friendly: &str,
        raw: &str,
    ) -> Result<(), ChannelError> {
        let message = if raw.is_empty() || friendly.contains(raw) {
            friendly.to_string()
        } else {
            format!("{friendly}\n> {raw}")
        };
        self.send_message(channel_id, &message).await
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answered_question_id_from_metadata() {
        let msg = IncomingMessage::new("telegram", "-100", "7", "yes")
            .with_metadata(serde_json::json!({ "question_id": "q-1" }));
        assert_eq!(msg.answered_question_id(), Some("q-1"));

        let plain = IncomingMessage::new("cli", "local", "me", "yes");
        assert_eq!(plain.answered_question_id(), None);
    }
}
