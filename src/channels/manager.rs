//! Channel manager — owns every channel and routes by platform name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::SelectAll;
use tracing::{info, warn};

use super::{Channel, JobNotifier, MessageStream};
use crate::conversation::ConversationState;
use crate::error::ChannelError;

/// Registry of active channels keyed by platform.
#[derive(Default)]
pub struct ChannelManager {
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. A later channel with the same name replaces the
    /// earlier one.
    pub fn add(&mut self, channel: Box<dyn Channel>) {
        let channel: Arc<dyn Channel> = Arc::from(channel);
        let name = channel.name().to_string();
        if self.channels.insert(name.clone(), channel).is_some() {
            warn!(platform = %name, "Replaced existing channel");
        }
    }

    pub fn get(&self, platform: &str) -> Result<&Arc<dyn Channel>, ChannelError> {
        self.channels
            .get(platform)
            .ok_or_else(|| ChannelError::UnknownPlatform(platform.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start every channel and merge their inbound streams.
    /// A channel that fails to start is logged and skipped.
    pub async fn start_all(&self) -> Result<MessageStream, ChannelError> {
        let mut merged = SelectAll::new();
        for (name, channel) in &self.channels {
            match channel.start().await {
                Ok(stream) => {
                    info!(platform = %name, "Channel started");
                    merged.push(stream);
                }
                Err(e) => warn!(platform = %name, error = %e, "Channel failed to start"),
            }
        }
        if merged.is_empty() {
            return Err(ChannelError::StartupFailed {
                name: "all".into(),
                reason: "no channel started".into(),
            });
        }
        Ok(Box::pin(merged))
    }

    /// Send plain text to a conversation on a platform.
    pub async fn send_message(
        &self,
        platform: &str,
        channel_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.get(platform)?.send_message(channel_id, text).await
    }

    pub async fn shutdown_all(&self) {
        for (name, channel) in &self.channels {
            if let Err(e) = channel.shutdown().await {
                warn!(platform = %name, error = %e, "Channel shutdown failed");
            }
        }
    }
}

#[async_trait]
impl JobNotifier for ChannelManager {
    async fn progress(
        &self,
        state: &ConversationState,
        step: u32,
        total: u32,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.get(&state.platform)?
            .send_progress(&state.channel_id, step, total, text)
            .await
    }

    async fn detail(&self, state: &ConversationState, text: &str) -> Result<(), ChannelError> {
        self.get(&state.platform)?
            .send_detail(&state.channel_id, text)
            .await
    }

    async fn question(
        &self,
        state: &ConversationState,
        question_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.get(&state.platform)?
            .send_question(&state.channel_id, question_id, text)
            .await
    }

    async fn done(
        &self,
        state: &ConversationState,
        text: &str,
        summary: &str,
        pr_url: Option<&str>,
    ) -> Result<(), ChannelError> {
        self.get(&state.platform)?
            .send_done(&state.channel_id, text, summary, pr_url)
            .await
    }

    async fn error(
        &self,
        state: &ConversationState,
        friendly: &str,
        raw: &str,
    ) -> Result<(), ChannelError> {
        self.get(&state.platform)?
            .send_error(&state.channel_id, friendly, raw)
            .await
    }
}
