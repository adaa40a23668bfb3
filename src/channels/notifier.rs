//! Job notifications — what the bus listener tells a conversation.

use async_trait::async_trait;

use crate::conversation::ConversationState;
use crate::error::ChannelError;

/// Delivers job traffic to the conversation that owns the job.
#[async_trait]
pub trait JobNotifier: Send + Sync {
    async fn progress(
        &self,
        state: &ConversationState,
        step: u32,
        total: u32,
        text: &str,
    ) -> Result<(), ChannelError>;

    async fn detail(&self, state: &ConversationState, text: &str) -> Result<(), ChannelError>;

    async fn question(
        &self,
        state: &ConversationState,
        question_id: &str,
        text: &str,
    ) -> Result<(), ChannelError>;

    async fn done(
        &self,
        state: &ConversationState,
        text: &str,
        summary: &str,
        pr_url: Option<&str>,
    ) -> Result<(), ChannelError>;

    async fn error(
        &self,
        state: &ConversationState,
        friendly: &str,
        raw: &str,
    ) -> Result<(), ChannelError>;
}
