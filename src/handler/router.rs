//! Router — decides what to do with each inbound chat message.
//!
//! In order:
//! 1. A pending worker question in the channel takes the text as its answer.
//! 2. A cached clarification is confirmed ("yes") or dropped ("no").
//! 3. Otherwise the text goes through the intent engine.

use std::sync::Arc;

use futures::StreamExt;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fix::FixHandler;
use crate::bus::MessageBus;
use crate::channels::{ChannelManager, IncomingMessage, MessageStream};
use crate::conversation::{ConversationStore, PendingClarification};
use crate::error::Result;
use crate::intent::{ChatIntent, IntentContext, IntentEngine};
use crate::tickets::{TicketSources, format_ticket_list};
use crate::worker::parse_yes_no;

const HELP_TEXT: &str = "I can start a coding agent on a ticket and relay its progress here.\n\n\
    • fix #42 in backend: work on ticket 42\n\
    • #42: same, if only one project has ticket 42\n\
    • list tickets [in project]\n\
    • create ticket 'title' [in project ['description']]\n\n\
    When the agent asks a question, just reply here.";

const GREETING_TEXT: &str = "Hi! Send \"help\" to see what I can do.";

const UNKNOWN_TEXT: &str = "Sorry, I didn't understand that. Send \"help\" for the commands I know.";

pub struct Router {
    engine: IntentEngine,
    fix: FixHandler,
    store: ConversationStore,
    bus: MessageBus,
    tickets: TicketSources,
}

impl Router {
    pub fn new(
        engine: IntentEngine,
        fix: FixHandler,
        store: ConversationStore,
        bus: MessageBus,
        tickets: TicketSources,
    ) -> Self {
        Self {
            engine,
            fix,
            store,
            bus,
            tickets,
        }
    }

    /// Route messages until the stream ends or `cancel` fires.
    pub async fn run(
        &self,
        mut messages: MessageStream,
        channels: Arc<ChannelManager>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                next = messages.next() => match next {
                    Some(message) => message,
                    None => {
                        info!("All channels closed");
                        break;
                    }
                },
            };

            let Some(reply) = self.handle_message(&message).await else {
                continue;
            };
            if let Err(e) = channels
                .send_message(&message.platform, &message.channel_id, &reply)
                .await
            {
                warn!(platform = %message.platform, error = %e, "Failed to send reply");
            }
        }
    }

    /// Handle one message and return the reply, if any. Failures become an
    /// apology so the user is never left without an answer.
    pub async fn handle_message(&self, message: &IncomingMessage) -> Option<String> {
        debug!(
            platform = %message.platform,
            channel_id = %message.channel_id,
            user_id = %message.user_id,
            "Routing message"
        );
        match self.route(message).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(
                    platform = %message.platform,
                    channel_id = %message.channel_id,
                    error = %e,
                    "Failed to handle message"
                );
                Some("Something went wrong handling that. Please try again.".to_string())
            }
        }
    }

    async fn route(&self, message: &IncomingMessage) -> Result<Option<String>> {
        let ctx = IntentContext::from_message(message);

        if let Some(reply) = self.route_answer(message).await? {
            return Ok(Some(reply));
        }

        if let Some(pending) = self
            .store
            .get_clarification(&ctx.platform, &ctx.channel_id)
            .await?
        {
            self.store
                .clear_clarification(&ctx.platform, &ctx.channel_id)
                .await?;
            match parse_yes_no(&message.content) {
                Some(true) => {
                    info!(suggested = %pending.suggested_text, "Clarification confirmed");
                    let intent = self
                        .engine
                        .resolve(ctx.with_text(&pending.suggested_text))
                        .await;
                    return self.dispatch(intent).await.map(Some);
                }
                Some(false) => return Ok(Some("OK, never mind.".to_string())),
                // Anything else is a fresh request.
                None => {}
            }
        }

        let intent = self.engine.resolve(ctx).await;
        debug!(intent = intent.kind(), "Resolved intent");
        self.dispatch(intent).await.map(Some)
    }

    /// Deliver the message as an answer if the channel's job is waiting on one.
    async fn route_answer(&self, message: &IncomingMessage) -> Result<Option<String>> {
        let state = self
            .store
            .get(&message.platform, &message.channel_id)
            .await?;
        let pending = state
            .as_ref()
            .and_then(|s| s.pending_question_id.clone().map(|q| (s.job_id.clone(), q)));

        let Some((job_id, question_id)) = pending else {
            if message.answered_question_id().is_some() {
                return Ok(Some(
                    "That question is no longer waiting for an answer.".to_string(),
                ));
            }
            return Ok(None);
        };

        if let Some(answered) = message.answered_question_id() {
            if answered != question_id {
                return Ok(Some(
                    "That question is no longer waiting for an answer.".to_string(),
                ));
            }
        }

        self.bus
            .publish_answer(&job_id, &question_id, &message.content)
            .await?;
        self.store
            .clear_pending_question(&message.platform, &message.channel_id)
            .await?;
        info!(job_id = %job_id, question_id = %question_id, "Relayed answer to worker");
        Ok(Some(format!("Got it: {}", message.content.trim())))
    }

    async fn dispatch(&self, intent: ChatIntent) -> Result<String> {
        let reply = match intent {
            ChatIntent::FixTicket {
                ctx,
                ticket_id,
                project,
            } => self
                .fix
                .handle(&ctx, &ticket_id, &project)
                .await?
                .reply(&ticket_id, &project),
            ChatIntent::ListTickets { project, .. } => self.list_tickets(project.as_deref()).await,
            ChatIntent::CreateTicket {
                project,
                title,
                description,
                ..
            } => {
                let source = self.tickets.get(&project)?;
                let ticket = source.create(&title, &description).await?;
                format!(
                    "Created #{} in {project}: {}\n{}",
                    ticket.number, ticket.title, ticket.url
                )
            }
            ChatIntent::Help { .. } => HELP_TEXT.to_string(),
            ChatIntent::Greeting { .. } => GREETING_TEXT.to_string(),
            ChatIntent::ClarificationNeeded {
                ctx,
                question,
                suggested_text,
                ..
            } => {
                if let Some(suggested_text) = suggested_text {
                    let pending = PendingClarification {
                        suggested_text,
                        original_input: ctx.raw_text.clone(),
                        user_id: ctx.user_id.clone(),
                    };
                    self.store
                        .set_clarification(&ctx.platform, &ctx.channel_id, &pending)
                        .await?;
                }
                question
            }
            ChatIntent::Error { message, .. } => message,
            ChatIntent::Unknown { .. } => UNKNOWN_TEXT.to_string(),
        };
        Ok(reply)
    }

    /// One project, or every project when `project` is `None`.
    async fn list_tickets(&self, project: Option<&str>) -> String {
        let sources: Vec<_> = match project {
            Some(project) => match self.tickets.get(project) {
                Ok(source) => vec![source],
                Err(_) => return format!("No ticket source is configured for {project}."),
            },
            None => self.tickets.all().collect(),
        };
        if sources.is_empty() {
            return "No ticket sources are configured.".to_string();
        }

        let listings = join_all(sources.iter().map(|source| async move {
            match source.list_open().await {
                Ok(tickets) => format_ticket_list(source.project(), &tickets),
                Err(e) => {
                    warn!(project = source.project(), error = %e, "Listing tickets failed");
                    format!("Couldn't list tickets in {}.", source.project())
                }
            }
        }))
        .await;
        listings.join("\n\n")
    }
}
