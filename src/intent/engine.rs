//! Intent engine — patterns first, classifier second, then project resolution.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::classifier::IntentClassifier;
use super::patterns::PatternMatcher;
use super::resolver::{ProjectResolver, Resolution};
use super::types::{ChatIntent, Command, IntentContext};

/// Below this, an actionable classifier guess is confirmed with the user.
const CONFIRM_THRESHOLD: f64 = 0.7;

/// Below this, a classifier guess is ignored altogether.
const IGNORE_THRESHOLD: f64 = 0.3;

pub struct IntentEngine {
    patterns: PatternMatcher,
    classifier: Option<Arc<dyn IntentClassifier>>,
    resolver: ProjectResolver,
}

impl IntentEngine {
    pub fn new(
        resolver: ProjectResolver,
        classifier: Option<Arc<dyn IntentClassifier>>,
    ) -> Self {
        Self {
            patterns: PatternMatcher::new(),
            classifier,
            resolver,
        }
    }

    pub fn resolver(&self) -> &ProjectResolver {
        &self.resolver
    }

    /// Work out what `ctx.raw_text` asks for.
    pub async fn resolve(&self, ctx: IntentContext) -> ChatIntent {
        if let Some(command) = self.patterns.parse(&ctx.raw_text) {
            return self.resolve_command(ctx, command).await;
        }

        let Some(classifier) = &self.classifier else {
            debug!("No pattern matched and no classifier configured");
            return ChatIntent::Unknown { ctx };
        };

        let guess = match classifier
            .classify(&ctx.raw_text, self.resolver.projects())
            .await
        {
            Ok(guess) => guess,
            Err(e) => {
                warn!(error = %e, "Intent classification failed");
                return ChatIntent::Unknown { ctx };
            }
        };

        let Some(command) = guess.to_command() else {
            debug!(?guess, "Classifier found no command");
            return ChatIntent::Unknown { ctx };
        };

        if guess.confidence < IGNORE_THRESHOLD {
            debug!(?guess, "Classifier guess too weak");
            return ChatIntent::Unknown { ctx };
        }

        if command.is_actionable() && guess.confidence < CONFIRM_THRESHOLD {
            let suggested = command.canonical_text();
            info!(
                confidence = guess.confidence,
                suggested = %suggested,
                "Asking user to confirm classifier guess"
            );
            return ChatIntent::ClarificationNeeded {
                ctx,
                question: format!("Did you mean \"{suggested}\"? (yes/no)"),
                suggested_text: Some(suggested),
                candidates: Vec::new(),
            };
        }

        self.resolve_command(ctx, command).await
    }

    async fn resolve_command(&self, ctx: IntentContext, command: Command) -> ChatIntent {
        match command {
            Command::Fix { ticket, project } => {
                self.resolver.resolve_fix(ctx, ticket, project).await
            }
            Command::List { project } => {
                let resolution = match project {
                    Some(project) => self.resolver.check_project(&project),
                    None => self.resolver.sole_project(),
                };
                match resolution {
                    Resolution::Resolved(project) => ChatIntent::ListTickets {
                        ctx,
                        project: Some(project),
                    },
                    Resolution::Ambiguous(_) => ChatIntent::ListTickets { ctx, project: None },
                    other => self.resolver.resolution_error(ctx, other),
                }
            }
            Command::Create {
                title,
                project,
                description,
            } => {
                let resolution = match project {
                    Some(project) => self.resolver.check_project(&project),
                    None => self.resolver.sole_project(),
                };
                match resolution {
                    Resolution::Resolved(project) => ChatIntent::CreateTicket {
                        ctx,
                        project,
                        title,
                        description,
                    },
                    Resolution::Ambiguous(candidates) => ChatIntent::ClarificationNeeded {
                        question: format!(
                            "Which project should \"{title}\" go in? Try \"create ticket '{title}' in {}\".",
                            candidates[0]
                        ),
                        suggested_text: None,
                        candidates,
                        ctx,
                    },
                    other => self.resolver.resolution_error(ctx, other),
                }
            }
            Command::Help => ChatIntent::Help { ctx },
            Command::Greeting => ChatIntent::Greeting { ctx },
        }
    }
}
