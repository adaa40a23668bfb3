//! Intent types.

use serde::{Deserialize, Serialize};

use crate::channels::IncomingMessage;

/// Where a piece of chat text came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentContext {
    pub raw_text: String,
    pub user_id: String,
    pub channel_id: String,
    pub platform: String,
}

impl IntentContext {
    pub fn from_message(message: &IncomingMessage) -> Self {
        Self {
            raw_text: message.content.clone(),
            user_id: message.user_id.clone(),
            channel_id: message.channel_id.clone(),
            platform: message.platform.clone(),
        }
    }

    /// Same origin, different text (used when replaying a confirmed suggestion).
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        Self {
            raw_text: text.into(),
            ..self.clone()
        }
    }
}

/// What the user wants, after resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatIntent {
    FixTicket {
        ctx: IntentContext,
        ticket_id: String,
        project: String,
    },
    /// `project: None` lists every configured project.
    ListTickets {
        ctx: IntentContext,
        project: Option<String>,
    },
    CreateTicket {
        ctx: IntentContext,
        project: String,
        title: String,
        description: String,
    },
    Help {
        ctx: IntentContext,
    },
    Greeting {
        ctx: IntentContext,
    },
    ClarificationNeeded {
        ctx: IntentContext,
        question: String,
        /// Canonical command to run if the user answers yes.
        suggested_text: Option<String>,
        candidates: Vec<String>,
    },
    Error {
        ctx: IntentContext,
        message: String,
    },
    Unknown {
        ctx: IntentContext,
    },
}

impl ChatIntent {
    pub fn context(&self) -> &IntentContext {
        match self {
            ChatIntent::FixTicket { ctx, .. }
            | ChatIntent::ListTickets { ctx, .. }
            | ChatIntent::CreateTicket { ctx, .. }
            | ChatIntent::Help { ctx }
            | ChatIntent::Greeting { ctx }
            | ChatIntent::ClarificationNeeded { ctx, .. }
            | ChatIntent::Error { ctx, .. }
            | ChatIntent::Unknown { ctx } => ctx,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChatIntent::FixTicket { .. } => "fix_ticket",
            ChatIntent::ListTickets { .. } => "list_tickets",
            ChatIntent::CreateTicket { .. } => "create_ticket",
            ChatIntent::Help { .. } => "help",
            ChatIntent::Greeting { .. } => "greeting",
            ChatIntent::ClarificationNeeded { .. } => "clarification_needed",
            ChatIntent::Error { .. } => "error",
            ChatIntent::Unknown { .. } => "unknown",
        }
    }
}

/// A command recognised in text, before project resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Fix {
        ticket: u64,
        project: Option<String>,
    },
    List {
        project: Option<String>,
    },
    Create {
        title: String,
        project: Option<String>,
        description: String,
    },
    Help,
    Greeting,
}

impl Command {
    /// The canonical text the pattern stage would parse back into this command.
    pub fn canonical_text(&self) -> String {
        match self {
            Command::Fix { ticket, project } => match project {
                Some(p) => format!("fix #{ticket} in {p}"),
                None => format!("fix #{ticket}"),
            },
            Command::List { project } => match project {
                Some(p) => format!("list tickets in {p}"),
                None => "list tickets".to_string(),
            },
            Command::Create {
                title,
                project,
                description,
            } => {
                let mut text = format!("create ticket '{title}'");
                if let Some(p) = project {
                    text.push_str(&format!(" in {p}"));
                    if !description.is_empty() {
                        text.push_str(&format!(" '{description}'"));
                    }
                }
                text
            }
            Command::Help => "help".to_string(),
            Command::Greeting => "hello".to_string(),
        }
    }

    /// Whether the command starts work or changes tickets.
    pub fn is_actionable(&self) -> bool {
        matches!(self, Command::Fix { .. } | Command::Create { .. })
    }
}

/// The classifier's structured guess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierGuess {
    /// One of `fix`, `list`, `create`, `help`, `greeting`, `unknown`.
    pub command_type: String,
    #[serde(default)]
    pub ticket_number: Option<u64>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub confidence: f64,
}

impl ClassifierGuess {
    /// The command this guess describes, if it names one completely.
    pub fn to_command(&self) -> Option<Command> {
        let project = self
            .project
            .as_ref()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty());
        match self.command_type.trim().to_lowercase().as_str() {
            "fix" => self.ticket_number.map(|ticket| Command::Fix { ticket, project }),
            "list" => Some(Command::List { project }),
            "create" => self
                .title
                .as_ref()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .map(|title| Command::Create {
                    title,
                    project,
                    description: String::new(),
                }),
            "help" => Some(Command::Help),
            "greeting" => Some(Command::Greeting),
            _ => None,
        }
    }
}
