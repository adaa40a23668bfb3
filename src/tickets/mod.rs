//! Ticket sources — where issues for each configured project live.
//!
//! Project resolution asks every source whether a ticket number exists; the
//! router uses the same sources to list and create tickets.

mod github;

pub use github::GitHubTicketSource;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TicketError;

/// An open ticket (issue) in a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub number: u64,
    pub title: String,
    pub url: String,
}

/// Issue tracker for one project.
#[async_trait]
pub trait TicketSource: Send + Sync {
    /// Project this source serves.
    fn project(&self) -> &str;

    /// Whether ticket `number` exists (open or closed).
    async fn exists(&self, number: u64) -> Result<bool, TicketError>;

    async fn list_open(&self) -> Result<Vec<Ticket>, TicketError>;

    async fn create(&self, title: &str, description: &str) -> Result<Ticket, TicketError>;
}

/// Ticket sources keyed by project name.
#[derive(Clone, Default)]
pub struct TicketSources {
    sources: BTreeMap<String, Arc<dyn TicketSource>>,
}

impl TicketSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, source: Arc<dyn TicketSource>) {
        self.sources.insert(source.project().to_string(), source);
    }

    pub fn get(&self, project: &str) -> Result<&Arc<dyn TicketSource>, TicketError> {
        self.sources
            .get(project)
            .ok_or_else(|| TicketError::UnknownProject(project.to_string()))
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn TicketSource>> {
        self.sources.values()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Render a ticket list for chat.
pub fn format_ticket_list(project: &str, tickets: &[Ticket]) -> String {
    if tickets.is_empty() {
        return format!("No open tickets in {project}.");
    }
    let mut out = format!("Open tickets in {project}:");
    for ticket in tickets {
        out.push_str(&format!("\n#{} {}", ticket.number, ticket.title));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_list_formatting() {
        assert_eq!(format_ticket_list("backend", &[]), "No open tickets in backend.");

        let tickets = vec![
            Ticket {
                number: 42,
                title: "Login broken".into(),
                url: "https://github.com/acme/backend/issues/42".into(),
            },
            Ticket {
                number: 43,
                title: "Slow search".into(),
                url: "https://github.com/acme/backend/issues/43".into(),
            },
        ];
        assert_eq!(
            format_ticket_list("backend", &tickets),
            "Open tickets in backend:\n#42 Login broken\n#43 Slow search"
        );
    }

    #[test]
    fn unknown_project_lookup_fails() {
        let sources = TicketSources::new();
        assert!(sources.is_empty());
        assert!(matches!(
            sources.get("nope"),
            Err(TicketError::UnknownProject(p)) if p == "nope"
        ));
    }
}
