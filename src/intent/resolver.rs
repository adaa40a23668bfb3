//! Project resolution for commands that did not name a project.

use futures::future::join_all;
use tracing::{debug, warn};

use super::types::{ChatIntent, IntentContext};
use crate::tickets::TicketSources;

/// Outcome of looking for a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    /// Several projects fit; the user has to pick.
    Ambiguous(Vec<String>),
    NotFound,
    UnknownProject(String),
    NoProjects,
}

/// Maps commands onto configured projects.
#[derive(Clone)]
pub struct ProjectResolver {
    projects: Vec<String>,
    sources: TicketSources,
}

impl ProjectResolver {
    pub fn new(projects: Vec<String>, sources: TicketSources) -> Self {
        Self { projects, sources }
    }

    pub fn projects(&self) -> &[String] {
        &self.projects
    }

    /// Validate an explicitly named project, ignoring case. Resolves to the
    /// configured spelling.
    pub fn check_project(&self, project: &str) -> Resolution {
        match self.projects.iter().find(|p| p.eq_ignore_ascii_case(project)) {
            Some(configured) => Resolution::Resolved(configured.clone()),
            None => Resolution::UnknownProject(project.to_string()),
        }
    }

    /// The only project, if exactly one is configured.
    pub fn sole_project(&self) -> Resolution {
        match self.projects.as_slice() {
            [] => Resolution::NoProjects,
            [only] => Resolution::Resolved(only.clone()),
            many => Resolution::Ambiguous(many.to_vec()),
        }
    }

    /// Find the project that owns ticket `number`.
    ///
    /// With several projects, every project that has a ticket source is asked
    /// concurrently. A source that fails counts as "not there".
    pub async fn locate_ticket(&self, number: u64) -> Resolution {
        let sole = self.sole_project();
        if !matches!(sole, Resolution::Ambiguous(_)) {
            return sole;
        }

        let checkable: Vec<_> = self
            .projects
            .iter()
            .filter_map(|p| self.sources.get(p).ok())
            .collect();
        if checkable.is_empty() {
            debug!(number, "No ticket sources configured; cannot narrow projects");
            return Resolution::Ambiguous(self.projects.clone());
        }

        let checks = checkable.iter().map(|source| async move {
            let project = source.project().to_string();
            match source.exists(number).await {
                Ok(found) => (project, found),
                Err(e) => {
                    warn!(project = %project, number, error = %e, "Ticket lookup failed");
                    (project, false)
                }
            }
        });

        let mut found: Vec<String> = join_all(checks)
            .await
            .into_iter()
            .filter_map(|(project, exists)| exists.then_some(project))
            .collect();
        found.sort();
        debug!(number, ?found, "Ticket lookup finished");

        match found.len() {
            0 => Resolution::NotFound,
            1 => Resolution::Resolved(found.remove(0)),
            _ => Resolution::Ambiguous(found),
        }
    }

    /// Turn a fix request into a resolved intent.
    pub async fn resolve_fix(
        &self,
        ctx: IntentContext,
        ticket: u64,
        project: Option<String>,
    ) -> ChatIntent {
        let resolution = match project {
            Some(project) => self.check_project(&project),
            None => self.locate_ticket(ticket).await,
        };

        match resolution {
            Resolution::Resolved(project) => ChatIntent::FixTicket {
                ctx,
                ticket_id: ticket.to_string(),
                project,
            },
            Resolution::Ambiguous(candidates) => ChatIntent::ClarificationNeeded {
                question: format!(
                    "Ticket #{ticket} could be in {}. Which one? Try \"fix #{ticket} in {}\".",
                    join_names(&candidates),
                    candidates[0]
                ),
                suggested_text: None,
                candidates,
                ctx,
            },
            Resolution::NotFound => ChatIntent::Error {
                ctx,
                message: format!("Ticket #{ticket} was not found in any project."),
            },
            other => self.resolution_error(ctx, other),
        }
    }

    /// Error intent for a resolution that cannot proceed.
    pub fn resolution_error(&self, ctx: IntentContext, resolution: Resolution) -> ChatIntent {
        let message = match resolution {
            Resolution::UnknownProject(project) => format!(
                "I don't know a project called \"{project}\". Known projects: {}.",
                join_names(&self.projects)
            ),
            Resolution::NoProjects => "No projects are configured.".to_string(),
            Resolution::NotFound => "Nothing matched.".to_string(),
            Resolution::Ambiguous(candidates) => {
                format!("Please name a project: {}.", join_names(&candidates))
            }
            Resolution::Resolved(project) => format!("Resolved to {project}."),
        };
        ChatIntent::Error { ctx, message }
    }
}

/// "a", "a and b", "a, b and c".
fn join_names(names: &[String]) -> String {
    match names {
        [] => String::new(),
        [one] => one.clone(),
        [init @ .., last] => format!("{} and {last}", init.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::error::TicketError;
    use crate::tickets::{Ticket, TicketSource};

    struct FixedSource {
        project: String,
        tickets: Vec<u64>,
        broken: bool,
    }

    #[async_trait]
    impl TicketSource for FixedSource {
        fn project(&self) -> &str {
            &self.project
        }

        async fn exists(&self, number: u64) -> Result<bool, TicketError> {
            if self.broken {
                return Err(TicketError::BadStatus {
                    project: self.project.clone(),
                    status: 502,
                });
            }
            Ok(self.tickets.contains(&number))
        }

        async fn list_open(&self) -> Result<Vec<Ticket>, TicketError> {
            Ok(Vec::new())
        }

        async fn create(&self, _: &str, _: &str) -> Result<Ticket, TicketError> {
            unreachable!()
        }
    }

    fn resolver(sources: &[(&str, &[u64], bool)]) -> ProjectResolver {
        let mut registry = TicketSources::new();
        for (project, tickets, broken) in sources {
            registry.add(Arc::new(FixedSource {
                project: project.to_string(),
                tickets: tickets.to_vec(),
                broken: *broken,
            }));
        }
        ProjectResolver::new(
            sources.iter().map(|(p, _, _)| p.to_string()).collect(),
            registry,
        )
    }

    #[tokio::test]
    async fn single_project_needs_no_lookup() {
        let r = resolver(&[("backend", &[], false)]);
        assert_eq!(r.locate_ticket(42).await, Resolution::Resolved("backend".into()));
    }

    #[tokio::test]
    async fn lookup_narrows_to_owning_project() {
        let r = resolver(&[("backend", &[42], false), ("frontend", &[7], false)]);
        assert_eq!(r.locate_ticket(42).await, Resolution::Resolved("backend".into()));
        assert_eq!(r.locate_ticket(99).await, Resolution::NotFound);
    }

    #[tokio::test]
    async fn failing_source_counts_as_absent() {
        let r = resolver(&[("backend", &[42], false), ("frontend", &[42], true)]);
        assert_eq!(r.locate_ticket(42).await, Resolution::Resolved("backend".into()));
    }

    #[tokio::test]
    async fn no_sources_leaves_every_project_ambiguous() {
        let r = ProjectResolver::new(vec!["a".into(), "b".into()], TicketSources::new());
        assert_eq!(
            r.locate_ticket(1).await,
            Resolution::Ambiguous(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn explicit_project_is_validated() {
        let r = resolver(&[("backend", &[], false)]);
        assert_eq!(r.check_project("backend"), Resolution::Resolved("backend".into()));
        assert_eq!(
            r.check_project("mobile"),
            Resolution::UnknownProject("mobile".into())
        );
    }

    #[test]
    fn project_names_match_any_case() {
        let r = resolver(&[("Backend", &[], false), ("web-UI", &[], false)]);
        assert_eq!(r.check_project("backend"), Resolution::Resolved("Backend".into()));
        assert_eq!(r.check_project("WEB-ui"), Resolution::Resolved("web-UI".into()));
    }

    #[test]
    fn joins_names_for_humans() {
        assert_eq!(join_names(&["a".into()]), "a");
        assert_eq!(join_names(&["a".into(), "b".into()]), "a and b");
        assert_eq!(join_names(&["a".into(), "b".into(), "c".into()]), "a, b and c");
    }
}
