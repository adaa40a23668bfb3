//! Pattern stage — fast regex matching before any classifier call.
//!
//! A match here short-circuits the classifier entirely.

use regex::Regex;
use tracing::debug;

use super::types::Command;

/// Compiled command patterns.
pub struct PatternMatcher {
    fix: Regex,
    bare_ticket: Regex,
    list: Regex,
    create: Regex,
    greeting: Regex,
    help: Regex,
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self {
            fix: Regex::new(
                r"(?i)^(?:please\s+)?(?:fix|work\s+on|resolve)\s+(?:ticket\s+|issue\s+)?#?(\d+)(?:\s+in\s+([\w.-]+))?\s*[.!]?$",
            )
            .expect("fix pattern"),
            bare_ticket: Regex::new(r"^#(\d+)$").expect("bare ticket pattern"),
            list: Regex::new(
                r"(?i)^(?:list|show)\s+(?:open\s+|all\s+)?(?:tickets|issues)(?:\s+(?:in|for)\s+([\w.-]+))?\s*$",
            )
            .expect("list pattern"),
            create: Regex::new(
                r#"(?i)^(?:create|open|new)\s+(?:a\s+)?(?:ticket|issue)\s+['"]([^'"]+)['"](?:\s+in\s+([\w.-]+)(?:\s+['"]([^'"]*)['"])?)?\s*$"#,
            )
            .expect("create pattern"),
            greeting: Regex::new(
                r"(?i)^(?:hi|hello|hey|yo|howdy|good\s+(?:morning|afternoon|evening))(?:\s+there)?[\s!.]*$",
            )
            .expect("greeting pattern"),
            help: Regex::new(r"(?i)^(?:/?help|/start|\?|what\s+can\s+you\s+do\??)$")
                .expect("help pattern"),
        }
    }

    /// Match `text` against every pattern. Returns `None` when nothing fits.
    pub fn parse(&self, text: &str) -> Option<Command> {
        let text = text.trim();
        let project = |m: Option<regex::Match<'_>>| {
            m.map(|m| m.as_str().trim_end_matches('.').to_lowercase())
        };

        let command = if let Some(caps) = self.fix.captures(text) {
            let ticket = caps.get(1)?.as_str().parse().ok()?;
            Command::Fix {
                ticket,
                project: project(caps.get(2)),
            }
        } else if let Some(caps) = self.bare_ticket.captures(text) {
            let ticket = caps.get(1)?.as_str().parse().ok()?;
            Command::Fix {
                ticket,
                project: None,
            }
        } else if let Some(caps) = self.list.captures(text) {
            Command::List {
                project: project(caps.get(1)),
            }
        } else if let Some(caps) = self.create.captures(text) {
            Command::Create {
                title: caps.get(1)?.as_str().trim().to_string(),
                project: project(caps.get(2)),
                description: caps
                    .get(3)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default(),
            }
        } else if self.greeting.is_match(text) {
            Command::Greeting
        } else if self.help.is_match(text) {
            Command::Help
        } else {
            return None;
        };

        debug!(?command, "Pattern match");
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Option<Command> {
        PatternMatcher::new().parse(text)
    }

    #[test]
    fn fix_with_and_without_project() {
        assert_eq!(
            parse("fix #42 in backend"),
            Some(Command::Fix {
                ticket: 42,
                project: Some("backend".into())
            })
        );
        assert_eq!(
            parse("Please fix issue 7 in Frontend!"),
            Some(Command::Fix {
                ticket: 7,
                project: Some("frontend".into())
            })
        );
        assert_eq!(
            parse("work on #3"),
            Some(Command::Fix {
                ticket: 3,
                project: None
            })
        );
    }

    #[test]
    fn bare_ticket_is_a_fix_request() {
        assert_eq!(
            parse("  #42 "),
            Some(Command::Fix {
                ticket: 42,
                project: None
            })
        );
        assert_eq!(parse("#abc"), None);
    }

    #[test]
    fn list_tickets() {
        assert_eq!(parse("list tickets"), Some(Command::List { project: None }));
        assert_eq!(
            parse("show open issues for web"),
            Some(Command::List {
                project: Some("web".into())
            })
        );
    }

    #[test]
    fn create_ticket_forms() {
        assert_eq!(
            parse("create ticket 'Login broken'"),
            Some(Command::Create {
                title: "Login broken".into(),
                project: None,
                description: String::new(),
            })
        );
        assert_eq!(
            parse("create ticket 'Login broken' in web 'Submit returns 500'"),
            Some(Command::Create {
                title: "Login broken".into(),
                project: Some("web".into()),
                description: "Submit returns 500".into(),
            })
        );
    }

    #[test]
    fn greetings_and_help() {
        assert_eq!(parse("Hello!"), Some(Command::Greeting));
        assert_eq!(parse("good morning"), Some(Command::Greeting));
        assert_eq!(parse("help"), Some(Command::Help));
        assert_eq!(parse("/start"), Some(Command::Help));
    }

    #[test]
    fn free_text_falls_through() {
        assert_eq!(parse("can you sort out the login bug"), None);
        assert_eq!(parse("fix the login bug"), None);
        assert_eq!(parse("hello, can you fix 42?"), None);
    }
}
