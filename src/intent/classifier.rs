//! Classifier fallback — asks an LLM what free-form text means.
//!
//! Only reached when the pattern stage finds nothing. The model answers with a
//! single JSON object that maps onto [`ClassifierGuess`].

use std::time::Duration;

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use secrecy::ExposeSecret;
use tracing::debug;

use super::types::ClassifierGuess;
use crate::config::ClassifierConfig;
use crate::error::LlmError;

/// Max tokens for the classifier call (runs on every unmatched message).
const CLASSIFY_MAX_TOKENS: u64 = 256;

/// Upper bound on one classifier round trip.
const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(20);

/// Turns free text into a structured command guess.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, text: &str, projects: &[String]) -> Result<ClassifierGuess, LlmError>;
}

/// Anthropic-backed classifier via rig-core.
pub struct RigClassifier {
    client: rig::client::Client<rig::providers::anthropic::client::AnthropicExt>,
    model: String,
}

impl RigClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, LlmError> {
        use rig::providers::anthropic;

        let client: rig::client::Client<anthropic::client::AnthropicExt> =
            anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
                LlmError::RequestFailed {
                    provider: "anthropic".to_string(),
                    reason: format!("Failed to create Anthropic client: {}", e),
                }
            })?;

        tracing::info!("Using Anthropic intent classifier (model: {})", config.model);
        Ok(Self {
            client,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl IntentClassifier for RigClassifier {
    async fn classify(&self, text: &str, projects: &[String]) -> Result<ClassifierGuess, LlmError> {
        let agent = self
            .client
            .agent(self.model.as_str())
            .preamble(&build_system_prompt(projects))
            .max_tokens(CLASSIFY_MAX_TOKENS)
            .temperature(0.0)
            .build();

        let raw = tokio::time::timeout(CLASSIFY_TIMEOUT, agent.prompt(text))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: "anthropic".to_string(),
                timeout: CLASSIFY_TIMEOUT,
            })?
            .map_err(|e| LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: e.to_string(),
            })?;

        debug!(response = %raw, "Classifier response");
        parse_guess(&raw).map_err(|reason| LlmError::InvalidResponse {
            provider: "anthropic".to_string(),
            reason,
        })
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt(projects: &[String]) -> String {
    let projects = if projects.is_empty() {
        "(none configured)".to_string()
    } else {
        projects.join(", ")
    };
    format!(
        "You interpret chat messages sent to a bot that dispatches coding agents to fix tickets.\n\n\
         Commands:\n\
         - \"fix\": work on a ticket. Needs ticketNumber; project if named.\n\
         - \"list\": list open tickets, optionally for one project.\n\
         - \"create\": create a ticket. Needs title; project if named.\n\
         - \"help\": the user asks what the bot can do.\n\
         - \"greeting\": small talk.\n\
         - \"unknown\": anything else.\n\n\
         Known projects: {projects}\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"commandType\": \"...\", \"ticketNumber\": null, \"project\": null, \"title\": null, \"confidence\": 0.0}}\n\n\
         Rules:\n\
         - project must be one of the known projects or null\n\
         - confidence is 0.0-1.0; above 0.8 only when the request is unambiguous"
    )
}

// ── Response parsing ────────────────────────────────────────────────

fn parse_guess(raw: &str) -> Result<ClassifierGuess, String> {
    let json_str = extract_json_object(raw).ok_or_else(|| "no JSON object in response".to_string())?;
    let mut guess: ClassifierGuess =
        serde_json::from_str(json_str).map_err(|e| format!("JSON parse error: {e}"))?;
    guess.confidence = guess.confidence.clamp(0.0, 1.0);
    Ok(guess)
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let guess = parse_guess(
            r#"{"commandType":"fix","ticketNumber":42,"project":"backend","title":null,"confidence":0.93}"#,
        )
        .unwrap();
        assert_eq!(guess.command_type, "fix");
        assert_eq!(guess.ticket_number, Some(42));
        assert_eq!(guess.project.as_deref(), Some("backend"));
    }

    #[test]
    fn parses_markdown_wrapped_json_and_clamps_confidence() {
        let raw = "Sure!\n```json\n{\"commandType\":\"list\",\"confidence\":1.7}\n```";
        let guess = parse_guess(raw).unwrap();
        assert_eq!(guess.command_type, "list");
        assert_eq!(guess.confidence, 1.0);
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_guess("I think they want a fix").is_err());
        assert!(parse_guess("} backwards {").is_err());
    }

    #[test]
    fn system_prompt_lists_projects() {
        let prompt = build_system_prompt(&["backend".into(), "web".into()]);
        assert!(prompt.contains("Known projects: backend, web"));
        assert!(build_system_prompt(&[]).contains("(none configured)"));
    }
}
