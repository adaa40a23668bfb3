//! GitHub Issues ticket source.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{Ticket, TicketSource};
use crate::config::ProjectConfig;
use crate::error::TicketError;

const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = "ticket-dispatch";
const PAGE_SIZE: usize = 100;

/// A GitHub issue (subset of fields).
#[derive(Debug, Deserialize)]
struct GitHubIssue {
    number: u64,
    title: String,
    html_url: String,
    /// Pull requests also come through the issues endpoint; filter them out.
    pull_request: Option<serde_json::Value>,
}

impl From<GitHubIssue> for Ticket {
    fn from(issue: GitHubIssue) -> Self {
        Ticket {
            number: issue.number,
            title: issue.title,
            url: issue.html_url,
        }
    }
}

/// Issues of one `owner/repo`.
pub struct GitHubTicketSource {
    project: String,
    repo: String,
    token: SecretString,
    client: reqwest::Client,
    api_url: String,
}

impl GitHubTicketSource {
    pub fn new(project: &ProjectConfig, token: SecretString) -> Self {
        Self {
            project: project.name.clone(),
            repo: project.repo.clone(),
            token,
            client: reqwest::Client::new(),
            api_url: GITHUB_API_URL.to_string(),
        }
    }

    fn issues_url(&self) -> String {
        format!("{}/repos/{}/issues", self.api_url, self.repo)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header(
                "Authorization",
                format!("Bearer {}", self.token.expose_secret()),
            )
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
    }

    fn failed(&self, e: reqwest::Error) -> TicketError {
        TicketError::RequestFailed {
            project: self.project.clone(),
            reason: e.to_string(),
        }
    }

    fn bad_status(&self, status: StatusCode) -> TicketError {
        TicketError::BadStatus {
            project: self.project.clone(),
            status: status.as_u16(),
        }
    }
}

#[async_trait]
impl TicketSource for GitHubTicketSource {
    fn project(&self) -> &str {
        &self.project
    }

    async fn exists(&self, number: u64) -> Result<bool, TicketError> {
        let url = format!("{}/{number}", self.issues_url());
        let resp = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.failed(e))?;

        match resp.status() {
            status if status.is_success() => {
                let issue: GitHubIssue = resp.json().await.map_err(|e| self.failed(e))?;
                // A pull request number is not a fixable ticket.
                Ok(issue.pull_request.is_none())
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(false),
            status => Err(self.bad_status(status)),
        }
    }

    /// Paginates through all pages automatically.
    async fn list_open(&self) -> Result<Vec<Ticket>, TicketError> {
        let url = self.issues_url();
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let resp = self
                .request(self.client.get(&url))
                .query(&[
                    ("state", "open"),
                    ("per_page", &PAGE_SIZE.to_string()),
                    ("page", &page.to_string()),
                ])
                .send()
                .await
                .map_err(|e| self.failed(e))?;

            if !resp.status().is_success() {
                return Err(self.bad_status(resp.status()));
            }

            let issues: Vec<GitHubIssue> = resp.json().await.map_err(|e| self.failed(e))?;
            let count = issues.len();
            all.extend(
                issues
                    .into_iter()
                    .filter(|i| i.pull_request.is_none())
                    .map(Ticket::from),
            );

            if count < PAGE_SIZE {
                break; // Last page
            }
            page += 1;
        }

        debug!(project = %self.project, count = all.len(), "Listed open tickets");
        Ok(all)
    }

    async fn create(&self, title: &str, description: &str) -> Result<Ticket, TicketError> {
        let resp = self
            .request(self.client.post(self.issues_url()))
            .json(&json!({ "title": title, "body": description }))
            .send()
            .await
            .map_err(|e| self.failed(e))?;

        if !resp.status().is_success() {
            return Err(self.bad_status(resp.status()));
        }

        let issue: GitHubIssue = resp.json().await.map_err(|e| self.failed(e))?;
        tracing::info!(project = %self.project, number = issue.number, "Created ticket");
        Ok(issue.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_url_uses_repo_slug() {
        let source = GitHubTicketSource::new(
            &ProjectConfig::new("backend", "acme/backend"),
            SecretString::from("ghp_test"),
        );
        assert_eq!(source.project(), "backend");
        assert_eq!(
            source.issues_url(),
            "https://api.github.com/repos/acme/backend/issues"
        );
    }

    #[test]
    fn issue_deserializes_into_ticket() {
        let issue: GitHubIssue = serde_json::from_value(json!({
            "number": 42,
            "title": "Login broken",
            "html_url": "https://github.com/acme/backend/issues/42",
            "state": "open",
            "body": null
        }))
        .unwrap();
        assert!(issue.pull_request.is_none());
        let ticket = Ticket::from(issue);
        assert_eq!(ticket.number, 42);
        assert_eq!(ticket.title, "Login broken");
    }
}
