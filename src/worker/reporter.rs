//! Worker reporter — publishes a job's progress and asks the human questions.
//!
//! Every method writes to the job's outbound stream. Questions then wait on the
//! inbound stream for the matching answer, falling back to a default when the
//! human stays silent past the timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::{BusMessage, MessageBus};
use crate::error::BusError;

/// Default wait for a human answer.
pub const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_secs(120);

pub struct WorkerReporter {
    bus: MessageBus,
    job_id: String,
    cancel: CancellationToken,
    finished: AtomicBool,
    /// Serialises terminal publishes so at most one lands.
    terminal: Mutex<()>,
}

impl WorkerReporter {
    pub fn new(bus: MessageBus, job_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            bus,
            job_id: job_id.into(),
            cancel,
            finished: AtomicBool::new(false),
            terminal: Mutex::new(()),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn progress(&self, step: u32, total: u32, text: &str) -> Result<(), BusError> {
        self.publish(BusMessage::Progress {
            job_id: self.job_id.clone(),
            text: text.to_string(),
            step,
            total,
        })
        .await
    }

    pub async fn detail(&self, text: &str) -> Result<(), BusError> {
        self.publish(BusMessage::Detail {
            job_id: self.job_id.clone(),
            text: text.to_string(),
        })
        .await
    }

    /// Post a question and return its ID without waiting for an answer.
    pub async fn question(&self, text: &str) -> Result<String, BusError> {
        let question_id = Uuid::new_v4().simple().to_string();
        self.publish(BusMessage::Question {
            job_id: self.job_id.clone(),
            text: text.to_string(),
            question_id: question_id.clone(),
        })
        .await?;
        Ok(question_id)
    }

    pub async fn done(
        &self,
        text: &str,
        summary: &str,
        pr_url: Option<&str>,
    ) -> Result<(), BusError> {
        self.publish_terminal(BusMessage::Done {
            job_id: self.job_id.clone(),
            text: text.to_string(),
            summary: summary.to_string(),
            pr_url: pr_url.map(str::to_string),
        })
        .await
    }

    pub async fn error(
        &self,
        text: &str,
        step: Option<u32>,
        total: Option<u32>,
        step_name: Option<&str>,
    ) -> Result<(), BusError> {
        self.publish_terminal(BusMessage::Error {
            job_id: self.job_id.clone(),
            text: text.to_string(),
            step,
            total,
            step_name: step_name.map(str::to_string),
        })
        .await
    }

    /// Ask a yes/no question. Returns `default` on timeout, cancellation, or an
    /// answer that is neither yes nor no.
    pub async fn ask_yes_no(
        &self,
        question: &str,
        default: bool,
        timeout: Duration,
    ) -> Result<bool, BusError> {
        let question_id = self.question(question).await?;
        let answer = self.wait_for_answer(&question_id, timeout).await;
        let value = answer
            .as_deref()
            .map(|content| normalize_answer(content, default))
            .unwrap_or(default);
        info!(job_id = %self.job_id, question_id = %question_id, answered = answer.is_some(), value, "Yes/no question resolved");
        Ok(value)
    }

    /// Ask a free-text question. Returns `default` on timeout or cancellation.
    pub async fn ask_text(
        &self,
        question: &str,
        default: &str,
        timeout: Duration,
    ) -> Result<String, BusError> {
        let question_id = self.question(question).await?;
        Ok(self
            .wait_for_answer(&question_id, timeout)
            .await
            .unwrap_or_else(|| default.to_string()))
    }

    async fn wait_for_answer(&self, question_id: &str, timeout: Duration) -> Option<String> {
        match self
            .bus
            .read_answer(&self.job_id, Some(question_id), timeout, &self.cancel)
            .await
        {
            Some(BusMessage::Answer { content, .. }) => Some(content),
            Some(other) => {
                debug!(kind = other.type_name(), "Unexpected message on inbound stream");
                None
            }
            None => {
                debug!(job_id = %self.job_id, question_id, ?timeout, "No answer; using default");
                None
            }
        }
    }

    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(BusError::Finished {
                job_id: self.job_id.clone(),
            });
        }
        self.bus.publish(&message).await.map(|_| ())
    }

    /// Only a successful publish finishes the job, so a failed one can be retried.
    async fn publish_terminal(&self, message: BusMessage) -> Result<(), BusError> {
        let _guard = self.terminal.lock().await;
        self.publish(message).await?;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// `Some(true)` for yes/y/true/1, `Some(false)` for no/n/false/0 (trimmed,
/// case-insensitive), `None` otherwise.
pub fn parse_yes_no(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "yes" | "y" | "true" | "1" => Some(true),
        "no" | "n" | "false" | "0" => Some(false),
        _ => None,
    }
}

pub fn normalize_answer(text: &str, default: bool) -> bool {
    parse_yes_no(text).unwrap_or(default)
}
