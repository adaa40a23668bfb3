//! Bus message types and their flat stream-field encoding.
//!
//! Every entry carries the same field set
//! (`type, jobId, text, step, total, questionId, prUrl, summary, content, stepName`);
//! fields a variant doesn't use are written as empty strings.

use std::collections::HashMap;

/// A message travelling over a job's outbound or inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    /// Step-level progress (`step` of `total`).
    Progress {
        job_id: String,
        text: String,
        step: u32,
        total: u32,
    },
    /// Free-form detail line attached to the current step.
    Detail { job_id: String, text: String },
    /// The worker needs an answer from the human.
    Question {
        job_id: String,
        text: String,
        question_id: String,
    },
    /// Terminal: the job finished successfully.
    Done {
        job_id: String,
        text: String,
        summary: String,
        pr_url: Option<String>,
    },
    /// Terminal: the job failed.
    Error {
        job_id: String,
        text: String,
        step: Option<u32>,
        total: Option<u32>,
        step_name: Option<String>,
    },
    /// Dispatcher → worker reply to a `Question`.
    Answer {
        job_id: String,
        text: String,
        question_id: String,
        content: String,
    },
}

/// Why a stream entry could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("field {field} is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

impl BusMessage {
    /// Wire tag for this variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            BusMessage::Progress { .. } => "progress",
            BusMessage::Detail { .. } => "detail",
            BusMessage::Question { .. } => "question",
            BusMessage::Done { .. } => "done",
            BusMessage::Error { .. } => "error",
            BusMessage::Answer { .. } => "answer",
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            BusMessage::Progress { job_id, .. }
            | BusMessage::Detail { job_id, .. }
            | BusMessage::Question { job_id, .. }
            | BusMessage::Done { job_id, .. }
            | BusMessage::Error { job_id, .. }
            | BusMessage::Answer { job_id, .. } => job_id,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            BusMessage::Progress { text, .. }
            | BusMessage::Detail { text, .. }
            | BusMessage::Question { text, .. }
            | BusMessage::Done { text, .. }
            | BusMessage::Error { text, .. }
            | BusMessage::Answer { text, .. } => text,
        }
    }

    /// Done and Error end a job's outbound stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BusMessage::Done { .. } | BusMessage::Error { .. })
    }

    /// Encode as flat string fields, in a stable order.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut step = String::new();
        let mut total = String::new();
        let mut question_id = String::new();
        let mut pr_url = String::new();
        let mut summary = String::new();
        let mut content = String::new();
        let mut step_name = String::new();

        match self {
            BusMessage::Progress {
                step: s, total: t, ..
            } => {
                step = s.to_string();
                total = t.to_string();
            }
            BusMessage::Detail { .. } => {}
            BusMessage::Question {
                question_id: q, ..
            } => question_id = q.clone(),
            BusMessage::Done {
                summary: s,
                pr_url: p,
                ..
            } => {
                summary = s.clone();
                pr_url = p.clone().unwrap_or_default();
            }
            BusMessage::Error {
                step: s,
                total: t,
                step_name: n,
                ..
            } => {
                step = s.map(|v| v.to_string()).unwrap_or_default();
                total = t.map(|v| v.to_string()).unwrap_or_default();
                step_name = n.clone().unwrap_or_default();
            }
            BusMessage::Answer {
                question_id: q,
                content: c,
                ..
            } => {
                question_id = q.clone();
                content = c.clone();
            }
        }

        vec![
            ("type", self.type_name().to_string()),
            ("jobId", self.job_id().to_string()),
            ("text", self.text().to_string()),
            ("step", step),
            ("total", total),
            ("questionId", question_id),
            ("prUrl", pr_url),
            ("summary", summary),
            ("content", content),
            ("stepName", step_name),
        ]
    }

    /// Decode from flat string fields. Missing optional fields read as empty.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, DecodeError> {
        let field = |name: &'static str| fields.get(name).map(String::as_str).unwrap_or("");

        let type_name = fields
            .get("type")
            .ok_or(DecodeError::MissingField("type"))?;
        let job_id = field("jobId");
        if job_id.is_empty() {
            return Err(DecodeError::MissingField("jobId"));
        }
        let job_id = job_id.to_string();
        let text = field("text").to_string();

        let message = match type_name.as_str() {
            "progress" => BusMessage::Progress {
                job_id,
                text,
                step: required_number(field("step"), "step")?,
                total: required_number(field("total"), "total")?,
            },
            "detail" => BusMessage::Detail { job_id, text },
            "question" => BusMessage::Question {
                job_id,
                text,
                question_id: required_text(field("questionId"), "questionId")?,
            },
            "done" => BusMessage::Done {
                job_id,
                text,
                summary: field("summary").to_string(),
                pr_url: optional_text(field("prUrl")),
            },
            "error" => BusMessage::Error {
                job_id,
                text,
                // Terminal: a bad step must not keep the job from ending.
                step: lenient_number(field("step")),
                total: lenient_number(field("total")),
                step_name: optional_text(field("stepName")),
            },
            "answer" => BusMessage::Answer {
                job_id,
                text,
                question_id: required_text(field("questionId"), "questionId")?,
                content: field("content").to_string(),
            },
            other => return Err(DecodeError::UnknownType(other.to_string())),
        };

        Ok(message)
    }
}

fn required_text(value: &str, name: &'static str) -> Result<String, DecodeError> {
    if value.is_empty() {
        Err(DecodeError::MissingField(name))
    } else {
        Ok(value.to_string())
    }
}

fn optional_text(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn lenient_number(value: &str) -> Option<u32> {
    value.trim().parse().ok()
}

fn required_number(value: &str, name: &'static str) -> Result<u32, DecodeError> {
    optional_number(value, name)?.ok_or(DecodeError::MissingField(name))
}

fn optional_number(value: &str, name: &'static str) -> Result<Option<u32>, DecodeError> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| DecodeError::InvalidNumber {
            field: name,
            value: value.to_string(),
        })
}
