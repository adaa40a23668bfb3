//! Telegram channel — long-polls the Bot API for updates.
//!
//! Worker questions are sent with an inline Yes/No keyboard. Button presses
//! arrive as callback queries and are turned into ordinary incoming messages
//! whose metadata carries the answered question ID.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::channels::{Channel, IncomingMessage, MessageStream};
use crate::error::ChannelError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Delay after the first failed poll; doubles per consecutive failure.
const POLL_BACKOFF: Duration = Duration::from_secs(5);

const MAX_POLL_BACKOFF: Duration = Duration::from_secs(300);

/// Prefix of inline-button callback data for question answers.
const ANSWER_CALLBACK_PREFIX: &str = "answer:";

/// Telegram channel — connects to the Bot API via long-polling.
pub struct TelegramChannel {
    bot_token: SecretString,
    allowed_users: Vec<String>,
    client: reqwest::Client,
    shutdown: CancellationToken,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString, allowed_users: Vec<String>) -> Self {
        Self {
            bot_token,
            allowed_users,
            client: reqwest::Client::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        api_url(&self.bot_token, method)
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits long messages that exceed Telegram's 4096 char limit.
    async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<Value>,
    ) -> Result<(), ChannelError> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);
        let last = chunks.len().saturating_sub(1);

        for (i, chunk) in chunks.iter().enumerate() {
            // Keyboards attach to the final chunk only.
            let markup = if i == last { reply_markup.clone() } else { None };
            self.send_chunk(chat_id, chunk, markup).await?;
        }
        Ok(())
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_chunk(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<Value>,
    ) -> Result<(), ChannelError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(markup) = reply_markup {
            body["reply_markup"] = markup;
        }

        let markdown_resp = self.post("sendMessage", &body).await?;
        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        if let Some(obj) = body.as_object_mut() {
            obj.remove("parse_mode");
        }
        let plain_resp = self.post("sendMessage", &body).await?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!(
                    "sendMessage failed (markdown: {}, plain: {})",
                    markdown_status, plain_err
                ),
            });
        }

        Ok(())
    }

    async fn post(&self, method: &str, body: &Value) -> Result<reqwest::Response, ChannelError> {
        self.client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.without_url().to_string(),
            })
    }
}

// ── Channel trait implementation ────────────────────────────────────

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(poll_updates(
            self.client.clone(),
            self.bot_token.clone(),
            self.allowed_users.clone(),
            tx,
            self.shutdown.clone(),
        ));

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send_message(&self, channel_id: &str, text: &str) -> Result<(), ChannelError> {
        self.send_text(channel_id, text, None).await
    }

    async fn send_progress(
        &self,
        channel_id: &str,
        step: u32,
        total: u32,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.send_text(channel_id, &format!("⏳ [{step}/{total}] {text}"), None)
            .await
    }

    async fn send_question(
        &self,
        channel_id: &str,
        question_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.send_text(
            channel_id,
            &format!("❓ {text}"),
            Some(answer_keyboard(question_id)),
        )
        .await
    }

    async fn send_done(
        &self,
        channel_id: &str,
        text: &str,
        summary: &str,
        pr_url: Option<&str>,
    ) -> Result<(), ChannelError> {
        let mut message = format!("✅ {text}");
        if !summary.is_empty() {
            message.push_str(&format!("\n\n{summary}"));
        }
        if let Some(url) = pr_url {
            message.push_str(&format!("\n\n🔗 {url}"));
        }
        self.send_text(channel_id, &message, None).await
    }

    async fn send_error(
        &self,
        channel_id: &str,
        friendly: &str,
        raw: &str,
    ) -> Result<(), ChannelError> {
        let mut message = format!("❌ {friendly}");
        if !raw.is_empty() && !friendly.contains(raw) {
            message.push_str(&format!("\n\n`{raw}`"));
        }
        self.send_text(channel_id, &message, None).await
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.without_url().to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram channel shutting down");
        self.shutdown.cancel();
        Ok(())
    }
}

// ── Long poll ───────────────────────────────────────────────────────

/// Long-poll `getUpdates` until `cancel` fires or the receiver goes away.
async fn poll_updates(
    client: reqwest::Client,
    bot_token: SecretString,
    allowed_users: Vec<String>,
    tx: UnboundedSender<IncomingMessage>,
    cancel: CancellationToken,
) {
    let mut offset: i64 = 0;
    let mut failures: u32 = 0;

    tracing::info!("Telegram channel listening for messages...");

    loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = get_updates(&client, &bot_token, offset) => result,
        };

        let updates = match fetched {
            Ok(updates) => {
                failures = 0;
                updates
            }
            Err(reason) => {
                failures += 1;
                let delay = poll_backoff(failures);
                tracing::warn!(failures, ?delay, %reason, "Telegram poll failed; backing off");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        for update in &updates {
            if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                offset = uid + 1;
            }

            // Acknowledge button presses so the client stops spinning.
            if let Some(callback_id) = update
                .get("callback_query")
                .and_then(|c| c.get("id"))
                .and_then(Value::as_str)
            {
                let _ = client
                    .post(api_url(&bot_token, "answerCallbackQuery"))
                    .json(&json!({ "callback_query_id": callback_id }))
                    .send()
                    .await;
            }

            let Some(incoming) = parse_update(update, &allowed_users) else {
                continue;
            };

            if tx.send(incoming).is_err() {
                tracing::info!("Telegram listener channel closed");
                return;
            }
        }
    }

    tracing::info!("Telegram poller stopped");
}

async fn get_updates(
    client: &reqwest::Client,
    bot_token: &SecretString,
    offset: i64,
) -> Result<Vec<Value>, String> {
    let body = json!({
        "offset": offset,
        "timeout": 30,
        "allowed_updates": ["message", "callback_query"]
    });
    let data: Value = client
        .post(api_url(bot_token, "getUpdates"))
        .json(&body)
        .send()
        .await
        .map_err(|e| e.without_url().to_string())?
        .json()
        .await
        .map_err(|e| e.without_url().to_string())?;
    update_results(&data).map(<[Value]>::to_vec)
}

/// The `result` array of a `getUpdates` reply. A revoked token (401) or a
/// second poller on the same bot (409) comes back with `ok: false`.
fn update_results(data: &Value) -> Result<&[Value], String> {
    if data.get("ok").and_then(Value::as_bool) != Some(true) {
        let code = data.get("error_code").and_then(Value::as_i64).unwrap_or_default();
        let description = data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("no description");
        return Err(format!("getUpdates returned {code}: {description}"));
    }
    data.get("result")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| "getUpdates reply has no result".to_string())
}

fn poll_backoff(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(16);
    POLL_BACKOFF
        .saturating_mul(1 << doublings)
        .min(MAX_POLL_BACKOFF)
}

// ── Helpers ─────────────────────────────────────────────────────────

fn api_url(bot_token: &SecretString, method: &str) -> String {
    format!(
        "https://api.telegram.org/bot{}/{method}",
        bot_token.expose_secret()
    )
}

/// Inline Yes/No keyboard whose callback data names the question.
fn answer_keyboard(question_id: &str) -> Value {
    json!({
        "inline_keyboard": [[
            { "text": "Yes", "callback_data": format!("{ANSWER_CALLBACK_PREFIX}{question_id}:yes") },
            { "text": "No", "callback_data": format!("{ANSWER_CALLBACK_PREFIX}{question_id}:no") },
        ]]
    })
}

/// Turn a Telegram update into an incoming message, applying the allowlist.
fn parse_update(update: &Value, allowed_users: &[String]) -> Option<IncomingMessage> {
    if let Some(callback) = update.get("callback_query") {
        let data = callback.get("data").and_then(Value::as_str)?;
        let (question_id, answer) = data
            .strip_prefix(ANSWER_CALLBACK_PREFIX)?
            .rsplit_once(':')?;
        let chat_id = callback
            .get("message")
            .and_then(|m| m.get("chat"))
            .and_then(|c| c.get("id"))
            .and_then(Value::as_i64)?;
        let from = callback.get("from")?;

        let incoming = build_incoming(from, chat_id, answer, allowed_users)?;
        return Some(incoming.with_metadata(json!({
            "chat_id": chat_id.to_string(),
            "question_id": question_id,
        })));
    }

    let message = update.get("message")?;
    let text = message.get("text").and_then(Value::as_str)?;
    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?;
    let from = message.get("from")?;

    let incoming = build_incoming(from, chat_id, text, allowed_users)?;
    Some(incoming.with_metadata(json!({ "chat_id": chat_id.to_string() })))
}

fn build_incoming(
    from: &Value,
    chat_id: i64,
    text: &str,
    allowed_users: &[String],
) -> Option<IncomingMessage> {
    let username = from
        .get("username")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let user_id = from.get("id").and_then(Value::as_i64).map(|id| id.to_string());

    let mut identities = vec![username];
    if let Some(ref id) = user_id {
        identities.push(id.as_str());
    }
    if !check_user_allowed(allowed_users, identities.iter().copied()) {
        tracing::warn!(
            "Telegram: ignoring message from unauthorized user: username={username}, user_id={}",
            user_id.as_deref().unwrap_or("unknown")
        );
        return None;
    }

    let display_name = from
        .get("first_name")
        .and_then(Value::as_str)
        .unwrap_or(username);

    Some(
        IncomingMessage::new(
            "telegram",
            chat_id.to_string(),
            user_id.as_deref().unwrap_or(username),
            text,
        )
        .with_user_name(display_name),
    )
}

/// Check if any identity in the iterator matches the allowed users list.
fn check_user_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut boundary = max_len;
        while !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }

        let chunk = &remaining[..boundary];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(boundary);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { boundary } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
