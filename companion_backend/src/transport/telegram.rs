//! Telegram Bot API transport.
//!
//! Talks to the Bot API directly over `reqwest`: long-polls `getUpdates`,
//! converts updates into [`InboundEvent`]s and hands each one to the
//! [`ChatBot`] on its own task so a slow completion for one user never
//! delays another.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{ChatTransport, InlineButton, MembershipStatus};
use crate::bot::{ChatBot, InboundEvent};

/// Telegram enforces a 4096-character limit per message.
const MAX_MESSAGE_CHARS: usize = 4096;
const LONG_POLL_SECS: u64 = 30;

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Deserialize)]
struct ChatMember {
    status: MembershipStatus,
}

/// Convert a raw update into something the bot understands.
pub fn to_inbound(update: Update) -> Option<InboundEvent> {
    // Every callback becomes an event so it gets answered, even without a message.
    if let Some(query) = update.callback_query {
        let (chat_id, message_id) = match query.message {
            Some(message) => (message.chat.id, Some(message.message_id)),
            None => (query.from.id, None),
        };
        return Some(InboundEvent::Callback {
            callback_id: query.id,
            user_id: query.from.id,
            display_name: query.from.first_name,
            chat_id,
            message_id,
            data: query.data.unwrap_or_default(),
        });
    }

    let message = update.message?;
    let from = message.from?;
    let text = message.text?.trim().to_string();
    if text.is_empty() {
        return None;
    }

    if let Some(command) = text.strip_prefix('/') {
        // "/start@riya_bot payload" -> "start"
        let name = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .split('@')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        return Some(InboundEvent::Command {
            user_id: from.id,
            display_name: from.first_name,
            chat_id: message.chat.id,
            name,
        });
    }

    Some(InboundEvent::Text {
        user_id: from.id,
        display_name: from.first_name,
        chat_id: message.chat.id,
        text,
    })
}

fn truncate_message(text: &str) -> &str {
    match text.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

fn inline_keyboard(buttons: &[InlineButton]) -> serde_json::Value {
    let rows: Vec<serde_json::Value> = buttons
        .iter()
        .map(|button| match button {
            InlineButton::Url { label, url } => json!([{ "text": label, "url": url }]),
            InlineButton::Callback { label, data } => {
                json!([{ "text": label, "callback_data": data }])
            }
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

pub struct TelegramTransport {
    api_base: String,
    client: reqwest::Client,
}

impl TelegramTransport {
    pub fn new(api_url: &str, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECS + 30))
            .build()
            .context("Failed to build Telegram HTTP client")?;
        Ok(Self {
            api_base: format!("{}/bot{}", api_url.trim_end_matches('/'), token),
            client,
        })
    }

    async fn call<T>(&self, method: &str, params: serde_json::Value) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/{}", self.api_base, method);
        let resp = self
            .client
            .post(&url)
            .json(&params)
            .send()
            .await
            .with_context(|| format!("Telegram {} request failed", method))?;

        let body: TelegramResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("Telegram {} returned an unreadable body", method))?;

        if !body.ok {
            bail!(
                "Telegram {} failed: {}",
                method,
                body.description.unwrap_or_else(|| "ok=false".to_string())
            );
        }
        body.result
            .ok_or_else(|| anyhow!("Telegram {} returned no result", method))
    }

    pub async fn poll_updates(&self, offset: i64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": LONG_POLL_SECS,
                "allowed_updates": ["message", "callback_query"]
            }),
        )
        .await
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                json!({ "chat_id": chat_id, "text": truncate_message(text) }),
            )
            .await?;
        tracing::debug!("Telegram: sent message to chat {}", chat_id);
        Ok(())
    }

    async fn send_with_buttons(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": chat_id,
                    "text": truncate_message(text),
                    "reply_markup": inline_keyboard(buttons),
                }),
            )
            .await?;
        Ok(())
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        let _: bool = self
            .call(
                "sendChatAction",
                json!({ "chat_id": chat_id, "action": "typing" }),
            )
            .await?;
        Ok(())
    }

    async fn membership_status(&self, channel_id: &str, user_id: i64) -> Result<MembershipStatus> {
        let member: ChatMember = self
            .call(
                "getChatMember",
                json!({ "chat_id": channel_id, "user_id": user_id }),
            )
            .await?;
        Ok(member.status)
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let _: bool = self
            .call(
                "deleteMessage",
                json!({ "chat_id": chat_id, "message_id": message_id }),
            )
            .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        let _: bool = self
            .call(
                "answerCallbackQuery",
                json!({ "callback_query_id": callback_id }),
            )
            .await?;
        Ok(())
    }
}

// ─── Polling loop ─────────────────────────────────────────────────────────────

/// Long-poll forever, spawning one task per update.
pub async fn run_polling(transport: Arc<TelegramTransport>, bot: Arc<ChatBot>) {
    let mut offset: i64 = 0;
    tracing::info!("Telegram long polling started");

    loop {
        let updates = match transport.poll_updates(offset).await {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!("Telegram getUpdates error: {:#}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        for update in updates {
            offset = update.update_id + 1;
            let Some(event) = to_inbound(update) else {
                continue;
            };
            let bot = bot.clone();
            tokio::spawn(async move {
                bot.handle(event).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Update {
        serde_json::from_str(raw).expect("update json")
    }

    #[test]
    fn text_message_becomes_text_event() {
        let update = parse(
            r#"{"update_id": 5, "message": {"message_id": 9, "from": {"id": 77, "first_name": "Aman"},
                "chat": {"id": 77}, "text": "  kya haal  "}}"#,
        );
        match to_inbound(update) {
            Some(InboundEvent::Text { user_id, display_name, chat_id, text }) => {
                assert_eq!((user_id, chat_id), (77, 77));
                assert_eq!(display_name, "Aman");
                assert_eq!(text, "kya haal");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn command_is_normalized() {
        let update = parse(
            r#"{"update_id": 1, "message": {"message_id": 1, "from": {"id": 3, "first_name": "A"},
                "chat": {"id": 3}, "text": "/Start@riya_bot ref123"}}"#,
        );
        match to_inbound(update) {
            Some(InboundEvent::Command { name, .. }) => assert_eq!(name, "start"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn callback_query_keeps_prompt_message_id() {
        let update = parse(
            r#"{"update_id": 2, "callback_query": {"id": "cb1", "from": {"id": 4, "first_name": "B"},
                "message": {"message_id": 55, "chat": {"id": 4}}, "data": "verify_join"}}"#,
        );
        match to_inbound(update) {
            Some(InboundEvent::Callback { callback_id, message_id, data, .. }) => {
                assert_eq!(callback_id, "cb1");
                assert_eq!(message_id, Some(55));
                assert_eq!(data, "verify_join");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn callback_without_message_still_reaches_the_bot() {
        let update = parse(
            r#"{"update_id": 4, "callback_query": {"id": "cb9", "from": {"id": 8, "first_name": "C"},
                "inline_message_id": "AAA", "data": "verify_join"}}"#,
        );
        assert_eq!(
            to_inbound(update),
            Some(InboundEvent::Callback {
                callback_id: "cb9".to_string(),
                user_id: 8,
                display_name: "C".to_string(),
                chat_id: 8,
                message_id: None,
                data: "verify_join".to_string(),
            })
        );
    }

    #[test]
    fn non_text_updates_are_ignored() {
        let update = parse(
            r#"{"update_id": 3, "message": {"message_id": 1, "from": {"id": 3, "first_name": "A"},
                "chat": {"id": 3}}}"#,
        );
        assert!(to_inbound(update).is_none());
    }

    #[test]
    fn unknown_membership_status_deserializes() {
        let member: ChatMember = serde_json::from_str(r#"{"status": "something_new"}"#).unwrap();
        assert_eq!(member.status, MembershipStatus::Unknown);
        let member: ChatMember = serde_json::from_str(r#"{"status": "administrator"}"#).unwrap();
        assert!(member.status.grants_access());
    }

    #[test]
    fn keyboard_has_one_button_per_row() {
        let keyboard = inline_keyboard(&[
            InlineButton::Url {
                label: "Join".to_string(),
                url: "https://t.me/chan".to_string(),
            },
            InlineButton::Callback {
                label: "Done".to_string(),
                data: "verify_join".to_string(),
            },
        ]);
        assert_eq!(keyboard["inline_keyboard"][0][0]["url"], "https://t.me/chan");
        assert_eq!(keyboard["inline_keyboard"][1][0]["callback_data"], "verify_join");
    }

    #[test]
    fn long_messages_are_truncated_on_char_boundary() {
        let text = "é".repeat(MAX_MESSAGE_CHARS + 10);
        assert_eq!(truncate_message(&text).chars().count(), MAX_MESSAGE_CHARS);
    }
}
