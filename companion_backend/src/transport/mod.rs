//! Chat platform transport.
//!
//! The engine only needs a handful of outbound operations; everything except
//! the membership query is fire-and-forget from its point of view.

pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A user's status in the required channel, as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
    #[serde(other)]
    Unknown,
}

impl MembershipStatus {
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            MembershipStatus::Creator | MembershipStatus::Administrator | MembershipStatus::Member
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineButton {
    Url { label: String, url: String },
    Callback { label: String, data: String },
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()>;

    /// Send text with one row per button.
    async fn send_with_buttons(&self, chat_id: i64, text: &str, buttons: &[InlineButton])
        -> Result<()>;

    async fn send_typing(&self, chat_id: i64) -> Result<()>;

    async fn membership_status(&self, channel_id: &str, user_id: i64) -> Result<MembershipStatus>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()>;

    async fn answer_callback(&self, callback_id: &str) -> Result<()>;
}
