//! In-crate fakes shared by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ProviderError;
use crate::llm_client::{CompletionProvider, CompletionRequest};
use crate::session::{Mood, Turn, UserSession};
use crate::store::{NudgeQuery, SessionStore, StoredTurn};
use crate::transport::{ChatTransport, InlineButton, MembershipStatus};

/// A store whose every call fails, standing in for an unreachable database.
pub struct FailingStore;

fn outage<T>() -> Result<T> {
    bail!("session store unavailable")
}

impl SessionStore for FailingStore {
    fn insert_if_absent(&self, _session: &UserSession) -> Result<bool> {
        outage()
    }
    fn load(&self, _user_id: i64, _history_limit: usize) -> Result<Option<UserSession>> {
        outage()
    }
    fn set_mood(&self, _user_id: i64, _mood: Mood) -> Result<()> {
        outage()
    }
    fn set_last_seen(&self, _user_id: i64, _at: DateTime<Utc>) -> Result<()> {
        outage()
    }
    fn set_last_notified(&self, _user_id: i64, _at: DateTime<Utc>) -> Result<()> {
        outage()
    }
    fn append_turns(&self, _user_id: i64, _turns: &[Turn]) -> Result<()> {
        outage()
    }
    fn increment_affinity(&self, _user_id: i64, _delta: u32, _cap: u32) -> Result<u32> {
        outage()
    }
    fn find_nudge_candidates(&self, _query: &NudgeQuery) -> Result<Vec<UserSession>> {
        outage()
    }
    fn count_sessions(&self) -> Result<usize> {
        outage()
    }
    fn count_seen_since(&self, _since: DateTime<Utc>) -> Result<usize> {
        outage()
    }
    fn count_notified_since(&self, _since: DateTime<Utc>) -> Result<usize> {
        outage()
    }
    fn count_in_mood(&self, _mood: Mood) -> Result<usize> {
        outage()
    }
    fn list_sessions(&self, _offset: usize, _limit: usize) -> Result<Vec<UserSession>> {
        outage()
    }
    fn history_page(&self, _user_id: i64, _offset: usize, _limit: usize) -> Result<Vec<StoredTurn>> {
        outage()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text { chat_id: i64, text: String },
    Buttons { chat_id: i64, text: String, buttons: Vec<InlineButton> },
    Typing { chat_id: i64 },
    Deleted { chat_id: i64, message_id: i64 },
    CallbackAnswered { callback_id: String },
}

/// Records everything sent; membership is scripted per user.
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<Sent>>,
    members: Mutex<HashMap<i64, MembershipStatus>>,
    unreachable_chats: Mutex<HashSet<i64>>,
    membership_outage: AtomicBool,
    membership_queries: Mutex<Vec<(String, i64)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, user_id: i64, status: MembershipStatus) {
        self.members.lock().unwrap().insert(user_id, status);
    }

    pub fn make_member(&self, user_id: i64) {
        self.set_status(user_id, MembershipStatus::Member);
    }

    /// Every send to `chat_id` fails from now on.
    pub fn fail_sends_to(&self, chat_id: i64) {
        self.unreachable_chats.lock().unwrap().insert(chat_id);
    }

    pub fn fail_membership_checks(&self) {
        self.membership_outage.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Plain and button texts delivered to `chat_id`, in order.
    pub fn texts_to(&self, chat_id: i64) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|sent| match sent {
                Sent::Text { chat_id: id, text } | Sent::Buttons { chat_id: id, text, .. }
                    if id == chat_id =>
                {
                    Some(text)
                }
                _ => None,
            })
            .collect()
    }

    pub fn membership_queries(&self) -> Vec<(String, i64)> {
        self.membership_queries.lock().unwrap().clone()
    }

    fn deliver(&self, chat_id: i64, sent: Sent) -> Result<()> {
        if self.unreachable_chats.lock().unwrap().contains(&chat_id) {
            return Err(anyhow!("Forbidden: bot was blocked by the user"));
        }
        self.sent.lock().unwrap().push(sent);
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        self.deliver(
            chat_id,
            Sent::Text {
                chat_id,
                text: text.to_string(),
            },
        )
    }

    async fn send_with_buttons(&self, chat_id: i64, text: &str, buttons: &[InlineButton]) -> Result<()> {
        self.deliver(
            chat_id,
            Sent::Buttons {
                chat_id,
                text: text.to_string(),
                buttons: buttons.to_vec(),
            },
        )
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        self.deliver(chat_id, Sent::Typing { chat_id })
    }

    async fn membership_status(&self, channel_id: &str, user_id: i64) -> Result<MembershipStatus> {
        self.membership_queries
            .lock()
            .unwrap()
            .push((channel_id.to_string(), user_id));
        if self.membership_outage.load(Ordering::SeqCst) {
            bail!("Bad Request: member list is inaccessible");
        }
        Ok(self
            .members
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .unwrap_or(MembershipStatus::Left))
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        self.deliver(chat_id, Sent::Deleted { chat_id, message_id })
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        self.sent.lock().unwrap().push(Sent::CallbackAnswered {
            callback_id: callback_id.to_string(),
        });
        Ok(())
    }
}

/// Scripted completion provider. Once the script runs out the fallback
/// outcome repeats forever.
pub struct FakeProvider {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Result<String, ProviderError>,
    requests: Mutex<Vec<CompletionRequest>>,
    delay: Option<Duration>,
}

impl FakeProvider {
    pub fn scripted(script: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Err(ProviderError::Malformed("script exhausted".to_string())),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn replying<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let replies: Vec<String> = replies.into_iter().map(Into::into).collect();
        let mut provider = Self::scripted(replies.iter().cloned().map(Ok).collect());
        if let Some(last) = replies.last() {
            provider.fallback = Ok(last.clone());
        }
        provider
    }

    pub fn failing(error: ProviderError) -> Self {
        let mut provider = Self::scripted(Vec::new());
        provider.fallback = Err(error);
        provider
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for FakeProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError> {
        self.requests.lock().unwrap().push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
