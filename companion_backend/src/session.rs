//! Per-user session state.
//!
//! A session is loaded once per inbound message, transformed by
//! [`next_mood`], and written back one field at a time through the
//! [`SessionStore`]. Two messages from the same user handled concurrently
//! may both load the same mood and the later write wins; that lost update is
//! accepted. History stays well-formed because every user/assistant pair is
//! appended in a single store transaction.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::MoodConfig;
use crate::store::SessionStore;

pub const INITIAL_AFFINITY: u32 = 10;
pub const MAX_AFFINITY: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Neutral,
    Warm,
    Angry,
}

impl Mood {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Mood::Neutral => "neutral",
            Mood::Warm => "warm",
            Mood::Angry => "angry",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "neutral" => Mood::Neutral,
            "angry" => Mood::Angry,
            // "happy" and "romantic" are written by older deployments.
            _ => Mood::Warm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipTier {
    Acquaintance,
    Friend,
    Partner,
}

impl RelationshipTier {
    pub fn from_affinity(affinity: u32) -> Self {
        match affinity {
            0..=24 => RelationshipTier::Acquaintance,
            25..=59 => RelationshipTier::Friend,
            _ => RelationshipTier::Partner,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelationshipTier::Acquaintance => "acquaintance",
            RelationshipTier::Friend => "friend",
            RelationshipTier::Partner => "partner",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("user") {
            Role::User
        } else {
            Role::Assistant
        }
    }
}

/// Who wrote a turn into history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnSource {
    Conversation,
    Operator,
}

impl TurnSource {
    pub fn as_db_str(self) -> &'static str {
        match self {
            TurnSource::Conversation => "conversation",
            TurnSource::Operator => "operator",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("operator") {
            TurnSource::Operator
        } else {
            TurnSource::Conversation
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default = "default_turn_source")]
    pub source: TurnSource,
}

fn default_turn_source() -> TurnSource {
    TurnSource::Conversation
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            source: TurnSource::Conversation,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            source: TurnSource::Conversation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub user_id: i64,
    pub display_name: String,
    pub mood: Mood,
    pub affinity: u32,
    pub created_at: DateTime<Utc>,
    /// Last genuine inbound message. Never touched by the scheduler.
    pub last_seen_at: DateTime<Utc>,
    /// Scheduler suppression marker.
    pub last_notified_at: Option<DateTime<Utc>>,
    /// Most recent turns only, chronological.
    #[serde(default)]
    pub history: Vec<Turn>,
    /// Set when the store could not be reached and this value lives only in memory.
    #[serde(skip)]
    pub detached: bool,
}

impl UserSession {
    pub fn new(user_id: i64, display_name: &str, mood: Mood, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            display_name: display_name.to_string(),
            mood,
            affinity: INITIAL_AFFINITY,
            created_at: now,
            last_seen_at: now,
            last_notified_at: None,
            history: Vec::new(),
            detached: false,
        }
    }

    pub fn relationship_tier(&self) -> RelationshipTier {
        RelationshipTier::from_affinity(self.affinity)
    }
}

/// Hostility and apology tokens, lowercased once.
#[derive(Debug, Clone)]
pub struct MoodLexicon {
    hostility: Vec<String>,
    apology: Vec<String>,
    calm: Mood,
}

impl MoodLexicon {
    pub fn new<I, J>(hostility: I, apology: J) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        J: IntoIterator,
        J::Item: AsRef<str>,
    {
        let normalize = |token: &str| token.trim().to_lowercase();
        Self {
            hostility: hostility
                .into_iter()
                .map(|t| normalize(t.as_ref()))
                .filter(|t| !t.is_empty())
                .collect(),
            apology: apology
                .into_iter()
                .map(|t| normalize(t.as_ref()))
                .filter(|t| !t.is_empty())
                .collect(),
            calm: Mood::Warm,
        }
    }

    pub fn from_config(config: &MoodConfig) -> Self {
        Self::new(&config.hostility_tokens, &config.apology_tokens)
    }

    fn is_hostile(&self, lowered: &str) -> bool {
        self.hostility.iter().any(|token| lowered.contains(token.as_str()))
    }

    fn is_apology(&self, lowered: &str) -> bool {
        self.apology.iter().any(|token| lowered.contains(token.as_str()))
    }
}

/// The mood state machine. Hostility always wins; an apology only matters
/// while angry; everything else is a self-loop.
pub fn next_mood(current: Mood, text: &str, lexicon: &MoodLexicon) -> Mood {
    let lowered = text.to_lowercase();
    if lexicon.is_hostile(&lowered) {
        Mood::Angry
    } else if current == Mood::Angry && lexicon.is_apology(&lowered) {
        lexicon.calm
    } else {
        current
    }
}

/// The last `n` turns of `session`, oldest first.
pub fn windowed_history(session: &UserSession, n: usize) -> &[Turn] {
    let start = session.history.len().saturating_sub(n);
    &session.history[start..]
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    lexicon: MoodLexicon,
    initial_mood: Mood,
    history_window: usize,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        lexicon: MoodLexicon,
        initial_mood: Mood,
        history_window: usize,
    ) -> Self {
        Self {
            store,
            lexicon,
            initial_mood,
            history_window: history_window.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    /// Fetch the session, creating it on first contact.
    ///
    /// Creation is an insert-if-absent, so two concurrent first messages
    /// converge on one row. If the store is unreachable the caller gets a
    /// detached default session and the conversation carries on.
    pub fn get_or_create(&self, user_id: i64, display_name: &str) -> UserSession {
        let fresh = UserSession::new(user_id, display_name, self.initial_mood, Utc::now());
        let loaded = self
            .store
            .insert_if_absent(&fresh)
            .and_then(|created| {
                if created {
                    tracing::info!("Created session for user {}", user_id);
                }
                self.store.load(user_id, self.history_window)
            });

        match loaded {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::warn!("Session for user {} vanished after upsert", user_id);
                Self::detach(fresh)
            }
            Err(e) => {
                tracing::warn!(
                    "Session store unavailable for user {}, using defaults: {}",
                    user_id,
                    e
                );
                Self::detach(fresh)
            }
        }
    }

    pub fn find(&self, user_id: i64) -> Result<Option<UserSession>> {
        self.store.load(user_id, self.history_window)
    }

    /// A default session for when the store cannot answer.
    pub fn detached_default(&self, user_id: i64, display_name: &str) -> UserSession {
        Self::detach(UserSession::new(
            user_id,
            display_name,
            self.initial_mood,
            Utc::now(),
        ))
    }

    fn detach(mut session: UserSession) -> UserSession {
        session.detached = true;
        session
    }

    /// Stamp activity and apply the mood transition for an inbound message.
    ///
    /// Both writes happen before this returns, so the reply that follows is
    /// always generated against the persisted mood.
    pub fn record_inbound(&self, session: &mut UserSession, text: &str, now: DateTime<Utc>) -> Mood {
        let before = session.mood;
        let after = next_mood(before, text, &self.lexicon);
        session.mood = after;
        session.last_seen_at = now;

        if let Err(e) = self.store.set_last_seen(session.user_id, now) {
            tracing::warn!("Failed to stamp activity for user {}: {}", session.user_id, e);
        }
        if after != before {
            tracing::debug!(
                "Mood for user {}: {} -> {}",
                session.user_id,
                before.as_db_str(),
                after.as_db_str()
            );
            if let Err(e) = self.store.set_mood(session.user_id, after) {
                tracing::warn!("Failed to persist mood for user {}: {}", session.user_id, e);
            }
        }
        after
    }

    pub fn append_turn(&self, session: &mut UserSession, role: Role, content: &str) {
        let turn = Turn {
            role,
            content: content.to_string(),
            source: TurnSource::Conversation,
        };
        if let Err(e) = self.store.append_turns(session.user_id, std::slice::from_ref(&turn)) {
            tracing::warn!("Failed to append turn for user {}: {}", session.user_id, e);
        }
        session.history.push(turn);
        self.trim_loaded_history(session);
    }

    /// Append one completed request cycle: the user turn, then the reply.
    pub fn append_exchange(&self, session: &mut UserSession, user_text: &str, reply: &str) {
        let turns = [Turn::user(user_text), Turn::assistant(reply)];
        match self.store.append_turns(session.user_id, &turns) {
            Ok(()) => match self.store.increment_affinity(session.user_id, 1, MAX_AFFINITY) {
                Ok(affinity) => session.affinity = affinity,
                Err(e) => tracing::warn!(
                    "Failed to bump affinity for user {}: {}",
                    session.user_id,
                    e
                ),
            },
            Err(e) => tracing::warn!(
                "Failed to persist history for user {}: {}",
                session.user_id,
                e
            ),
        }
        session.history.extend(turns);
        self.trim_loaded_history(session);
    }

    fn trim_loaded_history(&self, session: &mut UserSession) {
        let excess = session.history.len().saturating_sub(self.history_window);
        if excess > 0 {
            session.history.drain(..excess);
        }
    }

    /// Scheduler-only suppression stamp; leaves `last_seen_at` alone.
    pub fn mark_notified(&self, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        self.store.set_last_notified(user_id, now)
    }

    /// Operator-authored reply appended outside the request cycle.
    ///
    /// Written as an assistant turn so the persona "remembers" saying it; mood
    /// and affinity are untouched.
    pub fn inject_operator_message(&self, user_id: i64, content: &str) -> Result<Turn> {
        let content = content.trim();
        if content.is_empty() {
            return Err(anyhow!("operator message is empty"));
        }
        if self.store.load(user_id, 0)?.is_none() {
            return Err(anyhow!("no session for user {}", user_id));
        }
        let turn = Turn {
            role: Role::Assistant,
            content: content.to_string(),
            source: TurnSource::Operator,
        };
        self.store.append_turns(user_id, std::slice::from_ref(&turn))?;
        tracing::info!("Operator message appended for user {}", user_id);
        Ok(turn)
    }
}
