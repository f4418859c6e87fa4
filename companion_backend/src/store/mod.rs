//! Persistence for user sessions.
//!
//! The engine never holds its own locks across requests; it relies on each
//! store call being atomic on its own (single-field updates, insert-if-absent,
//! transactional multi-turn append).

pub mod sqlite;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{Mood, Role, Turn, TurnSource, UserSession};

/// Which notifications count as "already sent" for a candidate query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// Skip sessions notified after their last genuine activity.
    SinceLastSeen,
    /// Skip sessions notified at or after this instant.
    Since(DateTime<Utc>),
}

/// Range query over `last_seen_at` for the re-engagement scheduler.
#[derive(Debug, Clone)]
pub struct NudgeQuery {
    /// Inclusive lower bound; `None` means unbounded.
    pub seen_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub seen_to: DateTime<Utc>,
    pub suppression: Suppression,
    /// Results are ordered most-recently-seen first and capped here.
    pub limit: usize,
}

/// A persisted history entry as shown to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTurn {
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub source: TurnSource,
    pub created_at: DateTime<Utc>,
}

pub trait SessionStore: Send + Sync {
    /// Insert `session` unless a row for its user already exists.
    /// Returns `true` when a new row was written.
    fn insert_if_absent(&self, session: &UserSession) -> Result<bool>;

    /// Load a session with at most `history_limit` most recent turns.
    fn load(&self, user_id: i64, history_limit: usize) -> Result<Option<UserSession>>;

    fn set_mood(&self, user_id: i64, mood: Mood) -> Result<()>;
    fn set_last_seen(&self, user_id: i64, at: DateTime<Utc>) -> Result<()>;
    fn set_last_notified(&self, user_id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Append turns in order, all or nothing.
    fn append_turns(&self, user_id: i64, turns: &[Turn]) -> Result<()>;

    /// Add `delta` to affinity, saturating at `cap`. Returns the new value.
    fn increment_affinity(&self, user_id: i64, delta: u32, cap: u32) -> Result<u32>;

    /// Sessions matching `query`, without history.
    fn find_nudge_candidates(&self, query: &NudgeQuery) -> Result<Vec<UserSession>>;

    fn count_sessions(&self) -> Result<usize>;
    fn count_seen_since(&self, since: DateTime<Utc>) -> Result<usize>;
    fn count_notified_since(&self, since: DateTime<Utc>) -> Result<usize>;
    fn count_in_mood(&self, mood: Mood) -> Result<usize>;

    /// Sessions ordered by most recent activity, without history.
    fn list_sessions(&self, offset: usize, limit: usize) -> Result<Vec<UserSession>>;

    /// Chronological page of history. `offset_from_latest = 0` is the newest page.
    fn history_page(
        &self,
        user_id: i64,
        offset_from_latest: usize,
        limit: usize,
    ) -> Result<Vec<StoredTurn>>;
}
