use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::{NudgeQuery, SessionStore, StoredTurn, Suppression};
use crate::session::{Mood, Role, Turn, TurnSource, UserSession};

const SESSION_COLUMNS: &str =
    "user_id, display_name, mood, affinity, created_at, last_seen_at, last_notified_at";

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<UserSession> {
    let last_notified_at = match row.get::<_, Option<String>>(6)? {
        Some(raw) => Some(parse_ts(raw, 6)?),
        None => None,
    };
    Ok(UserSession {
        user_id: row.get(0)?,
        display_name: row.get(1)?,
        mood: Mood::from_db(&row.get::<_, String>(2)?),
        affinity: row.get::<_, i64>(3)?.clamp(0, u32::MAX as i64) as u32,
        created_at: parse_ts(row.get(4)?, 4)?,
        last_seen_at: parse_ts(row.get(5)?, 5)?,
        last_notified_at,
        history: Vec::new(),
        detached: false,
    })
}

pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open session database {:?}", path))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS sessions (
                user_id INTEGER PRIMARY KEY,
                display_name TEXT NOT NULL,
                mood TEXT NOT NULL,
                affinity INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                last_notified_at TEXT
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS turns (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES sessions(user_id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'conversation',
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_last_seen ON sessions(last_seen_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_turns_user_seq ON turns(user_id, seq DESC)",
            [],
        )?;

        Ok(())
    }

    fn update_one(&self, sql: &str, user_id: i64, value: &dyn rusqlite::ToSql) -> Result<()> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(sql, params![user_id, value])?;
        if changed == 0 {
            bail!("no session for user {}", user_id);
        }
        Ok(())
    }

    fn recent_turns(conn: &Connection, user_id: i64, limit: usize) -> Result<Vec<Turn>> {
        let mut stmt = conn.prepare(
            "SELECT role, content, source FROM turns
             WHERE user_id = ?1
             ORDER BY seq DESC
             LIMIT ?2",
        )?;
        let turns = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(Turn {
                    role: Role::from_db(&row.get::<_, String>(0)?),
                    content: row.get(1)?,
                    source: TurnSource::from_db(&row.get::<_, String>(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        // Reverse to get chronological order
        Ok(turns.into_iter().rev().collect())
    }

    fn count(&self, sql: &str, value: &dyn rusqlite::ToSql) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(sql, [value], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl SessionStore for SqliteSessionStore {
    fn insert_if_absent(&self, session: &UserSession) -> Result<bool> {
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sessions (user_id, display_name, mood, affinity, created_at, last_seen_at, last_notified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.user_id,
                session.display_name,
                session.mood.as_db_str(),
                session.affinity as i64,
                ts(session.created_at),
                ts(session.last_seen_at),
                session.last_notified_at.map(ts),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn load(&self, user_id: i64, history_limit: usize) -> Result<Option<UserSession>> {
        let conn = self.lock_conn()?;
        let session = conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE user_id = ?1", SESSION_COLUMNS),
                [user_id],
                session_from_row,
            )
            .optional()?;

        let Some(mut session) = session else {
            return Ok(None);
        };
        if history_limit > 0 {
            session.history = Self::recent_turns(&conn, user_id, history_limit)?;
        }
        Ok(Some(session))
    }

    fn set_mood(&self, user_id: i64, mood: Mood) -> Result<()> {
        self.update_one(
            "UPDATE sessions SET mood = ?2 WHERE user_id = ?1",
            user_id,
            &mood.as_db_str(),
        )
    }

    fn set_last_seen(&self, user_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.update_one(
            "UPDATE sessions SET last_seen_at = ?2 WHERE user_id = ?1",
            user_id,
            &ts(at),
        )
    }

    fn set_last_notified(&self, user_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.update_one(
            "UPDATE sessions SET last_notified_at = ?2 WHERE user_id = ?1",
            user_id,
            &ts(at),
        )
    }

    fn append_turns(&self, user_id: i64, turns: &[Turn]) -> Result<()> {
        if turns.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let now = ts(Utc::now());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO turns (user_id, role, content, source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for turn in turns {
                stmt.execute(params![
                    user_id,
                    turn.role.as_str(),
                    turn.content,
                    turn.source.as_db_str(),
                    now
                ])
                .with_context(|| format!("Failed to append turn for user {}", user_id))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn increment_affinity(&self, user_id: i64, delta: u32, cap: u32) -> Result<u32> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET affinity = MIN(affinity + ?2, ?3) WHERE user_id = ?1",
            params![user_id, delta as i64, cap as i64],
        )?;
        if changed == 0 {
            bail!("no session for user {}", user_id);
        }
        let affinity: i64 = conn.query_row(
            "SELECT affinity FROM sessions WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(affinity.clamp(0, u32::MAX as i64) as u32)
    }

    fn find_nudge_candidates(&self, query: &NudgeQuery) -> Result<Vec<UserSession>> {
        let conn = self.lock_conn()?;
        let seen_from = query.seen_from.map(ts);
        let seen_to = ts(query.seen_to);
        let suppress_since = match query.suppression {
            Suppression::SinceLastSeen => None,
            Suppression::Since(at) => Some(ts(at)),
        };

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions
             WHERE (?1 IS NULL OR last_seen_at >= ?1)
               AND last_seen_at <= ?2
               AND (
                 last_notified_at IS NULL
                 OR (?3 IS NULL AND last_notified_at < last_seen_at)
                 OR (?3 IS NOT NULL AND last_notified_at < ?3)
               )
             ORDER BY last_seen_at DESC
             LIMIT ?4",
            SESSION_COLUMNS
        ))?;

        let sessions = stmt
            .query_map(
                params![seen_from, seen_to, suppress_since, query.limit as i64],
                session_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    fn count_sessions(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn count_seen_since(&self, since: DateTime<Utc>) -> Result<usize> {
        self.count(
            "SELECT COUNT(*) FROM sessions WHERE last_seen_at >= ?1",
            &ts(since),
        )
    }

    fn count_notified_since(&self, since: DateTime<Utc>) -> Result<usize> {
        self.count(
            "SELECT COUNT(*) FROM sessions WHERE last_notified_at >= ?1",
            &ts(since),
        )
    }

    fn count_in_mood(&self, mood: Mood) -> Result<usize> {
        self.count(
            "SELECT COUNT(*) FROM sessions WHERE mood = ?1",
            &mood.as_db_str(),
        )
    }

    fn list_sessions(&self, offset: usize, limit: usize) -> Result<Vec<UserSession>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions
             ORDER BY last_seen_at DESC
             LIMIT ?1 OFFSET ?2",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map(params![limit as i64, offset as i64], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    fn history_page(
        &self,
        user_id: i64,
        offset_from_latest: usize,
        limit: usize,
    ) -> Result<Vec<StoredTurn>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT seq, role, content, source, created_at FROM turns
             WHERE user_id = ?1
             ORDER BY seq DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let turns = stmt
            .query_map(
                params![user_id, limit as i64, offset_from_latest as i64],
                |row| {
                    Ok(StoredTurn {
                        seq: row.get(0)?,
                        role: Role::from_db(&row.get::<_, String>(1)?),
                        content: row.get(2)?,
                        source: TurnSource::from_db(&row.get::<_, String>(3)?),
                        created_at: parse_ts(row.get(4)?, 4)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(turns.into_iter().rev().collect())
    }
}
