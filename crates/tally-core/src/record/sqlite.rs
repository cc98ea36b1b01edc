//! SQLite system of record.
//!
//! One connection behind a mutex per process. Vote writes run in
//! `BEGIN IMMEDIATE` transactions so the read of the current row and the
//! write that follows cannot interleave with another writer, and
//! `UNIQUE (voter_id, entity_id)` backs that up across processes sharing
//! the file.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{ffi, params, Connection, OptionalExtension, TransactionBehavior};

use super::{RecordStore, VoteRow, VoteWrite};
use crate::model::{EntityId, VoteCounts, VoteDelta, VoteIntent, VoteTransition, VoteType, VoterId};
use crate::scoring::{Badge, BadgeType, EntityScores, ScoreBreakdown, ValidationMode};

/// SQLite-backed [`RecordStore`].
#[derive(Debug)]
pub struct SqliteRecord {
    conn: Mutex<Connection>,
}

impl SqliteRecord {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories if they don't exist.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create parent directories: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.busy_timeout(busy_timeout)
            .context("Failed to set busy timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("Failed to configure database")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (tests and throwaway runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create all tables and indexes if they don't exist.
    pub fn init_schema(&self) -> Result<()> {
        self.lock()?
            .execute_batch(SCHEMA_SQL)
            .context("Failed to initialize schema")?;
        Ok(())
    }

    /// Run a closure against the raw connection (for queries outside the trait).
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    // ------------------------------------------------------------------------
    // Collaborator writes
    //
    // Voters, entities, component scores and badges belong to other parts of
    // the application. These exist so the core can be exercised end to end.
    // ------------------------------------------------------------------------

    pub fn insert_voter(&self, voter_id: VoterId) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR IGNORE INTO voters (voter_id, created_at) VALUES (?1, ?2)",
                params![voter_id, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("Failed to insert voter {voter_id}"))?;
        Ok(())
    }

    pub fn insert_entity(&self, entity_id: EntityId) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR IGNORE INTO entities (entity_id, updated_at) VALUES (?1, ?2)",
                params![entity_id, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("Failed to insert entity {entity_id}"))?;
        Ok(())
    }

    /// Overwrite the four component scores, as the scoring collaborators do.
    pub fn set_component_scores(
        &self,
        entity_id: EntityId,
        quality: f64,
        verification: f64,
        validation: f64,
        community: f64,
    ) -> Result<()> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE entities SET
                    quality_score = ?1,
                    verification_score = ?2,
                    validation_score = ?3,
                    community_score = ?4,
                    updated_at = ?5
                WHERE entity_id = ?6",
                params![
                    quality,
                    verification,
                    validation,
                    community,
                    Utc::now().to_rfc3339(),
                    entity_id
                ],
            )
            .context("Failed to update component scores")?;
        if changed == 0 {
            bail!("Entity not found: {entity_id}");
        }
        Ok(())
    }

    /// Record a badge worth its table value. Returns the badge id.
    pub fn award_badge(&self, entity_id: EntityId, badge_type: BadgeType) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO badges (entity_id, badge_type, points, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entity_id,
                badge_type,
                badge_type.points(),
                Utc::now().to_rfc3339()
            ],
        )
        .with_context(|| format!("Failed to award {badge_type} badge to entity {entity_id}"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Remove every badge of an entity. Returns how many were removed.
    pub fn remove_badges(&self, entity_id: EntityId) -> Result<usize> {
        let removed = self
            .lock()?
            .execute("DELETE FROM badges WHERE entity_id = ?1", params![entity_id])
            .context("Failed to remove badges")?;
        Ok(removed)
    }

    /// Stored audit breakdown of the last score recompute.
    pub fn score_breakdown(&self, entity_id: EntityId) -> Result<Option<ScoreBreakdown>> {
        let raw: Option<String> = self
            .lock()?
            .query_row(
                "SELECT score_breakdown FROM entities WHERE entity_id = ?1",
                params![entity_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query score breakdown")?
            .flatten();

        raw.map(|json| serde_json::from_str(&json).context("Failed to parse score breakdown"))
            .transpose()
    }

    // ------------------------------------------------------------------------
    // Pending-sync set
    //
    // Durable home for the pending-sync set when no Redis is configured, so a
    // mark written by one process is drained by another.
    // ------------------------------------------------------------------------

    pub fn mark_pending(&self, entity_id: EntityId) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR IGNORE INTO pending_sync (entity_id, marked_at) VALUES (?1, ?2)",
                params![entity_id, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("Failed to mark entity {entity_id} pending"))?;
        Ok(())
    }

    /// Remove and return up to `max_n` pending entities, lowest id first.
    pub fn pop_pending(&self, max_n: usize) -> Result<Vec<EntityId>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin pending-sync transaction")?;

        let batch = {
            let mut stmt = tx
                .prepare("SELECT entity_id FROM pending_sync ORDER BY entity_id LIMIT ?1")
                .context("Failed to prepare pending-sync query")?;
            let ids = stmt
                .query_map(params![max_n as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<EntityId>>>()
                .context("Failed to read pending-sync set")?;
            ids
        };
        for entity_id in &batch {
            tx.execute(
                "DELETE FROM pending_sync WHERE entity_id = ?1",
                params![entity_id],
            )
            .context("Failed to pop pending entity")?;
        }

        tx.commit().context("Failed to commit pending-sync pop")?;
        Ok(batch)
    }

    pub fn clear_pending(&self, entity_id: EntityId) -> Result<()> {
        self.lock()?
            .execute(
                "DELETE FROM pending_sync WHERE entity_id = ?1",
                params![entity_id],
            )
            .context("Failed to clear pending entity")?;
        Ok(())
    }

    pub fn pending_len(&self) -> Result<usize> {
        let count: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM pending_sync", [], |row| row.get(0))
            .context("Failed to count pending entities")?;
        Ok(count as usize)
    }
}

impl RecordStore for SqliteRecord {
    fn entity_exists(&self, entity_id: EntityId) -> Result<bool> {
        let found: Option<i64> = self
            .lock()?
            .query_row(
                "SELECT 1 FROM entities WHERE entity_id = ?1",
                params![entity_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query entity")?;
        Ok(found.is_some())
    }

    fn voter_exists(&self, voter_id: VoterId) -> Result<bool> {
        let found: Option<i64> = self
            .lock()?
            .query_row(
                "SELECT 1 FROM voters WHERE voter_id = ?1",
                params![voter_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query voter")?;
        Ok(found.is_some())
    }

    fn find_vote(&self, voter_id: VoterId, entity_id: EntityId) -> Result<Option<VoteRow>> {
        self.lock()?
            .query_row(
                "SELECT vote_id, voter_id, entity_id, vote_type, created_at, updated_at
                 FROM votes WHERE voter_id = ?1 AND entity_id = ?2",
                params![voter_id, entity_id],
                |row| {
                    Ok(VoteRow {
                        vote_id: row.get(0)?,
                        voter_id: row.get(1)?,
                        entity_id: row.get(2)?,
                        vote_type: row.get(3)?,
                        created_at: parse_ts(4, &row.get::<_, String>(4)?)?,
                        updated_at: parse_ts(5, &row.get::<_, String>(5)?)?,
                    })
                },
            )
            .optional()
            .context("Failed to query vote")
    }

    fn votes_by_voter(&self, voter_id: VoterId) -> Result<Vec<(EntityId, VoteType)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT entity_id, vote_type FROM votes WHERE voter_id = ?1")
            .context("Failed to prepare voter votes query")?;
        let votes = stmt
            .query_map(params![voter_id], |row| {
                Ok((row.get::<_, EntityId>(0)?, row.get::<_, VoteType>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read voter votes")?;
        Ok(votes)
    }

    fn apply_vote(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
        intent: VoteIntent,
    ) -> Result<VoteWrite> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin vote transaction")?;

        let previous: Option<VoteType> = tx
            .query_row(
                "SELECT vote_type FROM votes WHERE voter_id = ?1 AND entity_id = ?2",
                params![voter_id, entity_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read current vote")?;

        let transition = VoteTransition::resolve(previous, intent);
        if !transition.is_change() {
            // Nothing written; dropping the transaction rolls it back.
            return Ok(VoteWrite::Applied(transition));
        }

        let now = Utc::now().to_rfc3339();
        match (transition.previous, transition.current) {
            (None, Some(vote_type)) => {
                let inserted = tx.execute(
                    "INSERT INTO votes (voter_id, entity_id, vote_type, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![voter_id, entity_id, vote_type, now],
                );
                match inserted {
                    Ok(_) => {}
                    Err(e) if is_unique_violation(&e) => return Ok(VoteWrite::Conflict),
                    Err(e) => return Err(e).context("Failed to insert vote"),
                }
            }
            (Some(_), Some(vote_type)) => {
                tx.execute(
                    "UPDATE votes SET vote_type = ?1, updated_at = ?2
                     WHERE voter_id = ?3 AND entity_id = ?4",
                    params![vote_type, now, voter_id, entity_id],
                )
                .context("Failed to update vote")?;
            }
            (Some(_), None) => {
                tx.execute(
                    "DELETE FROM votes WHERE voter_id = ?1 AND entity_id = ?2",
                    params![voter_id, entity_id],
                )
                .context("Failed to delete vote")?;
            }
            (None, None) => {}
        }

        tx.commit().context("Failed to commit vote")?;
        Ok(VoteWrite::Applied(transition))
    }

    fn count_votes(&self, entity_id: EntityId) -> Result<VoteCounts> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT vote_type, COUNT(*) FROM votes
                 WHERE entity_id = ?1 GROUP BY vote_type",
            )
            .context("Failed to prepare vote count query")?;
        let rows = stmt
            .query_map(params![entity_id], |row| {
                Ok((row.get::<_, VoteType>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to count votes")?;

        let mut counts = VoteCounts::default();
        for (vote_type, count) in rows {
            match vote_type {
                VoteType::Up => counts.upvotes = count as u64,
                VoteType::Down => counts.downvotes = count as u64,
            }
        }
        Ok(counts)
    }

    fn aggregate_counts(&self, entity_id: EntityId) -> Result<Option<VoteCounts>> {
        self.lock()?
            .query_row(
                "SELECT upvotes, downvotes FROM entities WHERE entity_id = ?1",
                params![entity_id],
                |row| {
                    Ok(VoteCounts::new(
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? as u64,
                    ))
                },
            )
            .optional()
            .context("Failed to query aggregate counts")
    }

    fn adjust_aggregate_counts(&self, entity_id: EntityId, delta: VoteDelta) -> Result<()> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE entities SET
                    upvotes = MAX(upvotes + ?1, 0),
                    downvotes = MAX(downvotes + ?2, 0),
                    updated_at = ?3
                WHERE entity_id = ?4",
                params![delta.up, delta.down, Utc::now().to_rfc3339(), entity_id],
            )
            .context("Failed to adjust aggregate counts")?;
        if changed == 0 {
            bail!("Entity not found: {entity_id}");
        }
        Ok(())
    }

    fn write_aggregate_counts(&self, entity_id: EntityId, counts: VoteCounts) -> Result<()> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE entities SET upvotes = ?1, downvotes = ?2, updated_at = ?3
                 WHERE entity_id = ?4",
                params![
                    counts.upvotes as i64,
                    counts.downvotes as i64,
                    Utc::now().to_rfc3339(),
                    entity_id
                ],
            )
            .context("Failed to write aggregate counts")?;
        if changed == 0 {
            bail!("Entity not found: {entity_id}");
        }
        Ok(())
    }

    fn entity_page(&self, after: EntityId, limit: usize) -> Result<Vec<EntityId>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT entity_id FROM entities WHERE entity_id > ?1
                 ORDER BY entity_id LIMIT ?2",
            )
            .context("Failed to prepare entity page query")?;
        let ids = stmt
            .query_map(params![after, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<EntityId>>>()
            .context("Failed to list entities")?;
        Ok(ids)
    }

    fn load_scores(&self, entity_id: EntityId) -> Result<Option<EntityScores>> {
        self.lock()?
            .query_row(
                "SELECT quality_score, verification_score, validation_score,
                        community_score, total_score, validation_mode, ai_validation_score
                 FROM entities WHERE entity_id = ?1",
                params![entity_id],
                |row| {
                    Ok(EntityScores {
                        quality: row.get(0)?,
                        verification: row.get(1)?,
                        validation: row.get(2)?,
                        community: row.get(3)?,
                        total: row.get(4)?,
                        mode: row.get(5)?,
                        ai_validation: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to query scores")
    }

    fn store_scores(
        &self,
        entity_id: EntityId,
        scores: &EntityScores,
        breakdown: &ScoreBreakdown,
    ) -> Result<()> {
        let breakdown_json =
            serde_json::to_string(breakdown).context("Failed to serialize score breakdown")?;
        let changed = self
            .lock()?
            .execute(
                "UPDATE entities SET
                    validation_score = ?1,
                    total_score = ?2,
                    validation_mode = ?3,
                    ai_validation_score = ?4,
                    score_breakdown = ?5,
                    updated_at = ?6
                WHERE entity_id = ?7",
                params![
                    scores.validation,
                    scores.total,
                    scores.mode,
                    scores.ai_validation,
                    breakdown_json,
                    Utc::now().to_rfc3339(),
                    entity_id
                ],
            )
            .context("Failed to store scores")?;
        if changed == 0 {
            bail!("Entity not found: {entity_id}");
        }
        Ok(())
    }

    fn list_badges(&self, entity_id: EntityId) -> Result<Vec<Badge>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT badge_id, entity_id, badge_type, points, created_at
                 FROM badges WHERE entity_id = ?1 ORDER BY badge_id",
            )
            .context("Failed to prepare badge query")?;
        let badges = stmt
            .query_map(params![entity_id], |row| {
                Ok(Badge {
                    badge_id: row.get(0)?,
                    entity_id: row.get(1)?,
                    badge_type: row.get(2)?,
                    points: row.get(3)?,
                    created_at: parse_ts(4, &row.get::<_, String>(4)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read badges")?;
        Ok(badges)
    }
}

// ============================================================================
// Column conversions
// ============================================================================

fn parse_enum<T>(value: ValueRef<'_>) -> FromSqlResult<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .as_str()?
        .parse()
        .map_err(|e| FromSqlError::Other(Box::new(e)))
}

impl FromSql for VoteType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        parse_enum(value)
    }
}

impl ToSql for VoteType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for BadgeType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        parse_enum(value)
    }
}

impl ToSql for BadgeType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ValidationMode {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        parse_enum(value)
    }
}

impl ToSql for ValidationMode {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

fn parse_ts(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

// ============================================================================
// Schema SQL
// ============================================================================

const SCHEMA_SQL: &str = r"
-- VOTERS
CREATE TABLE IF NOT EXISTS voters (
    voter_id INTEGER PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- ENTITY AGGREGATES
CREATE TABLE IF NOT EXISTS entities (
    entity_id INTEGER PRIMARY KEY,
    upvotes INTEGER NOT NULL DEFAULT 0 CHECK (upvotes >= 0),
    downvotes INTEGER NOT NULL DEFAULT 0 CHECK (downvotes >= 0),
    quality_score REAL NOT NULL DEFAULT 0,
    verification_score REAL NOT NULL DEFAULT 0,
    validation_score REAL NOT NULL DEFAULT 0,
    community_score REAL NOT NULL DEFAULT 0,
    total_score REAL NOT NULL DEFAULT 0,
    validation_mode TEXT NOT NULL DEFAULT 'ai_only'
        CHECK (validation_mode IN ('ai_only', 'hybrid')),
    ai_validation_score REAL,
    score_breakdown TEXT,
    updated_at TEXT
);

-- VOTES
CREATE TABLE IF NOT EXISTS votes (
    vote_id INTEGER PRIMARY KEY AUTOINCREMENT,
    voter_id INTEGER NOT NULL REFERENCES voters(voter_id),
    entity_id INTEGER NOT NULL REFERENCES entities(entity_id),
    vote_type TEXT NOT NULL CHECK (vote_type IN ('up', 'down')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (voter_id, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_votes_entity_type ON votes(entity_id, vote_type);
CREATE INDEX IF NOT EXISTS idx_votes_voter ON votes(voter_id);

-- BADGES
CREATE TABLE IF NOT EXISTS badges (
    badge_id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL REFERENCES entities(entity_id),
    badge_type TEXT NOT NULL
        CHECK (badge_type IN ('tier1', 'tier2', 'tier3', 'tier4', 'demerit')),
    points REAL NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_badges_entity ON badges(entity_id);

-- No foreign key: a mark may outlive its entity and is dropped on drain.
CREATE TABLE IF NOT EXISTS pending_sync (
    entity_id INTEGER PRIMARY KEY,
    marked_at TEXT NOT NULL
);
";

// ============================================================================
// Tests
// ============================================================================
