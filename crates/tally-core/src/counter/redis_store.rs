//! Redis-backed counter store.
//!
//! ## Layout
//!
//! - `{ns}:votes:{entity}`: hash with `up` and `down` fields
//! - `{ns}:voter:{voter}:up` / `:down`: sets of entity ids
//! - `{ns}:voter:{voter}:loaded`: marker set once membership was warmed
//! - `{ns}:dirty`: set of entity ids pending write-through
//!
//! Tally increments and seeding run in Lua scripts so the existence check
//! and the writes that depend on it happen as one atomic step. Membership flips use `MULTI`.
//!
//! One connection is kept behind a mutex and re-established after I/O
//! errors. Connect, read and write all use the configured timeout, so an
//! unreachable server costs at most one timeout per call.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ::redis::{Client, Connection, ErrorKind, RedisError, RedisResult, Script};
use tracing::debug;

use super::{CounterStore, Keys, StoreError, StoreResult};
use crate::model::{EntityId, VoteCounts, VoteDelta, VoteType, VoterId};

const DEFAULT_NAMESPACE: &str = "tally";

const APPLY_DELTA_LUA: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return false
end
local up = redis.call('HINCRBY', KEYS[1], 'up', ARGV[1])
local down = redis.call('HINCRBY', KEYS[1], 'down', ARGV[2])
if up < 0 then
    up = 0
    redis.call('HSET', KEYS[1], 'up', 0)
end
if down < 0 then
    down = 0
    redis.call('HSET', KEYS[1], 'down', 0)
end
return {up, down}
";

const SEED_LUA: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    redis.call('HSET', KEYS[1], 'up', ARGV[1], 'down', ARGV[2])
end
local held = redis.call('HMGET', KEYS[1], 'up', 'down')
return {tonumber(held[1]) or 0, tonumber(held[2]) or 0}
";

/// Counter store talking to a Redis server.
pub struct RedisCounterStore {
    client: Client,
    conn: Mutex<Option<Connection>>,
    timeout: Duration,
    keys: Keys,
    apply_delta: Script,
    seed: Script,
}

impl RedisCounterStore {
    /// Create a store for `url` (e.g. `redis://127.0.0.1/`).
    ///
    /// Only the URL is validated here; the connection is opened on first use
    /// so the core can start while Redis is down.
    pub fn open(url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url {url}: {e}")))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            timeout,
            keys: Keys::new(DEFAULT_NAMESPACE),
            apply_delta: Script::new(APPLY_DELTA_LUA),
            seed: Script::new(SEED_LUA),
        })
    }

    /// Use a different key prefix (separate environments on one server).
    #[must_use]
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.keys = Keys::new(namespace);
        self
    }

    fn connect(&self) -> StoreResult<Connection> {
        let conn = self
            .client
            .get_connection_with_timeout(self.timeout)
            .map_err(|e| self.classify("connect", &e))?;
        conn.set_read_timeout(Some(self.timeout))
            .map_err(|e| self.classify("connect", &e))?;
        conn.set_write_timeout(Some(self.timeout))
            .map_err(|e| self.classify("connect", &e))?;
        debug!("connected to redis counter store");
        Ok(conn)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("redis connection lock poisoned".to_string()))
    }

    /// Run `op` on the shared connection, reconnecting if needed.
    fn run<T>(
        &self,
        key: &str,
        op: impl FnOnce(&mut Connection) -> RedisResult<T>,
    ) -> StoreResult<T> {
        let mut guard = self.lock()?;
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::Unavailable("no redis connection".to_string()));
        };

        op(conn).map_err(|e| {
            if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                // Drop the connection so the next call starts fresh.
                *guard = None;
            }
            self.classify(key, &e)
        })
    }

    fn classify(&self, key: &str, err: &RedisError) -> StoreError {
        if err.is_timeout() {
            StoreError::Timeout(self.timeout)
        } else if err.kind() == ErrorKind::TypeError {
            StoreError::Corrupt {
                key: key.to_string(),
                detail: err.to_string(),
            }
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

fn to_count(key: &str, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        detail: format!("negative tally {value}"),
    })
}

fn to_arg(key: &str, count: u64) -> StoreResult<i64> {
    i64::try_from(count).map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        detail: format!("tally {count} out of range"),
    })
}

impl CounterStore for RedisCounterStore {
    fn get_vote_state(&self, entity_id: EntityId) -> StoreResult<Option<VoteCounts>> {
        let key = self.keys.votes(entity_id);
        let (up, down): (Option<i64>, Option<i64>) = self.run(&key, |conn| {
            ::redis::cmd("HMGET")
                .arg(&key)
                .arg("up")
                .arg("down")
                .query(conn)
        })?;

        if up.is_none() && down.is_none() {
            return Ok(None);
        }
        Ok(Some(VoteCounts::new(
            to_count(&key, up.unwrap_or(0))?,
            to_count(&key, down.unwrap_or(0))?,
        )))
    }

    fn set_vote_state(&self, entity_id: EntityId, counts: VoteCounts) -> StoreResult<()> {
        let key = self.keys.votes(entity_id);
        let up = to_arg(&key, counts.upvotes)?;
        let down = to_arg(&key, counts.downvotes)?;
        self.run(&key, |conn| {
            ::redis::cmd("HSET")
                .arg(&key)
                .arg("up")
                .arg(up)
                .arg("down")
                .arg(down)
                .query(conn)
        })
    }

    fn seed_vote_state(&self, entity_id: EntityId, counts: VoteCounts) -> StoreResult<VoteCounts> {
        let key = self.keys.votes(entity_id);
        let up = to_arg(&key, counts.upvotes)?;
        let down = to_arg(&key, counts.downvotes)?;
        let reply: Vec<i64> = self.run(&key, |conn| {
            self.seed.key(&key).arg(up).arg(down).invoke(conn)
        })?;

        match reply.as_slice() {
            [up, down] => Ok(VoteCounts::new(to_count(&key, *up)?, to_count(&key, *down)?)),
            other => Err(StoreError::Corrupt {
                key,
                detail: format!("expected two tallies, got {}", other.len()),
            }),
        }
    }

    fn apply_vote_delta(
        &self,
        entity_id: EntityId,
        delta: VoteDelta,
    ) -> StoreResult<Option<VoteCounts>> {
        let key = self.keys.votes(entity_id);
        let reply: Option<Vec<i64>> = self.run(&key, |conn| {
            self.apply_delta
                .key(&key)
                .arg(delta.up)
                .arg(delta.down)
                .invoke(conn)
        })?;

        match reply.as_deref() {
            None => Ok(None),
            Some([up, down]) => Ok(Some(VoteCounts::new(
                to_count(&key, *up)?,
                to_count(&key, *down)?,
            ))),
            Some(other) => Err(StoreError::Corrupt {
                key,
                detail: format!("expected two tallies, got {}", other.len()),
            }),
        }
    }

    fn get_voter_vote(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
    ) -> StoreResult<Option<VoteType>> {
        let up_key = self.keys.voter_set(voter_id, VoteType::Up);
        let down_key = self.keys.voter_set(voter_id, VoteType::Down);
        let (is_up, is_down): (bool, bool) = self.run(&up_key, |conn| {
            ::redis::pipe()
                .cmd("SISMEMBER")
                .arg(&up_key)
                .arg(entity_id)
                .cmd("SISMEMBER")
                .arg(&down_key)
                .arg(entity_id)
                .query(conn)
        })?;

        Ok(match (is_up, is_down) {
            (true, _) => Some(VoteType::Up),
            (false, true) => Some(VoteType::Down),
            (false, false) => None,
        })
    }

    fn record_voter_vote(
        &self,
        voter_id: VoterId,
        entity_id: EntityId,
        vote_type: VoteType,
    ) -> StoreResult<()> {
        let target = self.keys.voter_set(voter_id, vote_type);
        let opposite = self.keys.voter_set(voter_id, vote_type.opposite());
        self.run(&target, |conn| {
            ::redis::pipe()
                .atomic()
                .cmd("SREM")
                .arg(&opposite)
                .arg(entity_id)
                .ignore()
                .cmd("SADD")
                .arg(&target)
                .arg(entity_id)
                .ignore()
                .query(conn)
        })
    }

    fn clear_voter_vote(&self, voter_id: VoterId, entity_id: EntityId) -> StoreResult<()> {
        let up_key = self.keys.voter_set(voter_id, VoteType::Up);
        let down_key = self.keys.voter_set(voter_id, VoteType::Down);
        self.run(&up_key, |conn| {
            ::redis::pipe()
                .atomic()
                .cmd("SREM")
                .arg(&up_key)
                .arg(entity_id)
                .ignore()
                .cmd("SREM")
                .arg(&down_key)
                .arg(entity_id)
                .ignore()
                .query(conn)
        })
    }

    fn voter_loaded(&self, voter_id: VoterId) -> StoreResult<bool> {
        let key = self.keys.voter_loaded(voter_id);
        self.run(&key, |conn| ::redis::cmd("EXISTS").arg(&key).query(conn))
    }

    fn load_voter(&self, voter_id: VoterId, votes: &[(EntityId, VoteType)]) -> StoreResult<()> {
        let up_key = self.keys.voter_set(voter_id, VoteType::Up);
        let down_key = self.keys.voter_set(voter_id, VoteType::Down);
        let loaded_key = self.keys.voter_loaded(voter_id);

        let ups: Vec<EntityId> = votes
            .iter()
            .filter(|(_, vote_type)| *vote_type == VoteType::Up)
            .map(|(entity_id, _)| *entity_id)
            .collect();
        let downs: Vec<EntityId> = votes
            .iter()
            .filter(|(_, vote_type)| *vote_type == VoteType::Down)
            .map(|(entity_id, _)| *entity_id)
            .collect();

        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(&up_key)
            .arg(&down_key)
            .ignore();
        // SADD rejects an empty member list.
        if !ups.is_empty() {
            pipe.cmd("SADD").arg(&up_key).arg(&ups).ignore();
        }
        if !downs.is_empty() {
            pipe.cmd("SADD").arg(&down_key).arg(&downs).ignore();
        }
        pipe.cmd("SET").arg(&loaded_key).arg(1).ignore();

        self.run(&loaded_key, |conn| pipe.query(conn))
    }

    fn mark_dirty(&self, entity_id: EntityId) -> StoreResult<()> {
        let key = self.keys.dirty();
        self.run(&key, |conn| {
            ::redis::cmd("SADD")
                .arg(&key)
                .arg(entity_id)
                .query::<i64>(conn)
                .map(|_| ())
        })
    }

    fn pop_dirty_batch(&self, max_n: usize) -> StoreResult<Vec<EntityId>> {
        if max_n == 0 {
            return Ok(Vec::new());
        }
        let key = self.keys.dirty();
        let popped: Option<Vec<EntityId>> = self.run(&key, |conn| {
            ::redis::cmd("SPOP").arg(&key).arg(max_n).query(conn)
        })?;
        Ok(popped.unwrap_or_default())
    }

    fn clear_dirty(&self, entity_id: EntityId) -> StoreResult<()> {
        let key = self.keys.dirty();
        self.run(&key, |conn| {
            ::redis::cmd("SREM")
                .arg(&key)
                .arg(entity_id)
                .query::<i64>(conn)
                .map(|_| ())
        })
    }

    fn dirty_len(&self) -> StoreResult<usize> {
        let key = self.keys.dirty();
        self.run(&key, |conn| ::redis::cmd("SCARD").arg(&key).query(conn))
    }
}
