//! Shared helpers for CLI commands.
//!
//! Every command opens the stores the same way: the SQLite record at
//! `--db` (schema created on demand) and Redis when `--redis-url` is set.
//! Without Redis, tallies are cached per process and the pending-sync set
//! lives in the database.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use tally_core::config::TallyConfig;
use tally_core::core::TallyServices;
use tally_core::counter::{CounterStore, LocalCounterStore, RedisCounterStore};
use tally_core::notify::LogPublisher;
use tally_core::record::SqliteRecord;

/// Where the stores live, from global flags.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub db: PathBuf,
    pub redis_url: Option<String>,
    pub counter_timeout: Duration,
}

impl StoreOptions {
    /// Service config seeded from these options.
    #[must_use]
    pub fn config(&self) -> TallyConfig {
        TallyConfig {
            counter_timeout: self.counter_timeout,
            ..TallyConfig::default()
        }
    }
}

/// Open the system of record and make sure its schema exists.
pub fn open_record(db: &Path, config: &TallyConfig) -> Result<SqliteRecord> {
    let record = SqliteRecord::open(db, config.busy_timeout)?;
    record
        .init_schema()
        .with_context(|| format!("Failed to prepare database: {}", db.display()))?;
    Ok(record)
}

/// Open the counter store: Redis when a URL is given, otherwise in-process
/// tallies with the pending-sync set kept in `record`.
pub fn open_counter(
    redis_url: Option<&str>,
    timeout: Duration,
    record: &Arc<SqliteRecord>,
) -> Result<Arc<dyn CounterStore>> {
    match redis_url {
        Some(url) => {
            let store = RedisCounterStore::open(url, timeout)
                .context("Failed to configure Redis counter store")?;
            debug!(timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "using Redis counter store");
            Ok(Arc::new(store))
        }
        None => {
            info!("no Redis URL given, using in-process counter store");
            Ok(Arc::new(LocalCounterStore::new(Arc::clone(record))))
        }
    }
}

/// Build the service facade with a given config.
pub fn open_services_with(opts: &StoreOptions, config: TallyConfig) -> Result<TallyServices> {
    let record = Arc::new(open_record(&opts.db, &config)?);
    let counter = open_counter(opts.redis_url.as_deref(), config.counter_timeout, &record)?;
    Ok(TallyServices::new(
        record,
        counter,
        Arc::new(LogPublisher),
        config,
    ))
}

/// Build the service facade with the default config.
pub fn open_services(opts: &StoreOptions) -> Result<TallyServices> {
    open_services_with(opts, opts.config())
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_record_creates_schema() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("nested").join("tally.db");
        open_record(&db, &TallyConfig::default()).unwrap();
        assert!(db.exists());
    }

    #[test]
    fn test_open_counter_rejects_bad_url() {
        let dir = tempdir().unwrap();
        let record = Arc::new(open_record(&dir.path().join("tally.db"), &TallyConfig::default()).unwrap());
        assert!(open_counter(Some("not a url"), Duration::from_millis(10), &record).is_err());
        assert!(open_counter(None, Duration::from_millis(10), &record).is_ok());
    }

    #[test]
    fn test_pending_marks_reach_the_next_process() {
        let (_dir, opts) = fixtures::seeded(1, 2);
        open_services(&opts).unwrap().cast_vote(1, 2, tally_core::model::VoteIntent::Up).unwrap();

        let drained = open_services(&opts).unwrap().drain_dirty(10).unwrap();
        assert_eq!(drained.entities_checked, 1);
        assert_eq!(drained.entities_failed, 0);
    }

    #[test]
    fn test_config_carries_timeout() {
        let opts = StoreOptions {
            db: PathBuf::from("x.db"),
            redis_url: None,
            counter_timeout: Duration::from_millis(7),
        };
        assert_eq!(opts.config().counter_timeout, Duration::from_millis(7));
    }
}
