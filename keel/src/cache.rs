//! Cache of open per-repository databases.
//!
//! Handles are opened on demand, shared between callers, evicted LRU
//! when the cache is at capacity, and closed by a periodic sweep once
//! idle for longer than the configured TTL.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use thiserror::Error;

use crate::db::{self, Database};
use crate::storage::RepoName;

/// Default maximum number of open handles.
pub const DEFAULT_CAPACITY: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(32) };
/// Default handle TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
/// Default sweep interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Database file name inside a repository directory.
const DB_FILE: &str = "keel.db";

#[derive(Error, Debug)]
pub enum Error {
    #[error("repository '{0}' was not found")]
    RepoNotFound(RepoName),
    #[error(transparent)]
    Db(#[from] db::Error),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of open handles.
    pub capacity: NonZeroUsize,
    /// Storage root under which repository directories live.
    pub root: PathBuf,
    /// How long an idle handle is kept open.
    pub ttl: Duration,
    /// How often idle handles are swept.
    pub sweep_interval: Duration,
}

impl Config {
    pub fn new(root: PathBuf) -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            root,
            ttl: DEFAULT_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

struct Entry {
    db: Database,
    last_used: Instant,
}

/// Thread-safe cache of open repository databases.
pub struct DbCache {
    config: Config,
    handles: Mutex<LruCache<RepoName, Entry>>,
}

impl DbCache {
    pub fn new(config: Config) -> Self {
        let handles = Mutex::new(LruCache::new(config.capacity));

        Self { config, handles }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get an open handle for the named repository, opening it if
    /// needed. Fails if the repository directory doesn't exist.
    /// Concurrent calls for the same name share one handle.
    pub fn get(&self, name: &RepoName) -> Result<Database, Error> {
        let mut handles = self.handles.lock().expect("cache lock is not poisoned");

        if let Some(entry) = handles.get_mut(name) {
            entry.last_used = Instant::now();
            return Ok(entry.db.clone());
        }

        let dir = self.config.root.join(name);
        if !dir.is_dir() {
            return Err(Error::RepoNotFound(name.clone()));
        }
        let db = Database::open(dir.join(DB_FILE))?;

        // Capacity eviction is handled by the LRU itself: pushing into a
        // full cache drops the least recently used handle.
        handles.push(
            name.clone(),
            Entry {
                db: db.clone(),
                last_used: Instant::now(),
            },
        );

        Ok(db)
    }

    /// Close handles that have been idle longer than the TTL. Returns
    /// the number of closed handles.
    pub fn sweep(&self) -> usize {
        let mut handles = self.handles.lock().expect("cache lock is not poisoned");
        let ttl = self.config.ttl;
        let expired = handles
            .iter()
            .filter(|(_, entry)| entry.last_used.elapsed() >= ttl)
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        let count = expired.len();

        for name in expired {
            handles.pop(&name);
        }
        if count > 0 {
            log::debug!(target: "cache", "Swept {count} idle database handle(s)");
        }
        count
    }

    /// Close all handles.
    pub fn clear(&self) {
        self.handles
            .lock()
            .expect("cache lock is not poisoned")
            .clear();
    }
}
