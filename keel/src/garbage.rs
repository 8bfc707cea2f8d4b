//! Object pruning.
//!
//! Repositories touched by a failed or reverted push accumulate
//! unreferenced objects. The scheduler collects dirty repositories and
//! prunes each one once nothing pending refers to it anymore: no
//! push-note in the pool, no transaction in the mempool.

use std::collections::BTreeSet;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{fmt, io};

use thiserror::Error;

use crate::chain::{self, Mempool};
use crate::pool::PushPool;
use crate::storage::{RepoName, Storage};

/// Default scheduler tick interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
/// Default expiry time for objects.
pub const EXPIRY_DEFAULT: Expiry = Expiry::Hours(1);

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] crate::storage::Error),
    #[error(transparent)]
    Chain(#[from] chain::Error),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

/// Expiry of objects for the garbage collector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Expiry {
    Now,
    Seconds(usize),
    Hours(usize),
    Days(usize),
    Weeks(usize),
}

impl Default for Expiry {
    fn default() -> Self {
        EXPIRY_DEFAULT
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Now => f.write_str("now"),
            Self::Seconds(s) => write!(f, "{s}.seconds.ago"),
            Self::Hours(s) => write!(f, "{s}.hours.ago"),
            Self::Days(s) => write!(f, "{s}.days.ago"),
            Self::Weeks(s) => write!(f, "{s}.weeks.ago"),
        }
    }
}

/// Run the git garbage collector on a repository.
pub fn collect(storage: &Storage, name: &RepoName, expiry: Expiry) -> io::Result<ExitStatus> {
    let git_dir = storage.path_of(name);
    let mut gc = Command::new("git");
    gc.current_dir(git_dir)
        .env_clear()
        .envs(std::env::vars().filter(|(key, _)| key == "PATH" || key.starts_with("GIT_TRACE")))
        .args(["gc", &format!("--prune={expiry}"), "--auto"])
        .stdout(Stdio::piped())
        .stdin(Stdio::piped())
        .stderr(Stdio::inherit());
    let mut child = gc.spawn()?;
    let status = child.wait()?;

    Ok(status)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub interval: Duration,
    pub expiry: Expiry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            expiry: EXPIRY_DEFAULT,
        }
    }
}

/// Tracks repositories awaiting a prune.
pub struct Scheduler {
    config: Config,
    storage: Storage,
    pool: Arc<PushPool>,
    mempool: Arc<dyn Mempool>,
    dirty: Mutex<BTreeSet<RepoName>>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        storage: Storage,
        pool: Arc<PushPool>,
        mempool: Arc<dyn Mempool>,
    ) -> Self {
        Self {
            config,
            storage,
            pool,
            mempool,
            dirty: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mark a repository for pruning at the next tick.
    pub fn schedule(&self, name: &RepoName) {
        self.dirty
            .lock()
            .expect("scheduler lock is not poisoned")
            .insert(name.clone());
    }

    /// Prune one repository. Without `force`, the prune is skipped (and
    /// the repository stays scheduled) while pending activity refers to
    /// it. Returns whether the prune ran.
    pub fn prune(&self, name: &RepoName, force: bool) -> Result<bool, Error> {
        if !force {
            if self.pool.references_repo(name) {
                return Ok(false);
            }
            if self.mempool.references_repo(name)? {
                return Ok(false);
            }
        }
        collect(&self.storage, name, self.config.expiry)?;
        log::debug!(target: "garbage", "Pruned repository {name}");

        Ok(true)
    }

    /// Process the dirty set. Repositories that can't be pruned yet
    /// stay scheduled for the next tick.
    pub fn tick(&self) {
        let dirty = std::mem::take(
            &mut *self
                .dirty
                .lock()
                .expect("scheduler lock is not poisoned"),
        );

        for name in dirty {
            match self.prune(&name, false) {
                Ok(true) => {}
                Ok(false) => self.schedule(&name),
                Err(e) => {
                    log::warn!(target: "garbage", "Failed to prune {name}: {e}");
                    self.schedule(&name);
                }
            }
        }
    }
}
