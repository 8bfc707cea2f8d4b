//! Node wiring.
//!
//! The pool, aggregator, pruner, db cache and reconciler are node-wide
//! singletons. They are constructed here, handed to their dependents
//! explicitly, and driven by named background threads.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crossbeam_channel as chan;

use crate::cache::{self, DbCache};
use crate::chain::{ChainView, Dht, Mempool};
use crate::crypto::Signer;
use crate::endorse::{self, Aggregator};
use crate::garbage::{self, Scheduler};
use crate::note::PushNote;
use crate::pool::{self, PushPool};
use crate::push;
use crate::storage::Storage;
use crate::sync::{self, Mode, Reconciler};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory of the hosted repositories.
    pub repos_root: PathBuf,
    /// Node state directory (checkpoints).
    pub data_dir: PathBuf,
    /// Reconciler mode.
    pub mode: Mode,
    pub push: push::Config,
    pub pool: pool::Config,
    pub endorse: endorse::Config,
    pub garbage: garbage::Config,
}

impl Config {
    pub fn new(repos_root: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            repos_root,
            data_dir,
            mode: Mode::default(),
            push: push::Config::default(),
            pool: pool::Config::default(),
            endorse: endorse::Config::default(),
            garbage: garbage::Config::default(),
        }
    }
}

/// A running node: the wired singletons plus their background threads.
pub struct Node {
    pub storage: Storage,
    pub cache: Arc<DbCache>,
    pub pool: Arc<PushPool>,
    pub pruner: Arc<Scheduler>,
    pub aggregator: Arc<Aggregator>,
    pub handler: Arc<push::Handler>,
    /// Accepted push-notes, to be forwarded to peers.
    pub notes: chan::Receiver<PushNote>,

    shutdown: chan::Sender<()>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Node {
    /// Construct the singletons and start the background workers.
    pub fn start(
        config: Config,
        chain: Arc<dyn ChainView>,
        dht: Arc<dyn Dht>,
        mempool: Arc<dyn Mempool>,
        signer: Arc<dyn Signer>,
    ) -> Result<Self, Error> {
        std::fs::create_dir_all(&config.data_dir)?;

        let storage = Storage::open(&config.repos_root)?;
        let cache = Arc::new(DbCache::new(cache::Config::new(config.repos_root.clone())));
        let pool = Arc::new(PushPool::new(config.pool.clone()));
        let pruner = Arc::new(Scheduler::new(
            config.garbage.clone(),
            storage.clone(),
            pool.clone(),
            mempool.clone(),
        ));
        let aggregator = Arc::new(Aggregator::new(
            config.endorse.clone(),
            pool.clone(),
            chain.clone(),
            mempool,
            pruner.clone(),
        ));
        let (notes_tx, notes_rx) = chan::unbounded();
        let handler = Arc::new(push::Handler::new(
            config.push.clone(),
            storage.clone(),
            chain.clone(),
            pool.clone(),
            pruner.clone(),
            signer,
            notes_tx,
        ));

        let mut sync_config = sync::Config::new(config.data_dir.clone());
        sync_config.mode = config.mode;
        let reconciler = Reconciler::new(
            sync_config,
            storage.clone(),
            chain,
            dht,
            pool.clone(),
            cache.clone(),
        );

        let (shutdown, shutdown_rx) = chan::bounded::<()>(1);
        let mut threads = Vec::new();

        threads.push(spawn("reconcile", {
            let shutdown = shutdown_rx.clone();
            move || reconciler.run(shutdown)
        }));
        threads.push(spawn("garbage", {
            let pruner = pruner.clone();
            let interval = pruner.config().interval;
            let shutdown = shutdown_rx.clone();
            move || {
                let ticker = chan::tick(interval);
                loop {
                    chan::select! {
                        recv(ticker) -> _ => pruner.tick(),
                        recv(shutdown) -> _ => break,
                    }
                }
            }
        }));
        threads.push(spawn("sweep", {
            let cache = cache.clone();
            let pool = pool.clone();
            let interval = cache.config().sweep_interval;
            move || {
                let ticker = chan::tick(interval);
                loop {
                    chan::select! {
                        recv(ticker) -> _ => {
                            cache.sweep();
                            for id in pool.sweep() {
                                log::debug!(target: "pool", "Expired push note {id}");
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
            }
        }));

        Ok(Self {
            storage,
            cache,
            pool,
            pruner,
            aggregator,
            handler,
            notes: notes_rx,
            shutdown,
            threads,
        })
    }

    /// Stop the background workers and wait for them.
    pub fn shutdown(self) {
        drop(self.shutdown);
        for thread in self.threads {
            thread.join().ok();
        }
        self.cache.clear();
    }
}

/// Spawn a labeled OS thread.
fn spawn<F>(label: &str, f: F) -> thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("keel-{label}"))
        .spawn(f)
        .expect("thread label must not contain NULL bytes")
}
