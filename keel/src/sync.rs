//! Chain reconciliation.
//!
//! A single background loop tails finalized blocks and applies the push
//! transactions they carry: missing objects are fetched from the DHT
//! and size-verified, references are updated, reference trees advance,
//! and the corresponding push-notes leave the pool. The loop's progress
//! is checkpointed so a restarted node resumes where it stopped.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as chan;
use thiserror::Error;

use crate::cache::DbCache;
use crate::chain::{self, ChainView, Dht};
use crate::git;
use crate::note::PushTx;
use crate::pool::PushPool;
use crate::reftree;
use crate::storage::{RepoName, Storage};
use crate::wire;

/// Reconciler checkpoint file, under the data directory.
pub const CHECKPOINT_FILE: &str = "last_sync_height";
/// Default tick interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum Error {
    /// Fatal: the chain refers to a repository this node doesn't have.
    #[error("unable to find repository '{0}' locally")]
    RepoMissing(RepoName),
    #[error("object {oid} of {repo} has size {actual}, push note declares {declared}")]
    ObjectSize {
        repo: RepoName,
        oid: git::Oid,
        declared: u64,
        actual: u64,
    },
    #[error(transparent)]
    Chain(#[from] chain::Error),
    #[error(transparent)]
    Git(#[from] git::Error),
    #[error(transparent)]
    RefTree(#[from] reftree::Error),
    #[error(transparent)]
    Cache(#[from] crate::cache::Error),
    #[error("db: {0}")]
    Db(#[from] sqlite::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the reconciler must stop instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RepoMissing(_))
    }
}

/// What the reconciler is allowed to touch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Mode {
    /// Download objects and mutate references.
    #[default]
    Full,
    /// Track state trees only; validators don't host repository
    /// contents.
    Validator,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Where the checkpoint lives.
    pub data_dir: PathBuf,
    pub interval: Duration,
    pub mode: Mode,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            interval: DEFAULT_INTERVAL,
            mode: Mode::default(),
        }
    }
}

/// Applies finalized push transactions to local repositories.
pub struct Reconciler {
    config: Config,
    storage: Storage,
    chain: Arc<dyn ChainView>,
    dht: Arc<dyn Dht>,
    pool: Arc<PushPool>,
    cache: Arc<DbCache>,
}

impl Reconciler {
    pub fn new(
        config: Config,
        storage: Storage,
        chain: Arc<dyn ChainView>,
        dht: Arc<dyn Dht>,
        pool: Arc<PushPool>,
        cache: Arc<DbCache>,
    ) -> Self {
        Self {
            config,
            storage,
            chain,
            dht,
            pool,
            cache,
        }
    }

    /// The height up to which blocks have been applied.
    pub fn height(&self) -> u64 {
        std::fs::read_to_string(self.config.data_dir.join(CHECKPOINT_FILE))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Persist the checkpoint atomically: the new value replaces the
    /// old file only once fully written and synced.
    fn set_height(&self, height: u64) -> Result<(), Error> {
        let mut file = tempfile::NamedTempFile::new_in(&self.config.data_dir)?;

        write!(file, "{height}")?;
        file.as_file().sync_all()?;
        file.persist(self.config.data_dir.join(CHECKPOINT_FILE))
            .map_err(|e| Error::Io(e.error))?;

        Ok(())
    }

    /// Apply the next block, if one is finalized. Returns whether a
    /// block was applied.
    pub fn tick(&self) -> Result<bool, Error> {
        let next = self.height() + 1;
        let Some(block) = self.chain.block(next)? else {
            return Ok(false);
        };

        for bytes in &block.txs {
            // Blocks carry transactions of every kind; only push
            // transactions concern us.
            let Ok(tx) = wire::deserialize::<PushTx>(bytes) else {
                continue;
            };
            self.apply(&tx)?;
        }
        self.set_height(next)?;
        log::debug!(target: "sync", "Synced block {next}");

        Ok(true)
    }

    /// Run until shutdown. Transient errors are retried at the next
    /// tick without advancing the checkpoint; a fatal error stops the
    /// loop.
    pub fn run(&self, shutdown: chan::Receiver<()>) {
        let ticker = chan::tick(self.config.interval);

        loop {
            chan::select! {
                recv(ticker) -> _ => loop {
                    match self.tick() {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) if e.is_fatal() => {
                            log::error!(target: "sync", "Fatal reconciliation error: {e}");
                            return;
                        }
                        Err(e) => {
                            log::warn!(target: "sync", "Reconciliation error: {e}");
                            break;
                        }
                    }
                },
                recv(shutdown) -> _ => {
                    log::debug!(target: "sync", "Reconciler shutting down..");
                    return;
                }
            }
        }
    }

    /// Apply one finalized push transaction.
    pub fn apply(&self, tx: &PushTx) -> Result<(), Error> {
        let note = &tx.note;
        let repo = self
            .storage
            .repository(&note.repo)
            .map_err(|_| Error::RepoMissing(note.repo.clone()))?;

        if self.config.mode == Mode::Full {
            // Fetch whatever the push introduced that we don't hold.
            for pushed in &note.references {
                for object in &pushed.objects {
                    if repo.contains(object.oid).map_err(git::Error::from)? {
                        continue;
                    }
                    let key = chain::object_key(&note.repo, object.oid);
                    let bytes = self.dht.get_object(&key)?;

                    if bytes.len() as u64 != object.size {
                        return Err(Error::ObjectSize {
                            repo: note.repo.clone(),
                            oid: object.oid,
                            declared: object.size,
                            actual: bytes.len() as u64,
                        });
                    }
                    git::object_write_raw(&repo, object.oid, &bytes)?;
                    self.dht.announce(&key)?;
                    log::debug!(target: "sync", "Fetched object {} for {}", object.oid, note.repo);
                }
            }

            // The objects are all present, so finalizing a reference is
            // a pure ref update.
            for pushed in &note.references {
                if pushed.delete {
                    match git::ref_delete(&repo, &pushed.name) {
                        Ok(()) | Err(git::Error::RefNotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                    reftree::delete(&repo.path, &pushed.name)?;
                } else {
                    git::ref_update(&repo, &pushed.name, pushed.new)?;
                }
            }
        }

        // State trees advance in every mode.
        let db = self.cache.get(&note.repo)?;
        for pushed in &note.references {
            if pushed.delete {
                if self.config.mode == Mode::Validator {
                    reftree::delete(&repo.path, &pushed.name)?;
                }
                let mut stmt = db.prepare("DELETE FROM \"state-roots\" WHERE ref = ?1")?;
                stmt.bind((1, pushed.name.as_str()))?;
                stmt.next()?;
                continue;
            }
            let objects = pushed.objects.iter().map(|o| o.oid).collect::<Vec<_>>();
            let value = reftree::leaf(pushed.old, pushed.new, &objects);
            let update = reftree::update(&repo.path, &pushed.name, &value)?;

            let mut stmt = db.prepare(
                "INSERT INTO \"state-roots\" (ref, root, version, timestamp)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT DO UPDATE SET root = ?2, version = ?3, timestamp = ?4",
            )?;
            stmt.bind((1, pushed.name.as_str()))?;
            stmt.bind((2, update.root.to_string().as_str()))?;
            stmt.bind((3, update.version as i64))?;
            stmt.bind((4, note.timestamp as i64))?;
            stmt.next()?;

            let mut stmt = db.prepare(
                "INSERT INTO \"ref-nonces\" (ref, nonce) VALUES (?1, ?2)
                 ON CONFLICT DO UPDATE SET nonce = ?2",
            )?;
            stmt.bind((1, pushed.name.as_str()))?;
            stmt.bind((2, pushed.nonce as i64))?;
            stmt.next()?;
        }

        // The push is final; its note has served its purpose.
        self.pool.remove(&note.id());
        log::info!(target: "sync", "Applied push tx for {} ({} reference(s))", note.repo, note.references.len());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::cache;
    use crate::chain::mock::{MockChain, MockDht};
    use keel_crypto::Signer;
    use crate::crypto::bls;
    use crate::crypto::test::signer::MockSigner;
    use crate::note::{PushNote, PushedObject, PushedRef};
    use crate::pool;
    use crate::state::{Filter, Snapshot};
    use crate::test::fixtures;

    struct Setup {
        _tmp: tempfile::TempDir,
        storage: Storage,
        chain: Arc<MockChain>,
        dht: Arc<MockDht>,
        pool: Arc<PushPool>,
        reconciler: Reconciler,
    }

    fn setup(mode: Mode) -> Setup {
        let tmp = tempfile::tempdir().unwrap();
        let repos = tmp.path().join("repos");
        let storage = Storage::open(&repos).unwrap();
        let chain = Arc::new(MockChain::default());
        let dht = Arc::new(MockDht::default());
        let pool = Arc::new(PushPool::new(pool::Config::default()));
        let cache = Arc::new(DbCache::new(cache::Config::new(repos)));
        let mut config = Config::new(tmp.path().to_path_buf());
        config.mode = mode;

        let reconciler = Reconciler::new(
            config,
            storage.clone(),
            chain.clone(),
            dht.clone(),
            pool.clone(),
            cache,
        );

        Setup {
            _tmp: tmp,
            storage,
            chain,
            dht,
            pool,
            reconciler,
        }
    }

    fn finalized_tx(repo_name: &RepoName, pushed: Vec<PushedRef>) -> PushTx {
        let signer = MockSigner::from_seed([3; 32]);
        let mut note = PushNote {
            repo: repo_name.clone(),
            namespace: None,
            references: pushed,
            push_key: crate::tx::PushKeyId::of(signer.public_key()),
            pusher: crate::chain::Address::from_str("os1alice").unwrap(),
            pusher_nonce: 1,
            fee: 1,
            size: 0,
            timestamp: 1_700_000_000_000,
            node_key: *signer.public_key(),
            node_sig: None,
        };
        note.sign(&signer);

        PushTx {
            note,
            aggregate_sig: bls::SecretKey::from_ikm(&[8; 32]).unwrap().sign(b"agg"),
            endorsers: 0b11,
        }
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let s = setup(Mode::Full);

        assert_eq!(s.reconciler.height(), 0);
        s.reconciler.set_height(42).unwrap();
        assert_eq!(s.reconciler.height(), 42);
    }

    #[test]
    fn test_tick_without_block() {
        let s = setup(Mode::Full);

        assert!(!s.reconciler.tick().unwrap());
        assert_eq!(s.reconciler.height(), 0);
    }

    #[test]
    fn test_apply_updates_refs_and_trees() {
        let s = setup(Mode::Full);
        let name = RepoName::from_str("alice").unwrap();
        let repo = s.storage.create(&name).unwrap();
        let head = fixtures::commit(&repo, "refs/heads/staging", "c1", &[]);
        git::ref_delete(&repo, "refs/heads/staging").unwrap();

        let pushed = PushedRef {
            name: "refs/heads/master".to_owned(),
            old: git::Oid::zero(),
            new: head,
            nonce: 1,
            objects: vec![],
            fee: 1,
            merge_id: None,
            delete: false,
        };
        let tx = finalized_tx(&name, vec![pushed]);
        s.chain.push_block(vec![wire::serialize(&tx)]);

        assert!(s.reconciler.tick().unwrap());
        assert_eq!(s.reconciler.height(), 1);
        assert_eq!(
            git::ref_get(&repo, "refs/heads/master").unwrap(),
            Some(head)
        );
        assert!(reftree::root(&repo.path, "refs/heads/master")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_apply_fetches_missing_objects() {
        let s = setup(Mode::Full);
        let name = RepoName::from_str("alice").unwrap();
        let repo = s.storage.create(&name).unwrap();
        let head = fixtures::commit(&repo, "refs/heads/staging", "c1", &[]);
        git::ref_delete(&repo, "refs/heads/staging").unwrap();

        let missing = fixtures::oid(77);
        let bytes = b"loose-object-bytes".to_vec();
        let key = chain::object_key(&name, missing);
        s.dht.insert(key.clone(), bytes.clone());

        let pushed = PushedRef {
            name: "refs/heads/master".to_owned(),
            old: git::Oid::zero(),
            new: head,
            nonce: 1,
            objects: vec![PushedObject {
                oid: missing,
                size: bytes.len() as u64,
            }],
            fee: 1,
            merge_id: None,
            delete: false,
        };
        s.reconciler.apply(&finalized_tx(&name, vec![pushed])).unwrap();

        let hex = missing.to_string();
        let path = repo.path.join("objects").join(&hex[..2]).join(&hex[2..]);
        assert_eq!(std::fs::read(path).unwrap(), bytes);
        assert_eq!(s.dht.announced(), vec![key]);
    }

    #[test]
    fn test_apply_rejects_wrong_size() {
        let s = setup(Mode::Full);
        let name = RepoName::from_str("alice").unwrap();
        let repo = s.storage.create(&name).unwrap();
        let head = fixtures::commit(&repo, "refs/heads/staging", "c1", &[]);
        git::ref_delete(&repo, "refs/heads/staging").unwrap();

        let missing = fixtures::oid(78);
        s.dht
            .insert(chain::object_key(&name, missing), b"short".to_vec());

        let pushed = PushedRef {
            name: "refs/heads/master".to_owned(),
            old: git::Oid::zero(),
            new: head,
            nonce: 1,
            objects: vec![PushedObject {
                oid: missing,
                size: 999,
            }],
            fee: 1,
            merge_id: None,
            delete: false,
        };
        let err = s
            .reconciler
            .apply(&finalized_tx(&name, vec![pushed]))
            .unwrap_err();

        assert!(matches!(err, Error::ObjectSize { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_unknown_repo_is_fatal() {
        let s = setup(Mode::Full);
        let name = RepoName::from_str("ghost").unwrap();
        let tx = finalized_tx(&name, vec![]);

        let err = s.reconciler.apply(&tx).unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "unable to find repository 'ghost' locally");
    }

    #[test]
    fn test_validator_mode_skips_ref_mutation() {
        let s = setup(Mode::Validator);
        let name = RepoName::from_str("alice").unwrap();
        let repo = s.storage.create(&name).unwrap();
        let head = fixtures::commit(&repo, "refs/heads/staging", "c1", &[]);
        git::ref_delete(&repo, "refs/heads/staging").unwrap();
        let before = Snapshot::capture(&repo, &Filter::All).unwrap();

        let pushed = PushedRef {
            name: "refs/heads/master".to_owned(),
            old: git::Oid::zero(),
            new: head,
            nonce: 1,
            objects: vec![],
            fee: 1,
            merge_id: None,
            delete: false,
        };
        s.reconciler.apply(&finalized_tx(&name, vec![pushed])).unwrap();

        // No reference moved, but the state tree advanced.
        assert_eq!(Snapshot::capture(&repo, &Filter::All).unwrap(), before);
        assert!(reftree::root(&repo.path, "refs/heads/master")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_applied_note_leaves_pool() {
        let s = setup(Mode::Full);
        let name = RepoName::from_str("alice").unwrap();
        s.storage.create(&name).unwrap();

        let tx = finalized_tx(&name, vec![]);
        let id = s.pool.add(tx.note.clone()).unwrap();
        s.reconciler.apply(&tx).unwrap();

        assert!(!s.pool.contains(&id));
    }
}
