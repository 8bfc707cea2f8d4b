//! Endorsement aggregation.
//!
//! Top hosts attest to push-notes they have verified. Once a quorum of
//! endorsements has been collected for a note, their BLS signatures are
//! aggregated and the note is promoted to a push transaction in the
//! mempool.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::chain::{self, ChainView, Host, Mempool};
use crate::crypto::bls;
use crate::garbage::Scheduler;
use crate::note::{Endorsement, NoteId, PushTx, VerifyError};
use crate::pool::PushPool;

/// Default number of endorsements required to form a push transaction.
pub const DEFAULT_QUORUM: usize = 3;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not a top host")]
    NotTopHost,
    #[error("push note {0} is not in the pool")]
    UnknownNote(NoteId),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Chain(#[from] chain::Error),
    #[error(transparent)]
    Bls(#[from] bls::Error),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub quorum: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            quorum: DEFAULT_QUORUM,
        }
    }
}

/// Collects endorsements per push-note and promotes quorums.
pub struct Aggregator {
    config: Config,
    pool: Arc<PushPool>,
    chain: Arc<dyn ChainView>,
    mempool: Arc<dyn Mempool>,
    pruner: Arc<Scheduler>,
    entries: Mutex<HashMap<NoteId, BTreeMap<bls::PublicKey, Endorsement>>>,
}

impl Aggregator {
    pub fn new(
        config: Config,
        pool: Arc<PushPool>,
        chain: Arc<dyn ChainView>,
        mempool: Arc<dyn Mempool>,
        pruner: Arc<Scheduler>,
    ) -> Self {
        Self {
            config,
            pool,
            chain,
            mempool,
            pruner,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record an endorsement. The sender must be a top host of the
    /// current epoch and the signature must verify. Duplicates from the
    /// same host are idempotent. Returns the push transaction if this
    /// endorsement completed a quorum.
    pub fn add_endorsement(&self, endorsement: Endorsement) -> Result<Option<PushTx>, Error> {
        let hosts = self.current_hosts()?;

        if !hosts.iter().any(|h| h.bls_key == endorsement.endorser) {
            return Err(Error::NotTopHost);
        }
        endorsement.verify()?;

        let note = endorsement.note;
        {
            let mut entries = self.entries.lock().expect("aggregator lock is not poisoned");
            entries
                .entry(note)
                .or_default()
                .insert(endorsement.endorser, endorsement);
        }
        // Keep the note alive while endorsements accumulate.
        self.pool.pin(&note);

        self.maybe_create_push_tx(&note, &hosts)
    }

    /// Number of endorsements collected for a note.
    pub fn endorsements(&self, id: &NoteId) -> usize {
        self.entries
            .lock()
            .expect("aggregator lock is not poisoned")
            .get(id)
            .map(|e| e.len())
            .unwrap_or(0)
    }

    /// Forget a note's endorsements, eg. once it was finalized.
    pub fn remove(&self, id: &NoteId) {
        self.entries
            .lock()
            .expect("aggregator lock is not poisoned")
            .remove(id);
    }

    /// Promote the note to a push transaction if a quorum is in.
    fn maybe_create_push_tx(
        &self,
        id: &NoteId,
        hosts: &[Host],
    ) -> Result<Option<PushTx>, Error> {
        let (signatures, bitset) = {
            let entries = self.entries.lock().expect("aggregator lock is not poisoned");
            let Some(collected) = entries.get(id) else {
                return Ok(None);
            };
            if collected.len() < self.config.quorum {
                return Ok(None);
            }
            // The map is keyed by endorser key, so iteration order and
            // the aggregate are deterministic.
            let signatures = collected.values().map(|e| e.sig).collect::<Vec<_>>();
            let mut bitset = 0u64;
            for endorser in collected.keys() {
                if let Some(i) = hosts.iter().position(|h| h.bls_key == *endorser) {
                    bitset |= 1 << i;
                }
            }
            (signatures, bitset)
        };

        let note = self.pool.get(id).ok_or(Error::UnknownNote(*id))?;
        let aggregate_sig = bls::aggregate(&signatures)?;
        let tx = PushTx {
            note,
            aggregate_sig,
            endorsers: bitset,
        };

        if let Err(e) = self.mempool.add(tx.clone()) {
            // The endorsements stay; the next add retries the
            // promotion.
            log::warn!(target: "endorse", "Mempool rejected push tx for {id}: {e}");
            self.pruner.schedule(&tx.note.repo);

            return Err(e.into());
        }
        log::info!(target: "endorse", "Submitted push tx for {id} with {} endorsement(s)", signatures.len());
        self.remove(id);

        Ok(Some(tx))
    }

    fn current_hosts(&self) -> Result<Vec<Host>, Error> {
        let epoch = self.chain.height()?;

        Ok(self.chain.top_hosts(epoch)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{MockChain, MockMempool};
    use crate::crypto::test::signer::MockSigner;
    use crate::crypto::Signer;
    use crate::garbage;
    use crate::pool;
    use crate::storage::Storage;
    use crate::test::arbitrary;

    struct Setup {
        _tmp: tempfile::TempDir,
        pool: Arc<PushPool>,
        mempool: Arc<MockMempool>,
        aggregator: Aggregator,
        hosts: Vec<bls::SecretKey>,
    }

    fn setup(quorum: usize, host_count: usize) -> Setup {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::open(tmp.path()).unwrap();
        let pool = Arc::new(PushPool::new(pool::Config::default()));
        let chain = Arc::new(MockChain::default());
        let mempool = Arc::new(MockMempool::default());
        let pruner = Arc::new(garbage::Scheduler::new(
            garbage::Config::default(),
            storage,
            pool.clone(),
            mempool.clone(),
        ));

        let hosts = (0..host_count)
            .map(|i| bls::SecretKey::from_ikm(&[i as u8 + 1; 32]).unwrap())
            .collect::<Vec<_>>();
        chain.set_hosts(
            hosts
                .iter()
                .enumerate()
                .map(|(i, key)| Host {
                    key: *MockSigner::from_seed([i as u8 + 1; 32]).public_key(),
                    bls_key: key.public_key(),
                })
                .collect(),
        );

        let aggregator = Aggregator::new(
            Config { quorum },
            pool.clone(),
            chain,
            mempool.clone(),
            pruner,
        );

        Setup {
            _tmp: tmp,
            pool,
            mempool,
            aggregator,
            hosts,
        }
    }

    #[test]
    fn test_quorum_promotes_exactly_once() {
        let s = setup(2, 3);
        let mut note = arbitrary::push_note(1);
        note.sign(&MockSigner::from_seed([9; 32]));
        let id = s.pool.add(note).unwrap();

        let first = Endorsement::create(id, &s.hosts[0]);
        let second = Endorsement::create(id, &s.hosts[1]);

        assert_eq!(s.aggregator.add_endorsement(first).unwrap(), None);
        let tx = s.aggregator.add_endorsement(second).unwrap().unwrap();

        assert_eq!(s.mempool.txs().len(), 1);
        assert_eq!(tx.endorser_indices().count(), 2);

        // The aggregate verifies under the two endorsers' keys, in
        // endorser key order.
        let mut pairs = s.hosts[..2]
            .iter()
            .map(|k| {
                let pk = k.public_key();
                (pk, Endorsement::payload(&id, &pk))
            })
            .collect::<Vec<_>>();
        pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
        bls::aggregate_verify(&pairs, &tx.aggregate_sig).unwrap();
    }

    #[test]
    fn test_duplicate_endorsement_is_idempotent() {
        let s = setup(2, 3);
        let mut note = arbitrary::push_note(2);
        note.sign(&MockSigner::from_seed([9; 32]));
        let id = s.pool.add(note).unwrap();
        let endorsement = Endorsement::create(id, &s.hosts[0]);

        s.aggregator.add_endorsement(endorsement.clone()).unwrap();
        s.aggregator.add_endorsement(endorsement).unwrap();

        assert_eq!(s.aggregator.endorsements(&id), 1);
        assert!(s.mempool.txs().is_empty());
    }

    #[test]
    fn test_rejects_non_top_host() {
        let s = setup(2, 2);
        let stranger = bls::SecretKey::from_ikm(&[99; 32]).unwrap();
        let endorsement = Endorsement::create(arbitrary::push_note(3).id(), &stranger);

        assert!(matches!(
            s.aggregator.add_endorsement(endorsement),
            Err(Error::NotTopHost)
        ));
    }

    #[test]
    fn test_rejects_bad_signature() {
        let s = setup(2, 2);
        let mut endorsement = Endorsement::create(arbitrary::push_note(4).id(), &s.hosts[0]);
        endorsement.note = arbitrary::push_note(5).id();

        assert!(matches!(
            s.aggregator.add_endorsement(endorsement),
            Err(Error::Verify(_))
        ));
    }

    #[test]
    fn test_mempool_failure_keeps_endorsements() {
        let s = setup(2, 3);
        let mut note = arbitrary::push_note(6);
        note.sign(&MockSigner::from_seed([9; 32]));
        let id = s.pool.add(note).unwrap();

        s.mempool.reject(true);
        s.aggregator
            .add_endorsement(Endorsement::create(id, &s.hosts[0]))
            .unwrap();
        let err = s
            .aggregator
            .add_endorsement(Endorsement::create(id, &s.hosts[1]))
            .unwrap_err();
        assert!(matches!(err, Error::Chain(_)));
        assert_eq!(s.aggregator.endorsements(&id), 2);

        // Mempool recovers; the next endorsement retries the
        // promotion.
        s.mempool.reject(false);
        let tx = s
            .aggregator
            .add_endorsement(Endorsement::create(id, &s.hosts[2]))
            .unwrap();
        assert!(tx.is_some());
        assert_eq!(s.mempool.txs().len(), 1);
    }
}
