//! In-memory ports for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::crypto::Signer;
use crate::note::PushTx;
use crate::storage::RepoName;
use crate::tx::PushKeyId;

use super::{
    Account, Address, Block, ChainView, Dht, Error, Host, Mempool, Proposal, PusherKey, RefState,
    RepoState,
};

/// An in-memory chain view.
#[derive(Default)]
pub struct MockChain {
    pushers: Mutex<HashMap<PushKeyId, PusherKey>>,
    accounts: Mutex<HashMap<Address, Account>>,
    hosts: Mutex<Vec<Host>>,
    repos: Mutex<HashMap<RepoName, RepoState>>,
    blocks: Mutex<Vec<Block>>,
}

impl MockChain {
    /// Register a push key owned by the given address.
    pub fn register_pusher(&self, signer: &dyn Signer, owner: Address) -> PushKeyId {
        let id = PushKeyId::of(signer.public_key());

        self.pushers.lock().unwrap().insert(
            id.clone(),
            PusherKey {
                id: id.clone(),
                key: *signer.public_key(),
                owner,
            },
        );
        id
    }

    pub fn register_repo(&self, name: &RepoName) {
        self.repos
            .lock()
            .unwrap()
            .entry(name.clone())
            .or_default();
    }

    pub fn set_ref_state(&self, name: &RepoName, refname: &str, state: RefState) {
        self.repos
            .lock()
            .unwrap()
            .entry(name.clone())
            .or_default()
            .references
            .insert(refname.to_owned(), state);
    }

    pub fn add_proposal(&self, name: &RepoName, proposal: Proposal) {
        self.repos
            .lock()
            .unwrap()
            .entry(name.clone())
            .or_default()
            .proposals
            .insert(proposal.id, proposal);
    }

    pub fn set_account(&self, addr: Address, account: Account) {
        self.accounts.lock().unwrap().insert(addr, account);
    }

    pub fn set_hosts(&self, hosts: Vec<Host>) {
        *self.hosts.lock().unwrap() = hosts;
    }

    /// Append a finalized block and return its height.
    pub fn push_block(&self, txs: Vec<Vec<u8>>) -> u64 {
        let mut blocks = self.blocks.lock().unwrap();
        let height = blocks.len() as u64 + 1;

        blocks.push(Block { height, txs });
        height
    }
}

impl ChainView for MockChain {
    fn pusher_key(&self, id: &PushKeyId) -> Result<Option<PusherKey>, Error> {
        Ok(self.pushers.lock().unwrap().get(id).cloned())
    }

    fn account(&self, addr: &Address) -> Result<Option<Account>, Error> {
        Ok(self.accounts.lock().unwrap().get(addr).copied())
    }

    fn top_hosts(&self, _epoch: u64) -> Result<Vec<Host>, Error> {
        Ok(self.hosts.lock().unwrap().clone())
    }

    fn repo_state(&self, name: &RepoName) -> Result<Option<RepoState>, Error> {
        Ok(self.repos.lock().unwrap().get(name).cloned())
    }

    fn block(&self, height: u64) -> Result<Option<Block>, Error> {
        if height == 0 {
            return Ok(None);
        }
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .get(height as usize - 1)
            .cloned())
    }

    fn height(&self) -> Result<u64, Error> {
        Ok(self.blocks.lock().unwrap().len() as u64)
    }
}

/// An in-memory object exchange.
#[derive(Default)]
pub struct MockDht {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    announced: Mutex<Vec<String>>,
}

impl MockDht {
    pub fn insert(&self, key: String, value: Vec<u8>) {
        self.objects.lock().unwrap().insert(key, value);
    }

    pub fn announced(&self) -> Vec<String> {
        self.announced.lock().unwrap().clone()
    }
}

impl Dht for MockDht {
    fn announce(&self, key: &str) -> Result<(), Error> {
        self.announced.lock().unwrap().push(key.to_owned());

        Ok(())
    }

    fn get_object(&self, key: &str) -> Result<Vec<u8>, Error> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_owned()))
    }
}

/// An in-memory mempool.
#[derive(Default)]
pub struct MockMempool {
    txs: Mutex<Vec<PushTx>>,
    reject: AtomicBool,
}

impl MockMempool {
    /// Make subsequent submissions fail.
    pub fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn txs(&self) -> Vec<PushTx> {
        self.txs.lock().unwrap().clone()
    }
}

impl Mempool for MockMempool {
    fn add(&self, tx: PushTx) -> Result<(), Error> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(Error::Rpc("mempool rejected transaction".to_owned()));
        }
        self.txs.lock().unwrap().push(tx);

        Ok(())
    }

    fn references_repo(&self, name: &RepoName) -> Result<bool, Error> {
        Ok(self.txs.lock().unwrap().iter().any(|tx| &tx.note.repo == name))
    }
}
