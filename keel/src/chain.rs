//! Ports to the node's external collaborators.
//!
//! The chain, the DHT and the mempool are consumed through narrow
//! traits, wired in explicitly wherever they are needed. The node never
//! implements consensus or content routing itself.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use std::{fmt, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{bls, PublicKey};
use crate::git::Oid;
use crate::note::PushTx;
use crate::storage::RepoName;
use crate::tx::{MergeId, PushKeyId};

#[cfg(any(test, feature = "test"))]
pub mod mock;

/// Module tag under which repository objects are published on the DHT.
pub const DHT_OBJECT_MODULE: &str = "repo-object";
/// How long to wait for a DHT fetch before giving up.
pub const DHT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum Error {
    #[error("request timed out")]
    Timeout,
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("rpc: {0}")]
    Rpc(String),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn rpc(err: impl fmt::Display) -> Self {
        Self::Rpc(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("invalid character '{0}' in address")]
    InvalidCharacter(char),
}

/// An on-chain account address. Opaque to the node; validated for
/// transport safety only.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        if let Some(c) = s.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(AddressError::InvalidCharacter(c));
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// A registered push key: the verification key and its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PusherKey {
    pub id: PushKeyId,
    pub key: PublicKey,
    pub owner: Address,
}

/// An on-chain account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: u64,
    pub nonce: u64,
}

/// A host eligible to endorse push-notes in the current epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub key: PublicKey,
    pub bls_key: bls::PublicKey,
}

/// Outcome of a merge proposal vote.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalOutcome {
    Pending,
    Accepted,
    Rejected,
}

/// A merge proposal held in repository state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: MergeId,
    pub creator: Address,
    pub closed: bool,
    pub outcome: ProposalOutcome,
    pub base_branch: String,
    pub base_hash: Oid,
    pub target_hash: Oid,
}

/// Accepted state of one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefState {
    pub hash: Oid,
    pub nonce: u64,
}

/// On-chain state of a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoState {
    pub balance: u64,
    pub references: BTreeMap<String, RefState>,
    pub proposals: BTreeMap<MergeId, Proposal>,
}

impl RepoState {
    pub fn reference(&self, name: &str) -> Option<&RefState> {
        self.references.get(name)
    }

    pub fn proposal(&self, id: &MergeId) -> Option<&Proposal> {
        self.proposals.get(id)
    }
}

/// A finalized block. Transactions are opaque payloads; the reconciler
/// picks out the ones that decode as push transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub txs: Vec<Vec<u8>>,
}

/// Read-only view of the chain.
pub trait ChainView: Send + Sync {
    /// Resolve a push key to its verification key and owner.
    fn pusher_key(&self, id: &PushKeyId) -> Result<Option<PusherKey>, Error>;
    /// Look up an account.
    fn account(&self, addr: &Address) -> Result<Option<Account>, Error>;
    /// The top-ranked hosts for the given epoch.
    fn top_hosts(&self, epoch: u64) -> Result<Vec<Host>, Error>;
    /// Repository state, if the repository is registered.
    fn repo_state(&self, name: &RepoName) -> Result<Option<RepoState>, Error>;
    /// The finalized block at the given height, if any.
    fn block(&self, height: u64) -> Result<Option<Block>, Error>;
    /// Current chain height.
    fn height(&self) -> Result<u64, Error>;
}

/// Content-addressed object exchange.
pub trait Dht: Send + Sync {
    /// Announce ourselves as a provider for the key.
    fn announce(&self, key: &str) -> Result<(), Error>;
    /// Fetch an object's bytes. Implementations are expected to give up
    /// after [`DHT_TIMEOUT`].
    fn get_object(&self, key: &str) -> Result<Vec<u8>, Error>;
}

/// Write access to the transaction pool for non-push transactions.
pub trait Mempool: Send + Sync {
    /// Submit a push transaction.
    fn add(&self, tx: PushTx) -> Result<(), Error>;
    /// Whether any pending transaction references the repository.
    fn references_repo(&self, name: &RepoName) -> Result<bool, Error>;
}

/// DHT key for a repository object: `<repo>/<oid>`.
pub fn object_key(repo: &RepoName, oid: Oid) -> String {
    format!("{repo}/{oid}")
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::test::arbitrary;

    #[test]
    fn test_address() {
        assert!(Address::from_str("os1qxyz9").is_ok());
        assert!(Address::from_str("").is_err());
        assert!(Address::from_str("a b").is_err());
    }

    #[test]
    fn test_object_key() {
        let repo = RepoName::from_str("alice").unwrap();
        let oid = arbitrary::oid(1);

        assert_eq!(object_key(&repo, oid), format!("alice/{oid}"));
    }
}
