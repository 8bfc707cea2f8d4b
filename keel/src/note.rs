//! Push-notes and their on-chain form.
//!
//! A push-note is the node-authored envelope around one client push:
//! the pushed references, the pusher's identity and fees, all signed by
//! the receiving node's key. Once a quorum of top hosts endorses the
//! note, it is promoted to a push transaction and submitted to the
//! mempool.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::chain::Address;
use crate::crypto::hash::Digest;
use crate::crypto::{bls, PublicKey, Signature, Signer};
use crate::git::Oid;
use crate::storage::{Namespace, RepoName};
use crate::tx::{MergeId, PushKeyId};
use crate::wire::{self, Decode, Encode};

/// A push-note fingerprint: Blake2b-256 of the note's wire encoding.
pub type NoteId = Digest;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("push note is unsigned")]
    Unsigned,
    #[error("push note signature is invalid")]
    InvalidSignature,
    #[error("endorsement signature is invalid")]
    InvalidEndorsement,
}

/// An object introduced by a push, with its declared byte size.
/// Peers fetching the object verify the size before accepting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushedObject {
    pub oid: Oid,
    pub size: u64,
}

impl Encode for PushedObject {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        Ok(self.oid.encode(writer)? + self.size.encode(writer)?)
    }
}

impl Decode for PushedObject {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let oid = Oid::decode(reader)?;
        let size = u64::decode(reader)?;

        Ok(Self { oid, size })
    }
}

/// One reference of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedRef {
    pub name: String,
    pub old: Oid,
    pub new: Oid,
    /// Reference nonce announced by the pusher. Must extend the
    /// accepted sequence by exactly one.
    pub nonce: u64,
    /// Objects this reference introduces.
    pub objects: Vec<PushedObject>,
    pub fee: u64,
    pub merge_id: Option<MergeId>,
    pub delete: bool,
}

impl Encode for PushedRef {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.name.encode(writer)?;
        n += self.old.encode(writer)?;
        n += self.new.encode(writer)?;
        n += self.nonce.encode(writer)?;
        n += self.objects.encode(writer)?;
        n += self.fee.encode(writer)?;
        n += self.merge_id.map(|id| id.number() as u64).encode(writer)?;
        n += self.delete.encode(writer)?;

        Ok(n)
    }
}

impl Decode for PushedRef {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let name = String::decode(reader)?;
        let old = Oid::decode(reader)?;
        let new = Oid::decode(reader)?;
        let nonce = u64::decode(reader)?;
        let objects = Vec::decode(reader)?;
        let fee = u64::decode(reader)?;
        let merge_id = Option::<u64>::decode(reader)?
            .map(|n| {
                format!("{:04}", n)
                    .parse::<MergeId>()
                    .map_err(|_| wire::Error::InvalidString(format!("merge id {n}")))
            })
            .transpose()?;
        let delete = bool::decode(reader)?;

        Ok(Self {
            name,
            old,
            new,
            nonce,
            objects,
            fee,
            merge_id,
            delete,
        })
    }
}

/// The node-authored envelope around one push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNote {
    pub repo: RepoName,
    pub namespace: Option<Namespace>,
    pub references: Vec<PushedRef>,
    pub push_key: PushKeyId,
    pub pusher: Address,
    /// The pusher's account nonce at push time.
    pub pusher_nonce: u64,
    /// Total fee, the sum of the per-reference fees.
    pub fee: u64,
    /// Total size in bytes of the objects this push introduces.
    pub size: u64,
    /// Unix timestamp, in milliseconds.
    pub timestamp: u64,
    /// Key of the node that accepted the push.
    pub node_key: PublicKey,
    pub node_sig: Option<Signature>,
}

impl PushNote {
    /// The note's fingerprint.
    pub fn id(&self) -> NoteId {
        Digest::new(wire::serialize(self))
    }

    /// The bytes covered by the node signature: the encoding with the
    /// signature itself absent.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.node_sig = None;

        wire::serialize(&unsigned)
    }

    /// Sign the note with the node key.
    pub fn sign(&mut self, signer: &dyn Signer) {
        self.node_key = *signer.public_key();
        self.node_sig = Some(signer.sign(&self.signing_payload()));
    }

    /// Verify the node signature.
    pub fn verify(&self) -> Result<(), VerifyError> {
        let sig = self.node_sig.as_ref().ok_or(VerifyError::Unsigned)?;

        self.node_key
            .verify(self.signing_payload(), sig)
            .map_err(|_| VerifyError::InvalidSignature)
    }

    /// The declared size of an object in this push, if present.
    pub fn object_size(&self, oid: Oid) -> Option<u64> {
        self.references
            .iter()
            .flat_map(|r| r.objects.iter())
            .find(|o| o.oid == oid)
            .map(|o| o.size)
    }

    /// A reference entry by name.
    pub fn reference(&self, name: &str) -> Option<&PushedRef> {
        self.references.iter().find(|r| r.name == name)
    }
}

impl fmt::Display for PushNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.id())
    }
}

impl Encode for PushNote {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.repo.as_str().encode(writer)?;
        n += self
            .namespace
            .map(|ns| *ns.digest())
            .encode(writer)?;
        n += self.references.encode(writer)?;
        n += self.push_key.as_str().encode(writer)?;
        n += self.pusher.as_str().encode(writer)?;
        n += self.pusher_nonce.encode(writer)?;
        n += self.fee.encode(writer)?;
        n += self.size.encode(writer)?;
        n += self.timestamp.encode(writer)?;
        n += self.node_key.encode(writer)?;
        n += self.node_sig.encode(writer)?;

        Ok(n)
    }
}

impl Decode for PushNote {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let repo = String::decode(reader)?
            .parse::<RepoName>()
            .map_err(|e| wire::Error::InvalidString(e.to_string()))?;
        let namespace = Option::<Digest>::decode(reader)?.map(Namespace::from);
        let references = Vec::decode(reader)?;
        let push_key = String::decode(reader)?
            .parse::<PushKeyId>()
            .map_err(|e| wire::Error::InvalidString(e.to_string()))?;
        let pusher = String::decode(reader)?
            .parse::<Address>()
            .map_err(|e| wire::Error::InvalidString(e.to_string()))?;
        let pusher_nonce = u64::decode(reader)?;
        let fee = u64::decode(reader)?;
        let size = u64::decode(reader)?;
        let timestamp = u64::decode(reader)?;
        let node_key = PublicKey::decode(reader)?;
        let node_sig = Option::<Signature>::decode(reader)?;

        Ok(Self {
            repo,
            namespace,
            references,
            push_key,
            pusher,
            pusher_nonce,
            fee,
            size,
            timestamp,
            node_key,
            node_sig,
        })
    }
}

/// A top host's attestation that a push-note is well-formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endorsement {
    pub note: NoteId,
    pub endorser: bls::PublicKey,
    pub sig: bls::Signature,
}

impl Endorsement {
    /// The bytes an endorsement signature covers:
    /// `note id || endorser key`.
    pub fn payload(note: &NoteId, endorser: &bls::PublicKey) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32 + bls::PUBLIC_KEY_BYTES);
        bytes.extend_from_slice(note.as_bytes());
        bytes.extend_from_slice(endorser.as_bytes());
        bytes
    }

    /// Create an endorsement for a note.
    pub fn create(note: NoteId, key: &bls::SecretKey) -> Self {
        let endorser = key.public_key();
        let sig = key.sign(&Self::payload(&note, &endorser));

        Self {
            note,
            endorser,
            sig,
        }
    }

    /// Verify the endorsement signature.
    pub fn verify(&self) -> Result<(), VerifyError> {
        bls::verify(
            &self.endorser,
            &Self::payload(&self.note, &self.endorser),
            &self.sig,
        )
        .map_err(|_| VerifyError::InvalidEndorsement)
    }
}

impl Encode for Endorsement {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.note.encode(writer)?;
        n += self.endorser.encode(writer)?;
        n += self.sig.encode(writer)?;

        Ok(n)
    }
}

impl Decode for Endorsement {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let note = Digest::decode(reader)?;
        let endorser = bls::PublicKey::decode(reader)?;
        let sig = bls::Signature::decode(reader)?;

        Ok(Self {
            note,
            endorser,
            sig,
        })
    }
}

/// The on-chain form of a quorum-endorsed push-note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTx {
    pub note: PushNote,
    /// Aggregate of the endorsers' signatures, in endorser key order.
    pub aggregate_sig: bls::Signature,
    /// Bit `i` set means the i-th top host of the note's epoch
    /// endorsed.
    pub endorsers: u64,
}

impl PushTx {
    /// Endorser indices set in the bitset.
    pub fn endorser_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..u64::BITS as usize).filter(move |i| self.endorsers & (1 << i) != 0)
    }
}

impl Encode for PushTx {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.note.encode(writer)?;
        n += self.aggregate_sig.encode(writer)?;
        n += self.endorsers.encode(writer)?;

        Ok(n)
    }
}

impl Decode for PushTx {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let note = PushNote::decode(reader)?;
        let aggregate_sig = bls::Signature::decode(reader)?;
        let endorsers = u64::decode(reader)?;

        Ok(Self {
            note,
            aggregate_sig,
            endorsers,
        })
    }
}
