//! Push validation.
//!
//! Every reference change of a push must carry well-formed transaction
//! parameters signed by a push key known to the chain, with a nonce
//! that extends the reference's accepted sequence by exactly one.
//! Merger commits additionally satisfy the merge-proposal rules.
//!
//! Error strings are part of the wire contract: clients see them on the
//! side-band, and peers reject pushes based on them.

use std::str;
use std::str::FromStr;

use thiserror::Error;

use crate::chain::{self, ChainView, Proposal, ProposalOutcome, PusherKey};
use crate::git::Oid;
use crate::state::Change;
use crate::storage::{RepoName, Repository};
use crate::tx::{self, MergeId, PushKeyId, TxParams};

/// Branch reference prefix.
pub const BRANCH_PREFIX: &str = "refs/heads/";
/// Tag reference prefix.
pub const TAG_PREFIX: &str = "refs/tags/";
/// Note reference prefix.
pub const NOTE_PREFIX: &str = "refs/notes/";

#[derive(Error, Debug)]
pub enum Error {
    #[error("reference '{0}' is not a branch, tag or note")]
    UnsupportedRef(String),
    #[error("reference deletion requires a delete directive")]
    DirectDeletion,
    #[error("commit {0} has no transaction parameters")]
    MissingParams(Oid),
    #[error("commit {0} is not a valid git object")]
    MalformedObject(Oid),
    #[error("commit {0} is unsigned")]
    UnsignedCommit(Oid),
    #[error("commit {0} signature is invalid")]
    InvalidCommitSignature(Oid),
    #[error("tag {0} is unsigned")]
    UnsignedTag(Oid),
    #[error("tag {0} signature is invalid")]
    InvalidTagSignature(Oid),
    #[error("note '{0}' has no transaction parameters")]
    MissingNoteParams(String),
    #[error("note '{0}' has more than one transaction parameters blob")]
    AmbiguousNoteParams(String),
    #[error("note '{0}' signature is invalid")]
    InvalidNoteSignature(String),
    #[error("push key '{0}' is unknown")]
    UnknownPushKey(PushKeyId),
    #[error("repository '{0}' has no chain state")]
    UnknownRepo(RepoName),
    #[error("reference '{name}' has nonce '{got}', expecting '{want}'")]
    Nonce { name: String, got: u64, want: u64 },
    #[error("merge error: {0}")]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Params(#[from] tx::ParseError),
    #[error(transparent)]
    Chain(#[from] chain::Error),
    #[error("git: {0}")]
    Git(#[from] git2::Error),
}

/// Merge-proposal compliance violations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MergeError {
    #[error("pushed reference must be a branch")]
    NotBranch,
    #[error("merge proposal '{0}' was not found")]
    NotFound(MergeId),
    #[error("signer did not create the merge proposal")]
    NotCreator,
    #[error("merge proposal is already closed")]
    Closed,
    #[error("merge proposal has not been accepted")]
    NotAccepted,
    #[error("pushed branch is not the merge proposal base branch")]
    BaseBranchMismatch,
    #[error("merge commit must have exactly one parent")]
    ParentCount,
    #[error("merge commit must not rewrite history")]
    HistoryRewrite,
    #[error("merge proposal base branch hash is stale or invalid")]
    StaleBase,
    #[error("merge commit parent does not match merge proposal target")]
    TargetMismatch,
}

/// Validate a single reference change and return its transaction
/// parameters.
pub fn validate_change(
    repo: &Repository,
    change: &Change,
    chain: &dyn ChainView,
) -> Result<TxParams, Error> {
    let name = change.name();
    let Some(new) = change.new() else {
        // Deletions arrive as an update carrying a `deleteRef`
        // directive; a bare zero-hash push has nothing to validate.
        return Err(Error::DirectDeletion);
    };

    if name.starts_with(BRANCH_PREFIX) {
        validate_branch(repo, chain, name, change.old(), new)
    } else if name.starts_with(TAG_PREFIX) {
        validate_tag(repo, chain, name, change.old(), new)
    } else if name.starts_with(NOTE_PREFIX) {
        validate_note(repo, chain, name, new)
    } else {
        Err(Error::UnsupportedRef(name.to_owned()))
    }
}

fn validate_branch(
    repo: &Repository,
    chain: &dyn ChainView,
    name: &str,
    old: Option<Oid>,
    new: Oid,
) -> Result<TxParams, Error> {
    let (params, pusher) = check_commit(repo, chain, new)?;

    check_nonce(chain, &repo.name, name, params.nonce)?;
    if let Some(merge_id) = params.merge_id {
        check_merge(repo, chain, &pusher, merge_id, name, old, new)?;
    }
    Ok(params)
}

fn validate_tag(
    repo: &Repository,
    chain: &dyn ChainView,
    name: &str,
    old: Option<Oid>,
    new: Oid,
) -> Result<TxParams, Error> {
    let object = repo.backend.find_object(*new, None)?;

    match object.kind() {
        Some(git2::ObjectType::Tag) => {
            let content = read_object(repo, new)?;
            let message = content
                .split_once("\n\n")
                .map(|(_, msg)| msg)
                .ok_or(Error::MalformedObject(new))?;
            let params = match TxParams::from_message(message) {
                Ok(params) => params,
                Err(tx::ParseError::Missing) => return Err(Error::MissingParams(new)),
                Err(e) => return Err(e.into()),
            };
            let sig = params.signature.ok_or(Error::UnsignedTag(new))?;
            let pusher = resolve_pusher(chain, &params.push_key)?;

            pusher
                .key
                .verify(tx::strip_signature(&content), &sig)
                .map_err(|_| Error::InvalidTagSignature(new))?;

            check_nonce(chain, &repo.name, name, params.nonce)?;
            if let Some(merge_id) = params.merge_id {
                check_merge(repo, chain, &pusher, merge_id, name, old, new)?;
            }

            // The tagged commit must itself carry a valid signature;
            // its nonce belongs to the branch push that introduced it.
            let target = object
                .peel(git2::ObjectType::Commit)
                .map_err(|_| Error::MalformedObject(new))?;
            check_commit(repo, chain, target.id().into())?;

            Ok(params)
        }
        // Lightweight tags point straight at a commit.
        Some(git2::ObjectType::Commit) => {
            let (params, pusher) = check_commit(repo, chain, new)?;

            check_nonce(chain, &repo.name, name, params.nonce)?;
            if let Some(merge_id) = params.merge_id {
                check_merge(repo, chain, &pusher, merge_id, name, old, new)?;
            }
            Ok(params)
        }
        _ => Err(Error::MalformedObject(new)),
    }
}

fn validate_note(
    repo: &Repository,
    chain: &dyn ChainView,
    name: &str,
    new: Oid,
) -> Result<TxParams, Error> {
    let commit = repo.backend.find_commit(*new)?;
    let tree = commit.tree()?;
    let mut found: Option<(TxParams, Oid)> = None;

    // Note trees name their entries after the annotated object. The
    // parameters blob's signature covers that object's hash, so it can
    // be computed before the note commit exists.
    for entry in tree.iter() {
        if entry.kind() != Some(git2::ObjectType::Blob) {
            continue;
        }
        let blob = repo.backend.find_blob(entry.id())?;
        let Ok(content) = str::from_utf8(blob.content()) else {
            continue;
        };
        if !content.trim_start().starts_with(tx::PREFIX) {
            continue;
        }
        let annotated = entry
            .name()
            .and_then(|n| Oid::from_str(n).ok())
            .ok_or_else(|| Error::MissingNoteParams(name.to_owned()))?;
        let line = content.lines().next().unwrap_or_default();
        if found.replace((TxParams::parse(line)?, annotated)).is_some() {
            return Err(Error::AmbiguousNoteParams(name.to_owned()));
        }
    }
    let (params, annotated) = found.ok_or_else(|| Error::MissingNoteParams(name.to_owned()))?;
    let sig = params
        .signature
        .ok_or_else(|| Error::InvalidNoteSignature(name.to_owned()))?;
    let pusher = resolve_pusher(chain, &params.push_key)?;

    pusher
        .key
        .verify(params.note_payload(annotated), &sig)
        .map_err(|_| Error::InvalidNoteSignature(name.to_owned()))?;

    check_nonce(chain, &repo.name, name, params.nonce)?;

    Ok(params)
}

/// Validate the transaction parameters and signature carried by a
/// commit. Nonce and merge rules are the caller's concern: a commit
/// referenced through a tag is checked for authorship only.
fn check_commit(
    repo: &Repository,
    chain: &dyn ChainView,
    oid: Oid,
) -> Result<(TxParams, PusherKey), Error> {
    let content = read_object(repo, oid)?;
    let message = content
        .split_once("\n\n")
        .map(|(_, msg)| msg)
        .ok_or(Error::MalformedObject(oid))?;
    let params = match TxParams::from_message(message) {
        Ok(params) => params,
        Err(tx::ParseError::Missing) => return Err(Error::MissingParams(oid)),
        Err(e) => return Err(e.into()),
    };
    let sig = params.signature.ok_or(Error::UnsignedCommit(oid))?;
    let pusher = resolve_pusher(chain, &params.push_key)?;

    pusher
        .key
        .verify(tx::strip_signature(&content), &sig)
        .map_err(|_| Error::InvalidCommitSignature(oid))?;

    Ok((params, pusher))
}

fn read_object(repo: &Repository, oid: Oid) -> Result<String, Error> {
    let data = repo
        .read_object(oid)
        .map_err(|_| Error::MalformedObject(oid))?;

    String::from_utf8(data).map_err(|_| Error::MalformedObject(oid))
}

fn resolve_pusher(chain: &dyn ChainView, id: &PushKeyId) -> Result<PusherKey, Error> {
    chain
        .pusher_key(id)?
        .ok_or_else(|| Error::UnknownPushKey(id.clone()))
}

/// The announced nonce must extend the reference's accepted sequence
/// by exactly one. The first push to a reference announces nonce 1.
fn check_nonce(
    chain: &dyn ChainView,
    repo: &RepoName,
    name: &str,
    got: u64,
) -> Result<(), Error> {
    let state = chain
        .repo_state(repo)?
        .ok_or_else(|| Error::UnknownRepo(repo.clone()))?;
    let want = state.reference(name).map(|r| r.nonce).unwrap_or(0) + 1;

    if got != want {
        return Err(Error::Nonce {
            name: name.to_owned(),
            got,
            want,
        });
    }
    Ok(())
}

fn check_merge(
    repo: &Repository,
    chain: &dyn ChainView,
    pusher: &PusherKey,
    merge_id: MergeId,
    name: &str,
    old: Option<Oid>,
    new: Oid,
) -> Result<(), Error> {
    let Some(branch) = name.strip_prefix(BRANCH_PREFIX) else {
        return Err(MergeError::NotBranch.into());
    };
    let state = chain
        .repo_state(&repo.name)?
        .ok_or_else(|| Error::UnknownRepo(repo.name.clone()))?;
    let proposal = state
        .proposal(&merge_id)
        .ok_or(MergeError::NotFound(merge_id))?;

    check_proposal(repo, pusher, proposal, branch, old, new)?;

    Ok(())
}

fn check_proposal(
    repo: &Repository,
    pusher: &PusherKey,
    proposal: &Proposal,
    branch: &str,
    old: Option<Oid>,
    new: Oid,
) -> Result<(), MergeError> {
    if pusher.owner != proposal.creator {
        return Err(MergeError::NotCreator);
    }
    if proposal.closed {
        return Err(MergeError::Closed);
    }
    if proposal.outcome != ProposalOutcome::Accepted {
        return Err(MergeError::NotAccepted);
    }
    if proposal.base_branch != branch {
        return Err(MergeError::BaseBranchMismatch);
    }

    let commit = repo
        .backend
        .find_commit(*new)
        .map_err(|_| MergeError::ParentCount)?;
    if commit.parent_count() != 1 {
        return Err(MergeError::ParentCount);
    }
    let parent = commit.parent(0).map_err(|_| MergeError::ParentCount)?;

    // A merger commit may carry the proposal's changes, but may not
    // rewrite what it merges onto.
    if parent.tree_id() != commit.tree_id()
        || !same_signature(&parent.author(), &commit.author())
        || !same_signature(&parent.committer(), &commit.committer())
    {
        return Err(MergeError::HistoryRewrite);
    }
    if old != Some(proposal.base_hash) {
        return Err(MergeError::StaleBase);
    }
    if Oid::from(parent.id()) != proposal.target_hash {
        return Err(MergeError::TargetMismatch);
    }
    Ok(())
}

fn same_signature(a: &git2::Signature, b: &git2::Signature) -> bool {
    a.name_bytes() == b.name_bytes() && a.email_bytes() == b.email_bytes() && a.when() == b.when()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::chain::mock::MockChain;
    use crate::chain::{Address, RefState};
    use crate::crypto::test::signer::MockSigner;
    use crate::test::fixtures;
    use keel_crypto::Signer;

    fn setup() -> (tempfile::TempDir, Repository, MockSigner, MockChain) {
        let (tmp, repo, _) = fixtures::repository();
        let signer = MockSigner::from_seed([11; 32]);
        let chain = MockChain::default();

        chain.register_pusher(&signer, Address::from_str("os1alice").unwrap());
        chain.register_repo(&repo.name);

        (tmp, repo, signer, chain)
    }

    #[test]
    fn test_valid_branch_push() {
        let (_tmp, repo, signer, chain) = setup();
        let head = fixtures::signed_commit(&repo, "refs/heads/feature", "add feature", &[], &signer, 1, 1);
        let change = Change::Added {
            name: "refs/heads/feature".to_owned(),
            new: head,
        };
        let params = validate_change(&repo, &change, &chain).unwrap();

        assert_eq!(params.nonce, 1);
        assert_eq!(params.fee, 1);
        assert_eq!(params.push_key, PushKeyId::of(signer.public_key()));
    }

    #[test]
    fn test_unsigned_commit() {
        let (_tmp, repo, signer, chain) = setup();
        let pk = PushKeyId::of(signer.public_key());
        let head = fixtures::commit_with_message(
            &repo,
            "refs/heads/feature",
            &format!("add feature\n\ntx: fee=1 nonce=1 pkID={pk}\n"),
            &[],
        );
        let change = Change::Added {
            name: "refs/heads/feature".to_owned(),
            new: head,
        };
        let err = validate_change(&repo, &change, &chain).unwrap_err();

        assert_eq!(err.to_string(), format!("commit {head} is unsigned"));
    }

    #[test]
    fn test_missing_params() {
        let (_tmp, repo, _, chain) = setup();
        let head = fixtures::commit_with_message(&repo, "refs/heads/feature", "no params\n", &[]);
        let change = Change::Added {
            name: "refs/heads/feature".to_owned(),
            new: head,
        };
        let err = validate_change(&repo, &change, &chain).unwrap_err();

        assert_eq!(
            err.to_string(),
            format!("commit {head} has no transaction parameters")
        );
    }

    #[test]
    fn test_wrong_signer() {
        let (_tmp, repo, signer, chain) = setup();
        // Signed by an impostor, but advertising the registered key.
        let impostor = MockSigner::from_seed([99; 32]);
        let head = fixtures::forged_commit(
            &repo,
            "refs/heads/feature",
            "add feature",
            &PushKeyId::of(signer.public_key()),
            &impostor,
        );
        let change = Change::Added {
            name: "refs/heads/feature".to_owned(),
            new: head,
        };
        let err = validate_change(&repo, &change, &chain).unwrap_err();

        assert_eq!(
            err.to_string(),
            format!("commit {head} signature is invalid")
        );
    }

    #[test]
    fn test_nonce_gap() {
        let (_tmp, repo, signer, chain) = setup();
        chain.set_ref_state(
            &repo.name,
            "refs/heads/main",
            RefState {
                hash: fixtures::oid(1),
                nonce: 3,
            },
        );
        let head =
            fixtures::signed_commit(&repo, "refs/heads/main", "skip ahead", &[], &signer, 1, 5);
        let change = Change::Added {
            name: "refs/heads/main".to_owned(),
            new: head,
        };
        let err = validate_change(&repo, &change, &chain).unwrap_err();

        assert_eq!(
            err.to_string(),
            "reference 'refs/heads/main' has nonce '5', expecting '4'"
        );
    }

    #[test]
    fn test_unknown_push_key() {
        let (_tmp, repo, _, chain) = setup();
        let stranger = MockSigner::from_seed([77; 32]);
        let head =
            fixtures::signed_commit(&repo, "refs/heads/x", "hello", &[], &stranger, 1, 1);
        let change = Change::Added {
            name: "refs/heads/x".to_owned(),
            new: head,
        };

        assert!(matches!(
            validate_change(&repo, &change, &chain),
            Err(Error::UnknownPushKey(_))
        ));
    }

    #[test]
    fn test_unsupported_ref() {
        let (_tmp, repo, _, chain) = setup();
        let change = Change::Added {
            name: "refs/wild/west".to_owned(),
            new: fixtures::oid(2),
        };

        assert!(matches!(
            validate_change(&repo, &change, &chain),
            Err(Error::UnsupportedRef(_))
        ));
    }

    #[test]
    fn test_annotated_tag() {
        let (_tmp, repo, signer, chain) = setup();
        let commit =
            fixtures::signed_commit(&repo, "refs/heads/release", "cut release", &[], &signer, 1, 1);
        let tag = fixtures::signed_tag(&repo, "v1", commit, &signer, 1, 1);
        let change = Change::Added {
            name: "refs/tags/v1".to_owned(),
            new: tag,
        };
        let params = validate_change(&repo, &change, &chain).unwrap();

        assert_eq!(params.nonce, 1);
    }

    #[test]
    fn test_lightweight_tag_falls_through_to_commit() {
        let (_tmp, repo, signer, chain) = setup();
        let commit =
            fixtures::signed_commit(&repo, "refs/heads/release", "cut release", &[], &signer, 1, 1);
        fixtures::lightweight_tag(&repo, "v2", commit);
        let change = Change::Added {
            name: "refs/tags/v2".to_owned(),
            new: commit,
        };

        validate_change(&repo, &change, &chain).unwrap();
    }

    #[test]
    fn test_note_change() {
        let (_tmp, repo, signer, chain) = setup();
        let annotated =
            fixtures::signed_commit(&repo, "refs/heads/master", "annotated", &[], &signer, 1, 1);
        let tip = fixtures::signed_note(&repo, "refs/notes/commits", annotated, &signer, 1, 1);
        let change = Change::Added {
            name: "refs/notes/commits".to_owned(),
            new: tip,
        };
        let params = validate_change(&repo, &change, &chain).unwrap();

        assert_eq!(params.fee, 1);
    }

    #[test]
    fn test_note_without_params() {
        let (_tmp, repo, _, chain) = setup();
        let tip = fixtures::commit(&repo, "refs/notes/commits", "empty notes", &[]);
        let change = Change::Added {
            name: "refs/notes/commits".to_owned(),
            new: tip,
        };

        assert!(matches!(
            validate_change(&repo, &change, &chain),
            Err(Error::MissingNoteParams(_))
        ));
    }

    fn merge_setup(
        repo: &Repository,
        chain: &MockChain,
        signer: &MockSigner,
        base_hash: Oid,
    ) -> (Oid, Oid) {
        use crate::chain::{Proposal, ProposalOutcome};

        // The commit being merged; the merger commit must carry
        // identical tree and identity fields.
        let target = fixtures::commit(repo, "refs/heads/staging", "work", &[]);
        let merger = fixtures::signed_commit_with(
            repo,
            "refs/heads/master",
            "merge work",
            &[target],
            &PushKeyId::of(signer.public_key()),
            signer,
            1,
            1,
            Some("0001".parse().unwrap()),
            false,
        );

        chain.add_proposal(
            &repo.name,
            Proposal {
                id: "0001".parse().unwrap(),
                creator: Address::from_str("os1alice").unwrap(),
                closed: false,
                outcome: ProposalOutcome::Accepted,
                base_branch: "master".to_owned(),
                base_hash,
                target_hash: target,
            },
        );
        (target, merger)
    }

    #[test]
    fn test_merge_compliance_accepts() {
        let (_tmp, repo, signer, chain) = setup();
        let base = fixtures::oid(10);
        let (_, merger) = merge_setup(&repo, &chain, &signer, base);
        let change = Change::Updated {
            name: "refs/heads/master".to_owned(),
            old: base,
            new: merger,
        };

        validate_change(&repo, &change, &chain).unwrap();
    }

    #[test]
    fn test_merge_stale_base_hash() {
        let (_tmp, repo, signer, chain) = setup();
        let (_, merger) = merge_setup(&repo, &chain, &signer, fixtures::oid(10));
        let change = Change::Updated {
            name: "refs/heads/master".to_owned(),
            // The push moves a different base than the proposal names.
            old: fixtures::oid(11),
            new: merger,
        };
        let err = validate_change(&repo, &change, &chain).unwrap_err();

        assert_eq!(
            err.to_string(),
            "merge error: merge proposal base branch hash is stale or invalid"
        );
    }

    #[test]
    fn test_merge_unknown_proposal() {
        let (_tmp, repo, signer, chain) = setup();
        let target = fixtures::commit(&repo, "refs/heads/staging", "work", &[]);
        let merger = fixtures::signed_commit_with(
            &repo,
            "refs/heads/master",
            "merge work",
            &[target],
            &PushKeyId::of(signer.public_key()),
            &signer,
            1,
            1,
            Some("0009".parse().unwrap()),
            false,
        );
        let change = Change::Updated {
            name: "refs/heads/master".to_owned(),
            old: fixtures::oid(12),
            new: merger,
        };
        let err = validate_change(&repo, &change, &chain).unwrap_err();

        assert_eq!(
            err.to_string(),
            "merge error: merge proposal '0009' was not found"
        );
    }

    #[test]
    fn test_merge_on_tag_rejected() {
        let (_tmp, repo, signer, chain) = setup();
        let commit = fixtures::signed_commit_with(
            &repo,
            "refs/heads/staging",
            "tagged",
            &[],
            &PushKeyId::of(signer.public_key()),
            &signer,
            1,
            1,
            Some("0001".parse().unwrap()),
            false,
        );
        fixtures::lightweight_tag(&repo, "v9", commit);
        let change = Change::Added {
            name: "refs/tags/v9".to_owned(),
            new: commit,
        };
        let err = validate_change(&repo, &change, &chain).unwrap_err();

        assert_eq!(
            err.to_string(),
            "merge error: pushed reference must be a branch"
        );
    }

    #[test]
    fn test_direct_deletion_rejected() {
        let (_tmp, repo, _, chain) = setup();
        let change = Change::Removed {
            name: "refs/heads/gone".to_owned(),
            old: fixtures::oid(3),
        };

        assert!(matches!(
            validate_change(&repo, &change, &chain),
            Err(Error::DirectDeletion)
        ));
    }
}
