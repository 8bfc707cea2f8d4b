//! Restoring a repository to a captured state.
//!
//! Pushes are never committed by the node: after validation the
//! repository is put back exactly as the pre-push snapshot describes
//! it, and the push only becomes final when the reconciler applies its
//! finalized transaction.

use thiserror::Error;

use crate::git;
use crate::inspect::ObjectRefs;
use crate::state::{Change, Changes, Filter, Snapshot};
use crate::storage::Repository;
use crate::validate::TAG_PREFIX;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Git(#[from] git::Error),
    #[error(transparent)]
    State(#[from] crate::state::Error),
}

/// Restore the repository's references to `old`, optionally filtered.
/// Returns the changes that were undone.
pub fn revert(
    repo: &Repository,
    old: &Snapshot,
    filter: &Filter,
    precomputed: Option<Changes>,
) -> Result<Changes, Error> {
    let changes = match precomputed {
        Some(changes) => changes,
        None => {
            let current = Snapshot::capture(repo, filter)?;
            old.filtered(filter).diff(&current)
        }
    };

    for change in changes.iter() {
        match change {
            // Introduced by the push: remove it again.
            Change::Added { name, .. } => {
                if let Some(tag) = name.strip_prefix(TAG_PREFIX) {
                    git::tag_delete(repo, tag)?;
                } else {
                    git::ref_delete(repo, name)?;
                }
            }
            // Moved by the push: point it back.
            Change::Updated { name, old, .. } => {
                git::ref_update(repo, name, *old)?;
            }
            // Deleted by the push: restore it.
            Change::Removed { name, old } => {
                git::ref_update(repo, name, *old)?;
            }
        }
        log::debug!(target: "revert", "Reverted '{}' in {}", change.name(), repo.name);
    }
    Ok(changes)
}

/// Delete the objects owned solely by the given reverted reference.
/// Objects shared with other refs of the same push survive; their
/// ownership is transferred, not cleared.
pub fn prune_objects(
    repo: &Repository,
    objects: &mut ObjectRefs,
    name: &str,
) -> Result<usize, Error> {
    let mut deleted = 0;

    for oid in objects.owned_by(name) {
        if objects.disown(oid, name) {
            git::object_delete(repo, oid)?;
            deleted += 1;
        }
    }
    if deleted > 0 {
        log::debug!(target: "revert", "Deleted {deleted} orphaned object(s) for '{name}'");
    }
    Ok(deleted)
}
