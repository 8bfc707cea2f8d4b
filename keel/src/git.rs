//! Git driver.
//!
//! Repository plumbing goes through `git2`; the smart protocol services
//! and maintenance commands drive the `git` binary as a subprocess, at
//! its pipe boundaries.

pub mod serve;

use std::io;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;
use std::{fmt, ops::Deref};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::Repository;

pub use git2 as raw;

/// A git object id.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Oid(git2::Oid);

impl Oid {
    /// The all-zero object id, used on the wire for ref creation and
    /// deletion.
    pub fn zero() -> Self {
        Self(git2::Oid::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.0)
    }
}

impl Deref for Oid {
    type Target = git2::Oid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<git2::Oid> for Oid {
    fn from(oid: git2::Oid) -> Self {
        Self(oid)
    }
}

impl From<Oid> for git2::Oid {
    fn from(oid: Oid) -> Self {
        oid.0
    }
}

impl FromStr for Oid {
    type Err = git2::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        git2::Oid::from_str(s).map(Self)
    }
}

impl TryFrom<String> for Oid {
    type Error = git2::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

impl From<Oid> for String {
    fn from(oid: Oid) -> Self {
        oid.to_string()
    }
}

impl TryFrom<&[u8]> for Oid {
    type Error = git2::Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        git2::Oid::from_bytes(bytes).map(Self)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("git: {0}")]
    Git(#[from] git2::Error),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("reference '{0}' was not found")]
    RefNotFound(String),
}

/// Execute a git command by spawning a child process.
pub fn run<P: AsRef<Path>, S: AsRef<std::ffi::OsStr>>(
    repo: &P,
    args: impl IntoIterator<Item = S>,
) -> Result<String, io::Error> {
    let output = Command::new("git").current_dir(repo).args(args).output()?;

    if output.status.success() {
        let out = if output.stdout.is_empty() {
            &output.stderr
        } else {
            &output.stdout
        };
        return Ok(String::from_utf8_lossy(out).into());
    }

    Err(io::Error::new(
        io::ErrorKind::Other,
        String::from_utf8_lossy(&output.stderr),
    ))
}

/// Point a reference at the given target, creating it if needed.
pub fn ref_update(repo: &Repository, name: &str, target: Oid) -> Result<(), Error> {
    repo.backend
        .reference(name, *target, true, "keel: update ref")?;

    Ok(())
}

/// Delete a reference.
pub fn ref_delete(repo: &Repository, name: &str) -> Result<(), Error> {
    let mut reference = repo
        .backend
        .find_reference(name)
        .map_err(|_| Error::RefNotFound(name.to_owned()))?;
    reference.delete()?;

    Ok(())
}

/// Resolve a reference to its target object id.
pub fn ref_get(repo: &Repository, name: &str) -> Result<Option<Oid>, Error> {
    match repo.backend.find_reference(name) {
        Ok(reference) => {
            let target = reference.resolve()?.target();
            Ok(target.map(Oid::from))
        }
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Delete a tag reference.
pub fn tag_delete(repo: &Repository, name: &str) -> Result<(), Error> {
    repo.backend.tag_delete(name)?;

    Ok(())
}

/// Reset the repository head hard to the given commit.
pub fn hard_reset(repo: &Repository, target: Oid) -> Result<(), Error> {
    run(&repo.path, ["reset", "--hard", &target.to_string()])?;

    Ok(())
}

/// Delete a loose object from the object database.
pub fn object_delete(repo: &Repository, oid: Oid) -> Result<(), Error> {
    let hex = oid.to_string();
    let path = repo.path.join("objects").join(&hex[..2]).join(&hex[2..]);

    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Write an already-encoded loose object under
/// `objects/<hash[:2]>/<hash[2:]>`. The bytes are stored as received;
/// peers exchange objects in git's own loose format.
pub fn object_write_raw(repo: &Repository, oid: Oid, bytes: &[u8]) -> Result<(), Error> {
    let hex = oid.to_string();
    let dir = repo.path.join("objects").join(&hex[..2]);

    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(&hex[2..]), bytes)?;

    Ok(())
}

/// Size in bytes of an object's content.
pub fn object_size(repo: &Repository, oid: Oid) -> Result<u64, Error> {
    let odb = repo.backend.odb()?;
    let (size, _) = odb.read_header(*oid)?;

    Ok(size as u64)
}

/// List every object reachable from the given tree-ish.
pub fn list_tree_objects(repo: &Repository, treeish: Oid) -> Result<Vec<Oid>, Error> {
    let object = repo.backend.find_object(*treeish, None)?;
    let tree = object.peel(git2::ObjectType::Tree)?;
    let mut objects = vec![Oid::from(tree.id())];

    let tree = tree.into_tree().map_err(|_| {
        git2::Error::from_str("object does not peel to a tree")
    })?;
    tree.walk(git2::TreeWalkMode::PreOrder, |_, entry| {
        objects.push(Oid::from(entry.id()));
        git2::TreeWalkResult::Ok
    })?;

    Ok(objects)
}

/// List the objects introduced between `old` (exclusive) and `new`
/// (inclusive): commits, their trees and blobs.
pub fn list_objects(repo: &Repository, old: Option<Oid>, new: Oid) -> Result<Vec<Oid>, Error> {
    let mut args = vec!["rev-list".to_owned(), "--objects".to_owned(), new.to_string()];
    if let Some(old) = old.filter(|o| !o.is_zero()) {
        args.push(format!("^{old}"));
    }
    let out = run(&repo.path, args)?;
    let mut objects = Vec::new();

    for line in out.lines() {
        let hash = line.split_whitespace().next().unwrap_or_default();
        if let Ok(oid) = Oid::from_str(hash) {
            objects.push(oid);
        }
    }
    Ok(objects)
}

/// Whether the range `old..new` contains any merge commits.
pub fn has_merge_commits(repo: &Repository, old: Option<Oid>, new: Oid) -> Result<bool, Error> {
    let range = match old.filter(|o| !o.is_zero()) {
        Some(old) => format!("{old}..{new}"),
        None => new.to_string(),
    };
    let out = run(&repo.path, ["rev-list", "--merges", "--count", &range])?;

    Ok(out.trim().parse::<u64>().unwrap_or(0) > 0)
}

/// Whether `descendant` descends from `ancestor`.
pub fn is_descendant(repo: &Repository, ancestor: Oid, descendant: Oid) -> Result<bool, Error> {
    if ancestor == descendant {
        return Ok(true);
    }
    Ok(repo.backend.graph_descendant_of(*descendant, *ancestor)?)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::test::fixtures;

    #[test]
    fn test_oid_zero() {
        let zero = Oid::zero();

        assert!(zero.is_zero());
        assert_eq!(
            zero.to_string(),
            "0000000000000000000000000000000000000000"
        );
        assert_eq!(Oid::from_str(&zero.to_string()).unwrap(), zero);
    }

    #[test]
    fn test_ref_lifecycle() {
        let (_tmp, repo, head) = fixtures::repository();

        assert_eq!(
            ref_get(&repo, "refs/heads/master").unwrap(),
            Some(head)
        );
        assert_eq!(ref_get(&repo, "refs/heads/nope").unwrap(), None);

        ref_update(&repo, "refs/heads/topic", head).unwrap();
        assert_eq!(ref_get(&repo, "refs/heads/topic").unwrap(), Some(head));

        ref_delete(&repo, "refs/heads/topic").unwrap();
        assert_eq!(ref_get(&repo, "refs/heads/topic").unwrap(), None);
    }

    #[test]
    fn test_list_objects() {
        let (_tmp, repo, head) = fixtures::repository();
        let objects = list_objects(&repo, None, head).unwrap();

        // At least the commit and its tree.
        assert!(objects.contains(&head));
        assert!(objects.len() >= 2);
    }

    #[test]
    fn test_is_descendant() {
        let (_tmp, repo, head) = fixtures::repository();
        let child = fixtures::commit(&repo, "refs/heads/master", "child", &[head]);

        assert!(is_descendant(&repo, head, child).unwrap());
        assert!(!is_descendant(&repo, child, head).unwrap());
        assert!(is_descendant(&repo, head, head).unwrap());
    }
}
