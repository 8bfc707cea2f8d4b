//! Per-reference state trees.
//!
//! Every reference of a repository has its own Merkle tree, persisted
//! in a dedicated database file next to the git object database. Each
//! accepted push appends one leaf encoding `old || new || objects`; the
//! root therefore commits to the reference's whole accepted history.
//!
//! The backing file is opened for the duration of one operation and
//! closed again, so trees can be deleted at any time without fighting
//! over file handles.

use std::path::{Path, PathBuf};

use sqlite as sql;
use thiserror::Error;

use crate::crypto::hash::Digest;
use crate::git::Oid;

#[derive(Error, Debug)]
pub enum Error {
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a tree update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Update {
    pub root: Digest,
    pub version: u64,
}

/// Database file for the given reference. Slashes are replaced with
/// dashes so the file sits flat inside the repository directory.
pub fn path(repo: &Path, refname: &str) -> PathBuf {
    repo.join(format!("tree-{}.db", refname.replace('/', "-")))
}

/// Encode a leaf value: `old || new || objects`, objects sorted so the
/// encoding doesn't depend on enumeration order.
pub fn leaf(old: Oid, new: Oid, objects: &[Oid]) -> Vec<u8> {
    let mut objects = objects.to_vec();
    objects.sort();
    objects.dedup();

    let mut value = Vec::with_capacity(20 * (2 + objects.len()));
    value.extend_from_slice(old.as_bytes());
    value.extend_from_slice(new.as_bytes());
    for oid in &objects {
        value.extend_from_slice(oid.as_bytes());
    }
    value
}

/// Append a leaf to the reference's tree and return the new root.
pub fn update(repo: &Path, refname: &str, value: &[u8]) -> Result<Update, Error> {
    let db = open(&path(repo, refname))?;

    let mut stmt = db.prepare("INSERT INTO leaves (value) VALUES (?1)")?;
    stmt.bind((1, value))?;
    stmt.next()?;
    drop(stmt);

    let (root, version) = compute_root(&db)?;
    // The connection is dropped here, releasing the file handle.

    Ok(Update { root, version })
}

/// Current root and version of the reference's tree, if it exists.
pub fn root(repo: &Path, refname: &str) -> Result<Option<Update>, Error> {
    let file = path(repo, refname);
    if !file.exists() {
        return Ok(None);
    }
    let db = open(&file)?;
    let (root, version) = compute_root(&db)?;
    if version == 0 {
        return Ok(None);
    }
    Ok(Some(Update { root, version }))
}

/// Drop the reference's tree entirely.
pub fn delete(repo: &Path, refname: &str) -> Result<(), Error> {
    match std::fs::remove_file(path(repo, refname)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn open(file: &Path) -> Result<sql::Connection, Error> {
    let db = sql::Connection::open(file)?;
    // Leaf writes must hit the disk before the update is reported.
    db.execute("PRAGMA synchronous = FULL")?;
    db.execute(
        "CREATE TABLE IF NOT EXISTS leaves (
           version INTEGER PRIMARY KEY AUTOINCREMENT,
           value BLOB NOT NULL
         )",
    )?;

    Ok(db)
}

fn compute_root(db: &sql::Connection) -> Result<(Digest, u64), Error> {
    let mut leaves = Vec::new();

    let stmt = db.prepare("SELECT value FROM leaves ORDER BY version")?;
    for row in stmt.into_iter() {
        let row = row?;
        let value = row.read::<&[u8], _>("value");
        leaves.push(Digest::new(value));
    }
    let version = leaves.len() as u64;

    Ok((fold(leaves), version))
}

/// Fold leaf digests pairwise into a root. An odd node is promoted to
/// the next level unchanged.
fn fold(mut level: Vec<Digest>) -> Digest {
    if level.is_empty() {
        return Digest::default();
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => {
                    let mut buf = [0u8; 64];
                    buf[..32].copy_from_slice(left.as_bytes());
                    buf[32..].copy_from_slice(right.as_bytes());
                    Digest::new(buf)
                }
                [single] => *single,
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }
    level[0]
}
