//! Pack stream inspection.
//!
//! The inspector sits in a tee between the HTTP request body and the
//! `receive-pack` subprocess. It keeps a bounded copy of the leading
//! packet-line region, enough to hold the reference commands, and
//! drops everything after the cap, so a large packfile never gets
//! buffered. Once the stream is closed, the captured region is parsed
//! into reference update commands.
//!
//! The packfile itself is never parsed here: the objects a push
//! introduces are enumerated through the git driver after the
//! subprocess has written them to disk.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::str;

use thiserror::Error;

use crate::git::{self, Oid};
use crate::pktline;
use crate::state::Change;
use crate::storage::Repository;

/// Default capture cap: the packet-line command region of a push fits
/// comfortably within a mebibyte.
pub const DEFAULT_CAP: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("push contains no reference commands")]
    NoCommands,
    #[error("malformed reference command '{0}'")]
    MalformedCommand(String),
    #[error("git: {0}")]
    Git(#[from] git::Error),
}

/// One `<old> <new> <name>` command from the push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefCommand {
    pub name: String,
    pub old: Oid,
    pub new: Oid,
}

impl RefCommand {
    /// Whether the command deletes the reference.
    pub fn is_delete(&self) -> bool {
        self.new.is_zero()
    }

    /// The change this command describes, for diff-shaped consumers.
    pub fn as_change(&self) -> Change {
        if self.old.is_zero() {
            Change::Added {
                name: self.name.clone(),
                new: self.new,
            }
        } else if self.new.is_zero() {
            Change::Removed {
                name: self.name.clone(),
                old: self.old,
            }
        } else {
            Change::Updated {
                name: self.name.clone(),
                old: self.old,
                new: self.new,
            }
        }
    }
}

/// Write-shaped tap capturing the head of the request stream.
pub struct PackInspector {
    buf: Vec<u8>,
    cap: usize,
    total: u64,
}

impl Default for PackInspector {
    fn default() -> Self {
        Self::new(DEFAULT_CAP)
    }
}

impl PackInspector {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            total: 0,
        }
    }

    /// Total bytes seen, including those past the cap.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Parse the captured region into reference commands. Call after
    /// the write side is done.
    pub fn commands(&self) -> Result<Vec<RefCommand>, Error> {
        let mut cursor = io::Cursor::new(&self.buf);
        let mut commands = Vec::new();

        for pkt in pktline::read_to_flush(&mut cursor)? {
            let pktline::Packet::Data(payload) = pkt else {
                continue;
            };
            // Stop at the packfile signature in case the flush packet
            // fell past the cap.
            if payload.starts_with(b"PACK") {
                break;
            }
            commands.push(parse_command(&payload)?);
        }
        if commands.is_empty() {
            return Err(Error::NoCommands);
        }
        Ok(commands)
    }
}

impl io::Write for PackInspector {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.total += buf.len() as u64;

        let room = self.cap.saturating_sub(self.buf.len());
        if room > 0 {
            self.buf.extend_from_slice(&buf[..room.min(buf.len())]);
        }
        // Bytes past the cap are dropped, not an error: the tee must
        // keep feeding the subprocess.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A reader tap: bytes read from the inner reader are copied into the
/// inspector on the way through.
pub struct Tee<'a, R> {
    inner: R,
    tap: &'a mut PackInspector,
}

impl<'a, R: io::Read> Tee<'a, R> {
    pub fn new(inner: R, tap: &'a mut PackInspector) -> Self {
        Self { inner, tap }
    }
}

impl<'a, R: io::Read> io::Read for Tee<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            use io::Write as _;
            self.tap.write_all(&buf[..n])?;
        }
        Ok(n)
    }
}

/// `<old-hex> <new-hex> <refname>[\0capabilities]`
fn parse_command(payload: &[u8]) -> Result<RefCommand, Error> {
    let line = str::from_utf8(payload)
        .map_err(|_| Error::MalformedCommand(String::from_utf8_lossy(payload).into_owned()))?;
    let line = line.split('\0').next().unwrap_or_default().trim_end();
    let malformed = || Error::MalformedCommand(line.to_owned());

    let mut parts = line.splitn(3, ' ');
    let old = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(malformed)?;
    let new = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(malformed)?;
    let name = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;

    Ok(RefCommand {
        name: name.to_owned(),
        old,
        new,
    })
}

/// Ownership of pushed objects by the references that introduced them.
///
/// This is a multiset, not a set: an object shared by two refs of the
/// same push is only deletable once *both* refs have given it up.
/// Revert paths decrement ownership instead of clearing it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectRefs {
    map: HashMap<Oid, BTreeSet<String>>,
}

impl ObjectRefs {
    /// Enumerate the objects each command introduced, through the git
    /// driver. Only valid once the pack has been written to disk.
    pub fn collect(repo: &Repository, commands: &[RefCommand]) -> Result<Self, Error> {
        let mut map: HashMap<Oid, BTreeSet<String>> = HashMap::new();

        for cmd in commands {
            if cmd.is_delete() {
                continue;
            }
            let old = (!cmd.old.is_zero()).then_some(cmd.old);
            for oid in git::list_objects(repo, old, cmd.new)? {
                map.entry(oid).or_default().insert(cmd.name.clone());
            }
        }
        Ok(Self { map })
    }

    /// Objects owned by the given reference.
    pub fn owned_by(&self, name: &str) -> Vec<Oid> {
        let mut objects = self
            .map
            .iter()
            .filter(|(_, refs)| refs.contains(name))
            .map(|(oid, _)| *oid)
            .collect::<Vec<_>>();
        objects.sort();
        objects
    }

    /// Give up the reference's claim on an object. Returns `true` when
    /// no other reference claims it and it is safe to delete.
    pub fn disown(&mut self, oid: Oid, name: &str) -> bool {
        let Some(refs) = self.map.get_mut(&oid) else {
            return false;
        };
        refs.remove(name);
        if refs.is_empty() {
            self.map.remove(&oid);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, oid: &Oid) -> bool {
        self.map.contains_key(oid)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn objects(&self) -> impl Iterator<Item = &Oid> {
        self.map.keys()
    }
}
