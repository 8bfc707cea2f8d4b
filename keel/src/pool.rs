//! The push pool.
//!
//! Pending push-notes, keyed by fingerprint, waiting for endorsement
//! and finalization. A secondary index by `(repo, ref, nonce)` rejects
//! a second push claiming a nonce that already has one pending, while
//! letting a reference queue follow-up pushes at later nonces.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::note::{NoteId, PushNote};
use crate::storage::RepoName;

/// Default pool capacity.
pub const DEFAULT_CAPACITY: usize = 1000;
/// Default entry TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Error, Debug)]
pub enum Error {
    #[error("push pool is full")]
    Full,
    #[error("push note {0} is already in the pool")]
    Duplicate(NoteId),
    #[error("a push for '{repo}/{name}' at nonce {nonce} is already pending")]
    RefConflict {
        repo: RepoName,
        name: String,
        nonce: u64,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ttl: DEFAULT_TTL,
        }
    }
}

struct Entry {
    note: PushNote,
    added: Instant,
    /// Entries referenced by the endorsement aggregator are exempt
    /// from expiry.
    pinned: bool,
}

#[derive(Default)]
struct Inner {
    notes: HashMap<NoteId, Entry>,
    /// Pending pushes by `(repo, ref, nonce)`. A reference may queue
    /// several pushes at sequential nonces; only a second push at the
    /// same nonce conflicts.
    by_ref: HashMap<(RepoName, String, u64), NoteId>,
}

/// A bounded pool of pending push-notes.
pub struct PushPool {
    config: Config,
    inner: Mutex<Inner>,
}

impl PushPool {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Admit a note to the pool. When the pool is at capacity, the
    /// oldest entry paying a lower fee is evicted to make room;
    /// otherwise the add is rejected.
    pub fn add(&self, note: PushNote) -> Result<NoteId, Error> {
        let id = note.id();
        let mut inner = self.inner.lock().expect("pool lock is not poisoned");

        if inner.notes.contains_key(&id) {
            return Err(Error::Duplicate(id));
        }
        for pushed in &note.references {
            let key = (note.repo.clone(), pushed.name.clone(), pushed.nonce);
            if inner.by_ref.contains_key(&key) {
                return Err(Error::RefConflict {
                    repo: note.repo.clone(),
                    name: pushed.name.clone(),
                    nonce: pushed.nonce,
                });
            }
        }
        if inner.notes.len() >= self.config.capacity {
            let victim = inner
                .notes
                .iter()
                .filter(|(_, e)| !e.pinned && e.note.fee < note.fee)
                .min_by_key(|(_, e)| (e.note.fee, e.added))
                .map(|(id, _)| *id);

            match victim {
                Some(victim) => {
                    self.evict(&mut inner, &victim);
                    log::debug!(target: "pool", "Evicted {victim} for a higher-fee push");
                }
                None => return Err(Error::Full),
            }
        }

        for pushed in &note.references {
            inner
                .by_ref
                .insert((note.repo.clone(), pushed.name.clone(), pushed.nonce), id);
        }
        inner.notes.insert(
            id,
            Entry {
                note,
                added: Instant::now(),
                pinned: false,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: &NoteId) -> Option<PushNote> {
        self.inner
            .lock()
            .expect("pool lock is not poisoned")
            .notes
            .get(id)
            .map(|e| e.note.clone())
    }

    pub fn contains(&self, id: &NoteId) -> bool {
        self.inner
            .lock()
            .expect("pool lock is not poisoned")
            .notes
            .contains_key(id)
    }

    /// Remove a note, eg. once its transaction was finalized.
    pub fn remove(&self, id: &NoteId) -> Option<PushNote> {
        let mut inner = self.inner.lock().expect("pool lock is not poisoned");

        self.evict(&mut inner, id)
    }

    /// Exempt a note from expiry while the aggregator tracks it.
    pub fn pin(&self, id: &NoteId) {
        if let Some(entry) = self
            .inner
            .lock()
            .expect("pool lock is not poisoned")
            .notes
            .get_mut(id)
        {
            entry.pinned = true;
        }
    }

    /// Whether any pending note targets the repository.
    pub fn references_repo(&self, name: &RepoName) -> bool {
        self.inner
            .lock()
            .expect("pool lock is not poisoned")
            .by_ref
            .keys()
            .any(|(repo, _, _)| repo == name)
    }

    /// Drop expired, unpinned entries. Returns the dropped ids.
    pub fn sweep(&self) -> Vec<NoteId> {
        let mut inner = self.inner.lock().expect("pool lock is not poisoned");
        let ttl = self.config.ttl;
        let expired = inner
            .notes
            .iter()
            .filter(|(_, e)| !e.pinned && e.added.elapsed() >= ttl)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in &expired {
            self.evict(&mut inner, id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("pool lock is not poisoned")
            .notes
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, inner: &mut Inner, id: &NoteId) -> Option<PushNote> {
        let entry = inner.notes.remove(id)?;

        for pushed in &entry.note.references {
            inner
                .by_ref
                .remove(&(entry.note.repo.clone(), pushed.name.clone(), pushed.nonce));
        }
        Some(entry.note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::arbitrary;

    fn pool(capacity: usize) -> PushPool {
        PushPool::new(Config {
            capacity,
            ttl: Duration::from_millis(0),
        })
    }

    #[test]
    fn test_add_get_remove() {
        let pool = pool(10);
        let note = arbitrary::push_note(1);
        let id = pool.add(note.clone()).unwrap();

        assert!(pool.contains(&id));
        assert_eq!(pool.get(&id), Some(note.clone()));
        assert!(pool.references_repo(&note.repo));

        assert_eq!(pool.remove(&id), Some(note.clone()));
        assert!(!pool.contains(&id));
        assert!(!pool.references_repo(&note.repo));
    }

    #[test]
    fn test_duplicate_rejected() {
        let pool = pool(10);
        let note = arbitrary::push_note(1);

        pool.add(note.clone()).unwrap();
        assert!(matches!(pool.add(note), Err(Error::Duplicate(_))));
    }

    #[test]
    fn test_ref_conflict_rejected() {
        let pool = pool(10);
        let note = arbitrary::push_note(1);
        // A different note pushing the same refs at the same nonces.
        let mut conflicting = arbitrary::push_note(2);
        conflicting.references = note.references.clone();

        pool.add(note).unwrap();
        assert!(matches!(
            pool.add(conflicting),
            Err(Error::RefConflict { .. })
        ));
    }

    #[test]
    fn test_sequential_nonces_coexist() {
        let pool = pool(10);
        let note = arbitrary::push_note(1);
        // The same refs again, one nonce ahead: a queued follow-up push.
        let mut next = arbitrary::push_note(2);
        next.references = note.references.clone();
        for pushed in &mut next.references {
            pushed.nonce += 1;
        }

        let a = pool.add(note).unwrap();
        let b = pool.add(next.clone()).unwrap();

        assert!(pool.contains(&a));
        assert!(pool.contains(&b));

        // Resubmitting at an occupied nonce is rejected.
        let mut again = arbitrary::push_note(3);
        again.references = next.references.clone();

        assert!(matches!(
            pool.add(again),
            Err(Error::RefConflict { .. })
        ));
    }

    #[test]
    fn test_eviction_prefers_higher_fee() {
        let pool = pool(1);
        let mut cheap = arbitrary::push_note(3);
        cheap.fee = 1;
        let mut rich = arbitrary::push_note(4);
        rich.fee = 9;

        let cheap_id = pool.add(cheap.clone()).unwrap();
        let rich_id = pool.add(rich).unwrap();

        assert!(!pool.contains(&cheap_id));
        assert!(pool.contains(&rich_id));

        // A poorer push doesn't displace a richer one.
        let mut poorer = arbitrary::push_note(9);
        poorer.fee = 0;
        assert!(matches!(pool.add(poorer), Err(Error::Full)));
    }

    #[test]
    fn test_sweep_skips_pinned() {
        let pool = pool(10);
        let a = pool.add(arbitrary::push_note(6)).unwrap();
        let b = pool.add(arbitrary::push_note(7)).unwrap();

        pool.pin(&a);
        let swept = pool.sweep();

        assert_eq!(swept, vec![b]);
        assert!(pool.contains(&a));
    }
}
