//! Repository state snapshots.
//!
//! A snapshot is an immutable value: the set of references with their
//! tip hashes at a point in time. Diffing two snapshots is pure, which
//! keeps revert decisions deterministic and testable.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::git::Oid;
use crate::storage::Repository;

#[derive(Error, Debug)]
pub enum Error {
    #[error("git: {0}")]
    Git(#[from] git2::Error),
}

/// Restricts which references a capture sees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Filter {
    /// All references.
    #[default]
    All,
    /// A single reference, by exact name.
    Match(String),
    /// All references under a prefix.
    Prefix(String),
}

impl Filter {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Match(exact) => name == exact,
            Self::Prefix(prefix) => name.starts_with(prefix.as_str()),
        }
    }
}

/// The reference set of a repository at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    refs: BTreeMap<String, Oid>,
}

impl Snapshot {
    /// Capture the current state of a repository.
    pub fn capture(repo: &Repository, filter: &Filter) -> Result<Self, Error> {
        let mut refs = BTreeMap::new();

        for reference in repo.backend.references()? {
            let reference = reference?;
            let Some(name) = reference.name() else {
                continue;
            };
            if !name.starts_with("refs/") || !filter.matches(name) {
                continue;
            }
            if let Some(oid) = reference.resolve()?.target() {
                refs.insert(name.to_owned(), oid.into());
            }
        }
        Ok(Self { refs })
    }

    /// A view of this snapshot restricted to the given filter.
    pub fn filtered(&self, filter: &Filter) -> Snapshot {
        self.refs
            .iter()
            .filter(|(name, _)| filter.matches(name))
            .map(|(name, oid)| (name.clone(), *oid))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Oid> {
        self.refs.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.refs.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Oid)> {
        self.refs.iter().map(|(name, oid)| (name.as_str(), *oid))
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Difference between this snapshot and a newer one.
    pub fn diff(&self, new: &Snapshot) -> Changes {
        let mut changes = Vec::new();

        for (name, &new_oid) in &new.refs {
            match self.refs.get(name) {
                None => changes.push(Change::Added {
                    name: name.clone(),
                    new: new_oid,
                }),
                Some(&old_oid) if old_oid != new_oid => changes.push(Change::Updated {
                    name: name.clone(),
                    old: old_oid,
                    new: new_oid,
                }),
                Some(_) => {}
            }
        }
        for (name, &old_oid) in &self.refs {
            if !new.refs.contains_key(name) {
                changes.push(Change::Removed {
                    name: name.clone(),
                    old: old_oid,
                });
            }
        }
        changes.sort_by(|a, b| a.name().cmp(b.name()));

        Changes(changes)
    }
}

impl FromIterator<(String, Oid)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (String, Oid)>>(iter: T) -> Self {
        Self {
            refs: iter.into_iter().collect(),
        }
    }
}

/// One reference's difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Present in the new state only.
    Added { name: String, new: Oid },
    /// Present in both, with different tips.
    Updated { name: String, old: Oid, new: Oid },
    /// Present in the old state only.
    Removed { name: String, old: Oid },
}

impl Change {
    pub fn name(&self) -> &str {
        match self {
            Self::Added { name, .. } | Self::Updated { name, .. } | Self::Removed { name, .. } => {
                name
            }
        }
    }

    /// The tip introduced by this change, if any.
    pub fn new(&self) -> Option<Oid> {
        match self {
            Self::Added { new, .. } | Self::Updated { new, .. } => Some(*new),
            Self::Removed { .. } => None,
        }
    }

    /// The tip being replaced by this change, if any.
    pub fn old(&self) -> Option<Oid> {
        match self {
            Self::Updated { old, .. } | Self::Removed { old, .. } => Some(*old),
            Self::Added { .. } => None,
        }
    }
}

/// An ordered set of reference changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes(pub Vec<Change>);

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(Change::name)
    }
}

impl IntoIterator for Changes {
    type Item = Change;
    type IntoIter = std::vec::IntoIter<Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::test::{arbitrary, fixtures};

    #[test]
    fn test_filter() {
        assert!(Filter::All.matches("refs/heads/master"));
        assert!(Filter::Match("refs/heads/x".into()).matches("refs/heads/x"));
        assert!(!Filter::Match("refs/heads/x".into()).matches("refs/heads/xy"));
        assert!(Filter::Prefix("refs/tags/".into()).matches("refs/tags/v1"));
        assert!(!Filter::Prefix("refs/tags/".into()).matches("refs/heads/v1"));
    }

    #[test]
    fn test_capture() {
        let (_tmp, repo, head) = fixtures::repository();
        let state = Snapshot::capture(&repo, &Filter::All).unwrap();

        assert_eq!(state.get("refs/heads/master"), Some(head));
        assert_eq!(state.len(), 1);

        let none = Snapshot::capture(
            &repo,
            &Filter::Match("refs/heads/other".into()),
        )
        .unwrap();

        assert!(none.is_empty());
    }

    #[test]
    fn test_diff_partitions() {
        let (a, b, c, d) = (
            arbitrary::oid(1),
            arbitrary::oid(2),
            arbitrary::oid(3),
            arbitrary::oid(4),
        );
        let old = Snapshot::from_iter([
            ("refs/heads/kept".to_owned(), a),
            ("refs/heads/updated".to_owned(), b),
            ("refs/heads/removed".to_owned(), c),
        ]);
        let new = Snapshot::from_iter([
            ("refs/heads/kept".to_owned(), a),
            ("refs/heads/updated".to_owned(), d),
            ("refs/heads/added".to_owned(), c),
        ]);
        let changes = old.diff(&new);

        assert_eq!(
            changes.0,
            vec![
                Change::Added {
                    name: "refs/heads/added".to_owned(),
                    new: c
                },
                Change::Removed {
                    name: "refs/heads/removed".to_owned(),
                    old: c
                },
                Change::Updated {
                    name: "refs/heads/updated".to_owned(),
                    old: b,
                    new: d
                },
            ]
        );
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let state = Snapshot::from_iter([(String::from_str("refs/heads/m").unwrap(), arbitrary::oid(5))]);

        assert!(state.diff(&state.clone()).is_empty());
    }
}
