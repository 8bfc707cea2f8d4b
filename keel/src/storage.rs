//! On-disk repository storage.
//!
//! The storage root contains one bare git directory per repository,
//! keyed by repository name. Reference trees and the per-repository
//! database live inside the repository directory, next to the git
//! object database.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{fmt, fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::hash::Digest;
use crate::git;

#[derive(Error, Debug)]
pub enum Error {
    #[error("repository '{0}' was not found")]
    NotFound(RepoName),
    #[error("git: {0}")]
    Git(#[from] git2::Error),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error means the repository doesn't exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[derive(Error, Debug)]
pub enum NameError {
    #[error("repository name is empty")]
    Empty,
    #[error("invalid character '{0}' in repository name")]
    InvalidCharacter(char),
}

/// A valid repository name. Lowercase alphanumerics, `-` and `_` only.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RepoName(String);

impl RepoName {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RepoName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(NameError::Empty);
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
        {
            return Err(NameError::InvalidCharacter(c));
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for RepoName {
    type Error = NameError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

impl From<RepoName> for String {
    fn from(name: RepoName) -> Self {
        name.0
    }
}

impl AsRef<Path> for RepoName {
    fn as_ref(&self) -> &Path {
        Path::new(self.0.as_str())
    }
}

/// A repository namespace. Raw namespace strings are hashed at the
/// boundary; only the digest is ever stored or compared.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace(Digest);

impl Namespace {
    pub fn hash(raw: &str) -> Self {
        Self(Digest::new(raw.as_bytes()))
    }

    pub fn from_digest(digest: Digest) -> Self {
        Self(digest)
    }

    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl From<Digest> for Namespace {
    fn from(digest: Digest) -> Self {
        Self(digest)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Repository storage under a root directory.
#[derive(Debug, Clone)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    /// Open storage at the given root, creating the directory if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Path of the given repository's git directory.
    pub fn path_of(&self, name: &RepoName) -> PathBuf {
        self.path.join(name)
    }

    pub fn contains(&self, name: &RepoName) -> bool {
        self.path_of(name).is_dir()
    }

    /// Open an existing repository.
    pub fn repository(&self, name: &RepoName) -> Result<Repository, Error> {
        if !self.contains(name) {
            return Err(Error::NotFound(name.clone()));
        }
        Repository::open(self.path_of(name), name.clone())
    }

    /// Initialize a new bare repository.
    pub fn create(&self, name: &RepoName) -> Result<Repository, Error> {
        let path = self.path_of(name);
        let backend = git2::Repository::init_opts(
            &path,
            git2::RepositoryInitOptions::new().bare(true).no_reinit(true),
        )?;

        Ok(Repository {
            name: name.clone(),
            path,
            backend,
        })
    }

    /// Enumerate all repositories under the root.
    pub fn repositories(&self) -> Result<Vec<RepoName>, Error> {
        let mut names = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(name) = entry.file_name().to_string_lossy().parse() {
                names.push(name);
            }
        }
        names.sort();

        Ok(names)
    }
}

/// An open repository.
pub struct Repository {
    pub name: RepoName,
    pub path: PathBuf,
    pub backend: git2::Repository,
}

impl Repository {
    pub fn open<P: AsRef<Path>>(path: P, name: RepoName) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let backend = git2::Repository::open_bare(&path)?;

        Ok(Self {
            name,
            path,
            backend,
        })
    }

    /// Whether the object database contains the given object.
    pub fn contains(&self, oid: git::Oid) -> Result<bool, git2::Error> {
        Ok(self.backend.odb()?.exists(*oid))
    }

    /// Read a raw object out of the object database.
    pub fn read_object(&self, oid: git::Oid) -> Result<Vec<u8>, git2::Error> {
        let odb = self.backend.odb()?;
        let obj = odb.read(*oid)?;

        Ok(obj.data().to_vec())
    }

    /// Write a raw object into the object database under its stated type.
    pub fn write_object(&self, kind: git2::ObjectType, data: &[u8]) -> Result<git::Oid, git2::Error> {
        let odb = self.backend.odb()?;
        let oid = odb.write(kind, data)?;

        Ok(oid.into())
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_repo_name() {
        assert!(RepoName::from_str("alice").is_ok());
        assert!(RepoName::from_str("a-b_c9").is_ok());
        assert!(RepoName::from_str("").is_err());
        assert!(RepoName::from_str("Alice").is_err());
        assert!(RepoName::from_str("a/b").is_err());
        assert!(RepoName::from_str("a b").is_err());
    }

    #[test]
    fn test_create_and_open() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::open(tmp.path()).unwrap();
        let name = RepoName::from_str("alice").unwrap();

        assert!(!storage.contains(&name));
        assert!(storage.repository(&name).is_err());

        storage.create(&name).unwrap();

        assert!(storage.contains(&name));
        assert!(storage.repository(&name).is_ok());
        assert_eq!(storage.repositories().unwrap(), vec![name]);
    }

    #[test]
    fn test_namespace_is_hashed() {
        let ns = Namespace::hash("acme");

        assert_eq!(ns, Namespace::hash("acme"));
        assert_ne!(ns, Namespace::hash("acme2"));
        assert_eq!(ns.to_string().len(), 64);
    }
}
