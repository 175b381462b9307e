//! Identifier validation for mount targets and repositories.
//!
//! Both identifiers end up inside filesystem paths, so they are validated once
//! at the boundary and carried around as newtypes afterwards. Nothing that
//! reaches [`crate::storage::StorageConfig`] can contain a separator or a
//! traversal sequence.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{MountError, Result};

const MAX_FOLDER_LEN: usize = 64;
const MAX_SEGMENT_LEN: usize = 96;

static FOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());
static SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

/// Name of a mount target. Letters, digits, `-` and `_` only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FolderName(String);

impl FolderName {
    pub fn parse(value: &str) -> Result<Self> {
        let reject = |reason: &str| MountError::Validation {
            kind: "folder",
            value: value.to_string(),
            reason: reason.to_string(),
        };

        if value.is_empty() {
            return Err(reject("must not be empty"));
        }
        if value.len() > MAX_FOLDER_LEN {
            return Err(reject("too long"));
        }
        if value.contains('/') || value.contains('\\') {
            return Err(reject("must not contain a path separator"));
        }
        if value.contains("..") {
            return Err(reject("must not contain a traversal sequence"));
        }
        if !FOLDER_RE.is_match(value) {
            return Err(reject("only letters, digits, '-' and '_' are allowed"));
        }

        Ok(FolderName(value.to_string()))
    }

    /// Derives the default folder for a repository: the repo name, lowercased,
    /// with `-` and `.` folded to `_`.
    pub fn default_for(repo: &RepositoryId) -> Result<Self> {
        let derived: String = repo
            .name()
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();
        FolderName::parse(&derived)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FolderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote repository identifier in `owner/name` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryId {
    owner: String,
    name: String,
}

impl RepositoryId {
    pub fn parse(value: &str) -> Result<Self> {
        let reject = |reason: &str| MountError::Validation {
            kind: "repository",
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = value.split('/');
        let (Some(owner), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(reject("expected owner/name"));
        };

        for segment in [owner, name] {
            if segment.is_empty() || segment.len() > MAX_SEGMENT_LEN {
                return Err(reject("owner and name must be 1-96 characters"));
            }
            if segment.contains("..") {
                return Err(reject("must not contain a traversal sequence"));
            }
            if !SEGMENT_RE.is_match(segment) {
                return Err(reject(
                    "owner and name must start with a letter or digit and use only letters, digits, '.', '-' and '_'",
                ));
            }
        }

        Ok(RepositoryId {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}
