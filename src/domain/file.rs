//! Registered files and the identifiers that key them
//!
//! A [`RegisteredFile`] is the catalog's view of one logical file: who owns
//! it, which backend holds the authoritative bytes, and where it sits in
//! that backend's namespace.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum IdError {
    #[error("Invalid file ID: expected a positive integer, got '{0}'")]
    InvalidFileId(String),

    #[error("Invalid backend ID: expected a positive integer, got '{0}'")]
    InvalidBackendId(String),
}

/// Globally unique numeric file identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(u64);

impl FileId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.parse::<u64>() {
            Ok(n) if n > 0 && !s.starts_with('+') => Ok(Self(n)),
            _ => Err(IdError::InvalidFileId(s.to_string())),
        }
    }
}

/// Numeric backend identifier, as configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(u32);

impl BackendId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BackendId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.parse::<u32>() {
            Ok(n) if n > 0 && !s.starts_with('+') => Ok(Self(n)),
            _ => Err(IdError::InvalidBackendId(s.to_string())),
        }
    }
}

/// Whether a file is a single blob or a directory of files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    #[default]
    Single,
    Collection,
}

impl FileKind {
    pub fn is_collection(self) -> bool {
        self == FileKind::Collection
    }
}

/// Catalog record for one logical file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredFile {
    pub id: FileId,

    pub name: String,

    /// Owner identity (login name); namespaces name-sharded layouts
    pub owner: String,

    /// Byte size for single files, entry count for collections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    pub backend_id: BackendId,

    #[serde(default)]
    pub kind: FileKind,

    /// Hierarchical sub-path below the backend root (flat layouts only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<PathBuf>,

    /// Set when reconciliation found the content gone
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub flagged_for_removal: bool,

    pub registered_at: DateTime<Utc>,
}

impl RegisteredFile {
    pub fn new(id: FileId, name: impl Into<String>, owner: impl Into<String>, backend_id: BackendId) -> Self {
        Self {
            id,
            name: name.into(),
            owner: owner.into(),
            size: None,
            backend_id,
            kind: FileKind::Single,
            sub_path: None,
            flagged_for_removal: false,
            registered_at: Utc::now(),
        }
    }

    /// Builder-style setter for the file kind
    pub fn with_kind(mut self, kind: FileKind) -> Self {
        self.kind = kind;
        self
    }

    /// Builder-style setter for the sub-path
    pub fn with_sub_path(mut self, sub_path: impl Into<PathBuf>) -> Self {
        self.sub_path = Some(sub_path.into());
        self
    }

    /// Returns a copy of this record carrying a different name
    pub fn renamed(&self, new_name: &str) -> Self {
        let mut copy = self.clone();
        copy.name = new_name.to_string();
        copy
    }

    pub fn sub_path(&self) -> Option<&Path> {
        self.sub_path.as_deref()
    }
}

/// Returns true if `name` can be used as a file name on every backend
pub fn is_legal_filename(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    first.is_ascii_alphanumeric()
        && name.len() <= 255
        && !name.chars().any(|c| c == '/' || c == '\0' || c.is_control())
}

/// Returns true if every component of `sub_path` is a legal, plain name
pub fn is_legal_sub_path(sub_path: &Path) -> bool {
    use std::path::Component;

    sub_path.components().count() > 0
        && sub_path.components().all(|c| match c {
            Component::Normal(part) => part.to_str().map(is_legal_filename).unwrap_or(false),
            _ => false,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_file_id() {
        assert_eq!("42".parse::<FileId>().unwrap(), FileId::new(42));
        assert_eq!(" 7 ".parse::<FileId>().unwrap(), FileId::new(7));
        assert!("0".parse::<FileId>().is_err());
        assert!("+3".parse::<FileId>().is_err());
        assert!("abc".parse::<FileId>().is_err());
    }

    #[test]
    fn parse_backend_id() {
        assert_eq!("3".parse::<BackendId>().unwrap(), BackendId::new(3));
        assert!("-1".parse::<BackendId>().is_err());
    }

    #[test]
    fn legal_names() {
        assert!(is_legal_filename("alpha"));
        assert!(is_legal_filename("scan_01.nii.gz"));
        assert!(is_legal_filename("9lives"));
        assert!(!is_legal_filename(""));
        assert!(!is_legal_filename("."));
        assert!(!is_legal_filename(".."));
        assert!(!is_legal_filename(".hidden"));
        assert!(!is_legal_filename("a/b"));
        assert!(!is_legal_filename("tab\tname"));
    }

    #[test]
    fn legal_sub_paths() {
        assert!(is_legal_sub_path(Path::new("projects/2024")));
        assert!(!is_legal_sub_path(Path::new("../escape")));
        assert!(!is_legal_sub_path(Path::new("/abs")));
        assert!(!is_legal_sub_path(Path::new("")));
    }

    #[test]
    fn serde_roundtrip_keeps_optional_fields_out() {
        let file = RegisteredFile::new(FileId::new(5), "alpha", "bob", BackendId::new(1));
        let json = serde_json::to_value(&file).unwrap();
        assert!(json.get("size").is_none());
        assert!(json.get("flagged_for_removal").is_none());

        let back: RegisteredFile = serde_json::from_value(json).unwrap();
        assert_eq!(back, file);
    }

    #[test]
    fn renamed_keeps_identity() {
        let file = RegisteredFile::new(FileId::new(5), "alpha", "bob", BackendId::new(1));
        let renamed = file.renamed("beta");
        assert_eq!(renamed.id, file.id);
        assert_eq!(renamed.owner, "bob");
        assert_eq!(renamed.name, "beta");
    }
}
