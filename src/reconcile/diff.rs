//! Catalog vs. physical content comparison
//!
//! Pure functions: the backends gather the expected paths and walk their
//! storage, [`diff`] decides what is missing and what is stray.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::domain::{BackendId, FileId, Issue, RegisteredFile, ShardingScheme};

/// Where a registered file should be, relative to the backend root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedPath {
    pub file_id: FileId,
    pub path: PathBuf,
    /// Collections own everything below their path
    pub is_collection: bool,
}

impl ExpectedPath {
    pub fn for_file(scheme: ShardingScheme, file: &RegisteredFile) -> Self {
        Self {
            file_id: file.id,
            path: scheme.relative_path(file),
            is_collection: file.kind.is_collection(),
        }
    }
}

/// One path found under the backend root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

impl PhysicalEntry {
    pub fn new(path: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self {
            path: path.into(),
            is_dir,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Drift {
    pub missing: Vec<FileId>,
    /// Topmost stray paths; deleting one removes everything below it
    pub orphans: Vec<PathBuf>,
}

impl Drift {
    /// Turns the drift into issues with absolute paths below `root`
    pub fn into_issues(self, backend_id: BackendId, root: &Path) -> Vec<Issue> {
        let missing = self.missing.into_iter().map(|id| {
            Issue::missing(
                backend_id,
                id,
                format!("file {} is registered but absent", id),
            )
        });

        let orphans = self.orphans.into_iter().map(|relative| {
            let path = root.join(&relative);
            let message = format!("{} is not registered", relative.display());
            Issue::orphan_path(backend_id, path, message)
        });

        missing.chain(orphans).collect()
    }
}

/// Computes the symmetric difference between `expected` and `physical`.
///
/// A directory counts as stray only if no expected path runs through it,
/// so interior shard directories are never reported. Pruning floors of
/// `scheme` are kept even when empty. Entries inside a registered
/// collection belong to it.
pub fn diff(scheme: ShardingScheme, expected: &[ExpectedPath], physical: &[PhysicalEntry]) -> Drift {
    let expected_paths: HashSet<&Path> = expected.iter().map(|e| e.path.as_path()).collect();

    let interior: HashSet<&Path> = expected
        .iter()
        .flat_map(|e| e.path.ancestors().skip(1))
        .filter(|p| !p.as_os_str().is_empty())
        .collect();

    let collections: Vec<&Path> = expected
        .iter()
        .filter(|e| e.is_collection)
        .map(|e| e.path.as_path())
        .collect();

    let mut present = HashSet::new();
    let mut stray: Vec<&Path> = Vec::new();

    for entry in physical {
        let path = entry.path.as_path();

        if expected_paths.contains(path) {
            present.insert(path);
            continue;
        }

        if collections.iter().any(|c| path.starts_with(c)) {
            continue;
        }

        if entry.is_dir && (interior.contains(path) || scheme.is_floor_dir(path)) {
            continue;
        }

        stray.push(path);
    }

    // Keep only the topmost stray paths
    stray.sort();
    let mut orphans: Vec<PathBuf> = Vec::new();
    for path in stray {
        if orphans.last().is_some_and(|top| path.starts_with(top)) {
            continue;
        }
        orphans.push(path.to_path_buf());
    }

    let mut missing: Vec<FileId> = expected
        .iter()
        .filter(|e| !present.contains(e.path.as_path()))
        .map(|e| e.file_id)
        .collect();
    missing.sort();
    missing.dedup();

    Drift { missing, orphans }
}

/// Walks `root` and returns every entry below it, relative to `root`
pub fn walk_local(root: &Path) -> io::Result<Vec<PhysicalEntry>> {
    if !fs::metadata(root)?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", root.display()),
        ));
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            // Removed while walking
            Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => continue,
            Err(e) => return Err(io::Error::from(e)),
        };

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        entries.push(PhysicalEntry::new(relative, entry.file_type().is_dir()));
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected(id: u64, path: &str) -> ExpectedPath {
        ExpectedPath {
            file_id: FileId::new(id),
            path: PathBuf::from(path),
            is_collection: false,
        }
    }

    fn dir(path: &str) -> PhysicalEntry {
        PhysicalEntry::new(path, true)
    }

    fn file(path: &str) -> PhysicalEntry {
        PhysicalEntry::new(path, false)
    }

    #[test]
    fn interior_shard_dirs_are_not_orphans() {
        let expected = [expected(1, "bob/12/34/alpha")];
        let physical = [
            dir("bob"),
            dir("bob/12"),
            dir("bob/12/34"),
            file("bob/12/34/alpha"),
        ];

        assert_eq!(diff(ShardingScheme::NameSharded, &expected, &physical), Drift::default());
    }

    #[test]
    fn stray_subtrees_collapse_to_their_top() {
        let expected = [expected(1, "bob/12/34/alpha")];
        let physical = [
            dir("bob"),
            dir("bob/12"),
            dir("bob/12/34"),
            file("bob/12/34/alpha"),
            file("bob/12/34/stray"),
            dir("bob/99"),
            dir("bob/99/01"),
            file("bob/99/01/old"),
            dir("eve"),
            dir("eve/00"),
        ];

        let drift = diff(ShardingScheme::NameSharded, &expected, &physical);
        assert!(drift.missing.is_empty());
        assert_eq!(
            drift.orphans,
            vec![
                PathBuf::from("bob/12/34/stray"),
                PathBuf::from("bob/99"),
                PathBuf::from("eve/00"),
            ]
        );
    }

    #[test]
    fn empty_owner_directories_are_kept() {
        // Erasing an owner's last file leaves its directory behind
        let physical = [dir("bob"), dir("eve")];
        assert_eq!(diff(ShardingScheme::NameSharded, &[], &physical), Drift::default());

        // Other layouts have no per-owner floor
        let drift = diff(ShardingScheme::Flat, &[], &physical);
        assert_eq!(drift.orphans, vec![PathBuf::from("bob"), PathBuf::from("eve")]);

        // A stray file at owner depth is still stray
        let drift = diff(ShardingScheme::NameSharded, &[], &[file("junk")]);
        assert_eq!(drift.orphans, vec![PathBuf::from("junk")]);
    }

    #[test]
    fn missing_files_are_reported() {
        let expected = [expected(1, "a"), expected(2, "b")];
        let drift = diff(ShardingScheme::Flat, &expected, &[file("a")]);
        assert_eq!(drift.missing, vec![FileId::new(2)]);
        assert!(drift.orphans.is_empty());
    }

    #[test]
    fn collection_contents_belong_to_the_collection() {
        let mut series = expected(1, "scans/series");
        series.is_collection = true;

        let physical = [
            dir("scans"),
            dir("scans/series"),
            file("scans/series/one.dcm"),
            dir("scans/series/nested"),
            file("scans/series/nested/two.dcm"),
        ];

        assert_eq!(diff(ShardingScheme::Flat, &[series], &physical), Drift::default());
    }

    #[test]
    fn file_where_a_directory_is_expected_is_stray() {
        let expected = [expected(1, "bob/12/34/alpha")];
        let physical = [file("bob")];

        let drift = diff(ShardingScheme::NameSharded, &expected, &physical);
        assert_eq!(drift.orphans, vec![PathBuf::from("bob")]);
        assert_eq!(drift.missing, vec![FileId::new(1)]);
    }

    #[test]
    fn walk_local_lists_relative_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/c"), b"x").unwrap();

        let mut entries = walk_local(dir.path()).unwrap();
        entries.sort_by(|x, y| x.path.cmp(&y.path));

        assert_eq!(
            entries,
            vec![
                PhysicalEntry::new("a", true),
                PhysicalEntry::new("a/b", true),
                PhysicalEntry::new("a/b/c", false),
            ]
        );
    }

    #[test]
    fn drift_into_issues_uses_absolute_paths() {
        let drift = Drift {
            missing: vec![FileId::new(4)],
            orphans: vec![PathBuf::from("x/y")],
        };
        let issues = drift.into_issues(BackendId::new(2), Path::new("/data"));

        assert_eq!(issues.len(), 2);
        assert_eq!(
            issues[1].target,
            crate::domain::IssueTarget::Path(PathBuf::from("/data/x/y"))
        );
    }
}
