//! Deterministic path sharding
//!
//! Layouts map a file to a relative path below a backend (or cache) root:
//!
//! | Layout | Relative path | Pruning floor |
//! |--------|---------------|---------------|
//! | `flat` | `[{sub_path}/]{name}` | root |
//! | `name_sharded` | `{owner}/{h0}/{h1}/{name}` | `{owner}` |
//! | `id_sharded` | `{h0}/{h1}/{id}/{name}` | root |
//!
//! `h0`/`h1` are two-digit decimal segments (`00`-`99`) taken from the
//! BLAKE3 digest of the key, so every shard level holds at most 100
//! entries and the mapping never changes for a given key.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::RegisteredFile;

/// Entries per shard level
pub const FAN_OUT: u16 = 100;

/// Hash-derived shard levels per layout
const SHARD_LEVELS: usize = 2;

/// Maps `key` to `levels` two-digit segments
pub fn shard_key(key: &[u8], levels: usize) -> Vec<String> {
    let digest = blake3::hash(key);
    digest
        .as_bytes()
        .chunks_exact(2)
        .take(levels)
        .map(|pair| {
            let value = u16::from_le_bytes([pair[0], pair[1]]) % FAN_OUT;
            format!("{:02}", value)
        })
        .collect()
}

/// On-disk layout of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardingScheme {
    #[default]
    Flat,
    NameSharded,
    IdSharded,
}

impl ShardingScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardingScheme::Flat => "flat",
            ShardingScheme::NameSharded => "name_sharded",
            ShardingScheme::IdSharded => "id_sharded",
        }
    }

    /// Directory segments between the root and the file name
    pub fn segments(&self, file: &RegisteredFile) -> Vec<String> {
        match self {
            ShardingScheme::Flat => file
                .sub_path()
                .map(|p| {
                    p.components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect()
                })
                .unwrap_or_default(),
            ShardingScheme::NameSharded => {
                let mut segments = Vec::with_capacity(SHARD_LEVELS + 1);
                segments.push(file.owner.clone());
                segments.extend(shard_key(file.name.as_bytes(), SHARD_LEVELS));
                segments
            }
            ShardingScheme::IdSharded => {
                let mut segments = shard_key(&file.id.get().to_le_bytes(), SHARD_LEVELS);
                segments.push(file.id.to_string());
                segments
            }
        }
    }

    /// Directory holding the file, relative to the root
    pub fn relative_dir(&self, file: &RegisteredFile) -> PathBuf {
        self.segments(file).iter().collect()
    }

    /// Full relative path of the file
    pub fn relative_path(&self, file: &RegisteredFile) -> PathBuf {
        self.relative_dir(file).join(&file.name)
    }

    /// What erase removes: the per-id directory for id-sharded layouts,
    /// the file itself otherwise
    pub fn relative_leaf(&self, file: &RegisteredFile) -> PathBuf {
        match self {
            ShardingScheme::IdSharded => self.relative_dir(file),
            _ => self.relative_path(file),
        }
    }

    /// Deepest directory that pruning must never remove, relative to the root
    pub fn relative_floor(&self, file: &RegisteredFile) -> PathBuf {
        match self {
            ShardingScheme::NameSharded => PathBuf::from(&file.owner),
            _ => PathBuf::new(),
        }
    }

    /// True for a directory that erase and rename never prune, so it may
    /// legitimately sit empty: the owner directories of a name-sharded root
    pub fn is_floor_dir(&self, relative: &Path) -> bool {
        match self {
            ShardingScheme::NameSharded => relative.components().count() == 1,
            _ => false,
        }
    }

    /// Whether two owners may register the same name on one backend
    pub fn names_scoped_by_owner(&self) -> bool {
        matches!(self, ShardingScheme::NameSharded)
    }

    /// Whether a rename changes the directory a file lives in
    pub fn rename_moves_shard(&self) -> bool {
        matches!(self, ShardingScheme::NameSharded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackendId, FileId};
    use proptest::prelude::*;
    use std::path::Path;

    fn file(id: u64, name: &str, owner: &str) -> RegisteredFile {
        RegisteredFile::new(FileId::new(id), name, owner, BackendId::new(1))
    }

    #[test]
    fn name_sharded_path_is_owner_namespaced() {
        let f = file(1, "alpha", "bob");
        let segments = ShardingScheme::NameSharded.segments(&f);

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], "bob");
        assert!(segments[1..].iter().all(|s| s.len() == 2));

        let path = ShardingScheme::NameSharded.relative_path(&f);
        assert!(path.starts_with("bob"));
        assert!(path.ends_with("alpha"));
        assert_eq!(ShardingScheme::NameSharded.relative_floor(&f), Path::new("bob"));
    }

    #[test]
    fn name_sharding_ignores_id() {
        let a = file(1, "alpha", "bob");
        let b = file(99, "alpha", "bob");
        assert_eq!(
            ShardingScheme::NameSharded.relative_path(&a),
            ShardingScheme::NameSharded.relative_path(&b)
        );
    }

    #[test]
    fn id_sharded_leaf_is_per_file_directory() {
        let f = file(1234, "alpha", "bob");
        let dir = ShardingScheme::IdSharded.relative_dir(&f);

        assert!(dir.ends_with("1234"));
        assert_eq!(ShardingScheme::IdSharded.relative_leaf(&f), dir);
        assert_eq!(ShardingScheme::IdSharded.relative_path(&f), dir.join("alpha"));
        assert!(!dir.starts_with("bob"));
    }

    #[test]
    fn flat_layout_honors_sub_path() {
        let f = file(1, "alpha", "bob").with_sub_path("proj/2024");
        assert_eq!(
            ShardingScheme::Flat.relative_path(&f),
            Path::new("proj/2024/alpha")
        );

        let plain = file(1, "alpha", "bob");
        assert_eq!(ShardingScheme::Flat.relative_path(&plain), Path::new("alpha"));
    }

    #[test]
    fn sharded_layouts_spread_keys() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000u32 {
            let name = format!("file-{}", i);
            seen.insert(shard_key(name.as_bytes(), 1)[0].clone());
        }
        // 1000 keys over 100 buckets should touch nearly all of them
        assert!(seen.len() > 90, "only {} buckets used", seen.len());
    }

    proptest! {
        #[test]
        fn shard_is_deterministic(key in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assert_eq!(shard_key(&key, 2), shard_key(&key, 2));
        }

        #[test]
        fn segments_stay_in_range(key in ".{0,40}") {
            for seg in shard_key(key.as_bytes(), 2) {
                let n: u16 = seg.parse().unwrap();
                prop_assert!(n < FAN_OUT);
                prop_assert_eq!(seg.len(), 2);
            }
        }

        #[test]
        fn paths_are_stable_across_recomputation(id in 1u64..u64::MAX, name in "[a-z][a-z0-9_.]{0,20}") {
            let f = file(id, &name, "owner");
            for scheme in [ShardingScheme::Flat, ShardingScheme::NameSharded, ShardingScheme::IdSharded] {
                let copy = f.clone();
                prop_assert_eq!(scheme.relative_path(&f), scheme.relative_path(&copy));
            }
        }
    }
}
