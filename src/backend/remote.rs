//! Backend on a remote host reached through a [`Transport`]
//!
//! All remote work is shell commands plus rsync. Paths are quoted with
//! [`shell_escape`] before they reach the remote shell.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::identity::{IdentityCache, IdentityLookup};
use super::transport::{shell_escape, Direction, SshTransport, Transport};
use super::{
    check_below, check_sub_path, not_browsable, BackendContext, Capabilities, EntryKind, FileInfo,
    StorageBackend,
};
use crate::domain::{Issue, IssueTarget, RegisteredFile};
use crate::error::{Error, Result};
use crate::reconcile::{diff, ExpectedPath, PhysicalEntry};
use crate::storage::{BackendConfig, LocalCacheManager};

/// Exit status the rename script uses when the target exists
const TARGET_EXISTS: i32 = 17;

pub struct RemoteShellBackend {
    config: BackendConfig,
    root: PathBuf,
    transport: Arc<dyn Transport>,
    cache: LocalCacheManager,
}

impl RemoteShellBackend {
    pub fn new(config: BackendConfig, transport: Arc<dyn Transport>, cache: LocalCacheManager) -> Result<Self> {
        let root = config.require_root()?.to_path_buf();
        config.require_host()?;

        Ok(Self {
            config,
            root,
            transport,
            cache,
        })
    }

    /// Builds the backend on a pooled ssh channel
    pub fn over_ssh(config: BackendConfig, ctx: &BackendContext) -> Result<Self> {
        let channel = ctx.ssh_pool.channel(&config)?;
        let cache = ctx.cache_for(&config);
        Self::new(config, Arc::new(SshTransport::new(channel)), cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn remote_path(&self, file: &RegisteredFile) -> PathBuf {
        self.root.join(self.config.layout.relative_path(file))
    }

    fn remote_leaf(&self, file: &RegisteredFile) -> PathBuf {
        self.root.join(self.config.layout.relative_leaf(file))
    }

    fn remote_floor(&self, file: &RegisteredFile) -> PathBuf {
        self.root.join(self.config.layout.relative_floor(file))
    }

    /// Runs `command` and turns a non-zero exit into an error
    fn run_checked(&self, command: &str) -> Result<String> {
        let output = self.transport.execute(command)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(Error::Io(std::io::Error::other(format!(
                "'{}' on {} exited with {}: {}",
                command,
                self.transport.describe(),
                output.status,
                output.stderr.trim()
            ))))
        }
    }

    fn default_capabilities() -> Capabilities {
        Capabilities {
            browsable: true,
            fast_syncing: false,
            allow_owner_change: false,
            content_shared: false,
        }
    }
}

/// Shell loop removing empty directories from `start` up to, not
/// including, `floor`
fn prune_script(start: &Path, floor: &Path) -> String {
    format!(
        "d={}; while [ \"$d\" != {} ] && [ \"$d\" != / ] && rmdir -- \"$d\"; do d=$(dirname -- \"$d\"); done",
        shell_escape(&start.display().to_string()),
        shell_escape(&floor.display().to_string()),
    )
}

/// One command deleting `leaf` then pruning its empty parents; failures
/// of either step are ignored
pub(crate) fn erase_command(leaf: &Path, floor: &Path) -> String {
    let parent = leaf.parent().unwrap_or(floor);
    format!(
        "( rm -rf -- {} ; {} ) >/dev/null 2>&1; true",
        shell_escape(&leaf.display().to_string()),
        prune_script(parent, floor)
    )
}

/// Check-then-rename; exits with [`TARGET_EXISTS`] instead of overwriting
pub(crate) fn rename_command(from: &Path, to: &Path, floor: &Path) -> String {
    let to_dir = to.parent().unwrap_or(floor);
    let from_dir = from.parent().unwrap_or(floor);
    let target = shell_escape(&to.display().to_string());

    format!(
        "if [ -e {target} ] || [ -L {target} ]; then exit {code}; fi; \
         mkdir -p -- {to_dir} && mv -- {from} {target} || exit 1; \
         ( {prune} ) >/dev/null 2>&1; true",
        target = target,
        code = TARGET_EXISTS,
        to_dir = shell_escape(&to_dir.display().to_string()),
        from = shell_escape(&from.display().to_string()),
        prune = prune_script(from_dir, floor),
    )
}

/// `find` format: type, size, mode, uid, gid, atime, mtime, ctime, path
const LIST_FORMAT: &str = r"%y\t%s\t%m\t%U\t%G\t%A@\t%T@\t%C@\t%P\n";

fn list_command(dir: &Path, recursive: bool) -> String {
    format!(
        "find {} -mindepth 1 {}-printf '{}'",
        shell_escape(&dir.display().to_string()),
        if recursive { "" } else { "-maxdepth 1 " },
        LIST_FORMAT
    )
}

fn entry_kind(code: &str) -> EntryKind {
    match code {
        "f" => EntryKind::Regular,
        "d" => EntryKind::Directory,
        "l" => EntryKind::Symlink,
        _ => EntryKind::Other,
    }
}

fn parse_time(field: &str) -> DateTime<Utc> {
    let (secs, frac) = field.split_once('.').unwrap_or((field, "0"));
    let secs = secs.parse::<i64>().unwrap_or(0);
    let nanos = format!("{:0<9}", frac)
        .get(..9)
        .and_then(|n| n.parse::<u32>().ok())
        .unwrap_or(0);
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}

/// Parses `find -printf` output produced with [`LIST_FORMAT`]
fn parse_listing<L: IdentityLookup>(stdout: &str, identities: &mut IdentityCache<L>) -> Vec<FileInfo> {
    let mut entries: Vec<FileInfo> = stdout
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.splitn(9, '\t').collect();
            let [kind, size, mode, uid, gid, atime, mtime, ctime, name] = fields[..] else {
                tracing::warn!(line, "Skipping malformed listing line");
                return None;
            };

            let uid = uid.parse().unwrap_or(0);
            let gid = gid.parse().unwrap_or(0);

            Some(FileInfo {
                name: name.to_string(),
                kind: entry_kind(kind),
                size: size.parse().unwrap_or(0),
                permissions: u32::from_str_radix(mode, 8).unwrap_or(0),
                uid,
                gid,
                owner: identities.user(uid),
                group: identities.group(gid),
                atime: parse_time(atime),
                mtime: parse_time(mtime),
                ctime: parse_time(ctime),
            })
        })
        .collect();

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

/// Name lookups through `getent` on the backend host
struct RemoteLookup<'a> {
    transport: &'a dyn Transport,
}

impl RemoteLookup<'_> {
    fn getent(&self, database: &str, id: u32) -> Option<String> {
        let output = self
            .transport
            .execute(&format!("getent {} {}", database, id))
            .ok()?;
        if !output.success() {
            return None;
        }
        output
            .stdout
            .split(':')
            .next()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }
}

impl IdentityLookup for RemoteLookup<'_> {
    fn user_name(&self, uid: u32) -> Option<String> {
        self.getent("passwd", uid)
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        self.getent("group", gid)
    }
}

impl StorageBackend for RemoteShellBackend {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn capabilities(&self) -> Capabilities {
        Self::default_capabilities().with_overrides(&self.config)
    }

    fn is_alive(&self) -> bool {
        let command = format!("test -d {}", shell_escape(&self.root.display().to_string()));
        match self.transport.execute(&command) {
            Ok(output) => output.success(),
            Err(err) => {
                tracing::debug!(backend = %self.config.name, error = %err, "Backend not reachable");
                false
            }
        }
    }

    fn cache(&self) -> &LocalCacheManager {
        &self.cache
    }

    fn sync_to_cache(&self, file: &RegisteredFile) -> Result<()> {
        self.cache.ensure_dirs(file)?;
        self.transport.transfer(
            Direction::Download,
            &self.cache.full_path(file),
            &self.remote_path(file),
            file.kind.is_collection(),
        )
    }

    fn sync_to_provider(&self, file: &RegisteredFile) -> Result<()> {
        let remote = self.remote_path(file);
        let remote_dir = remote.parent().unwrap_or(&self.root);

        self.run_checked(&format!(
            "mkdir -p -- {}",
            shell_escape(&remote_dir.display().to_string())
        ))?;

        self.transport.transfer(
            Direction::Upload,
            &self.cache.full_path(file),
            &remote,
            file.kind.is_collection(),
        )
    }

    fn erase(&self, file: &RegisteredFile) -> Result<()> {
        let command = erase_command(&self.remote_leaf(file), &self.remote_floor(file));
        self.transport.execute(&command)?;
        Ok(())
    }

    fn rename(&self, file: &RegisteredFile, new_name: &str) -> Result<()> {
        let renamed = file.renamed(new_name);
        let from = self.remote_path(file);
        let to = self.remote_path(&renamed);

        let output = self
            .transport
            .execute(&rename_command(&from, &to, &self.remote_floor(file)))?;

        match output.status {
            0 => Ok(()),
            TARGET_EXISTS => Err(Error::Integrity(format!(
                "cannot rename file {}: {} already exists on {}",
                file.id,
                to.display(),
                self.transport.describe()
            ))),
            status => Err(Error::Io(std::io::Error::other(format!(
                "rename of {} on {} exited with {}: {}",
                from.display(),
                self.transport.describe(),
                status,
                output.stderr.trim()
            )))),
        }
    }

    fn list(&self, sub_path: &Path, recursive: bool) -> Result<Vec<FileInfo>> {
        if !self.is_browsable() {
            return Err(not_browsable(&self.config));
        }
        check_sub_path(sub_path)?;

        let dir = self.root.join(sub_path);
        let output = self.transport.execute(&list_command(&dir, recursive))?;
        if !output.success() && output.stdout.is_empty() {
            return Err(Error::NotFound(format!(
                "{} on {}: {}",
                dir.display(),
                self.transport.describe(),
                output.stderr.trim()
            )));
        }

        let mut identities = IdentityCache::new(RemoteLookup {
            transport: self.transport.as_ref(),
        });
        Ok(parse_listing(&output.stdout, &mut identities))
    }

    fn report(&self, files: &[RegisteredFile]) -> Result<Vec<Issue>> {
        let command = format!(
            "find {} -mindepth 1 -printf '%y\\t%P\\n'",
            shell_escape(&self.root.display().to_string())
        );
        let output = self.transport.execute(&command)?;
        if !output.success() {
            let detail = format!(
                "{} on {}: {}",
                self.root.display(),
                self.transport.describe(),
                output.stderr.trim()
            );
            // A partial listing is never diffed
            return Err(if output.stdout.is_empty() {
                Error::NotFound(detail)
            } else {
                Error::Transient(format!("incomplete walk of {}", detail))
            });
        }

        let physical: Vec<PhysicalEntry> = output
            .stdout
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .map(|(kind, path)| PhysicalEntry::new(path, kind == "d"))
            .collect();

        let expected: Vec<ExpectedPath> = files
            .iter()
            .map(|f| ExpectedPath::for_file(self.config.layout, f))
            .collect();

        Ok(diff(self.config.layout, &expected, &physical).into_issues(self.config.id, &self.root))
    }

    fn repair(&self, issue: &Issue) -> Result<bool> {
        let IssueTarget::Path(path) = &issue.target else {
            return Err(Error::Unsupported(format!(
                "remote backend '{}' cannot repair {} issues",
                self.config.name, issue.kind
            )));
        };

        check_below(&self.root, path)?;

        let quoted = shell_escape(&path.display().to_string());
        let present = self
            .transport
            .execute(&format!("test -e {0} || test -L {0}", quoted))?;
        if !present.success() {
            return Ok(false);
        }

        self.transport.execute(&erase_command(path, &self.root))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CommandOutput;
    use crate::domain::{BackendId, FileId, FileKind, IssueKind, ShardingScheme};
    use crate::storage::{BackendKind, SqliteStateStore, SyncSettings, SyncStateTracker};
    use std::fs;
    use std::process::Command;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Runs "remote" commands through the local shell
    struct LocalShell {
        commands: AtomicUsize,
    }

    impl Transport for LocalShell {
        fn execute(&self, command: &str) -> Result<CommandOutput> {
            self.commands.fetch_add(1, Ordering::SeqCst);
            let output = Command::new("sh").arg("-c").arg(command).output()?;
            Ok(CommandOutput {
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }

        fn transfer(&self, direction: Direction, local: &Path, remote: &Path, is_dir: bool) -> Result<()> {
            let (from, to) = match direction {
                Direction::Download => (remote, local),
                Direction::Upload => (local, remote),
            };
            if !from.exists() {
                return Err(Error::Transient(format!("{} unreachable", from.display())));
            }
            crate::storage::cache::remove_path(to)?;
            if is_dir {
                crate::storage::cache::copy_tree(from, to)?;
            } else {
                crate::storage::cache::copy_file(from, to)?;
            }
            Ok(())
        }

        fn describe(&self) -> String {
            "localhost".to_string()
        }
    }

    struct Fixture {
        dir: TempDir,
        backend: RemoteShellBackend,
    }

    fn fixture(layout: ShardingScheme) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("remote");
        fs::create_dir_all(&root).unwrap();

        let store = SqliteStateStore::open(dir.path().join("state.db")).unwrap();
        let tracker = Arc::new(SyncStateTracker::new(Arc::new(store), SyncSettings::default()));
        let config = BackendConfig::new(2, "remote", BackendKind::RemoteShell, layout)
            .with_root(&root)
            .with_host("example.org");
        let cache = LocalCacheManager::new(dir.path().join("cache"), layout, config.id, tracker);

        let transport = Arc::new(LocalShell {
            commands: AtomicUsize::new(0),
        });
        let backend = RemoteShellBackend::new(config, transport, cache).unwrap();
        Fixture { dir, backend }
    }

    fn file(id: u64, name: &str) -> RegisteredFile {
        RegisteredFile::new(FileId::new(id), name, "bob", BackendId::new(2))
    }

    fn put(fx: &Fixture, file: &RegisteredFile, content: &[u8]) {
        fx.backend.cache().ensure_dirs(file).unwrap();
        fs::write(fx.backend.cache().full_path(file), content).unwrap();
        fx.backend.sync_to_provider(file).unwrap();
    }

    #[test]
    fn push_creates_remote_shards_and_fill_downloads() {
        let fx = fixture(ShardingScheme::IdSharded);
        let alpha = file(7, "alpha");
        put(&fx, &alpha, b"remote bytes");

        let remote = fx.backend.remote_path(&alpha);
        assert_eq!(fs::read(&remote).unwrap(), b"remote bytes");

        fs::remove_file(fx.backend.cache().full_path(&alpha)).unwrap();
        fx.backend.sync_to_cache(&alpha).unwrap();
        assert_eq!(
            fs::read(fx.backend.cache().full_path(&alpha)).unwrap(),
            b"remote bytes"
        );
    }

    #[test]
    fn erase_prunes_remote_parents_but_not_root() {
        let fx = fixture(ShardingScheme::IdSharded);
        let alpha = file(7, "alpha");
        put(&fx, &alpha, b"x");

        fx.backend.erase(&alpha).unwrap();
        assert!(!fx.backend.remote_leaf(&alpha).exists());
        assert!(fx.backend.root().is_dir());
        assert_eq!(fs::read_dir(fx.backend.root()).unwrap().count(), 0);

        // Erasing what is gone still succeeds
        fx.backend.erase(&alpha).unwrap();
    }

    #[test]
    fn erase_keeps_owner_directory() {
        let fx = fixture(ShardingScheme::NameSharded);
        let alpha = file(7, "alpha");
        put(&fx, &alpha, b"x");

        fx.backend.erase(&alpha).unwrap();
        let owner = fx.backend.root().join("bob");
        assert!(owner.is_dir());
        assert_eq!(fs::read_dir(&owner).unwrap().count(), 0);
    }

    #[test]
    fn rename_refuses_existing_target() {
        let fx = fixture(ShardingScheme::NameSharded);
        let alpha = file(1, "alpha");
        let beta = file(2, "beta");
        put(&fx, &alpha, b"a");
        put(&fx, &beta, b"b");

        let err = fx.backend.rename(&alpha, "beta").unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert_eq!(fs::read(fx.backend.remote_path(&alpha)).unwrap(), b"a");
        assert_eq!(fs::read(fx.backend.remote_path(&beta)).unwrap(), b"b");

        fx.backend.rename(&alpha, "gamma").unwrap();
        assert!(!fx.backend.remote_path(&alpha).exists());
        assert_eq!(
            fs::read(fx.backend.remote_path(&alpha.renamed("gamma"))).unwrap(),
            b"a"
        );
    }

    #[test]
    fn names_with_spaces_and_quotes_survive_the_shell() {
        let fx = fixture(ShardingScheme::Flat);
        let odd = file(3, "it's a file");
        put(&fx, &odd, b"q");

        fx.backend.rename(&odd, "still odd; ok").unwrap();
        assert!(fx.backend.root().join("still odd; ok").is_file());
    }

    #[test]
    fn listing_resolves_metadata() {
        let fx = fixture(ShardingScheme::Flat);
        let root = fx.backend.root().to_path_buf();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/data.bin"), b"12345").unwrap();
        fs::write(root.join("top.txt"), b"1").unwrap();

        let top = fx.backend.list(Path::new(""), false).unwrap();
        let names: Vec<_> = top.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["sub", "top.txt"]);

        let nested = fx.backend.list(Path::new("sub"), true).unwrap();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].name, "data.bin");
        assert_eq!(nested[0].size, 5);
        assert_eq!(nested[0].kind, EntryKind::Regular);
        assert!(nested[0].mtime.timestamp() > 0);

        assert!(matches!(
            fx.backend.list(Path::new("absent"), false),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn report_and_repair_orphans() {
        let fx = fixture(ShardingScheme::NameSharded);
        let alpha = file(1, "alpha");
        let ghost = file(2, "ghost");
        put(&fx, &alpha, b"a");
        let stray = fx.backend.root().join("eve/01");
        fs::create_dir_all(stray.join("02")).unwrap();

        let issues = fx.backend.report(&[alpha.clone(), ghost]).unwrap();
        assert_eq!(issues.iter().filter(|i| i.kind == IssueKind::Missing).count(), 1);
        let orphans: Vec<_> = issues.iter().filter(|i| i.kind == IssueKind::Orphan).collect();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].target, IssueTarget::Path(stray.clone()));

        assert!(fx.backend.repair(orphans[0]).unwrap());
        assert!(!stray.exists());
        assert!(fx.backend.root().join("eve").is_dir());
        assert!(!fx.backend.repair(orphans[0]).unwrap());
        assert!(fx.backend.remote_path(&alpha).exists());
    }

    #[test]
    fn repair_refuses_paths_climbing_out_of_root() {
        let fx = fixture(ShardingScheme::Flat);
        let outside = fx.dir.path().join("keep.txt");
        fs::write(&outside, b"x").unwrap();

        let climbing = fx.backend.root().join("../keep.txt");
        let issue = Issue::orphan_path(BackendId::new(2), climbing, "x");
        assert!(matches!(fx.backend.repair(&issue), Err(Error::Integrity(_))));
        assert!(outside.exists());
    }

    /// Answers every command like a `find` cut short by an unreadable directory
    struct CutShortWalk;

    impl Transport for CutShortWalk {
        fn execute(&self, _command: &str) -> Result<CommandOutput> {
            Ok(CommandOutput {
                status: 1,
                stdout: "d\tbob\n".to_string(),
                stderr: "find: 'bob/12': Permission denied\n".to_string(),
            })
        }

        fn transfer(&self, _: Direction, _: &Path, _: &Path, _: bool) -> Result<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            "localhost".to_string()
        }
    }

    #[test]
    fn incomplete_walk_reports_nothing() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStateStore::open(dir.path().join("state.db")).unwrap();
        let tracker = Arc::new(SyncStateTracker::new(Arc::new(store), SyncSettings::default()));
        let layout = ShardingScheme::NameSharded;
        let config = BackendConfig::new(2, "remote", BackendKind::RemoteShell, layout)
            .with_root(dir.path().join("remote"))
            .with_host("example.org");
        let cache = LocalCacheManager::new(dir.path().join("cache"), layout, config.id, tracker);
        let backend = RemoteShellBackend::new(config, Arc::new(CutShortWalk), cache).unwrap();

        let err = backend.report(&[file(1, "alpha")]).unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
        assert!(err.to_string().contains("Permission denied"));
    }

    #[test]
    fn collections_mirror_directories() {
        let fx = fixture(ShardingScheme::Flat);
        let series = file(4, "series").with_kind(FileKind::Collection);
        let cached = fx.backend.cache().full_path(&series);
        fs::create_dir_all(cached.join("nested")).unwrap();
        fs::write(cached.join("nested/one.dcm"), b"1").unwrap();

        fx.backend.sync_to_provider(&series).unwrap();
        assert!(fx.backend.remote_path(&series).join("nested/one.dcm").is_file());
    }

    #[test]
    fn is_alive_checks_root() {
        let fx = fixture(ShardingScheme::Flat);
        assert!(fx.backend.is_alive());
        fs::remove_dir_all(fx.backend.root()).unwrap();
        assert!(!fx.backend.is_alive());
    }

    #[test]
    fn command_builders_quote_paths() {
        let cmd = erase_command(Path::new("/r/12/34/7"), Path::new("/r"));
        assert!(cmd.starts_with("( rm -rf -- /r/12/34/7 ;"));
        assert!(cmd.contains("d=/r/12/34;"));

        let cmd = rename_command(Path::new("/r/a b"), Path::new("/r/c"), Path::new("/r"));
        assert!(cmd.contains("mv -- '/r/a b' /r/c"));
        assert!(cmd.contains("exit 17"));
    }

    #[test]
    fn parse_find_lines() {
        struct Nobody;
        impl IdentityLookup for Nobody {
            fn user_name(&self, _: u32) -> Option<String> {
                None
            }
            fn group_name(&self, _: u32) -> Option<String> {
                None
            }
        }

        let out = "f\t12\t644\t1000\t100\t1700000000.5\t1700000001.0000000000\t1700000002\tname with\ttab\nbroken\n";
        let entries = parse_listing(out, &mut IdentityCache::new(Nobody));

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "name with\ttab");
        assert_eq!(entries[0].permissions, 0o644);
        assert_eq!(entries[0].atime.timestamp_subsec_millis(), 500);
        assert_eq!(entries[0].ctime.timestamp(), 1_700_000_002);
    }
}
