//! Remote command execution and bulk transfer
//!
//! [`SshTransport`] shells out to OpenSSH and rsync. Connections are
//! multiplexed: every [`SshChannel`] names one ControlMaster socket, and
//! [`SshConnectionPool`] hands out one channel per (user, host, port,
//! identity) so many logical operations share one TCP connection.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::storage::BackendConfig;

/// Captured result of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Backend to local
    Download,
    /// Local to backend
    Upload,
}

/// Execution and transfer primitives on a backend host
pub trait Transport: Send + Sync {
    /// Runs `command` through the remote shell
    fn execute(&self, command: &str) -> Result<CommandOutput>;

    /// Copies between `local` and `remote`. Directories are mirrored,
    /// removing extraneous destination files.
    fn transfer(&self, direction: Direction, local: &Path, remote: &Path, is_dir: bool) -> Result<()>;

    /// Human-readable endpoint for messages
    fn describe(&self) -> String;
}

/// Quotes `s` for a POSIX shell
pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':' | '='))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Maps a failed rsync exit code to the error taxonomy
pub fn classify_rsync_exit(code: i32, path: &Path, stderr: &str) -> Error {
    let detail = if stderr.trim().is_empty() {
        format!("rsync exited with {}", code)
    } else {
        format!("rsync exited with {}: {}", code, stderr.trim())
    };

    match code {
        // Partial transfer
        23 | 24 => Error::partial(path, detail),
        // Protocol, socket, timeout, daemon and ssh connection failures
        5 | 10 | 12 | 30 | 35 | 255 => Error::Transient(detail),
        _ => Error::Io(std::io::Error::other(detail)),
    }
}

/// Drops ssh chatter that is not an error
fn filter_noise(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| {
            !(line.starts_with("Warning: Permanently added")
                || (line.starts_with("Connection to ") && line.ends_with(" closed.")))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One multiplexed ssh endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshChannel {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub identity: Option<PathBuf>,
    pub control_path: PathBuf,
}

impl SshChannel {
    /// Seconds a master connection stays up after its last client
    const CONTROL_PERSIST_SECS: u32 = 600;

    const CONNECT_TIMEOUT_SECS: u32 = 10;

    /// `user@host`, or `host` alone
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// ssh options shared by commands and rsync
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPersist={}", Self::CONTROL_PERSIST_SECS),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            format!("ConnectTimeout={}", Self::CONNECT_TIMEOUT_SECS),
        ];

        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }

        args
    }

    /// Remote shell command line for `rsync -e`
    pub fn rsync_shell(&self) -> String {
        std::iter::once("ssh".to_string())
            .chain(self.ssh_args().iter().map(|a| shell_escape(a)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Hands out shared channels, one per endpoint
pub struct SshConnectionPool {
    control_dir: PathBuf,
    channels: Mutex<HashMap<(Option<String>, String, Option<u16>, Option<PathBuf>), Arc<SshChannel>>>,
}

impl SshConnectionPool {
    pub fn new(control_dir: impl Into<PathBuf>) -> Self {
        Self {
            control_dir: control_dir.into(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn control_dir(&self) -> &Path {
        &self.control_dir
    }

    /// Returns the channel for the endpoint of `config`, creating it on
    /// first use
    pub fn channel(&self, config: &BackendConfig) -> Result<Arc<SshChannel>> {
        let host = config.require_host()?.to_string();
        let key = (
            config.user.clone(),
            host.clone(),
            config.port,
            config.credentials.clone(),
        );

        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(&key) {
            return Ok(Arc::clone(channel));
        }

        fs::create_dir_all(&self.control_dir)?;

        // Socket paths are length-limited, so name them by a short digest
        let digest = blake3::hash(format!("{:?}", key).as_bytes()).to_hex();
        let channel = Arc::new(SshChannel {
            user: key.0.clone(),
            host,
            port: key.2,
            identity: key.3.clone(),
            control_path: self.control_dir.join(format!("{}.sock", &digest.as_str()[..16])),
        });

        tracing::debug!(
            destination = %channel.destination(),
            control_path = %channel.control_path.display(),
            "Opened ssh channel"
        );
        channels.insert(key, Arc::clone(&channel));
        Ok(channel)
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`Transport`] over OpenSSH and rsync
pub struct SshTransport {
    channel: Arc<SshChannel>,
}

impl SshTransport {
    pub fn new(channel: Arc<SshChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &SshChannel {
        &self.channel
    }

    fn run(mut command: Command, what: &str) -> Result<Output> {
        command.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Configuration(format!("{} is not installed", what))
            } else {
                Error::Io(e)
            }
        })
    }

    fn remote_spec(&self, remote: &Path, is_dir: bool) -> String {
        let mut path = remote.display().to_string();
        if is_dir && !path.ends_with('/') {
            path.push('/');
        }
        format!("{}:{}", self.channel.destination(), path)
    }
}

impl Transport for SshTransport {
    fn execute(&self, command: &str) -> Result<CommandOutput> {
        let mut ssh = Command::new("ssh");
        ssh.args(self.channel.ssh_args())
            .arg(self.channel.destination())
            .arg(command);

        tracing::debug!(destination = %self.channel.destination(), command, "ssh");
        let output = Self::run(ssh, "ssh")?;

        let status = output.status.code().unwrap_or(-1);
        let stderr = filter_noise(&String::from_utf8_lossy(&output.stderr));

        if status == 255 {
            return Err(Error::Transient(format!(
                "ssh to {} failed: {}",
                self.channel.destination(),
                stderr.trim()
            )));
        }

        Ok(CommandOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }

    fn transfer(&self, direction: Direction, local: &Path, remote: &Path, is_dir: bool) -> Result<()> {
        let mut local_spec = local.display().to_string();
        if is_dir && !local_spec.ends_with('/') {
            local_spec.push('/');
        }
        let remote_spec = self.remote_spec(remote, is_dir);

        let (source, dest, dest_path) = match direction {
            Direction::Download => (remote_spec, local_spec, local),
            Direction::Upload => (local_spec, remote_spec, remote),
        };

        let mut rsync = Command::new("rsync");
        rsync
            .args(["-a", "-L", "-s", "--delete"])
            .arg("-e")
            .arg(self.channel.rsync_shell())
            .arg(&source)
            .arg(&dest);

        tracing::debug!(source = %source, dest = %dest, "rsync");
        let output = Self::run(rsync, "rsync")?;

        match output.status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(classify_rsync_exit(
                code,
                dest_path,
                &filter_noise(&String::from_utf8_lossy(&output.stderr)),
            )),
            None => Err(Error::partial(dest_path, "rsync was killed by a signal")),
        }
    }

    fn describe(&self) -> String {
        self.channel.destination()
    }
}
