//! Backend CLI commands

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use clap::Subcommand;

use super::output::Output;
use crate::storage::Catalog;
use crate::workspace::Workspace;

#[derive(Subcommand)]
pub enum BackendCommands {
    /// List configured backends
    List,

    /// Show liveness, capabilities and sync-state counts of a backend
    Status {
        /// Backend name or id
        backend: String,
    },

    /// List a directory on a browsable backend
    Ls {
        /// Backend name or id
        backend: String,

        /// Directory below the backend root
        #[arg(default_value = "")]
        path: String,

        /// Descend into subdirectories
        #[arg(long, short)]
        recursive: bool,
    },
}

pub fn run(cmd: BackendCommands, output: &Output) -> Result<()> {
    match cmd {
        BackendCommands::List => list(output),
        BackendCommands::Status { backend } => status(output, &backend),
        BackendCommands::Ls {
            backend,
            path,
            recursive,
        } => ls(output, &backend, &path, recursive),
    }
}

fn list(output: &Output) -> Result<()> {
    let workspace = Workspace::open_current()?;
    let backends = &workspace.config().workspace.backends;

    if output.is_json() {
        output.data(backends);
        return Ok(());
    }

    if backends.is_empty() {
        println!("No backends configured. Add [[backends]] to .dataprov/config.toml.");
        return Ok(());
    }

    println!("{:<4} {:<16} {:<13} {:<13} LOCATION", "ID", "NAME", "KIND", "LAYOUT");
    for backend in backends {
        let location = match (&backend.host, &backend.root, &backend.url) {
            (Some(host), Some(root), _) => format!("{}:{}", host, root.display()),
            (None, Some(root), _) => root.display().to_string(),
            (_, None, Some(url)) => url.clone(),
            _ => "-".to_string(),
        };

        let mut flags = Vec::new();
        if !backend.online {
            flags.push("offline");
        }
        if backend.read_only {
            flags.push("read-only");
        }

        println!(
            "{:<4} {:<16} {:<13} {:<13} {}{}",
            backend.id,
            backend.name,
            backend.kind.as_str(),
            backend.layout.as_str(),
            location,
            if flags.is_empty() {
                String::new()
            } else {
                format!(" ({})", flags.join(", "))
            }
        );
    }

    Ok(())
}

fn status(output: &Output, name: &str) -> Result<()> {
    let workspace = Workspace::open_current()?;
    let provider = workspace.provider(name)?;
    let config = provider.config();

    let alive = config.online && provider.is_alive();
    let capabilities = provider.backend().capabilities();
    let files = workspace.catalog().files_on_backend(config.id)?;

    let mut states: BTreeMap<String, usize> = BTreeMap::new();
    for record in workspace.tracker().store().records_for_backend(config.id)? {
        *states.entry(record.state.to_string()).or_default() += 1;
    }

    if output.is_json() {
        output.data(&serde_json::json!({
            "id": config.id,
            "name": config.name,
            "kind": config.kind,
            "layout": config.layout,
            "online": config.online,
            "read_only": config.read_only,
            "alive": alive,
            "capabilities": capabilities,
            "cache": provider.backend().cache().root().display().to_string(),
            "files": files.len(),
            "states": states,
        }));
        return Ok(());
    }

    println!("Backend {} ({})", config.name, config.id);
    println!("{}", "=".repeat(40));
    println!("Kind:   {} ({})", config.kind.as_str(), config.layout.as_str());
    println!("Alive:  {}", if alive { "yes" } else { "no" });
    println!(
        "Flags:  {}{}",
        if config.online { "online" } else { "offline" },
        if config.read_only { ", read-only" } else { "" }
    );
    println!("Cache:  {}", provider.backend().cache().root().display());
    println!();
    println!("Capabilities:");
    println!("  browsable:          {}", capabilities.browsable);
    println!("  fast syncing:       {}", capabilities.fast_syncing);
    println!("  owner change:       {}", capabilities.allow_owner_change);
    println!("  shared content:     {}", capabilities.content_shared);
    println!();
    println!("Files: {}", files.len());
    for (state, count) in &states {
        println!("  {:<20} {}", state, count);
    }

    Ok(())
}

fn ls(output: &Output, name: &str, path: &str, recursive: bool) -> Result<()> {
    let workspace = Workspace::open_current()?;
    let provider = workspace.provider(name)?;

    let entries = provider.list(Path::new(path), recursive)?;
    output.verbose_ctx("ls", &format!("{} entries", entries.len()));

    if output.is_json() {
        output.data(&entries);
        return Ok(());
    }

    for entry in &entries {
        let owner = entry.owner.clone().unwrap_or_else(|| entry.uid.to_string());
        let group = entry.group.clone().unwrap_or_else(|| entry.gid.to_string());
        output.row(&[
            entry.kind.as_str(),
            &format!("{:04o}", entry.permissions),
            &owner,
            &group,
            &entry.size.to_string(),
            &entry.mtime.format("%Y-%m-%d %H:%M").to_string(),
            &entry.name,
        ]);
    }

    Ok(())
}
