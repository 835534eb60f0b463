//! File CLI commands

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use super::output::Output;
use crate::domain::{FileId, FileKind, RegisteredFile, ShardingScheme};
use crate::workspace::Workspace;

#[derive(Subcommand)]
pub enum FileCommands {
    /// Register a new file on a backend
    Register {
        /// Backend name or id
        backend: String,

        /// File name
        name: String,

        /// Owner login name
        #[arg(long)]
        owner: String,

        /// The file is a directory of files
        #[arg(long)]
        collection: bool,

        /// Sub-directory below the backend root (flat layouts only)
        #[arg(long)]
        sub_path: Option<PathBuf>,
    },

    /// Show a registered file
    Show {
        id: FileId,
    },

    /// Store local content as the file and upload it
    Put {
        id: FileId,

        /// Local file (or directory, for collections)
        source: PathBuf,
    },

    /// Fetch the file and copy it to a local path
    Get {
        id: FileId,

        /// Destination path
        dest: PathBuf,
    },

    /// Bring the cached copy up to date
    Fill {
        id: FileId,
    },

    /// Upload the cached copy to the backend
    Push {
        id: FileId,
    },

    /// Rename the file; never overwrites
    Rename {
        id: FileId,

        new_name: String,
    },

    /// Delete the content and the catalog record
    Erase {
        id: FileId,

        /// Keep the catalog record
        #[arg(long)]
        keep_record: bool,
    },

    /// Move the file to another backend, keeping its id
    Move {
        id: FileId,

        /// Target backend name or id
        backend: String,
    },

    /// Copy the file to another backend as a new file
    Copy {
        id: FileId,

        /// Target backend name or id
        backend: String,

        /// Name of the copy (defaults to the original name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Show the sync state of the cached copy
    State {
        id: FileId,
    },
}

pub fn run(cmd: FileCommands, output: &Output) -> Result<()> {
    let workspace = Workspace::open_current()?;

    match cmd {
        FileCommands::Register {
            backend,
            name,
            owner,
            collection,
            sub_path,
        } => register(&workspace, output, &backend, &name, &owner, collection, sub_path),
        FileCommands::Show { id } => show(&workspace, output, id),
        FileCommands::Put { id, source } => put(&workspace, output, id, source),
        FileCommands::Get { id, dest } => get(&workspace, output, id, dest),
        FileCommands::Fill { id } => fill(&workspace, output, id),
        FileCommands::Push { id } => push(&workspace, output, id),
        FileCommands::Rename { id, new_name } => rename(&workspace, output, id, &new_name),
        FileCommands::Erase { id, keep_record } => erase(&workspace, output, id, keep_record),
        FileCommands::Move { id, backend } => move_to(&workspace, output, id, &backend),
        FileCommands::Copy { id, backend, name } => {
            copy_to(&workspace, output, id, &backend, name.as_deref())
        }
        FileCommands::State { id } => state(&workspace, output, id),
    }
}

fn print_file(output: &Output, file: &RegisteredFile) {
    if output.is_json() {
        output.data(file);
        return;
    }

    println!("File {}: {}", file.id, file.name);
    println!("Owner:    {}", file.owner);
    println!("Backend:  {}", file.backend_id);
    println!(
        "Kind:     {}",
        if file.kind.is_collection() { "collection" } else { "single" }
    );
    if let Some(sub) = file.sub_path() {
        println!("Sub-path: {}", sub.display());
    }
    if let Some(size) = file.size {
        println!("Size:     {}", size);
    }
    if file.flagged_for_removal {
        println!("Flagged for removal");
    }
}

fn register(
    workspace: &Workspace,
    output: &Output,
    backend: &str,
    name: &str,
    owner: &str,
    collection: bool,
    sub_path: Option<PathBuf>,
) -> Result<()> {
    let kind = if collection {
        FileKind::Collection
    } else {
        FileKind::Single
    };
    let file = workspace.register(backend, name, owner, kind, sub_path.as_deref())?;

    if output.is_json() {
        output.data(&file);
    } else {
        output.done(&format!("Registered file {} ({})", file.id, file.name));
    }
    Ok(())
}

fn show(workspace: &Workspace, output: &Output, id: FileId) -> Result<()> {
    let file = workspace.file(id)?;
    print_file(output, &file);
    Ok(())
}

fn put(workspace: &Workspace, output: &Output, id: FileId, source: PathBuf) -> Result<()> {
    let file = workspace.file(id)?;
    let provider = workspace.provider_for(&file)?;

    let stored = provider
        .copy_from_local(&file, &source)
        .with_context(|| format!("Failed to store {} as file {}", source.display(), id))?;

    if output.is_json() {
        output.data(&stored);
    } else {
        output.done(&format!(
            "Stored file {} on '{}' ({} {})",
            id,
            provider.name(),
            stored.size.unwrap_or_default(),
            if stored.kind.is_collection() { "files" } else { "bytes" }
        ));
    }
    Ok(())
}

fn get(workspace: &Workspace, output: &Output, id: FileId, dest: PathBuf) -> Result<()> {
    let file = workspace.file(id)?;
    let provider = workspace.provider_for(&file)?;

    let size = provider
        .copy_to_local(&file, &dest)
        .with_context(|| format!("Failed to copy file {} to {}", id, dest.display()))?;

    if output.is_json() {
        output.data(&serde_json::json!({
            "id": id,
            "dest": dest.display().to_string(),
            "size": size,
        }));
    } else {
        output.done(&format!("Copied file {} to {}", id, dest.display()));
    }
    Ok(())
}

fn fill(workspace: &Workspace, output: &Output, id: FileId) -> Result<()> {
    let file = workspace.file(id)?;
    let provider = workspace.provider_for(&file)?;

    let filled = provider
        .sync_to_cache(&file)
        .with_context(|| format!("Failed to fill the cache of file {}", id))?;

    if output.is_json() {
        output.data(&serde_json::json!({
            "id": id,
            "filled": filled,
            "path": provider.cache_full_path(&file).display().to_string(),
        }));
    } else if filled {
        output.done(&format!(
            "Filled {}",
            provider.cache_full_path(&file).display()
        ));
    } else {
        output.done(&format!("File {} is already in sync", id));
    }
    Ok(())
}

fn push(workspace: &Workspace, output: &Output, id: FileId) -> Result<()> {
    let file = workspace.file(id)?;
    let provider = workspace.provider_for(&file)?;

    provider
        .sync_to_provider(&file)
        .with_context(|| format!("Failed to push file {}", id))?;

    output.done(&format!("Pushed file {} to '{}'", id, provider.name()));
    Ok(())
}

fn rename(workspace: &Workspace, output: &Output, id: FileId, new_name: &str) -> Result<()> {
    let file = workspace.file(id)?;
    let provider = workspace.provider_for(&file)?;

    let renamed = provider
        .rename(&file, new_name)
        .with_context(|| format!("Failed to rename file {}", id))?;

    if output.is_json() {
        output.data(&renamed);
    } else {
        output.done(&format!("Renamed file {} to '{}'", id, renamed.name));
    }
    Ok(())
}

fn erase(workspace: &Workspace, output: &Output, id: FileId, keep_record: bool) -> Result<()> {
    let file = workspace.file(id)?;
    let provider = workspace.provider_for(&file)?;

    provider
        .erase(&file)
        .with_context(|| format!("Failed to erase file {}", id))?;

    if !keep_record {
        workspace.catalog().remove(id)?;
    }

    output.done(&format!("Erased file {} from '{}'", id, provider.name()));
    Ok(())
}

fn move_to(workspace: &Workspace, output: &Output, id: FileId, backend: &str) -> Result<()> {
    let file = workspace.file(id)?;
    let source = workspace.provider_for(&file)?;
    let target = workspace.provider(backend)?;

    let moved = source
        .move_to(&file, &target)
        .with_context(|| format!("Failed to move file {} to '{}'", id, target.name()))?;

    if output.is_json() {
        output.data(&moved);
    } else {
        output.done(&format!(
            "Moved file {} from '{}' to '{}'",
            id,
            source.name(),
            target.name()
        ));
    }
    Ok(())
}

fn copy_to(
    workspace: &Workspace,
    output: &Output,
    id: FileId,
    backend: &str,
    name: Option<&str>,
) -> Result<()> {
    let file = workspace.file(id)?;
    let source = workspace.provider_for(&file)?;
    let target = workspace.provider(backend)?;

    let sub_path = match target.config().layout {
        ShardingScheme::Flat => file.sub_path(),
        _ => None,
    };
    let copy = workspace.register(
        backend,
        name.unwrap_or(&file.name),
        &file.owner,
        file.kind,
        sub_path,
    )?;

    let stored = match source.copy_to(&file, &target, &copy) {
        Ok(stored) => stored,
        Err(e) => {
            workspace.catalog().remove(copy.id)?;
            return Err(e).with_context(|| format!("Failed to copy file {} to '{}'", id, target.name()));
        }
    };

    if output.is_json() {
        output.data(&stored);
    } else {
        output.done(&format!(
            "Copied file {} to '{}' as file {}",
            id,
            target.name(),
            stored.id
        ));
    }
    Ok(())
}

fn state(workspace: &Workspace, output: &Output, id: FileId) -> Result<()> {
    let file = workspace.file(id)?;
    let provider = workspace.provider_for(&file)?;
    let state = provider.state(&file)?;

    if output.is_json() {
        output.data(&serde_json::json!({
            "id": id,
            "backend": provider.name(),
            "state": state,
            "cache": provider.cache_full_path(&file).display().to_string(),
        }));
    } else {
        println!("{}", state);
    }
    Ok(())
}
