//! Catalog of registered files
//!
//! The catalog is the registry the storage layer consumes: it reads a file's
//! identity and placement, and writes back size, name and backend assignment
//! after successful operations. [`JsonlCatalog`] stores it in
//! `.dataprov/catalog.jsonl`, one JSON object per line.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::domain::{
    is_legal_filename, is_legal_sub_path, BackendId, FileId, FileKind, RegisteredFile,
    ShardingScheme,
};
use crate::error::{Error, Result};
use crate::storage::config::WORKSPACE_DIR;

/// Registry of logical files
pub trait Catalog: Send + Sync {
    fn get(&self, id: FileId) -> Result<Option<RegisteredFile>>;

    fn files_on_backend(&self, backend_id: BackendId) -> Result<Vec<RegisteredFile>>;

    /// Every file on `backend_id` called `name`, regardless of owner
    fn find_by_name(&self, backend_id: BackendId, name: &str) -> Result<Vec<RegisteredFile>>;

    /// Replaces the stored record with the same id
    fn update(&self, file: &RegisteredFile) -> Result<()>;

    /// Marks a file for administrative removal. Returns false if the file
    /// is gone or already flagged.
    fn flag_for_removal(&self, id: FileId) -> Result<bool>;
}

/// True if `a` and `b` would claim the same name on a backend using `scheme`
pub fn same_slot(scheme: ShardingScheme, a: &RegisteredFile, b: &RegisteredFile) -> bool {
    if a.backend_id != b.backend_id || a.name != b.name {
        return false;
    }

    match scheme {
        ShardingScheme::NameSharded => a.owner == b.owner,
        ShardingScheme::IdSharded => true,
        ShardingScheme::Flat => a.sub_path() == b.sub_path(),
    }
}

/// Returns the other registered file already holding `candidate`'s name
pub fn name_taken(
    catalog: &dyn Catalog,
    scheme: ShardingScheme,
    candidate: &RegisteredFile,
) -> Result<Option<RegisteredFile>> {
    Ok(catalog
        .find_by_name(candidate.backend_id, &candidate.name)?
        .into_iter()
        .find(|other| other.id != candidate.id && same_slot(scheme, other, candidate)))
}

/// Catalog stored as JSONL with `fs2` file locks
pub struct JsonlCatalog {
    path: PathBuf,
}

impl JsonlCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Creates the default catalog for a workspace
    pub fn for_workspace(workspace_root: &Path) -> Self {
        Self::new(workspace_root.join(WORKSPACE_DIR).join("catalog.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record
    pub fn read_all(&self) -> Result<BTreeMap<FileId, RegisteredFile>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let file = File::open(&self.path)?;
        file.lock_shared()?;

        let reader = BufReader::new(&file);
        let mut files = BTreeMap::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let record: RegisteredFile = serde_json::from_str(&line).map_err(|e| {
                Error::Catalog(format!(
                    "{}: line {}: {}",
                    self.path.display(),
                    line_num + 1,
                    e
                ))
            })?;
            files.insert(record.id, record);
        }

        Ok(files)
    }

    /// Registers a new file and assigns it the next free id
    pub fn register(
        &self,
        name: &str,
        owner: &str,
        backend_id: BackendId,
        scheme: ShardingScheme,
        kind: FileKind,
        sub_path: Option<&Path>,
    ) -> Result<RegisteredFile> {
        if !is_legal_filename(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        if !is_legal_filename(owner) {
            return Err(Error::InvalidName(owner.to_string()));
        }
        if let Some(sub) = sub_path {
            if scheme != ShardingScheme::Flat {
                return Err(Error::Unsupported(format!(
                    "sub-paths require a flat layout, backend {} is {}",
                    backend_id,
                    scheme.as_str()
                )));
            }
            if !is_legal_sub_path(sub) {
                return Err(Error::InvalidName(sub.display().to_string()));
            }
        }

        self.modify(|files| {
            // Ids are never reissued, even after the newest record is removed
            let highest = files.keys().next_back().map(|id| id.get()).unwrap_or(0);
            let next = self.read_last_id()?.max(highest) + 1;

            let mut file = RegisteredFile::new(FileId::new(next), name, owner, backend_id)
                .with_kind(kind);
            if let Some(sub) = sub_path {
                file = file.with_sub_path(sub);
            }

            if let Some(other) = files.values().find(|other| same_slot(scheme, other, &file)) {
                return Err(Error::Integrity(format!(
                    "'{}' is already registered on backend {} as file {}",
                    name, backend_id, other.id
                )));
            }

            self.write_last_id(next)?;
            files.insert(file.id, file.clone());
            tracing::debug!(file_id = %file.id, name, owner, backend = %backend_id, "Registered file");
            Ok(file)
        })
    }

    /// Removes a record. Returns false if it did not exist.
    pub fn remove(&self, id: FileId) -> Result<bool> {
        self.modify(|files| Ok(files.remove(&id).is_some()))
    }

    /// Runs a read-modify-write cycle under the catalog's writer lock
    fn modify<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<FileId, RegisteredFile>) -> Result<T>,
    ) -> Result<T> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Writers serialize on a sidecar lock so the data file can be replaced
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path.with_extension("jsonl.lock"))?;
        lock_file.lock_exclusive()?;

        let mut files = self.read_all()?;
        let before = files.clone();
        let result = f(&mut files)?;

        if files != before {
            self.write_all(&files)?;
        }

        Ok(result)
    }

    /// Sidecar holding the highest id ever issued
    fn last_id_path(&self) -> PathBuf {
        self.path.with_extension("jsonl.last-id")
    }

    fn read_last_id(&self) -> Result<u64> {
        match fs::read_to_string(self.last_id_path()) {
            Ok(content) => content.trim().parse().map_err(|e| {
                Error::Catalog(format!("{}: {}", self.last_id_path().display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Called with the writer lock held
    fn write_last_id(&self, id: u64) -> Result<()> {
        let path = self.last_id_path();
        let temp_path = path.with_extension("last-id.tmp");
        fs::write(&temp_path, format!("{}\n", id))?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn write_all(&self, files: &BTreeMap<FileId, RegisteredFile>) -> Result<()> {
        let temp_path = self.path.with_extension("jsonl.tmp");

        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            file.lock_exclusive()?;

            let mut writer = BufWriter::new(&file);
            for record in files.values() {
                let line = serde_json::to_string(record)
                    .map_err(|e| Error::Catalog(format!("failed to serialize file {}: {}", record.id, e)))?;
                writeln!(writer, "{}", line)?;
            }
            writer.flush()?;
        }

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl Catalog for JsonlCatalog {
    fn get(&self, id: FileId) -> Result<Option<RegisteredFile>> {
        Ok(self.read_all()?.remove(&id))
    }

    fn files_on_backend(&self, backend_id: BackendId) -> Result<Vec<RegisteredFile>> {
        Ok(self
            .read_all()?
            .into_values()
            .filter(|f| f.backend_id == backend_id)
            .collect())
    }

    fn find_by_name(&self, backend_id: BackendId, name: &str) -> Result<Vec<RegisteredFile>> {
        Ok(self
            .read_all()?
            .into_values()
            .filter(|f| f.backend_id == backend_id && f.name == name)
            .collect())
    }

    fn update(&self, file: &RegisteredFile) -> Result<()> {
        self.modify(|files| match files.get_mut(&file.id) {
            Some(existing) => {
                *existing = file.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("file {}", file.id))),
        })
    }

    fn flag_for_removal(&self, id: FileId) -> Result<bool> {
        self.modify(|files| match files.get_mut(&id) {
            Some(file) if !file.flagged_for_removal => {
                file.flagged_for_removal = true;
                Ok(true)
            }
            _ => Ok(false),
        })
    }
}
