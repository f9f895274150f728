//! Durable journal of created resources.
//!
//! One pretty-printed JSON file per deployment identifier lives in the state
//! directory next to a `.lock` file. A `JournalStore` holds an exclusive
//! advisory lock on that file for its whole lifetime, so a second provisioning
//! run against the same deployment identifier is refused instead of racing.
//!
//! Every write goes to a temporary file which is synced and renamed over the
//! journal, so a crash leaves either the previous or the new journal on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::model::{Journal, ResourceRecord};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("InvalidDeploymentId: {0:?} (use lowercase letters, digits and '-')")]
    InvalidDeploymentId(String),
    #[error("AlreadyRunning: another run holds {0}")]
    Locked(PathBuf),
    #[error("UnableToAccessJournal {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("UnableToDecodeJournal {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("UnableToEncodeJournal: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("JournalMismatch: {path} belongs to deployment {found}")]
    Mismatch { path: PathBuf, found: String },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> JournalError + '_ {
    move |source| JournalError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn validate_deployment_id(deployment_id: &str) -> Result<(), JournalError> {
    let valid = !deployment_id.is_empty()
        && deployment_id.len() <= 40
        && !deployment_id.starts_with('-')
        && deployment_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(JournalError::InvalidDeploymentId(deployment_id.to_string()));
    }
    Ok(())
}

pub fn journal_path(dir: &Path, deployment_id: &str) -> PathBuf {
    dir.join(format!("{}.json", deployment_id))
}

fn read_journal(path: &Path, deployment_id: &str) -> Result<Option<Journal>, JournalError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path)(e)),
    };
    let journal: Journal = serde_json::from_slice(&data).map_err(|source| JournalError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    if journal.deployment_id != deployment_id {
        return Err(JournalError::Mismatch {
            path: path.to_path_buf(),
            found: journal.deployment_id,
        });
    }
    Ok(Some(journal))
}

/// Reads a journal without taking the lock, for inspection only.
pub fn inspect(dir: &Path, deployment_id: &str) -> Result<Option<Journal>, JournalError> {
    validate_deployment_id(deployment_id)?;
    read_journal(&journal_path(dir, deployment_id), deployment_id)
}

pub struct JournalStore {
    deployment_id: String,
    path: PathBuf,
    lock_path: PathBuf,
    lock: File,
}

impl JournalStore {
    /// Takes the per-deployment lock, creating the state directory if needed.
    pub fn acquire(dir: impl AsRef<Path>, deployment_id: &str) -> Result<JournalStore, JournalError> {
        validate_deployment_id(deployment_id)?;
        let dir = dir.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(io_error(dir))?;
            debug!(path = %dir.display(), "Created state directory");
        }

        let lock_path = dir.join(format!("{}.lock", deployment_id));
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(io_error(&lock_path))?;

        match lock.try_lock_exclusive() {
            Ok(()) => {}
            // EAGAIN is 11 on Linux and 35 on macOS
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.raw_os_error() == Some(11)
                    || e.raw_os_error() == Some(35) =>
            {
                error!(path = %lock_path.display(), "Deployment is locked by another run");
                return Err(JournalError::Locked(lock_path));
            }
            Err(e) => return Err(io_error(&lock_path)(e)),
        }
        info!(deployment = %deployment_id, path = %lock_path.display(), "Acquired journal lock");

        Ok(JournalStore {
            deployment_id: deployment_id.to_string(),
            path: journal_path(dir, deployment_id),
            lock_path,
            lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the journal left by a prior incomplete run, if any.
    pub fn load(&self) -> Result<Option<Journal>, JournalError> {
        let journal = read_journal(&self.path, &self.deployment_id)?;
        if let Some(j) = &journal {
            info!(
                deployment = %self.deployment_id,
                records = j.records.len(),
                started_at = %j.started_at,
                "Loaded journal from a previous run"
            );
        }
        Ok(journal)
    }

    /// Adds a record and flushes the journal before returning.
    pub fn append(&self, journal: &mut Journal, record: ResourceRecord) -> Result<(), JournalError> {
        debug!(deployment = %self.deployment_id, record = %record.message(), "Journaling");
        journal.records.push(record);
        self.write(journal)
    }

    /// Removes the record at `index` and flushes the journal.
    pub fn remove(&self, journal: &mut Journal, index: usize) -> Result<ResourceRecord, JournalError> {
        let record = journal.records.remove(index);
        self.write(journal)?;
        Ok(record)
    }

    pub fn write(&self, journal: &Journal) -> Result<(), JournalError> {
        let data = serde_json::to_vec_pretty(journal)?;
        let tmp = self.path.with_extension("json.tmp");

        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp).map_err(io_error(&tmp))?;
        file.write_all(&data).map_err(io_error(&tmp))?;
        file.sync_all().map_err(io_error(&tmp))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(io_error(&self.path))?;
        self.sync_dir()
    }

    /// Deletes the persisted journal. Missing files are not an error.
    pub fn clear(&self) -> Result<(), JournalError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&self.path)(e)),
        }
        info!(deployment = %self.deployment_id, "Cleared journal");
        self.sync_dir()
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> Result<(), JournalError> {
        if let Some(dir) = self.path.parent() {
            File::open(dir)
                .and_then(|d| d.sync_all())
                .map_err(io_error(dir))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<(), JournalError> {
        Ok(())
    }
}

impl Drop for JournalStore {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock) {
            error!(path = %self.lock_path.display(), error = %e, "Failed to release journal lock");
        } else {
            debug!(path = %self.lock_path.display(), "Released journal lock");
        }
    }
}
