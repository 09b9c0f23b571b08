//! Crash-safe on-disk journal of live jobs.
//!
//! Each live job is one `<job-id>.json` file, rewritten whenever its attempt
//! count changes and removed once the job reaches a terminal state. Writes
//! follow write-to-temp-then-rename:
//!
//! 1. Write to `<job-id>.json.tmp`
//! 2. fsync the temp file
//! 3. Rename to `<job-id>.json`
//! 4. fsync the directory
//!
//! On POSIX systems the rename only updates the directory entry, so without
//! step 4 the new name may not survive a power loss.
//!
//! A journal belongs to one process at a time: opening takes an exclusive
//! advisory lock on `<dir>/.lock`, held until the last clone is dropped.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::JobId;

use super::job::Job;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another process has the journal open.
    #[error("journal {} is locked by another process", .0.display())]
    Locked(PathBuf),
}

pub type Result<T> = std::result::Result<T, JournalError>;

const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone)]
pub struct JobJournal {
    dir: PathBuf,
    _lock: Arc<File>,
}

impl JobJournal {
    /// Opens (creating if needed) a journal rooted at `dir`.
    ///
    /// Fails with [`JournalError::Locked`] if another process holds it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if let Err(e) = lock.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(JournalError::Locked(dir));
            }
            return Err(e.into());
        }
        debug!(dir = %dir.display(), "locked job journal");

        Ok(JobJournal {
            dir,
            _lock: Arc::new(lock),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn job_path(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Durably writes `job`, replacing any previous version.
    pub fn write(&self, job: &Job) -> Result<()> {
        let path = self.job_path(job.id);
        let temp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(job)?;

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            file.write_all(&bytes)?;
            fsync_file(&file)?;
        }

        std::fs::rename(&temp_path, &path)?;
        fsync_dir(&self.dir)?;
        Ok(())
    }

    /// Removes the journal entry for `id`. Missing entries are not an error.
    pub fn remove(&self, id: JobId) -> Result<()> {
        match std::fs::remove_file(self.job_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        fsync_dir(&self.dir)?;
        Ok(())
    }

    /// Loads every journaled job, oldest first.
    ///
    /// Leftover temp files from interrupted writes are deleted. Entries that
    /// fail to parse are renamed to `.corrupt` and skipped.
    pub fn load_all(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.ends_with(".json.tmp") {
                debug!(path = %path.display(), "removing interrupted journal write");
                std::fs::remove_file(&path)?;
                continue;
            }
            if !name.ends_with(".json") {
                continue;
            }

            let parsed = std::fs::read(&path)
                .map_err(JournalError::from)
                .and_then(|bytes| serde_json::from_slice::<Job>(&bytes).map_err(JournalError::from));
            match parsed {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "quarantining corrupt journal entry");
                    std::fs::rename(&path, path.with_extension("json.corrupt"))?;
                }
            }
        }

        jobs.sort_by_key(|job| job.enqueued_at);
        Ok(jobs)
    }
}

fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}
