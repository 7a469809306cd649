//! Append-only per-repo event journal for external consumers.
//!
//! One JSON object per line under `{repo.path}/.metarelay/events.jsonl`.
//! The file is owner-only and never truncated by the daemon; rotation is
//! the operator's concern. Appends are flushed before the caller advances
//! the cursor, so a consumer tailing the file never runs ahead of it.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use metarelay_core::{Event, StoreError};

const JOURNAL_DIR: &str = ".metarelay";
const JOURNAL_FILE: &str = "events.jsonl";

#[derive(Clone)]
pub struct EventJournal {
    path: PathBuf,
    file: Arc<Mutex<std::fs::File>>,
}

impl EventJournal {
    pub fn open(repo_root: &Path) -> Result<Self, StoreError> {
        let dir = repo_root.join(JOURNAL_DIR);
        create_private_dir(&dir)?;
        let path = dir.join(JOURNAL_FILE);
        let file = open_private_append(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn append(&self, event: &Event) -> Result<(), StoreError> {
        let line = serde_json::to_string(event)
            .map_err(|error| StoreError::Backend(format!("failed to encode event: {error}")))?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| StoreError::Backend("journal mutex is poisoned".to_string()))?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.exists() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(unix)]
fn open_private_append(path: &Path) -> Result<std::fs::File, StoreError> {
    use std::os::unix::fs::OpenOptionsExt;
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)?)
}

#[cfg(not(unix))]
fn open_private_append(path: &Path) -> Result<std::fs::File, StoreError> {
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?)
}
