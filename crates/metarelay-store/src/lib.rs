//! SQLite-backed local event store: per-repo cursors, the dedup event log,
//! and the dispatch-result log.
//!
//! One connection behind a mutex serializes all writes; every operation
//! commits before returning. The database file is owner-only (0600, parent
//! directory 0700) since dispatch output can carry anything a handler
//! printed.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use metarelay_core::{DispatchOutcome, DispatchRecord, Event, EventStore, StoreError};

mod schema;

pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_private_dir(parent)?;
            }
        }
        let preexisting = path.exists();
        let conn = Connection::open(path).map_err(StoreError::backend)?;
        schema::migrate(&conn).map_err(StoreError::backend)?;
        tighten_file_mode(path, preexisting)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::backend)?;
        schema::migrate(&conn).map_err(StoreError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("store mutex is poisoned".to_string()))
    }

    /// Dispatch rows recorded for one event, in handler-name order.
    pub fn list_dispatches(&self, remote_id: i64) -> Result<Vec<DispatchRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT remote_id, handler_name, outcome, exit_status, stdout, stderr,
                        started_at, ended_at
                 FROM dispatch_log WHERE remote_id = ?1 ORDER BY handler_name ASC",
            )
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map(params![remote_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<i32>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(StoreError::backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::backend)?;

        rows.into_iter()
            .map(
                |(remote_id, handler_name, outcome, exit_status, stdout, stderr, started, ended)| {
                    Ok(DispatchRecord {
                        remote_id,
                        handler_name,
                        outcome: DispatchOutcome::parse(&outcome).ok_or_else(|| {
                            StoreError::Backend(format!("unknown outcome '{outcome}'"))
                        })?,
                        exit_status,
                        stdout,
                        stderr,
                        started_at: parse_timestamp(&started)?,
                        ended_at: parse_timestamp(&ended)?,
                    })
                },
            )
            .collect()
    }
}

impl EventStore for SqliteEventStore {
    fn get_cursor(&self, repo: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT last_id FROM cursors WHERE repo = ?1",
            params![repo],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::backend)
    }

    fn set_cursor(&self, repo: &str, remote_id: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(StoreError::backend)?;
        let stored: Option<i64> = tx
            .query_row(
                "SELECT last_id FROM cursors WHERE repo = ?1",
                params![repo],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::backend)?;
        if let Some(stored) = stored {
            if remote_id < stored {
                return Err(StoreError::StaleCursor {
                    repo: repo.to_string(),
                    stored,
                    requested: remote_id,
                });
            }
        }
        tx.execute(
            "INSERT INTO cursors (repo, last_id, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(repo) DO UPDATE SET
                 last_id = excluded.last_id,
                 updated_at = excluded.updated_at",
            params![repo, remote_id, Utc::now().to_rfc3339()],
        )
        .map_err(StoreError::backend)?;
        tx.commit().map_err(StoreError::backend)
    }

    fn try_claim(&self, event: &Event) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO event_log
                     (remote_id, delivery_id, repo, event_type, action, claimed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.id,
                    event.delivery_id,
                    event.repo,
                    event.event_type,
                    event.action,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(StoreError::backend)?;
        Ok(inserted > 0)
    }

    fn record_dispatch(&self, record: &DispatchRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO dispatch_log
                 (remote_id, handler_name, outcome, exit_status, stdout, stderr,
                  started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.remote_id,
                record.handler_name,
                record.outcome.as_str(),
                record.exit_status,
                record.stdout,
                record.stderr,
                record.started_at.to_rfc3339(),
                record.ended_at.to_rfc3339()
            ],
        )
        .map_err(StoreError::backend)?;
        Ok(())
    }

    fn list_cursors(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT repo, last_id FROM cursors ORDER BY repo ASC")
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(StoreError::backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::backend)?;
        Ok(rows)
    }

    fn any_claimed_between(&self, repo: &str, low: i64, high: i64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT 1 FROM event_log
             WHERE repo = ?1 AND remote_id > ?2 AND remote_id < ?3 LIMIT 1",
            params![repo, low, high],
            |_| Ok(()),
        )
        .optional()
        .map_err(StoreError::backend)
        .map(|row| row.is_some())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(StoreError::backend)
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
fn tighten_file_mode(path: &Path, preexisting: bool) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = std::fs::metadata(path)?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        if preexisting {
            tracing::warn!(
                path = %path.display(),
                mode = %format!("{mode:o}"),
                "database file had permissive mode; tightening to 0600"
            );
        }
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn tighten_file_mode(_path: &Path, _preexisting: bool) -> Result<(), StoreError> {
    Ok(())
}
