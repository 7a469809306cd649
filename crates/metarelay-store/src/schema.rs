use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cursors (
            repo TEXT PRIMARY KEY,
            last_id INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS event_log (
            remote_id INTEGER PRIMARY KEY,
            delivery_id TEXT UNIQUE,
            repo TEXT NOT NULL,
            event_type TEXT NOT NULL,
            action TEXT NOT NULL,
            claimed_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_event_log_repo_id ON event_log(repo, remote_id);

        CREATE TABLE IF NOT EXISTS dispatch_log (
            remote_id INTEGER NOT NULL,
            handler_name TEXT NOT NULL,
            outcome TEXT NOT NULL,
            exit_status INTEGER,
            stdout TEXT NOT NULL,
            stderr TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT NOT NULL,
            PRIMARY KEY (remote_id, handler_name)
        );
        ",
    )?;

    Ok(())
}
