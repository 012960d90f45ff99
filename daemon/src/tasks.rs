// Copyright 2025 Oxide Computer Company

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};
use slog::{info, Logger};

#[derive(Debug, thiserror::Error)]
pub enum RepairSchedulingError {
    #[error("task queue error")]
    Database(#[from] rusqlite::Error),

    #[error("cannot open task queue {0:?}")]
    Open(PathBuf, #[source] rusqlite::Error),
}

/// Options attached to a scheduled fsck task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsckFlag {
    /// Mail the operator a report when the walk completes.
    EmailReport,
    /// Re-verify stored file checksums, not just copy counts.
    Checksums,
}

impl std::fmt::Display for FsckFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsckFlag::EmailReport => write!(f, "email"),
            FsckFlag::Checksums => write!(f, "checksums"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: i64,
    pub action: String,
    pub target: PathBuf,
    pub options: Vec<String>,
}

/**
 * Durable queue of repair work handed off to the task executor.
 *
 * Tasks are inserted in the `staged` state and flipped to `queued` in
 * one transaction once a whole batch is complete, so the executor never
 * observes half of a repair plan.  A daemon restart clears leftover
 * staged rows.
 */
pub struct TaskQueue {
    log: Logger,
    conn: Mutex<Connection>,
}

impl TaskQueue {
    pub fn open(
        log: Logger,
        path: &Path,
    ) -> Result<TaskQueue, RepairSchedulingError> {
        let conn = Connection::open(path).map_err(|e| {
            RepairSchedulingError::Open(path.to_path_buf(), e)
        })?;

        /*
         * The queue is shared with the executor process; WAL keeps
         * readers from blocking our inserts, and FULL synchronous
         * keeps a queued task durable across power loss.
         */
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "full")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                action  TEXT NOT NULL,
                target  TEXT NOT NULL,
                options TEXT NOT NULL DEFAULT '',
                state   TEXT NOT NULL DEFAULT 'staged',
                created TEXT NOT NULL
            )",
            [],
        )?;

        let orphaned = conn.execute(
            "DELETE FROM tasks WHERE state = 'staged'",
            [],
        )?;
        if orphaned > 0 {
            info!(
                log,
                "discarded {} staged tasks from an interrupted run",
                orphaned
            );
        }

        Ok(TaskQueue {
            log,
            conn: Mutex::new(conn),
        })
    }

    /**
     * Insert a task in the staged state.  It stays invisible to the
     * executor until `release` commits the batch.
     */
    pub fn stage(
        &self,
        action: &str,
        target: &Path,
        options: &[String],
    ) -> Result<(), RepairSchedulingError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (action, target, options, state, created)
             VALUES (?1, ?2, ?3, 'staged', ?4)",
            params![
                action,
                target.to_string_lossy(),
                options.join("|"),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /**
     * Make every staged task visible to the executor at once.
     */
    pub fn release(&self) -> Result<usize, RepairSchedulingError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE tasks SET state = 'queued' WHERE state = 'staged'",
            [],
        )?;
        if n > 0 {
            info!(self.log, "released {} tasks to the executor", n);
        }
        Ok(n)
    }

    /// Stage and release a single task.
    pub fn enqueue(
        &self,
        action: &str,
        target: &Path,
        options: &[String],
    ) -> Result<(), RepairSchedulingError> {
        self.stage(action, target, options)?;
        self.release()?;
        Ok(())
    }

    pub fn pending(&self) -> Result<Vec<Task>, RepairSchedulingError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, action, target, options FROM tasks
             WHERE state = 'queued' ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let options: String = row.get(3)?;
            Ok(Task {
                id: row.get(0)?,
                action: row.get(1)?,
                target: PathBuf::from(row.get::<_, String>(2)?),
                options: if options.is_empty() {
                    Vec::new()
                } else {
                    options.split('|').map(|s| s.to_string()).collect()
                },
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    #[cfg(test)]
    pub fn staged_count(&self) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE state = 'staged'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .unwrap() as usize
    }
}
