//! Online backups of SQLite databases.
//!
//! Backups are written with `VACUUM INTO` as `<stem>.<YYYYMMDDHHMMSSffffff>.<ext>`
//! next to the database file (or in the configured backup directory), so the
//! timestamp orders them.
//!
//! Restoring the `n`th newest backup leaves the `n` newer ones describing states the
//! database no longer has. They stay available (another restore can go back to
//! them) until the next backup, which deletes them first.

use crate::db::coordinator::Coordinator;
use crate::db::dialect::RenderedStatement;
use crate::db::executor;
use crate::error::{DbError, DbResult};
use crate::models::Value;
use chrono::Utc;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%6f";
const TIMESTAMP_LEN: usize = 20;

/// Where backups of a database go and how they are named.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BackupLayout {
    directory: PathBuf,
    stem: String,
    extension: Option<String>,
}

impl BackupLayout {
    fn for_coordinator(coordinator: &Coordinator) -> DbResult<Self> {
        let manager = coordinator.manager();
        if !manager.db_type().is_embedded() {
            return Err(DbError::unsupported("backup", manager.db_type().display_name()));
        }
        let db_path = manager.params().file_path().ok_or_else(|| {
            DbError::invalid_input("In-memory databases cannot be backed up or restored")
        })?;
        Self::new(db_path, manager.options().backup_directory.as_deref())
    }

    fn new(db_path: &Path, backup_directory: Option<&Path>) -> DbResult<Self> {
        let stem = db_path
            .file_stem()
            .and_then(OsStr::to_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                DbError::invalid_input(format!(
                    "Cannot derive a backup name from '{}'",
                    db_path.display()
                ))
            })?
            .to_string();
        let directory = match backup_directory {
            Some(dir) => dir.to_path_buf(),
            None => db_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        Ok(Self {
            directory,
            stem,
            extension: db_path
                .extension()
                .and_then(OsStr::to_str)
                .map(str::to_string),
        })
    }

    fn file_name(&self, timestamp: &str) -> String {
        match &self.extension {
            Some(ext) => format!("{}.{}.{}", self.stem, timestamp, ext),
            None => format!("{}.{}", self.stem, timestamp),
        }
    }

    /// The timestamp part of a backup file name, if the name is one of ours.
    fn timestamp_of<'a>(&self, file_name: &'a str) -> Option<&'a str> {
        let rest = file_name.strip_prefix(&self.stem)?.strip_prefix('.')?;
        let ts = match &self.extension {
            Some(ext) => rest.strip_suffix(ext.as_str())?.strip_suffix('.')?,
            None => rest,
        };
        (ts.len() == TIMESTAMP_LEN && ts.bytes().all(|b| b.is_ascii_digit())).then_some(ts)
    }
}

/// Write a consistent copy of the database and return its path.
pub async fn backup(coordinator: &Coordinator) -> DbResult<PathBuf> {
    let layout = BackupLayout::for_coordinator(coordinator)?;
    tokio::fs::create_dir_all(&layout.directory)
        .await
        .map_err(|e| io_error("create backup directory", &layout.directory, e))?;

    let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
    let target = layout.directory.join(layout.file_name(&timestamp));
    let target_str = target
        .to_str()
        .ok_or_else(|| DbError::invalid_input("Backup path is not valid UTF-8"))?
        .to_string();

    // VACUUM cannot run inside a transaction; hold admission instead
    let _admission = coordinator.admit().await?;
    prune_orphaned(coordinator, &layout).await?;
    let manager = coordinator.manager();
    let mut conn = manager.acquire().await?;
    let stmt = RenderedStatement {
        sql: "VACUUM INTO ?".to_string(),
        params: vec![Value::Text(target_str)],
    };
    executor::execute(
        &mut conn,
        coordinator.dialect(),
        &stmt,
        manager.options().query_timeout,
    )
    .await?;

    info!(
        database = %manager.params().label(),
        backup = %target.display(),
        "Backup written"
    );
    Ok(target)
}

/// Delete the backups made after the one last restored.
async fn prune_orphaned(coordinator: &Coordinator, layout: &BackupLayout) -> DbResult<()> {
    let orphaned = coordinator.take_orphaned_backups();
    if orphaned == 0 {
        return Ok(());
    }
    let backups = list_in(layout).await?;
    for path in backups.iter().take(orphaned) {
        debug!(backup = %path.display(), "Removing backup newer than the restored state");
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| io_error("remove backup", path, e))?;
    }
    Ok(())
}

/// Backups of the database, newest first.
pub async fn list_backups(coordinator: &Coordinator) -> DbResult<Vec<PathBuf>> {
    let layout = BackupLayout::for_coordinator(coordinator)?;
    list_in(&layout).await
}

async fn list_in(layout: &BackupLayout) -> DbResult<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(&layout.directory).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error("read backup directory", &layout.directory, e)),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("read backup directory", &layout.directory, e))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(ts) = layout.timestamp_of(name) {
            found.push((ts.to_string(), entry.path()));
        }
    }
    found.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

/// Replace the database file with the `nth` newest backup (0 is the newest).
///
/// The pool is closed first and reconnects lazily on the next operation.
pub async fn restore(coordinator: &Coordinator, nth: usize) -> DbResult<PathBuf> {
    let layout = BackupLayout::for_coordinator(coordinator)?;
    let backups = list_in(&layout).await?;
    let source = backups.get(nth).cloned().ok_or_else(|| {
        DbError::invalid_input(format!(
            "No backup #{} ({} available)",
            nth,
            backups.len()
        ))
    })?;

    let _admission = coordinator.admit().await?;
    let manager = coordinator.manager();
    let db_path = manager
        .params()
        .file_path()
        .ok_or_else(|| DbError::internal("Restore target has no file path"))?
        .to_path_buf();

    manager.reset().await;
    let _file_lock = manager.lock_file().await?;

    // Journal files belong to the replaced database
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut journal = db_path.clone().into_os_string();
        journal.push(suffix);
        if let Err(e) = tokio::fs::remove_file(&journal).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(file = ?journal, error = %e, "Could not remove journal file");
            }
        }
    }
    tokio::fs::copy(&source, &db_path)
        .await
        .map_err(|e| io_error("restore backup", &source, e))?;

    info!(
        database = %manager.params().label(),
        backup = %source.display(),
        "Database restored from backup"
    );
    coordinator.record_restore(nth);
    Ok(source)
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> DbError {
    DbError::database(
        format!("Failed to {} '{}': {}", action, path.display(), err),
        None,
        "Check that the path exists and is writable",
    )
}
