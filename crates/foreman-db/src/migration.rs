//! Migration-safe schema evolution: timestamped backups, row-count
//! verification, and restore-on-regression.
//!
//! Plain additive migrations run through [`pool::run_migrations`]. This
//! module wraps that with the destructive-migration contract from the
//! spec: back up the store (including WAL/SHM sidecars) before applying,
//! compare a caller-supplied table list's row counts before and after, and
//! roll back to the backup if any table lost rows.

use std::path::{Path, PathBuf};

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::config::ForemanPaths;
use crate::pool;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to back up store before migrating: {0}")]
    BackupUnavailable(String),

    #[error(
        "migration verification failed: table {table} had {before} rows before, {after} after"
    )]
    MigrationVerifyFailed {
        table: String,
        before: i64,
        after: i64,
    },

    #[error("failed to restore store from backup {0}: {1}")]
    RestoreFailed(PathBuf, String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Copy the store file plus its `-wal`/`-shm` sidecars to a timestamped
/// backup path. Returns the path to the primary backup file.
pub fn backup_store(db_path: &Path, paths: &ForemanPaths, reason: &str) -> Result<PathBuf, MigrationError> {
    paths
        .ensure_dirs()
        .map_err(|e| MigrationError::BackupUnavailable(e.to_string()))?;

    let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.3f").to_string();
    let backup_path = paths.backup_path(reason, &timestamp);

    std::fs::copy(db_path, &backup_path)
        .map_err(|e| MigrationError::BackupUnavailable(e.to_string()))?;

    for ext in ["-wal", "-shm"] {
        let sidecar = sidecar_path(db_path, ext);
        if sidecar.exists() {
            let backup_sidecar = sidecar_path(&backup_path, ext);
            std::fs::copy(&sidecar, &backup_sidecar)
                .map_err(|e| MigrationError::BackupUnavailable(e.to_string()))?;
        }
    }

    Ok(backup_path)
}

fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    db_path.with_file_name(name)
}

/// Restore the store from a backup file.
///
/// Validates the candidate is a readable SQLite database containing a
/// `tasks` table before swapping it in, so a corrupt or unrelated backup
/// can never silently replace a good store.
pub async fn restore_from_backup(db_path: &Path, backup_path: &Path) -> Result<(), MigrationError> {
    let opts = pool::connect_options(backup_path, std::time::Duration::from_secs(5));
    let candidate_pool = sqlx::SqlitePool::connect_with(opts)
        .await
        .map_err(|e| MigrationError::RestoreFailed(backup_path.to_path_buf(), e.to_string()))?;

    let has_tasks_table: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'tasks'")
            .fetch_optional(&candidate_pool)
            .await
            .map_err(|e| MigrationError::RestoreFailed(backup_path.to_path_buf(), e.to_string()))?;

    candidate_pool.close().await;

    if has_tasks_table.is_none() {
        return Err(MigrationError::RestoreFailed(
            backup_path.to_path_buf(),
            "candidate backup has no tasks table".to_string(),
        ));
    }

    std::fs::copy(backup_path, db_path)
        .map_err(|e| MigrationError::RestoreFailed(backup_path.to_path_buf(), e.to_string()))?;

    for ext in ["-wal", "-shm"] {
        let backup_sidecar = sidecar_path(backup_path, ext);
        let live_sidecar = sidecar_path(db_path, ext);
        if backup_sidecar.exists() {
            std::fs::copy(&backup_sidecar, &live_sidecar).map_err(|e| {
                MigrationError::RestoreFailed(backup_path.to_path_buf(), e.to_string())
            })?;
        } else {
            let _ = std::fs::remove_file(&live_sidecar);
        }
    }

    Ok(())
}

/// Delete old backups, keeping only the `retain` most recent (by file
/// name, which sorts lexically by timestamp).
pub fn prune_backups(paths: &ForemanPaths, retain: usize) -> Result<(), MigrationError> {
    let dir = paths.backups_dir();
    if !dir.exists() {
        return Ok(());
    }

    let mut backups: Vec<PathBuf> = std::fs::read_dir(&dir)
        .map_err(|e| MigrationError::BackupUnavailable(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.extension().and_then(|e| e.to_str()) == Some("db")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("supervisor-backup-"))
        })
        .collect();

    backups.sort();

    if backups.len() > retain {
        for stale in &backups[..backups.len() - retain] {
            let _ = std::fs::remove_file(stale);
            for ext in ["-wal", "-shm"] {
                let _ = std::fs::remove_file(sidecar_path(stale, ext));
            }
        }
    }

    Ok(())
}

/// Row counts for a caller-supplied list of tables.
async fn row_counts(pool: &SqlitePool, tables: &[&str]) -> Result<Vec<(String, i64)>, MigrationError> {
    let mut counts = Vec::with_capacity(tables.len());
    for table in tables {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .map_err(|e| MigrationError::Other(anyhow::anyhow!(e)))?;
        counts.push(((*table).to_string(), count));
    }
    Ok(counts)
}

/// Apply pending migrations with the full verified-backup contract:
/// backup, apply, compare row counts on `verify_tables`, roll back to the
/// backup on any regression, then prune old backups.
///
/// `verify_tables` should be empty for additive-only migrations (column
/// adds with defaults), which may skip row-count verification but still
/// take a backup.
pub async fn apply_verified(
    pool: &SqlitePool,
    db_path: &Path,
    paths: &ForemanPaths,
    migrations_dir: &Path,
    verify_tables: &[&str],
    backup_retain: usize,
) -> Result<(), MigrationError> {
    let backup_path = backup_store(db_path, paths, "pre-migrate")?;

    let before = row_counts(pool, verify_tables).await?;

    pool::run_migrations_from(pool, migrations_dir)
        .await
        .map_err(MigrationError::Other)?;

    let after = row_counts(pool, verify_tables).await?;

    for ((table, before_count), (_, after_count)) in before.iter().zip(after.iter()) {
        if after_count < before_count {
            pool.close().await;
            restore_from_backup(db_path, &backup_path).await?;
            return Err(MigrationError::MigrationVerifyFailed {
                table: table.clone(),
                before: *before_count,
                after: *after_count,
            });
        }
    }

    prune_backups(paths, backup_retain)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn backup_then_restore_round_trip() {
        let dir = tempdir().expect("tempdir");
        let paths = ForemanPaths::new(dir.path());
        paths.ensure_dirs().expect("ensure dirs");

        let db_path = paths.store_path();
        let pool = sqlx::SqlitePool::connect_with(pool::connect_options(
            &db_path,
            std::time::Duration::from_secs(5),
        ))
        .await
        .expect("connect");
        sqlx::query("CREATE TABLE tasks (id TEXT PRIMARY KEY)")
            .execute(&pool)
            .await
            .expect("create table");
        sqlx::query("INSERT INTO tasks (id) VALUES ('t1')")
            .execute(&pool)
            .await
            .expect("insert");
        pool.close().await;

        let backup = backup_store(&db_path, &paths, "test").expect("backup");
        assert!(backup.exists());

        // Corrupt the live db, then restore.
        std::fs::write(&db_path, b"not a real db").expect("corrupt");
        restore_from_backup(&db_path, &backup)
            .await
            .expect("restore");

        let pool = sqlx::SqlitePool::connect_with(pool::connect_options(
            &db_path,
            std::time::Duration::from_secs(5),
        ))
        .await
        .expect("reconnect");
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn restore_rejects_backup_without_tasks_table() {
        let dir = tempdir().expect("tempdir");
        let paths = ForemanPaths::new(dir.path());
        paths.ensure_dirs().expect("ensure dirs");

        let bogus_backup = paths.backup_path("bogus", "x");
        let pool = sqlx::SqlitePool::connect_with(pool::connect_options(
            &bogus_backup,
            std::time::Duration::from_secs(5),
        ))
        .await
        .expect("connect");
        sqlx::query("CREATE TABLE not_tasks (id TEXT)")
            .execute(&pool)
            .await
            .expect("create table");
        pool.close().await;

        let db_path = paths.store_path();
        std::fs::write(&db_path, b"irrelevant").expect("seed");

        let result = restore_from_backup(&db_path, &bogus_backup).await;
        assert!(result.is_err());
    }

    #[test]
    fn prune_backups_keeps_most_recent() {
        let dir = tempdir().expect("tempdir");
        let paths = ForemanPaths::new(dir.path());
        paths.ensure_dirs().expect("ensure dirs");

        for i in 0..5 {
            let path = paths.backup_path("t", &format!("{i:04}"));
            std::fs::write(&path, b"x").expect("write backup");
        }

        prune_backups(&paths, 2).expect("prune");

        let remaining: Vec<_> = std::fs::read_dir(paths.backups_dir())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(remaining.len(), 2);
    }
}
