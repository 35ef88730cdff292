//! Backups of the database and the generated documents.
//!
//! The backup root (usually a synced cloud folder) holds one subdirectory
//! per kind. Every function here is best effort from the caller's point of
//! view: a failed backup is logged and never blocks a sale or a day close.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::format;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Database,
    Receipts,
    ServiceOrders,
    Reports,
}

impl BackupKind {
    pub const ALL: [BackupKind; 4] = [
        BackupKind::Database,
        BackupKind::Receipts,
        BackupKind::ServiceOrders,
        BackupKind::Reports,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            BackupKind::Database => "database",
            BackupKind::Receipts => "receipts",
            BackupKind::ServiceOrders => "service_orders",
            BackupKind::Reports => "reports",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub root: PathBuf,
}

impl BackupConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir(&self, kind: BackupKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    pub fn ensure_dirs(&self) -> PosResult<()> {
        for kind in BackupKind::ALL {
            fs::create_dir_all(self.dir(kind))?;
        }
        Ok(())
    }
}

/// Write a consistent snapshot of the open database to
/// `database/loja_<stamp>.db`.
///
/// Uses `VACUUM INTO`, so the copy is transactionally consistent even with
/// WAL enabled and other writers pending.
pub fn backup_database(conn: &Connection, cfg: &BackupConfig, now: NaiveDateTime) -> PosResult<PathBuf> {
    cfg.ensure_dirs()?;
    let dest = cfg
        .dir(BackupKind::Database)
        .join(format!("loja_{}.db", format::file_stamp(now)));
    if dest.exists() {
        return Err(PosError::Conflict(format!(
            "backup {} already exists",
            dest.display()
        )));
    }
    let dest_str = dest
        .to_str()
        .ok_or_else(|| PosError::Config(format!("backup path is not UTF-8: {}", dest.display())))?;
    conn.execute("VACUUM INTO ?1", [dest_str])?;
    info!(path = %dest.display(), "Database backup written");
    Ok(dest)
}

/// Copy one generated document into the backup tree.
pub fn backup_artifact(cfg: &BackupConfig, kind: BackupKind, path: &Path) -> PosResult<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| PosError::validation(format!("not a file: {}", path.display())))?;
    let dir = cfg.dir(kind);
    fs::create_dir_all(&dir)?;
    let dest = dir.join(name);
    fs::copy(path, &dest)?;
    info!(kind = kind.dir_name(), path = %dest.display(), "Document backed up");
    Ok(dest)
}

/// [`backup_artifact`], logging instead of failing.
pub fn backup_artifact_best_effort(cfg: &BackupConfig, kind: BackupKind, path: &Path) -> Option<PathBuf> {
    match backup_artifact(cfg, kind, path) {
        Ok(dest) => Some(dest),
        Err(e) => {
            warn!(kind = kind.dir_name(), path = %path.display(), "Document backup failed: {e}");
            None
        }
    }
}

/// Copy every regular file in `source` into the backup subdirectory for
/// `kind`. A missing source directory copies nothing.
pub fn backup_dir(cfg: &BackupConfig, kind: BackupKind, source: &Path) -> PosResult<usize> {
    if !source.is_dir() {
        return Ok(0);
    }
    let dest_dir = cfg.dir(kind);
    fs::create_dir_all(&dest_dir)?;

    let mut copied = 0;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        fs::copy(entry.path(), dest_dir.join(entry.file_name()))?;
        copied += 1;
    }
    info!(kind = kind.dir_name(), copied, "Bulk backup finished");
    Ok(copied)
}

/// What one scheduled backup run managed to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    pub database: Option<PathBuf>,
    pub documents_copied: usize,
    pub failures: Vec<String>,
}

impl BackupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Database snapshot plus bulk copy of the document folders under
/// `data_dir`. Individual failures are collected, not propagated.
pub fn run_full_backup(db: &DbState, cfg: &BackupConfig, data_dir: &Path, now: NaiveDateTime) -> BackupReport {
    let database = db.lock().and_then(|conn| backup_database(&conn, cfg, now));
    finish_full_backup(database, cfg, data_dir)
}

/// [`run_full_backup`] for a caller that already holds the connection.
pub fn run_full_backup_on(conn: &Connection, cfg: &BackupConfig, data_dir: &Path, now: NaiveDateTime) -> BackupReport {
    finish_full_backup(backup_database(conn, cfg, now), cfg, data_dir)
}

fn finish_full_backup(database: PosResult<PathBuf>, cfg: &BackupConfig, data_dir: &Path) -> BackupReport {
    let mut report = BackupReport::default();

    match database {
        Ok(path) => report.database = Some(path),
        Err(e) => {
            warn!("Database backup failed: {e}");
            report.failures.push(format!("database: {e}"));
        }
    }

    for kind in [BackupKind::Receipts, BackupKind::ServiceOrders, BackupKind::Reports] {
        match backup_dir(cfg, kind, &data_dir.join(kind.dir_name())) {
            Ok(n) => report.documents_copied += n,
            Err(e) => {
                warn!(kind = kind.dir_name(), "Bulk backup failed: {e}");
                report.failures.push(format!("{}: {e}", kind.dir_name()));
            }
        }
    }

    if report.is_clean() {
        info!(documents = report.documents_copied, "Automatic backup finished");
    }
    report
}
