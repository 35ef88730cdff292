//! Generated documents: receipts, service-order slips and reports.
//!
//! Every document is a plain-text file written into its folder under the
//! data directory, copied into the backup tree, and optionally opened with
//! the OS default viewer. Only the write itself can fail the caller.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::backup::{self, BackupConfig, BackupKind};
use crate::config::AppConfig;
use crate::error::PosResult;

pub const STORE_NAME: &str = "BESIM COMPANY";
pub(crate) const RULE: &str = "--------------------------------------------------------------";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Receipt,
    ServiceOrder,
    Report,
}

impl DocumentKind {
    fn backup_kind(&self) -> BackupKind {
        match self {
            DocumentKind::Receipt => BackupKind::Receipts,
            DocumentKind::ServiceOrder => BackupKind::ServiceOrders,
            DocumentKind::Report => BackupKind::Reports,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentStore {
    data_dir: PathBuf,
    backup: Option<BackupConfig>,
    open_with_viewer: bool,
}

impl DocumentStore {
    /// Documents under `data_dir`, no backup copy, never opened.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            backup: None,
            open_with_viewer: false,
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            data_dir: cfg.data_dir.clone(),
            backup: Some(BackupConfig::new(cfg.backup_dir.clone())),
            open_with_viewer: cfg.open_documents,
        }
    }

    pub fn with_backup(mut self, backup: BackupConfig) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn backup_config(&self) -> Option<&BackupConfig> {
        self.backup.as_ref()
    }

    pub fn dir(&self, kind: DocumentKind) -> PathBuf {
        self.data_dir.join(kind.backup_kind().dir_name())
    }

    /// Write `content` to `<kind dir>/<file_name>`, then back it up and
    /// open it. Returns the written path.
    pub fn save(&self, kind: DocumentKind, file_name: &str, content: &str) -> PosResult<PathBuf> {
        let dir = self.dir(kind);
        fs::create_dir_all(&dir)?;
        let path = dir.join(file_name);
        fs::write(&path, content)?;
        info!(path = %path.display(), "Document written");

        if let Some(cfg) = &self.backup {
            backup::backup_artifact_best_effort(cfg, kind.backup_kind(), &path);
        }
        if self.open_with_viewer {
            open_document(&path);
        }
        Ok(path)
    }
}

/// Open `path` with the OS default application. Failures are logged.
pub fn open_document(path: &Path) {
    let target = path.display().to_string();
    if let Err(e) = webbrowser::open(&target) {
        warn!(path = %target, "Could not open document: {e}");
    }
}
