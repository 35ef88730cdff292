//! Self-update from the project's GitHub branch.
//!
//! The installed version lives in a plain `VERSION` file. When the remote
//! marker differs, the branch archive is downloaded and fully extracted into
//! a temporary directory first; only then is the new tree copied over the
//! installation, leaving alone every path in the [`UpdateManifest`]. The
//! temporary directory is removed on every exit path.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{AppConfig, UpdateSettings};
use crate::db::DB_FILE_NAME;
use crate::error::{PosError, PosResult};

pub const VERSION_FILE: &str = "VERSION";
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Where releases come from.
pub trait ReleaseSource {
    /// The published version marker, already trimmed.
    fn remote_version(&self) -> PosResult<String>;
    /// Save the release archive (a zip) at `dest`.
    fn download_archive(&self, dest: &Path) -> PosResult<()>;
}

/// Replaces the running process with the freshly installed one.
pub trait Relauncher {
    fn relaunch(&self) -> PosResult<()>;
}

pub struct GithubSource {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    client: Client,
}

impl GithubSource {
    pub fn new(settings: &UpdateSettings) -> PosResult<Self> {
        let client = Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .user_agent(concat!("loja-pos/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            owner: settings.owner.clone(),
            repo: settings.repo.clone(),
            branch: settings.branch.clone(),
            client,
        })
    }

    pub fn version_url(&self) -> String {
        format!(
            "https://raw.githubusercontent.com/{}/{}/{}/{VERSION_FILE}",
            self.owner, self.repo, self.branch
        )
    }

    pub fn archive_url(&self) -> String {
        format!(
            "https://github.com/{}/{}/archive/refs/heads/{}.zip",
            self.owner, self.repo, self.branch
        )
    }
}

impl ReleaseSource for GithubSource {
    fn remote_version(&self) -> PosResult<String> {
        let body = self
            .client
            .get(self.version_url())
            .timeout(VERSION_TIMEOUT)
            .send()?
            .error_for_status()?
            .text()?;
        Ok(body.trim().to_string())
    }

    fn download_archive(&self, dest: &Path) -> PosResult<()> {
        let mut resp = self
            .client
            .get(self.archive_url())
            .send()?
            .error_for_status()?;
        let mut file = File::create(dest)?;
        let bytes = resp.copy_to(&mut file)?;
        info!(bytes, url = %self.archive_url(), "Update archive downloaded");
        Ok(())
    }
}

/// Re-executes the current binary with the same arguments.
pub struct ProcessRelauncher;

impl Relauncher for ProcessRelauncher {
    fn relaunch(&self) -> PosResult<()> {
        let exe = std::env::current_exe()?;
        let args: Vec<String> = std::env::args().skip(1).collect();
        info!(exe = %exe.display(), "Restarting after update");
        replace_process(&exe, &args)
    }
}

#[cfg(unix)]
fn replace_process(exe: &Path, args: &[String]) -> PosResult<()> {
    use std::os::unix::process::CommandExt;
    // exec only returns on failure
    Err(Command::new(exe).args(args).exec().into())
}

#[cfg(not(unix))]
fn replace_process(exe: &Path, args: &[String]) -> PosResult<()> {
    Command::new(exe).args(args).spawn()?;
    std::process::exit(0)
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Relative paths (files or whole directories) an update must never touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateManifest {
    preserve: Vec<PathBuf>,
}

impl Default for UpdateManifest {
    fn default() -> Self {
        let db_wal = format!("{DB_FILE_NAME}-wal");
        let db_shm = format!("{DB_FILE_NAME}-shm");
        Self::new([
            DB_FILE_NAME,
            db_wal.as_str(),
            db_shm.as_str(),
            "receipts",
            "reports",
            "service_orders",
            "backup",
            "logs",
            ".git",
            crate::config::CONFIG_FILE_NAME,
            crate::mailer::CONFIG_FILE_NAME,
            crate::notify::CONFIG_FILE_NAME,
        ])
    }
}

impl UpdateManifest {
    pub fn new<I, P>(preserve: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            preserve: preserve
                .into_iter()
                .map(|p| p.as_ref().to_path_buf())
                .collect(),
        }
    }

    /// The defaults plus the configured data and backup folders when they
    /// live inside the installation directory.
    pub fn for_config(cfg: &AppConfig) -> Self {
        let mut manifest = Self::default();
        for dir in [&cfg.data_dir, &cfg.backup_dir] {
            match dir.strip_prefix(&cfg.base_dir) {
                // an empty path would cover the whole installation
                Ok(rel) if !rel.as_os_str().is_empty() => {
                    if !manifest.is_preserved(rel) {
                        manifest.preserve.push(rel.to_path_buf());
                    }
                }
                _ => {}
            }
        }
        manifest
    }

    /// True when `rel` is a preserved path or lies inside one. Matching is
    /// per path component, so `reports` does not cover `reports_old`.
    pub fn is_preserved(&self, rel: &Path) -> bool {
        self.preserve.iter().any(|p| rel.starts_with(p))
    }
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    UpToDate {
        version: String,
    },
    Updated {
        from: String,
        to: String,
        files_copied: usize,
        files_unchanged: usize,
    },
}

impl UpdateOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated { .. })
    }
}

/// Installed version: the `VERSION` file, else the compiled package version.
pub fn local_version(install_dir: &Path) -> String {
    fs::read_to_string(install_dir.join(VERSION_FILE))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
}

pub fn check_and_update(
    source: &dyn ReleaseSource,
    install_dir: &Path,
    manifest: &UpdateManifest,
    relauncher: &dyn Relauncher,
) -> PosResult<UpdateOutcome> {
    let local = local_version(install_dir);
    let remote = source.remote_version()?.trim().to_string();
    if remote.is_empty() {
        return Err(PosError::validation("remote version marker is empty"));
    }
    if remote == local {
        info!(version = %local, "Already up to date");
        return Ok(UpdateOutcome::UpToDate { version: local });
    }
    info!(from = %local, to = %remote, "Update available");

    let staging = tempfile::Builder::new().prefix("update_").tempdir()?;
    let archive = staging.path().join("repo.zip");
    source.download_archive(&archive)?;

    let extracted = staging.path().join("src");
    extract_archive(&archive, &extracted)?;
    let root = source_root(&extracted)?;

    let (files_copied, files_unchanged) = install_tree(&root, install_dir, manifest)?;
    fs::write(install_dir.join(VERSION_FILE), &remote)?;
    drop(staging);

    info!(from = %local, to = %remote, files_copied, files_unchanged, "Update installed");
    // the new files are in place either way; a failed relaunch only means
    // the old binary keeps running until the next restart
    if let Err(e) = relauncher.relaunch() {
        error!(version = %remote, "Update installed but relaunch failed: {e}");
    }

    Ok(UpdateOutcome::Updated {
        from: local,
        to: remote,
        files_copied,
        files_unchanged,
    })
}

/// Startup entry point: never fails, only reports whether an update was
/// installed into `cfg.base_dir`.
pub fn run_update_check(cfg: &AppConfig) -> bool {
    if !cfg.update.enabled {
        info!("Automatic update disabled");
        return false;
    }
    let result = GithubSource::new(&cfg.update).and_then(|source| {
        check_and_update(
            &source,
            &cfg.base_dir,
            &UpdateManifest::for_config(cfg),
            &ProcessRelauncher,
        )
    });
    match result {
        Ok(outcome) => outcome.is_updated(),
        Err(e) => {
            error!("Automatic update failed: {e}");
            false
        }
    }
}

fn extract_archive(archive: &Path, dest: &Path) -> PosResult<()> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    fs::create_dir_all(dest)?;
    zip.extract(dest)?;
    Ok(())
}

/// GitHub archives wrap everything in one `<repo>-<branch>/` directory.
fn source_root(extracted: &Path) -> PosResult<PathBuf> {
    let entries: Vec<fs::DirEntry> = fs::read_dir(extracted)?.collect::<Result<_, _>>()?;
    match entries.as_slice() {
        [] => Err(PosError::validation("update archive is empty")),
        [only] if only.file_type()?.is_dir() => Ok(only.path()),
        _ => Ok(extracted.to_path_buf()),
    }
}

fn file_digest(path: &Path) -> PosResult<md5::Digest> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    Ok(md5::compute(&buf))
}

/// Copy `src` over `dest`, skipping preserved paths and files whose content
/// is already identical. Returns (copied, unchanged).
fn install_tree(src: &Path, dest: &Path, manifest: &UpdateManifest) -> PosResult<(usize, usize)> {
    let mut copied = 0;
    let mut unchanged = 0;
    let mut pending = vec![src.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let rel = path
                .strip_prefix(src)
                .map_err(|_| PosError::validation(format!("unexpected path {}", path.display())))?
                .to_path_buf();
            if manifest.is_preserved(&rel) {
                continue;
            }

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() {
                warn!(path = %rel.display(), "Skipping non-regular file in update");
                continue;
            }

            let target = dest.join(&rel);
            if target.is_file() && file_digest(&target)? == file_digest(&path)? {
                unchanged += 1;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&path, &target)?;
            copied += 1;
        }
    }
    Ok((copied, unchanged))
}
