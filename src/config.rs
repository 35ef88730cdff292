//! Store configuration.
//!
//! Settings come from plain `KEY=value` text files next to the executable
//! (`loja_config.txt`, `email_config.txt`, `telegram_config.txt`), with the
//! process environment as fallback. A missing file is not an error.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{PosError, PosResult};

pub const CONFIG_FILE_NAME: &str = "loja_config.txt";

pub const DEFAULT_UPDATE_OWNER: &str = "andremariano07";
pub const DEFAULT_UPDATE_REPO: &str = "besim_company";
pub const DEFAULT_UPDATE_BRANCH: &str = "main";
const DEFAULT_ROLLOVER_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// KEY=value files
// ---------------------------------------------------------------------------

/// Parsed `KEY=value` file in dotenv syntax: `#` comments, blank lines,
/// quoted values and `export` prefixes are handled by `dotenvy`. Reading a
/// file never touches the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueFile {
    values: HashMap<String, String>,
}

impl KeyValueFile {
    pub fn parse(content: &str) -> PosResult<Self> {
        Self::collect(dotenvy::from_read_iter(content.as_bytes()))
    }

    /// Read and parse `path`. A missing file yields an empty set.
    pub fn load(path: &Path) -> PosResult<Self> {
        match dotenvy::from_path_iter(path) {
            Ok(iter) => Self::collect(iter),
            Err(e) if e.not_found() => {
                debug!(path = %path.display(), "Config file not present");
                Ok(Self::default())
            }
            Err(e) => Err(PosError::Config(format!("{}: {e}", path.display()))),
        }
    }

    fn collect<R: Read>(iter: dotenvy::Iter<R>) -> PosResult<Self> {
        let values = iter
            .collect::<Result<HashMap<_, _>, _>>()
            .map_err(|e| PosError::Config(format!("invalid config line: {e}")))?;
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// File value first, then the environment variable of the same name.
    pub fn get_or_env(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(str::to_string)
            .or_else(|| dotenvy::var(key).ok().filter(|v| !v.trim().is_empty()))
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Application config
// ---------------------------------------------------------------------------

/// Where the self-updater looks for new releases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSettings {
    pub enabled: bool,
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Installation directory; the updater overwrites files here.
    pub base_dir: PathBuf,
    /// Holds the database, generated documents and logs.
    pub data_dir: PathBuf,
    /// Root of the backup tree (`database/`, `receipts/`, ...).
    pub backup_dir: PathBuf,
    pub update: UpdateSettings,
    pub rollover_interval: Duration,
    /// Open generated receipts and reports with the OS viewer.
    pub open_documents: bool,
}

impl AppConfig {
    /// Load `loja_config.txt` from `base_dir`, falling back to `LOJA_*`
    /// environment variables and then to defaults.
    pub fn load(base_dir: &Path) -> PosResult<Self> {
        let file = KeyValueFile::load(&base_dir.join(CONFIG_FILE_NAME))?;
        Self::from_values(base_dir, &file)
    }

    pub fn from_values(base_dir: &Path, file: &KeyValueFile) -> PosResult<Self> {
        let data_dir = file
            .get_or_env("LOJA_DATA_DIR")
            .map(|p| resolve(base_dir, &p))
            .unwrap_or_else(|| base_dir.to_path_buf());

        let backup_dir = file
            .get_or_env("LOJA_BACKUP_DIR")
            .map(|p| resolve(base_dir, &p))
            .unwrap_or_else(|| data_dir.join("backup"));

        let enabled = match file.get_or_env("LOJA_AUTO_UPDATE") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| {
                PosError::Config(format!("LOJA_AUTO_UPDATE must be true or false, got {raw:?}"))
            })?,
            None => true,
        };

        let rollover_secs = match file.get_or_env("LOJA_ROLLOVER_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| {
                    PosError::Config(format!("LOJA_ROLLOVER_SECS must be a positive integer, got {raw:?}"))
                })?,
            None => DEFAULT_ROLLOVER_SECS,
        };

        let open_documents = file
            .get_or_env("LOJA_OPEN_DOCUMENTS")
            .and_then(|raw| {
                let parsed = parse_bool(&raw);
                if parsed.is_none() {
                    warn!(value = %raw, "Ignoring invalid LOJA_OPEN_DOCUMENTS");
                }
                parsed
            })
            .unwrap_or(true);

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            data_dir,
            backup_dir,
            update: UpdateSettings {
                enabled,
                owner: file
                    .get_or_env("LOJA_UPDATE_OWNER")
                    .unwrap_or_else(|| DEFAULT_UPDATE_OWNER.to_string()),
                repo: file
                    .get_or_env("LOJA_UPDATE_REPO")
                    .unwrap_or_else(|| DEFAULT_UPDATE_REPO.to_string()),
                branch: file
                    .get_or_env("LOJA_UPDATE_BRANCH")
                    .unwrap_or_else(|| DEFAULT_UPDATE_BRANCH.to_string()),
            },
            rollover_interval: Duration::from_secs(rollover_secs),
            open_documents,
        })
    }

    pub fn receipts_dir(&self) -> PathBuf {
        self.data_dir.join("receipts")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn service_orders_dir(&self) -> PathBuf {
        self.data_dir.join("service_orders")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn resolve(base_dir: &Path, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw.trim());
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const LOJA_VARS: &[&str] = &[
        "LOJA_DATA_DIR",
        "LOJA_BACKUP_DIR",
        "LOJA_AUTO_UPDATE",
        "LOJA_UPDATE_OWNER",
        "LOJA_UPDATE_REPO",
        "LOJA_UPDATE_BRANCH",
        "LOJA_ROLLOVER_SECS",
        "LOJA_OPEN_DOCUMENTS",
    ];

    fn clear_env() {
        for var in LOJA_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_parses_dotenv_lines() {
        let file = KeyValueFile::parse(
            "# store settings\n\
             EMAIL_GMAIL=loja@example.com\n\
             \n\
             EMAIL_GMAIL_APP=\"abcd efgh\"\n\
             export TELEGRAM_CHAT_ID=-10042\n\
             EMPTY=\n",
        )
        .unwrap();
        assert_eq!(file.get("EMAIL_GMAIL"), Some("loja@example.com"));
        assert_eq!(file.get("EMAIL_GMAIL_APP"), Some("abcd efgh"));
        assert_eq!(file.get("TELEGRAM_CHAT_ID"), Some("-10042"));
        assert_eq!(file.get("EMPTY"), None);
    }

    #[test]
    fn test_malformed_line_is_a_config_error() {
        assert!(matches!(
            KeyValueFile::parse("LOJA_DATA_DIR=dados\nnot a pair\n"),
            Err(PosError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn test_reading_a_file_leaves_environment_alone() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "LOJA_UPDATE_REPO=fork\n").unwrap();

        let file = KeyValueFile::load(&path).unwrap();
        assert_eq!(file.get("LOJA_UPDATE_REPO"), Some("fork"));
        assert!(std::env::var("LOJA_UPDATE_REPO").is_err());
    }

    #[test]
    #[serial]
    fn test_defaults_when_nothing_is_configured() {
        clear_env();
        let base = Path::new("/opt/loja");
        let cfg = AppConfig::from_values(base, &KeyValueFile::default()).unwrap();
        assert_eq!(cfg.data_dir, base);
        assert_eq!(cfg.backup_dir, base.join("backup"));
        assert!(cfg.update.enabled);
        assert_eq!(cfg.update.owner, DEFAULT_UPDATE_OWNER);
        assert_eq!(cfg.update.repo, DEFAULT_UPDATE_REPO);
        assert_eq!(cfg.update.branch, "main");
        assert_eq!(cfg.rollover_interval, Duration::from_secs(60));
        assert_eq!(cfg.reports_dir(), base.join("reports"));
    }

    #[test]
    #[serial]
    fn test_file_values_win_over_environment() {
        clear_env();
        std::env::set_var("LOJA_UPDATE_BRANCH", "beta");
        std::env::set_var("LOJA_DATA_DIR", "/from/env");
        let file = KeyValueFile::parse("LOJA_DATA_DIR=dados\nLOJA_AUTO_UPDATE=no\n").unwrap();

        let cfg = AppConfig::from_values(Path::new("/opt/loja"), &file).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/opt/loja/dados"));
        assert_eq!(cfg.backup_dir, PathBuf::from("/opt/loja/dados/backup"));
        assert!(!cfg.update.enabled);
        assert_eq!(cfg.update.branch, "beta");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_rejects_invalid_values() {
        clear_env();
        let bad_flag = KeyValueFile::parse("LOJA_AUTO_UPDATE=maybe").unwrap();
        assert!(matches!(
            AppConfig::from_values(Path::new("/x"), &bad_flag),
            Err(PosError::Config(_))
        ));
        let bad_secs = KeyValueFile::parse("LOJA_ROLLOVER_SECS=0").unwrap();
        assert!(AppConfig::from_values(Path::new("/x"), &bad_secs).is_err());
    }

    #[test]
    #[serial]
    fn test_load_tolerates_missing_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.data_dir, dir.path());

        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "LOJA_ROLLOVER_SECS=15\n").unwrap();
        let cfg = AppConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.rollover_interval, Duration::from_secs(15));
    }
}
