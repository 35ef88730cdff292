//! Diagnostics for Loja POS.
//!
//! Provides:
//! - **Logging setup**: console plus a daily rolling file under `logs/`
//! - **Log rotation**: keeps only the newest [`MAX_LOG_FILES`] files
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Store health**: schema version, database size, open drawer days

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::ledger::{self, DayClosing};

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Rolling log files are named `pos.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "pos";

const DEFAULT_FILTER: &str = "info,loja_pos_lib=debug";

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the global subscriber. The returned guard flushes the file
/// writer when dropped, so the caller keeps it for the process lifetime.
pub fn init_logging(log_dir: &Path) -> PosResult<WorkerGuard> {
    fs::create_dir_all(log_dir)?;
    prune_old_logs(log_dir);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| PosError::Config(format!("logging already initialized: {e}")))?;

    Ok(guard)
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
/// Returns how many files were removed.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .filter(|entry| entry.path().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name == LOG_FILE_PREFIX || name.starts_with("pos."))
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // newest first; names break ties since daily files sort by date
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

// ---------------------------------------------------------------------------
// Store health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    pub schema_version: i32,
    pub db_size_bytes: u64,
    /// Days that still have ledger entries, oldest first.
    pub open_dates: Vec<NaiveDate>,
    pub last_closing: Option<DayClosing>,
    pub product_count: i64,
}

pub fn store_health(db: &DbState) -> PosResult<StoreHealth> {
    let (schema_version, product_count) = {
        let conn = db.lock()?;
        let schema_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        let product_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?;
        (schema_version, product_count)
    }; // lock released before the ledger helpers take their own

    let db_size_bytes = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);
    let open_dates = ledger::open_dates(db)?;
    let last_closing = ledger::closings(db)?.into_iter().next();

    Ok(StoreHealth {
        schema_version,
        db_size_bytes,
        open_dates,
        last_closing,
        product_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::ledger::{EntryKind, NewEntry};
    use crate::money::Money;
    use crate::reports::test_support::MemorySink;

    #[test]
    fn test_about_info_has_required_fields() {
        let info = get_about_info();
        assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
    }

    #[test]
    fn test_prune_keeps_newest_log_files() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=14 {
            fs::write(dir.path().join(format!("pos.2024-05-{day:02}")), "x").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        assert_eq!(prune_old_logs(dir.path()), 4);

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left.len(), MAX_LOG_FILES + 1);
        assert!(left.contains(&"notes.txt".to_string()));
        assert!(!left.contains(&"pos.2024-05-01".to_string()));
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(prune_old_logs(&dir.path().join("nope")), 0);
    }

    #[test]
    fn test_store_health_reports_open_days() {
        let db = test_db();
        let sink = MemorySink::default();
        let at = NaiveDate::from_ymd_opt(2024, 5, 10)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        ledger::record_entry(
            &db,
            &sink,
            NewEntry::new(EntryKind::Sale, Money::from_units(10)),
            at,
        )
        .unwrap();

        let health = store_health(&db).unwrap();
        assert!(health.schema_version >= 3);
        assert_eq!(health.open_dates, vec![at.date()]);
        assert!(health.last_closing.is_none());
    }
}
