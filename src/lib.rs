//! Loja POS - single-store point-of-sale back office.
//!
//! The library exposes every store operation (sales, stock, service
//! orders, the cash drawer ledger and its day close) over an explicit
//! [`db::DbState`]. [`run`] is the headless entry point used by the binary:
//! it loads configuration, sets up logging, opens the database, checks for
//! updates, closes stale drawer days and keeps the rollover and backup
//! loops running until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

pub mod auth;
pub mod backup;
pub mod config;
pub mod customers;
pub mod db;
pub mod diagnostics;
pub mod documents;
pub mod error;
pub mod format;
pub mod inventory;
pub mod ledger;
pub mod mailer;
pub mod money;
pub mod notify;
pub mod receipts;
pub mod reports;
pub mod returns;
pub mod sales;
pub mod schedule;
pub mod scheduler;
pub mod service_orders;
pub mod updater;

use crate::backup::BackupConfig;
use crate::config::AppConfig;
use crate::db::DbState;
use crate::documents::DocumentStore;
use crate::notify::{Notifier, TelegramConfig};
use crate::reports::{FileReportSink, ReportSink};
use crate::scheduler::SchedulerState;

// ============================================================================
// Startup helpers
// ============================================================================

/// Directory holding the executable; configuration files and, by default,
/// the data directory live next to it.
fn install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn record_update_check(db: &DbState, base_dir: &std::path::Path) {
    let result = db.lock().and_then(|conn| {
        db::set_setting(
            &conn,
            "updater",
            "last_check",
            &chrono::Local::now().naive_local().to_string(),
        )?;
        db::set_setting(
            &conn,
            "updater",
            "installed_version",
            &updater::local_version(base_dir),
        )
    });
    if let Err(e) = result {
        warn!("Could not record update check: {e}");
    }
}

fn load_notifier(base_dir: &std::path::Path) -> Option<Notifier> {
    match TelegramConfig::load(base_dir) {
        Ok(cfg) => cfg.map(Notifier::new),
        Err(e) => {
            warn!("Telegram configuration unreadable, notifications off: {e}");
            None
        }
    }
}

// ============================================================================
// App entry point
// ============================================================================

pub fn run() -> anyhow::Result<()> {
    let base_dir = install_dir();
    let config = AppConfig::load(&base_dir).context("loading configuration")?;

    // Keep the guard alive for the lifetime of the app; dropping it flushes logs.
    let _log_guard =
        diagnostics::init_logging(&config.logs_dir()).context("initializing logging")?;
    info!(
        base_dir = %config.base_dir.display(),
        data_dir = %config.data_dir.display(),
        "Starting Loja POS v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db = db::init(&config.data_dir).context("opening the store database")?;
    if auth::ensure_admin_user(&db, &auth::PasswordPolicy::default())? {
        warn!(
            user = auth::DEFAULT_ADMIN_USER,
            "Default administrator created; its password must be changed at first login"
        );
    }

    if updater::run_update_check(&config) {
        // Only reached when the relaunch returned without replacing us.
        info!("Update installed; restart to use the new version");
    }
    record_update_check(&db, &config.base_dir);

    let backup_cfg = BackupConfig::new(config.backup_dir.clone());
    if let Err(e) = backup_cfg.ensure_dirs() {
        warn!("Backup folders unavailable: {e}");
    }

    let documents = DocumentStore::from_config(&config);
    let reports: Arc<dyn ReportSink> =
        Arc::new(FileReportSink::new(documents).with_notifier(load_notifier(&config.base_dir)));

    let today = chrono::Local::now().date_naive();
    let closed = ledger::rollover(&db, reports.as_ref(), today)
        .context("closing stale drawer days")?;
    info!(
        days = closed.iter().filter(|o| o.is_closed()).count(),
        "Startup rollover finished"
    );

    // Second connection for the backup loop; the rollover loop keeps this one.
    let backup_db = db::init(&config.data_dir).context("opening backup connection")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;

    runtime.block_on(async move {
        let state = SchedulerState::new();
        let rollover = scheduler::start_rollover_loop(
            Arc::new(db),
            reports,
            state.clone(),
            config.rollover_interval,
        );
        let backups = scheduler::start_backup_loop(
            Arc::new(backup_db),
            backup_cfg,
            config.data_dir.clone(),
            state.clone(),
            scheduler::BACKUP_FIRST_DELAY,
            scheduler::BACKUP_INTERVAL,
        );

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("Shutdown requested");
        state.stop();
        rollover.abort();
        backups.abort();
        Ok::<(), anyhow::Error>(())
    })
}
