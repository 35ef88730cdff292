//! Background loops: periodic drawer rollover and automatic backups.
//!
//! Each loop owns its own [`DbState`] (a second connection to the same
//! file) and runs the blocking store work on tokio's blocking pool.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backup::{self, BackupConfig};
use crate::db::DbState;
use crate::ledger;
use crate::reports::ReportSink;

/// First automatic backup runs this long after startup.
pub const BACKUP_FIRST_DELAY: Duration = Duration::from_secs(5 * 60);
/// Then every this often.
pub const BACKUP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Shared stop flag for every loop started from it.
#[derive(Clone)]
pub struct SchedulerState {
    is_running: Arc<AtomicBool>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Loops exit at their next wake-up.
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

fn local_now() -> chrono::NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Close stale drawer days every `interval`.
pub fn start_rollover_loop(
    db: Arc<DbState>,
    reports: Arc<dyn ReportSink>,
    state: SchedulerState,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Rollover loop started");
        loop {
            tokio::time::sleep(interval).await;
            if !state.is_running() {
                info!("Rollover loop stopped");
                break;
            }

            let db = db.clone();
            let reports = reports.clone();
            let result = tokio::task::spawn_blocking(move || {
                ledger::rollover(&db, reports.as_ref(), local_now().date())
            })
            .await;

            match result {
                Ok(Ok(outcomes)) => {
                    let closed = outcomes.iter().filter(|o| o.is_closed()).count();
                    if closed > 0 {
                        info!(closed, "Periodic rollover closed stale days");
                    }
                }
                Ok(Err(e)) => error!("Periodic rollover failed: {e}"),
                Err(e) => error!("Rollover task panicked: {e}"),
            }
        }
    })
}

/// Snapshot the database and copy documents into `cfg`, first after
/// `first_delay`, then every `interval`.
pub fn start_backup_loop(
    db: Arc<DbState>,
    cfg: BackupConfig,
    data_dir: PathBuf,
    state: SchedulerState,
    first_delay: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            first_delay_secs = first_delay.as_secs(),
            interval_secs = interval.as_secs(),
            "Backup loop started"
        );
        let mut wait = first_delay;
        loop {
            tokio::time::sleep(wait).await;
            wait = interval;
            if !state.is_running() {
                info!("Backup loop stopped");
                break;
            }

            let db = db.clone();
            let cfg = cfg.clone();
            let data_dir = data_dir.clone();
            let result = tokio::task::spawn_blocking(move || {
                backup::run_full_backup(&db, &cfg, &data_dir, local_now())
            })
            .await;

            match result {
                Ok(report) if !report.is_clean() => {
                    warn!(failures = report.failures.len(), "Automatic backup incomplete");
                }
                Ok(_) => {}
                Err(e) => error!("Backup task panicked: {e}"),
            }
        }
    })
}
