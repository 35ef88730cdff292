//! Local SQLite database layer for Loja POS.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the key/value
//! settings table and the shared [`DbState`] handle that every store
//! operation receives by reference.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info};

use crate::error::{PosError, PosResult};

/// File name of the store database inside the data directory.
pub const DB_FILE_NAME: &str = "loja.db";

/// Shared handle holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Wrap an already configured connection.
    pub fn from_connection(conn: Connection, db_path: PathBuf) -> Self {
        Self {
            conn: Mutex::new(conn),
            db_path,
        }
    }

    /// Acquire the connection for one logical operation.
    pub fn lock(&self) -> PosResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PosError::LockPoisoned)
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/loja.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. The file is never deleted or recreated
/// on failure: it holds the store's only copy of its history.
pub fn init(data_dir: &Path) -> PosResult<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = open_and_configure(&db_path).map_err(|e| {
        error!(path = %db_path.display(), "Database open failed: {e}");
        e
    })?;

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState::from_connection(conn, db_path))
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> PosResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
pub(crate) fn run_migrations(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

fn apply(conn: &Connection, version: i32, label: &str, sql: &str) -> PosResult<()> {
    conn.execute_batch(sql).map_err(|e| {
        error!("Migration v{version} failed: {e}");
        PosError::from(e)
    })?;
    info!("Applied migration v{version} ({label})");
    Ok(())
}

/// Migration v1: catalogue, sales and the cash ledger.
fn migrate_v1(conn: &Connection) -> PosResult<()> {
    apply(
        conn,
        1,
        "sales and cash ledger",
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        CREATE TABLE IF NOT EXISTS customers (
            cpf TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            phone TEXT NOT NULL DEFAULT '',
            email TEXT
        );

        CREATE TABLE IF NOT EXISTS products (
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            cost_cents INTEGER NOT NULL DEFAULT 0,
            price_cents INTEGER NOT NULL DEFAULT 0,
            stock INTEGER NOT NULL DEFAULT 0 CHECK (stock >= 0)
        );

        CREATE TABLE IF NOT EXISTS sales (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            customer_name TEXT NOT NULL DEFAULT '',
            cpf TEXT NOT NULL DEFAULT '',
            product_code TEXT,
            product_name TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            total_cents INTEGER NOT NULL,
            payment_method TEXT NOT NULL,
            is_upgrade INTEGER NOT NULL DEFAULT 0,
            sale_date TEXT NOT NULL,
            sale_time TEXT NOT NULL
        );

        -- one row per signed cash movement of the open day
        CREATE TABLE IF NOT EXISTS cash_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            amount_cents INTEGER NOT NULL CHECK (amount_cents <> 0),
            kind TEXT NOT NULL CHECK (kind IN ('sale', 'upgrade', 'service', 'refund', 'outflow')),
            entry_date TEXT NOT NULL,
            entry_time TEXT NOT NULL,
            reason TEXT,
            sale_id INTEGER,
            service_order_id INTEGER,
            CHECK (amount_cents > 0 OR (reason IS NOT NULL AND length(trim(reason)) > 0))
        );

        CREATE TABLE IF NOT EXISTS day_closings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            closing_date TEXT NOT NULL UNIQUE,
            total_cents INTEGER NOT NULL,
            entry_count INTEGER NOT NULL DEFAULT 0,
            closed_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sales_date ON sales(sale_date);
        CREATE INDEX IF NOT EXISTS idx_cash_entries_date ON cash_entries(entry_date);
        CREATE INDEX IF NOT EXISTS idx_customers_name ON customers(name);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
}

/// Migration v2: service orders, returns and the pickup schedule.
fn migrate_v2(conn: &Connection) -> PosResult<()> {
    apply(
        conn,
        2,
        "service orders, returns, schedule",
        "
        CREATE TABLE IF NOT EXISTS service_orders (
            order_number INTEGER PRIMARY KEY AUTOINCREMENT,
            cpf TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL,
            phone TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL,
            order_date TEXT NOT NULL,
            amount_cents INTEGER NOT NULL DEFAULT 0,
            approved INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS returns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item TEXT NOT NULL,
            reason TEXT NOT NULL,
            customer_name TEXT NOT NULL,
            return_date TEXT NOT NULL,
            return_time TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pickup_schedule (
            pickup_date TEXT PRIMARY KEY,
            names TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_returns_date ON returns(return_date, return_time);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
}

/// Migration v3: user accounts and password history.
fn migrate_v3(conn: &Connection) -> PosResult<()> {
    apply(
        conn,
        3,
        "users",
        "
        CREATE TABLE IF NOT EXISTS users (
            username TEXT PRIMARY KEY,
            password_hash TEXT NOT NULL,
            is_admin INTEGER NOT NULL DEFAULT 0,
            password_changed_on TEXT
        );

        CREATE TABLE IF NOT EXISTS password_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE,
            password_hash TEXT NOT NULL,
            changed_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_password_history_user ON password_history(username, changed_at);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> PosResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Delete all settings in a category.
pub fn delete_all_settings(conn: &Connection, category: &str) -> PosResult<()> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![category],
    )?;
    Ok(())
}

/// In-memory database with every migration applied (test helper).
#[cfg(test)]
pub(crate) fn test_db() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .expect("pragma setup");
    run_migrations(&conn).expect("run_migrations should succeed in test");
    DbState::from_connection(conn, PathBuf::from(":memory:"))
}

// ===========================================================================
// Tests
// ===========================================================================
