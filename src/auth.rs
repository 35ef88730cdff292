//! Operator accounts with bcrypt password hashes.
//!
//! One [`PasswordPolicy`] governs hashing cost, minimum length, how long an
//! administrator may keep a password, and how many previous passwords are
//! remembered. Failed logins are counted per user in `local_settings`
//! (category "auth_lockout") so a lockout survives a restart.

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_ADMIN_USER: &str = "admin";
const DEFAULT_ADMIN_PASSWORD: &str = "admin123";

const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const LOCKOUT_CATEGORY: &str = "auth_lockout";
const TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordPolicy {
    /// Administrators must change a password older than this.
    pub max_age_days: i64,
    /// A new password may not repeat any of this many previous ones.
    pub history_depth: usize,
    pub min_length: usize,
    pub bcrypt_cost: u32,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            history_depth: 3,
            min_length: 6,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl PasswordPolicy {
    /// Cheap hashing so tests stay fast.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            bcrypt_cost: 4,
            ..Self::default()
        }
    }

    fn check_length(&self, password: &str) -> PosResult<()> {
        if password.chars().count() < self.min_length {
            return Err(PosError::validation(format!(
                "password must have at least {} characters",
                self.min_length
            )));
        }
        Ok(())
    }

    fn is_expired(&self, is_admin: bool, changed_on: Option<NaiveDate>, today: NaiveDate) -> bool {
        if !is_admin {
            return false;
        }
        match changed_on {
            Some(date) => (today - date).num_days() >= self.max_age_days,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginOutcome {
    pub username: String,
    pub is_admin: bool,
    /// The operator must pick a new password before using the system.
    pub must_change_password: bool,
}

struct UserRow {
    password_hash: String,
    is_admin: bool,
    changed_on: Option<NaiveDate>,
}

fn load_user(conn: &Connection, username: &str) -> PosResult<Option<UserRow>> {
    Ok(conn
        .query_row(
            "SELECT password_hash, is_admin, password_changed_on FROM users WHERE username = ?1",
            params![username],
            |row| {
                Ok(UserRow {
                    password_hash: row.get(0)?,
                    is_admin: row.get(1)?,
                    changed_on: row.get(2)?,
                })
            },
        )
        .optional()?)
}

// ---------------------------------------------------------------------------
// Lockout
// ---------------------------------------------------------------------------

struct LockoutEntry {
    attempts: u32,
    last_attempt: Option<NaiveDateTime>,
}

fn load_lockout(conn: &Connection, username: &str) -> LockoutEntry {
    let attempts = db::get_setting(conn, LOCKOUT_CATEGORY, &format!("{username}.attempts"))
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    let last_attempt = db::get_setting(conn, LOCKOUT_CATEGORY, &format!("{username}.last_attempt"))
        .and_then(|v| NaiveDateTime::parse_from_str(&v, TIMESTAMP).ok());
    LockoutEntry {
        attempts,
        last_attempt,
    }
}

fn persist_lockout(conn: &Connection, username: &str, entry: &LockoutEntry) -> PosResult<()> {
    db::set_setting(
        conn,
        LOCKOUT_CATEGORY,
        &format!("{username}.attempts"),
        &entry.attempts.to_string(),
    )?;
    if let Some(at) = entry.last_attempt {
        db::set_setting(
            conn,
            LOCKOUT_CATEGORY,
            &format!("{username}.last_attempt"),
            &at.format(TIMESTAMP).to_string(),
        )?;
    }
    Ok(())
}

fn check_lockout(entry: &LockoutEntry, now: NaiveDateTime) -> PosResult<()> {
    if entry.attempts < MAX_FAILED_ATTEMPTS {
        return Ok(());
    }
    let Some(last) = entry.last_attempt else {
        return Ok(());
    };
    let elapsed = (now - last).num_minutes();
    if elapsed < LOCKOUT_MINUTES {
        return Err(PosError::PermissionDenied(format!(
            "too many failed attempts; try again in {} minutes",
            LOCKOUT_MINUTES - elapsed
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

fn hash(policy: &PasswordPolicy, password: &str) -> PosResult<String> {
    Ok(bcrypt::hash(password, policy.bcrypt_cost)?)
}

fn today_stamp(today: NaiveDate) -> String {
    today.and_time(chrono::NaiveTime::MIN).format(TIMESTAMP).to_string()
}

/// Make sure the `admin` account exists and is an administrator.
///
/// A freshly seeded admin has no change date, so its first login must
/// change the default password. Returns `true` when the account was created.
pub fn ensure_admin_user(db: &DbState, policy: &PasswordPolicy) -> PosResult<bool> {
    let conn = db.lock()?;
    if let Some(user) = load_user(&conn, DEFAULT_ADMIN_USER)? {
        if !user.is_admin {
            conn.execute(
                "UPDATE users SET is_admin = 1 WHERE username = ?1",
                params![DEFAULT_ADMIN_USER],
            )?;
            warn!("Restored administrator flag on the admin account");
        }
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO users (username, password_hash, is_admin, password_changed_on) VALUES (?1, ?2, 1, NULL)",
        params![DEFAULT_ADMIN_USER, hash(policy, DEFAULT_ADMIN_PASSWORD)?],
    )?;
    info!("Seeded default admin account");
    Ok(true)
}

pub fn create_user(
    db: &DbState,
    policy: &PasswordPolicy,
    username: &str,
    password: &str,
    is_admin: bool,
) -> PosResult<()> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Err(PosError::validation("username and password are required"));
    }
    policy.check_length(password)?;
    let hashed = hash(policy, password)?;
    let today = chrono::Local::now().date_naive();

    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO users (username, password_hash, is_admin, password_changed_on)
         VALUES (?1, ?2, ?3, ?4)",
        params![username, hashed, is_admin, today],
    )?;
    if inserted == 0 {
        return Err(PosError::Conflict(format!("user {username} already exists")));
    }
    tx.execute(
        "INSERT INTO password_history (username, password_hash, changed_at) VALUES (?1, ?2, ?3)",
        params![username, hashed, today_stamp(today)],
    )?;
    tx.commit()?;
    info!(username, is_admin, "User created");
    Ok(())
}

/// Check credentials at `now`.
pub fn login(
    db: &DbState,
    policy: &PasswordPolicy,
    username: &str,
    password: &str,
    now: NaiveDateTime,
) -> PosResult<LoginOutcome> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Err(PosError::validation("username and password are required"));
    }

    let conn = db.lock()?;
    let mut lockout = load_lockout(&conn, username);
    check_lockout(&lockout, now)?;
    if lockout.attempts >= MAX_FAILED_ATTEMPTS {
        // lockout window has passed
        lockout.attempts = 0;
        persist_lockout(&conn, username, &lockout)?;
    }

    let user = load_user(&conn, username)?;
    let verified = match &user {
        Some(u) => bcrypt::verify(password, &u.password_hash)?,
        None => false,
    };

    let Some(user) = user.filter(|_| verified) else {
        lockout.attempts = lockout.attempts.saturating_add(1);
        lockout.last_attempt = Some(now);
        persist_lockout(&conn, username, &lockout)?;
        warn!(username, attempts = lockout.attempts, "Failed login");
        return Err(PosError::PermissionDenied("invalid username or password".into()));
    };

    if lockout.attempts > 0 {
        db::set_setting(&conn, LOCKOUT_CATEGORY, &format!("{username}.attempts"), "0")?;
    }

    let must_change_password = policy.is_expired(user.is_admin, user.changed_on, now.date());
    info!(username, must_change_password, "Login succeeded");
    Ok(LoginOutcome {
        username: username.to_string(),
        is_admin: user.is_admin,
        must_change_password,
    })
}

/// Set a new password, refusing any of the last `history_depth` ones.
pub fn change_password(
    db: &DbState,
    policy: &PasswordPolicy,
    username: &str,
    new_password: &str,
    today: NaiveDate,
) -> PosResult<()> {
    policy.check_length(new_password)?;

    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    let user = load_user(&tx, username)?
        .ok_or_else(|| PosError::not_found(format!("user {username}")))?;

    let mut recent: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT password_hash FROM password_history WHERE username = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![username, policy.history_depth as i64], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        rows
    };
    // Seeded accounts have no history row for their current password.
    if !recent.contains(&user.password_hash) {
        recent.push(user.password_hash.clone());
    }
    for old in recent.iter().take(policy.history_depth.max(1)) {
        if bcrypt::verify(new_password, old)? {
            return Err(PosError::validation(format!(
                "the new password cannot repeat any of the last {} passwords",
                policy.history_depth
            )));
        }
    }

    let hashed = hash(policy, new_password)?;
    tx.execute(
        "UPDATE users SET password_hash = ?2, password_changed_on = ?3 WHERE username = ?1",
        params![username, hashed, today],
    )?;
    tx.execute(
        "INSERT INTO password_history (username, password_hash, changed_at) VALUES (?1, ?2, ?3)",
        params![username, hashed, today_stamp(today)],
    )?;
    tx.commit()?;
    info!(username, "Password changed");
    Ok(())
}

pub(crate) fn is_admin_on(conn: &Connection, username: &str) -> PosResult<bool> {
    Ok(load_user(conn, username)?.map(|u| u.is_admin).unwrap_or(false))
}

pub fn is_admin(db: &DbState, username: &str) -> PosResult<bool> {
    let conn = db.lock()?;
    is_admin_on(&conn, username)
}

pub(crate) fn require_admin_on(conn: &Connection, username: &str) -> PosResult<()> {
    if is_admin_on(conn, username)? {
        Ok(())
    } else {
        Err(PosError::PermissionDenied(format!(
            "{username} is not an administrator"
        )))
    }
}

pub fn require_admin(db: &DbState, username: &str) -> PosResult<()> {
    let conn = db.lock()?;
    require_admin_on(&conn, username)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
