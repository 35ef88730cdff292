//! Cash drawer ledger: signed cash movements, day close and rollover.
//!
//! Every sale, upgrade, approved service order, refund and manual outflow
//! becomes one row in `cash_entries`, tagged with its calendar date. Closing
//! a day sums those rows into a `day_closings` record, hands a summary to
//! the [`ReportSink`], and only then purges the day's rows. All three steps
//! run in one SQLite transaction, so a failure at any point leaves the
//! ledger exactly as it was and the day can be closed again.
//!
//! Rollover keeps at most one open date in the table: before anything new
//! is recorded, every older date that still has entries is closed.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::format;
use crate::money::Money;
use crate::reports::{DaySummary, ReportSink};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What produced a ledger movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Sale,
    Upgrade,
    Service,
    Refund,
    Outflow,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Sale => "sale",
            EntryKind::Upgrade => "upgrade",
            EntryKind::Service => "service",
            EntryKind::Refund => "refund",
            EntryKind::Outflow => "outflow",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sale" => Some(EntryKind::Sale),
            "upgrade" => Some(EntryKind::Upgrade),
            "service" => Some(EntryKind::Service),
            "refund" => Some(EntryKind::Refund),
            "outflow" => Some(EntryKind::Outflow),
            _ => None,
        }
    }

    /// Refunds and outflows take money out of the drawer.
    pub fn is_outgoing(&self) -> bool {
        matches!(self, EntryKind::Refund | EntryKind::Outflow)
    }
}

/// One signed cash movement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub amount: Money,
    pub kind: EntryKind,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub reason: Option<String>,
    pub sale_id: Option<i64>,
    pub service_order_id: Option<i64>,
}

/// A movement about to be recorded.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub amount: Money,
    pub kind: EntryKind,
    pub reason: Option<String>,
    pub sale_id: Option<i64>,
    pub service_order_id: Option<i64>,
}

impl NewEntry {
    pub fn new(kind: EntryKind, amount: Money) -> Self {
        Self {
            amount,
            kind,
            reason: None,
            sale_id: None,
            service_order_id: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn validate(&self) -> PosResult<()> {
        if self.amount.is_zero() {
            return Err(PosError::validation("ledger amount must not be zero"));
        }
        if self.kind.is_outgoing() != self.amount.is_negative() {
            return Err(PosError::validation(format!(
                "{} entries must be {}",
                self.kind.as_str(),
                if self.kind.is_outgoing() { "negative" } else { "positive" }
            )));
        }
        let has_reason = self
            .reason
            .as_deref()
            .map(|r| !r.trim().is_empty())
            .unwrap_or(false);
        if self.amount.is_negative() && !has_reason {
            return Err(PosError::validation("a reason is required for money leaving the drawer"));
        }
        Ok(())
    }
}

/// The archived total of one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayClosing {
    pub date: NaiveDate,
    pub total: Money,
    pub entry_count: i64,
    pub closed_at: String,
}

/// Result of a close attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CloseOutcome {
    /// The day's entries sum to zero; nothing was written.
    NothingToClose { date: NaiveDate },
    Closed {
        date: NaiveDate,
        total: Money,
        entries_removed: usize,
        report: Option<PathBuf>,
    },
}

impl CloseOutcome {
    pub fn date(&self) -> NaiveDate {
        match self {
            CloseOutcome::NothingToClose { date } | CloseOutcome::Closed { date, .. } => *date,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, CloseOutcome::Closed { .. })
    }
}

/// What the drawer screen shows for the current day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrawerStatus {
    pub date: NaiveDate,
    pub total: Money,
    pub entry_count: i64,
    /// Older dates still present (zero-sum days rollover leaves alone).
    pub stale_dates: Vec<NaiveDate>,
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

/// Insert a validated entry on an open connection or transaction.
///
/// Callers that combine the entry with other writes (a sale, a service
/// approval) run this inside their own transaction after
/// [`rollover_locked`] and [`ensure_day_open`].
pub(crate) fn insert_entry(conn: &Connection, entry: &NewEntry, at: NaiveDateTime) -> PosResult<LedgerEntry> {
    entry.validate()?;
    let reason = entry
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);
    let date = at.date();
    let time = at.time();

    conn.execute(
        "INSERT INTO cash_entries (amount_cents, kind, entry_date, entry_time, reason, sale_id, service_order_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.amount,
            entry.kind.as_str(),
            date,
            format::time_str(time),
            reason,
            entry.sale_id,
            entry.service_order_id,
        ],
    )?;

    Ok(LedgerEntry {
        id: conn.last_insert_rowid(),
        amount: entry.amount,
        kind: entry.kind,
        date,
        time: format::parse_time(&format::time_str(time))?,
        reason,
        sale_id: entry.sale_id,
        service_order_id: entry.service_order_id,
    })
}

/// Record one movement for `now`, closing any stale day first.
pub fn record_entry(
    db: &DbState,
    reports: &dyn ReportSink,
    entry: NewEntry,
    now: NaiveDateTime,
) -> PosResult<LedgerEntry> {
    entry.validate()?;
    let mut conn = db.lock()?;
    rollover_locked(&mut conn, reports, now.date())?;
    ensure_day_open(&conn, now.date())?;
    let recorded = insert_entry(&conn, &entry, now)?;
    info!(
        entry_id = recorded.id,
        kind = recorded.kind.as_str(),
        amount = %recorded.amount,
        "Cash entry recorded"
    );
    Ok(recorded)
}

/// Record money taken out of the drawer. `amount` is the positive value
/// removed; it is stored negated.
pub fn record_outflow(
    db: &DbState,
    reports: &dyn ReportSink,
    amount: Money,
    reason: &str,
    now: NaiveDateTime,
) -> PosResult<LedgerEntry> {
    if !amount.is_positive() {
        return Err(PosError::validation("outflow amount must be positive"));
    }
    if reason.trim().is_empty() {
        return Err(PosError::validation("outflow reason is required"));
    }
    record_entry(
        db,
        reports,
        NewEntry::new(EntryKind::Outflow, -amount).with_reason(reason),
        now,
    )
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub(crate) fn sum_for(conn: &Connection, date: NaiveDate) -> PosResult<Money> {
    let total: Money = conn.query_row(
        "SELECT COALESCE(SUM(amount_cents), 0) FROM cash_entries WHERE entry_date = ?1",
        params![date],
        |row| row.get(0),
    )?;
    Ok(total)
}

fn count_for(conn: &Connection, date: NaiveDate) -> PosResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM cash_entries WHERE entry_date = ?1",
        params![date],
        |row| row.get(0),
    )?)
}

/// Sum of the entries recorded for `date`, always recomputed from the rows.
pub fn day_total(db: &DbState, date: NaiveDate) -> PosResult<Money> {
    let conn = db.lock()?;
    sum_for(&conn, date)
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(LedgerEntry, String, String)> {
    Ok((
        LedgerEntry {
            id: row.get(0)?,
            amount: row.get(1)?,
            kind: EntryKind::Sale, // replaced below once the raw kind is parsed
            date: row.get(3)?,
            time: NaiveTime::MIN,
            reason: row.get(5)?,
            sale_id: row.get(6)?,
            service_order_id: row.get(7)?,
        },
        row.get::<_, String>(2)?,
        row.get::<_, String>(4)?,
    ))
}

/// Entries recorded for `date`, oldest first.
pub(crate) fn entries_on(conn: &Connection, date: NaiveDate) -> PosResult<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, amount_cents, kind, entry_date, entry_time, reason, sale_id, service_order_id
         FROM cash_entries WHERE entry_date = ?1
         ORDER BY entry_time ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![date], row_to_entry)?;

    let mut entries = Vec::new();
    for row in rows {
        let (mut entry, kind, time) = row?;
        entry.kind = EntryKind::parse(&kind)
            .ok_or_else(|| PosError::validation(format!("unknown ledger kind {kind}")))?;
        entry.time = format::parse_time(&time)?;
        entries.push(entry);
    }
    Ok(entries)
}

pub fn entries_for(db: &DbState, date: NaiveDate) -> PosResult<Vec<LedgerEntry>> {
    let conn = db.lock()?;
    entries_on(&conn, date)
}

/// Distinct dates that still have entries, oldest first.
pub fn open_dates(db: &DbState) -> PosResult<Vec<NaiveDate>> {
    let conn = db.lock()?;
    dates_before(&conn, None)
}

fn dates_before(conn: &Connection, before: Option<NaiveDate>) -> PosResult<Vec<NaiveDate>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT entry_date FROM cash_entries
         WHERE ?1 IS NULL OR entry_date < ?1
         ORDER BY entry_date ASC",
    )?;
    let dates = stmt
        .query_map(params![before], |row| row.get::<_, NaiveDate>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(dates)
}

/// Totals for the drawer screen. Does not roll anything over.
pub fn drawer_status(db: &DbState, today: NaiveDate) -> PosResult<DrawerStatus> {
    let conn = db.lock()?;
    Ok(DrawerStatus {
        date: today,
        total: sum_for(&conn, today)?,
        entry_count: count_for(&conn, today)?,
        stale_dates: dates_before(&conn, Some(today))?,
    })
}

pub(crate) fn is_day_closed(conn: &Connection, date: NaiveDate) -> PosResult<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM day_closings WHERE closing_date = ?1",
            params![date],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// A closed date takes no new movements; they would never be archived.
pub(crate) fn ensure_day_open(conn: &Connection, date: NaiveDate) -> PosResult<()> {
    if is_day_closed(conn, date)? {
        warn!(date = %date, "Movement refused, the day is already closed");
        return Err(PosError::DayClosed(format::br_date(date)));
    }
    Ok(())
}

fn row_to_closing(row: &rusqlite::Row<'_>) -> rusqlite::Result<DayClosing> {
    Ok(DayClosing {
        date: row.get(0)?,
        total: row.get(1)?,
        entry_count: row.get(2)?,
        closed_at: row.get(3)?,
    })
}

pub fn closing_for(db: &DbState, date: NaiveDate) -> PosResult<Option<DayClosing>> {
    let conn = db.lock()?;
    Ok(conn
        .query_row(
            "SELECT closing_date, total_cents, entry_count, closed_at
             FROM day_closings WHERE closing_date = ?1",
            params![date],
            row_to_closing,
        )
        .optional()?)
}

/// Closing history, newest first.
pub fn closings(db: &DbState) -> PosResult<Vec<DayClosing>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT closing_date, total_cents, entry_count, closed_at
         FROM day_closings ORDER BY closing_date DESC",
    )?;
    let rows = stmt
        .query_map([], row_to_closing)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Closings of one calendar month, oldest first.
pub fn closings_for_month(db: &DbState, year: i32, month: u32) -> PosResult<Vec<DayClosing>> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| PosError::validation(format!("invalid month {year}-{month}")))?;
    let next = if first.month() == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| PosError::validation(format!("invalid month {year}-{month}")))?;

    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT closing_date, total_cents, entry_count, closed_at
         FROM day_closings WHERE closing_date >= ?1 AND closing_date < ?2
         ORDER BY closing_date ASC",
    )?;
    let rows = stmt
        .query_map(params![first, next], row_to_closing)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Close / rollover
// ---------------------------------------------------------------------------

/// Close the cash drawer for `date`.
///
/// Sums the rows for `date`. A zero sum reports [`CloseOutcome::NothingToClose`]
/// and writes nothing. Otherwise the closing record is upserted, the summary
/// is written through `reports`, and the day's entries are deleted, all in
/// one transaction. `reports` hears about the committed close afterwards.
pub fn close_day(db: &DbState, reports: &dyn ReportSink, date: NaiveDate) -> PosResult<CloseOutcome> {
    let mut conn = db.lock()?;
    close_day_locked(&mut conn, reports, date)
}

pub(crate) fn close_day_locked(
    conn: &mut Connection,
    reports: &dyn ReportSink,
    date: NaiveDate,
) -> PosResult<CloseOutcome> {
    let total = sum_for(conn, date)?;
    if total.is_zero() {
        info!(date = %date, "Nothing to close");
        return Ok(CloseOutcome::NothingToClose { date });
    }

    let tx = conn.transaction()?;
    let entry_count = count_for(&tx, date)?;

    tx.execute(
        "INSERT INTO day_closings (closing_date, total_cents, entry_count, closed_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(closing_date) DO UPDATE SET
            total_cents = excluded.total_cents,
            entry_count = excluded.entry_count,
            closed_at = excluded.closed_at",
        params![date, total, entry_count],
    )?;

    let summary = DaySummary::build(&tx, date)?;
    let report = reports.write_day_summary(&summary).map_err(|e| {
        error!(date = %date, "Day summary could not be written, close aborted: {e}");
        e
    })?;

    let entries_removed = tx.execute(
        "DELETE FROM cash_entries WHERE entry_date = ?1",
        params![date],
    )?;
    tx.commit()?;

    info!(
        date = %date,
        total = %total,
        entries_removed,
        "Cash drawer closed"
    );
    reports.day_closed(conn, date);

    Ok(CloseOutcome::Closed {
        date,
        total,
        entries_removed,
        report,
    })
}

/// Close every date before `today` that still has entries.
///
/// Today's entries are never touched. Stale dates whose entries sum to zero
/// are left in place.
pub fn rollover(db: &DbState, reports: &dyn ReportSink, today: NaiveDate) -> PosResult<Vec<CloseOutcome>> {
    let mut conn = db.lock()?;
    rollover_locked(&mut conn, reports, today)
}

pub(crate) fn rollover_locked(
    conn: &mut Connection,
    reports: &dyn ReportSink,
    today: NaiveDate,
) -> PosResult<Vec<CloseOutcome>> {
    let stale = dates_before(conn, Some(today))?;
    let mut outcomes = Vec::with_capacity(stale.len());

    for date in stale {
        let outcome = close_day_locked(conn, reports, date)?;
        match &outcome {
            CloseOutcome::Closed { total, .. } => {
                info!(date = %date, total = %total, "Stale day rolled over");
            }
            CloseOutcome::NothingToClose { .. } => {
                warn!(date = %date, "Stale day sums to zero; entries kept");
            }
        }
        outcomes.push(outcome);
    }

    Ok(outcomes)
}

// ===========================================================================
// Tests
// ===========================================================================
