//! Phone pickup calendar: who is collecting devices on which day.

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::db::DbState;
use crate::error::{PosError, PosResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PickupDay {
    pub date: NaiveDate,
    pub names: Vec<String>,
}

fn clean_names<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    names
        .iter()
        .flat_map(|n| n.as_ref().lines().map(str::to_string).collect::<Vec<_>>())
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect()
}

fn split_names(stored: &str) -> Vec<String> {
    clean_names(&[stored])
}

/// Replace the pickups for `date`. An empty list clears the day.
pub fn set_pickups<S: AsRef<str>>(
    db: &DbState,
    date: NaiveDate,
    names: &[S],
    now: NaiveDateTime,
) -> PosResult<Option<PickupDay>> {
    let names = clean_names(names);
    let conn = db.lock()?;

    if names.is_empty() {
        conn.execute("DELETE FROM pickup_schedule WHERE pickup_date = ?1", params![date])?;
        info!(date = %date, "Pickup day cleared");
        return Ok(None);
    }

    conn.execute(
        "INSERT INTO pickup_schedule (pickup_date, names, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(pickup_date) DO UPDATE SET names = excluded.names, updated_at = excluded.updated_at",
        params![date, names.join("\n"), now],
    )?;
    info!(date = %date, count = names.len(), "Pickups saved");
    Ok(Some(PickupDay { date, names }))
}

pub fn pickups_for(db: &DbState, date: NaiveDate) -> PosResult<Vec<String>> {
    let conn = db.lock()?;
    let stored: Option<String> = conn
        .query_row(
            "SELECT names FROM pickup_schedule WHERE pickup_date = ?1",
            params![date],
            |row| row.get(0),
        )
        .optional()?;
    Ok(stored.map(|s| split_names(&s)).unwrap_or_default())
}

/// Scheduled days of one month, in date order.
pub fn pickups_for_month(db: &DbState, year: i32, month: u32) -> PosResult<Vec<PickupDay>> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| PosError::validation(format!("invalid month {year}-{month}")))?;
    let last = first
        .checked_add_months(chrono::Months::new(1))
        .and_then(|d| d.pred_opt())
        .ok_or_else(|| PosError::validation(format!("invalid month {year}-{month}")))?;

    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT pickup_date, names FROM pickup_schedule
         WHERE pickup_date BETWEEN ?1 AND ?2 ORDER BY pickup_date",
    )?;
    let rows = stmt
        .query_map(params![first, last], |row| {
            Ok(PickupDay {
                date: row.get(0)?,
                names: split_names(&row.get::<_, String>(1)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
