//! Product returns brought back to the counter.
//!
//! A return is a log entry only; any money given back goes through sale
//! reversal or a drawer outflow.

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::format;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductReturn {
    pub id: i64,
    pub customer_name: String,
    pub item: String,
    pub reason: String,
    pub date: NaiveDate,
    pub time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewReturn {
    pub customer_name: String,
    pub item: String,
    pub reason: String,
}

pub fn register_return(db: &DbState, req: &NewReturn, now: NaiveDateTime) -> PosResult<ProductReturn> {
    let customer_name = req.customer_name.trim();
    let item = req.item.trim();
    let reason = req.reason.trim();
    if customer_name.is_empty() || item.is_empty() || reason.is_empty() {
        return Err(PosError::validation("name, item and reason are required"));
    }

    let date = now.date();
    let time = format::time_str(now.time());
    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO returns (item, reason, customer_name, return_date, return_time)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![item, reason, customer_name, date, time],
    )?;
    let id = conn.last_insert_rowid();
    info!(return_id = id, item, "Return registered");

    Ok(ProductReturn {
        id,
        customer_name: customer_name.to_string(),
        item: item.to_string(),
        reason: reason.to_string(),
        date,
        time,
    })
}

/// Every return, newest first.
pub fn list_returns(db: &DbState) -> PosResult<Vec<ProductReturn>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, customer_name, item, reason, return_date, return_time
         FROM returns ORDER BY return_date DESC, return_time DESC, id DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ProductReturn {
                id: row.get(0)?,
                customer_name: row.get(1)?,
                item: row.get(2)?,
                reason: row.get(3)?,
                date: row.get(4)?,
                time: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
