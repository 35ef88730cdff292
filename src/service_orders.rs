//! Repair / maintenance service orders.
//!
//! An order is registered with a quoted amount and only reaches the cash
//! drawer when it is approved, exactly once.

use std::path::PathBuf;

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth;
use crate::db::DbState;
use crate::documents::DocumentStore;
use crate::error::{PosError, PosResult};
use crate::format;
use crate::ledger::{self, EntryKind, NewEntry};
use crate::money::Money;
use crate::receipts;
use crate::reports::ReportSink;
use crate::sales::NO_NAME;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceOrder {
    pub order_number: i64,
    pub cpf: String,
    pub name: String,
    pub phone: String,
    pub description: String,
    pub date: NaiveDate,
    pub amount: Money,
    pub approved: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewServiceOrder {
    #[serde(default)]
    pub cpf: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
    pub description: String,
    pub amount: Money,
}

/// A registered order and the slip printed for it, if writing it worked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedOrder {
    pub order: ServiceOrder,
    pub slip: Option<PathBuf>,
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceOrder> {
    Ok(ServiceOrder {
        order_number: row.get(0)?,
        cpf: row.get(1)?,
        name: row.get(2)?,
        phone: row.get(3)?,
        description: row.get(4)?,
        date: row.get(5)?,
        amount: row.get(6)?,
        approved: row.get(7)?,
    })
}

const ORDER_COLUMNS: &str = "order_number, cpf, name, phone, description, order_date, amount_cents, approved";

pub fn create_order(
    db: &DbState,
    documents: &DocumentStore,
    req: &NewServiceOrder,
    now: NaiveDateTime,
) -> PosResult<CreatedOrder> {
    let description = req.description.trim();
    if description.is_empty() {
        return Err(PosError::validation("service description is required"));
    }
    if req.amount.is_negative() {
        return Err(PosError::validation("service amount cannot be negative"));
    }
    let name = match req.name.trim() {
        "" => NO_NAME.to_string(),
        n => n.to_string(),
    };

    let order = {
        let conn = db.lock()?;
        conn.execute(
            "INSERT INTO service_orders (cpf, name, phone, description, order_date, amount_cents)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                format::format_cpf(&req.cpf),
                name,
                format::format_phone(&req.phone),
                description,
                now.date(),
                req.amount
            ],
        )?;
        let number = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM service_orders WHERE order_number = ?1"),
            params![number],
            row_to_order,
        )?
    };
    info!(order = order.order_number, amount = %order.amount, "Service order created");

    let slip = match receipts::write_service_order_slip(documents, &order) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(order = order.order_number, "Service order slip not written: {e}");
            None
        }
    };
    Ok(CreatedOrder { order, slip })
}

/// All orders, newest first.
pub fn list_orders(db: &DbState) -> PosResult<Vec<ServiceOrder>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM service_orders ORDER BY order_number DESC"
    ))?;
    let rows = stmt
        .query_map([], row_to_order)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_order(db: &DbState, order_number: i64) -> PosResult<ServiceOrder> {
    let conn = db.lock()?;
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM service_orders WHERE order_number = ?1"),
        params![order_number],
        row_to_order,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found(format!("service order {order_number}")))
}

pub fn delete_order(db: &DbState, actor: &str, order_number: i64) -> PosResult<()> {
    let conn = db.lock()?;
    auth::require_admin_on(&conn, actor)?;
    let deleted = conn.execute(
        "DELETE FROM service_orders WHERE order_number = ?1",
        params![order_number],
    )?;
    if deleted == 0 {
        return Err(PosError::not_found(format!("service order {order_number}")));
    }
    info!(order = order_number, by = %actor, "Service order deleted");
    Ok(())
}

/// Approve an order and put its amount into today's drawer.
pub fn approve_order(
    db: &DbState,
    reports: &dyn ReportSink,
    order_number: i64,
    now: NaiveDateTime,
) -> PosResult<ServiceOrder> {
    let mut conn = db.lock()?;
    ledger::rollover_locked(&mut conn, reports, now.date())?;
    ledger::ensure_day_open(&conn, now.date())?;
    let tx = conn.transaction()?;

    let mut order = tx
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM service_orders WHERE order_number = ?1"),
            params![order_number],
            row_to_order,
        )
        .optional()?
        .ok_or_else(|| PosError::not_found(format!("service order {order_number}")))?;

    if order.approved {
        return Err(PosError::Conflict(format!(
            "service order {order_number} was already approved"
        )));
    }
    if !order.amount.is_positive() {
        return Err(PosError::validation(format!(
            "service order {order_number} has no amount to approve"
        )));
    }

    let mut entry = NewEntry::new(EntryKind::Service, order.amount)
        .with_reason(format!("Service order #{order_number}"));
    entry.service_order_id = Some(order_number);
    ledger::insert_entry(&tx, &entry, now)?;
    tx.execute(
        "UPDATE service_orders SET approved = 1 WHERE order_number = ?1",
        params![order_number],
    )?;
    tx.commit()?;

    order.approved = true;
    info!(order = order_number, amount = %order.amount, "Service order approved");
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PasswordPolicy;
    use crate::db::test_db;
    use crate::reports::test_support::MemorySink;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 10)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn new_order(name: &str, cents: i64) -> NewServiceOrder {
        NewServiceOrder {
            cpf: "12345678901".into(),
            name: name.into(),
            phone: "11987654321".into(),
            description: "Screen replacement".into(),
            amount: Money::from_cents(cents),
        }
    }

    #[test]
    fn test_create_defaults_name_and_writes_slip() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db();
        let created = create_order(&db, &DocumentStore::new(dir.path()), &new_order("", 25000), now()).unwrap();

        assert_eq!(created.order.name, NO_NAME);
        assert_eq!(created.order.cpf, "123.456.789-01");
        assert!(!created.order.approved);
        let slip = created.slip.unwrap();
        assert_eq!(
            slip,
            dir.path().join(format!("service_orders/os_{}.txt", created.order.order_number))
        );
    }

    #[test]
    fn test_create_requires_description() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db();
        let mut req = new_order("Ana", 100);
        req.description = " ".into();
        assert!(create_order(&db, &DocumentStore::new(dir.path()), &req, now()).is_err());
        req.description = "ok".into();
        req.amount = Money::from_cents(-1);
        assert!(create_order(&db, &DocumentStore::new(dir.path()), &req, now()).is_err());
    }

    #[test]
    fn test_approve_once_adds_service_entry() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db();
        let sink = MemorySink::default();
        let created = create_order(&db, &DocumentStore::new(dir.path()), &new_order("Ana", 25000), now()).unwrap();
        let number = created.order.order_number;

        let approved = approve_order(&db, &sink, number, now()).unwrap();
        assert!(approved.approved);
        let entries = ledger::entries_for(&db, now().date()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Service);
        assert_eq!(entries[0].service_order_id, Some(number));
        assert_eq!(entries[0].amount, Money::from_units(250));

        assert!(matches!(approve_order(&db, &sink, number, now()), Err(PosError::Conflict(_))));
        assert_eq!(ledger::entries_for(&db, now().date()).unwrap().len(), 1);
    }

    #[test]
    fn test_approval_on_a_closed_day_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db();
        let sink = MemorySink::default();
        let docs = DocumentStore::new(dir.path());
        let first = create_order(&db, &docs, &new_order("Ana", 10000), now()).unwrap().order;
        let second = create_order(&db, &docs, &new_order("Bia", 5000), now()).unwrap().order;

        approve_order(&db, &sink, first.order_number, now()).unwrap();
        ledger::close_day(&db, &sink, now().date()).unwrap();

        let err = approve_order(&db, &sink, second.order_number, now()).unwrap_err();
        assert!(matches!(err, PosError::DayClosed(_)));
        assert!(!get_order(&db, second.order_number).unwrap().approved);
        assert!(ledger::entries_for(&db, now().date()).unwrap().is_empty());
    }

    #[test]
    fn test_zero_amount_cannot_be_approved() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db();
        let sink = MemorySink::default();
        let created = create_order(&db, &DocumentStore::new(dir.path()), &new_order("Ana", 0), now()).unwrap();
        assert!(matches!(
            approve_order(&db, &sink, created.order.order_number, now()),
            Err(PosError::Validation(_))
        ));
        assert!(!get_order(&db, created.order.order_number).unwrap().approved);
    }

    #[test]
    fn test_listing_is_newest_first_and_delete_needs_admin() {
        let dir = tempfile::tempdir().unwrap();
        let docs = DocumentStore::new(dir.path());
        let db = test_db();
        let policy = PasswordPolicy::for_tests();
        auth::ensure_admin_user(&db, &policy).unwrap();
        auth::create_user(&db, &policy, "clerk", "secret2", false).unwrap();

        let first = create_order(&db, &docs, &new_order("A", 100), now()).unwrap().order;
        let second = create_order(&db, &docs, &new_order("B", 200), now()).unwrap().order;
        let numbers: Vec<_> = list_orders(&db).unwrap().iter().map(|o| o.order_number).collect();
        assert_eq!(numbers, vec![second.order_number, first.order_number]);

        assert!(delete_order(&db, "clerk", first.order_number).is_err());
        delete_order(&db, "admin", first.order_number).unwrap();
        assert_eq!(list_orders(&db).unwrap().len(), 1);
    }
}
