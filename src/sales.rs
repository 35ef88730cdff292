//! Product sales, upgrades and sale reversal.
//!
//! A sale touches four tables (sales, products, cash_entries, customers) and
//! always does so in one transaction, after any stale day has been rolled
//! over.

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::format;
use crate::ledger::{self, EntryKind, NewEntry};
use crate::money::Money;
use crate::reports::ReportSink;

// ---------------------------------------------------------------------------
// Payment / discount
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Pix,
    Card,
    Cash,
    Other,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 4] = [
        PaymentMethod::Pix,
        PaymentMethod::Card,
        PaymentMethod::Cash,
        PaymentMethod::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Pix => "pix",
            PaymentMethod::Card => "card",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Other => "other",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PaymentMethod::Pix => "PIX",
            PaymentMethod::Card => "Card",
            PaymentMethod::Cash => "Cash",
            PaymentMethod::Other => "Other",
        }
    }

    /// Parse what the operator picked or typed. Accepts the Portuguese
    /// names printed on the store's card machine and drawer.
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "pix" => Some(PaymentMethod::Pix),
            "card" | "cartão" | "cartao" | "credito" | "crédito" | "debito" | "débito" => {
                Some(PaymentMethod::Card)
            }
            "cash" | "dinheiro" => Some(PaymentMethod::Cash),
            "other" | "outros" => Some(PaymentMethod::Other),
            _ => None,
        }
    }

    /// Decode the stored column; anything unknown counts as `Other`.
    pub fn from_stored(raw: &str) -> Self {
        Self::parse(raw).unwrap_or(PaymentMethod::Other)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Discount {
    #[default]
    None,
    FivePercent,
    TenPercent,
}

impl Discount {
    pub fn percent(&self) -> u8 {
        match self {
            Discount::None => 0,
            Discount::FivePercent => 5,
            Discount::TenPercent => 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sale {
    pub id: i64,
    pub customer_name: String,
    pub cpf: String,
    pub product_code: Option<String>,
    pub product_name: String,
    pub quantity: i64,
    pub total: Money,
    pub payment: PaymentMethod,
    pub is_upgrade: bool,
    pub date: NaiveDate,
    pub time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaleRequest {
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub cpf: String,
    pub product_code: String,
    pub quantity: i64,
    pub payment: PaymentMethod,
    #[serde(default)]
    pub discount: Discount,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpgradeRequest {
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub cpf: String,
    #[serde(default)]
    pub phone: String,
    pub description: String,
    pub amount: Money,
    pub payment: Option<PaymentMethod>,
}

pub(crate) const NO_NAME: &str = "No name";

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Sell `quantity` units of a catalogue product.
pub fn record_sale(
    db: &DbState,
    reports: &dyn ReportSink,
    req: &SaleRequest,
    now: NaiveDateTime,
) -> PosResult<Sale> {
    if req.quantity <= 0 {
        return Err(PosError::validation("quantity must be positive"));
    }
    let code = req.product_code.trim();

    let mut conn = db.lock()?;
    ledger::rollover_locked(&mut conn, reports, now.date())?;
    ledger::ensure_day_open(&conn, now.date())?;
    let tx = conn.transaction()?;

    let (product_name, price, stock): (String, Money, i64) = tx
        .query_row(
            "SELECT name, price_cents, stock FROM products WHERE code = ?1",
            params![code],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
        .ok_or_else(|| PosError::not_found(format!("product {code}")))?;

    if req.quantity > stock {
        return Err(PosError::validation(format!("only {stock} units available")));
    }

    let total = price.times(req.quantity).discounted(req.discount.percent());
    if !total.is_positive() {
        return Err(PosError::validation(format!("product {code} has no sale price")));
    }

    let date = now.date();
    let time = format::time_str(now.time());
    let customer_name = req.customer_name.trim().to_string();
    let cpf = format::format_cpf(&req.cpf);

    tx.execute(
        "INSERT INTO sales (customer_name, cpf, product_code, product_name, quantity, total_cents,
                            payment_method, is_upgrade, sale_date, sale_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
        params![
            customer_name,
            cpf,
            code,
            product_name,
            req.quantity,
            total,
            req.payment.as_str(),
            date,
            time
        ],
    )?;
    let sale_id = tx.last_insert_rowid();

    tx.execute(
        "UPDATE products SET stock = stock - ?1 WHERE code = ?2",
        params![req.quantity, code],
    )?;

    let mut entry = NewEntry::new(EntryKind::Sale, total);
    entry.sale_id = Some(sale_id);
    ledger::insert_entry(&tx, &entry, now)?;

    if !cpf.is_empty() {
        tx.execute(
            "INSERT OR IGNORE INTO customers (cpf, name) VALUES (?1, ?2)",
            params![cpf, customer_name],
        )?;
    }
    tx.commit()?;

    info!(
        sale_id,
        product = %code,
        quantity = req.quantity,
        total = %total,
        payment = req.payment.as_str(),
        "Sale recorded"
    );

    let sale = Sale {
        id: sale_id,
        customer_name,
        cpf,
        product_code: Some(code.to_string()),
        product_name,
        quantity: req.quantity,
        total,
        payment: req.payment,
        is_upgrade: false,
        date,
        time,
    };
    reports.sale_recorded(&sale);
    Ok(sale)
}

/// Record a free-form upgrade (a service charged at the counter).
pub fn record_upgrade(
    db: &DbState,
    reports: &dyn ReportSink,
    req: &UpgradeRequest,
    now: NaiveDateTime,
) -> PosResult<Sale> {
    let description = req.description.trim();
    if description.is_empty() {
        return Err(PosError::validation("upgrade description is required"));
    }
    if !req.amount.is_positive() {
        return Err(PosError::validation("upgrade amount must be positive"));
    }

    let customer_name = match req.customer_name.trim() {
        "" => NO_NAME.to_string(),
        name => name.to_string(),
    };
    let cpf = format::format_cpf(&req.cpf);
    let payment = req.payment.unwrap_or(PaymentMethod::Other);
    let date = now.date();
    let time = format::time_str(now.time());

    let mut conn = db.lock()?;
    ledger::rollover_locked(&mut conn, reports, date)?;
    ledger::ensure_day_open(&conn, date)?;
    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO sales (customer_name, cpf, product_code, product_name, quantity, total_cents,
                            payment_method, is_upgrade, sale_date, sale_time)
         VALUES (?1, ?2, NULL, ?3, 1, ?4, ?5, 1, ?6, ?7)",
        params![customer_name, cpf, description, req.amount, payment.as_str(), date, time],
    )?;
    let sale_id = tx.last_insert_rowid();

    let reason = match req.payment {
        Some(p) => format!("Upgrade - {}", p.label()),
        None => "Upgrade".to_string(),
    };
    let mut entry = NewEntry::new(EntryKind::Upgrade, req.amount).with_reason(reason);
    entry.sale_id = Some(sale_id);
    ledger::insert_entry(&tx, &entry, now)?;

    if !cpf.is_empty() {
        tx.execute(
            "INSERT OR IGNORE INTO customers (cpf, name, phone) VALUES (?1, ?2, ?3)",
            params![cpf, customer_name, format::format_phone(&req.phone)],
        )?;
    }
    tx.commit()?;

    info!(sale_id, amount = %req.amount, "Upgrade recorded");

    let sale = Sale {
        id: sale_id,
        customer_name,
        cpf,
        product_code: None,
        product_name: description.to_string(),
        quantity: 1,
        total: req.amount,
        payment,
        is_upgrade: true,
        date,
        time,
    };
    reports.sale_recorded(&sale);
    Ok(sale)
}

fn row_to_sale(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sale> {
    Ok(Sale {
        id: row.get(0)?,
        customer_name: row.get(1)?,
        cpf: row.get(2)?,
        product_code: row.get(3)?,
        product_name: row.get(4)?,
        quantity: row.get(5)?,
        total: row.get(6)?,
        payment: PaymentMethod::from_stored(&row.get::<_, String>(7)?),
        is_upgrade: row.get(8)?,
        date: row.get(9)?,
        time: row.get(10)?,
    })
}

const SALE_COLUMNS: &str = "id, customer_name, cpf, product_code, product_name, quantity, total_cents,
     payment_method, is_upgrade, sale_date, sale_time";

pub fn get_sale(db: &DbState, sale_id: i64) -> PosResult<Sale> {
    let conn = db.lock()?;
    conn.query_row(
        &format!("SELECT {SALE_COLUMNS} FROM sales WHERE id = ?1"),
        params![sale_id],
        row_to_sale,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found(format!("sale #{sale_id}")))
}

/// Sales of one day, newest first, optionally for one payment method.
pub fn sales_for_day(
    db: &DbState,
    date: NaiveDate,
    payment: Option<PaymentMethod>,
) -> PosResult<Vec<Sale>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SALE_COLUMNS} FROM sales
         WHERE sale_date = ?1 AND (?2 IS NULL OR payment_method = ?2)
         ORDER BY sale_time DESC, id DESC"
    ))?;
    let rows = stmt
        .query_map(params![date, payment.map(|p| p.as_str())], row_to_sale)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Undo a sale of a day that is still open.
///
/// Deletes the sale, returns its units to stock and records a refund on the
/// sale's own date. Sales of a closed day cannot be reversed.
pub fn reverse_sale(db: &DbState, sale_id: i64, now: NaiveDateTime) -> PosResult<Sale> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    let sale = tx
        .query_row(
            &format!("SELECT {SALE_COLUMNS} FROM sales WHERE id = ?1"),
            params![sale_id],
            row_to_sale,
        )
        .optional()?
        .ok_or_else(|| PosError::not_found(format!("sale #{sale_id}")))?;

    if ledger::is_day_closed(&tx, sale.date)? {
        return Err(PosError::DayClosed(format::br_date(sale.date)));
    }

    tx.execute("DELETE FROM sales WHERE id = ?1", params![sale_id])?;

    if let Some(code) = &sale.product_code {
        let restocked = tx.execute(
            "UPDATE products SET stock = stock + ?1 WHERE code = ?2",
            params![sale.quantity, code],
        )?;
        if restocked == 0 {
            warn!(sale_id, product = %code, "Reversed sale's product no longer exists; stock not restored");
        }
    }

    let mut entry = NewEntry::new(EntryKind::Refund, -sale.total)
        .with_reason(format!("Reversal of sale #{sale_id}"));
    entry.sale_id = Some(sale_id);
    ledger::insert_entry(&tx, &entry, sale.date.and_time(now.time()))?;
    tx.commit()?;

    info!(sale_id, total = %sale.total, date = %sale.date, "Sale reversed");
    Ok(sale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::reports::test_support::MemorySink;

    fn at(d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, d)
            .unwrap()
            .and_hms_opt(h, 15, 0)
            .unwrap()
    }

    fn seed_product(db: &DbState, code: &str, price_cents: i64, stock: i64) {
        db.lock()
            .unwrap()
            .execute(
                "INSERT INTO products (code, name, kind, cost_cents, price_cents, stock)
                 VALUES (?1, ?2, 'accessory', 100, ?3, ?4)",
                params![code, format!("Product {code}"), price_cents, stock],
            )
            .unwrap();
    }

    fn stock_of(db: &DbState, code: &str) -> i64 {
        db.lock()
            .unwrap()
            .query_row("SELECT stock FROM products WHERE code = ?1", [code], |r| r.get(0))
            .unwrap()
    }

    fn request(code: &str, qty: i64) -> SaleRequest {
        SaleRequest {
            customer_name: "Ana".into(),
            cpf: "123.456.789-01".into(),
            product_code: code.into(),
            quantity: qty,
            payment: PaymentMethod::Pix,
            discount: Discount::None,
        }
    }

    #[test]
    fn test_sale_updates_stock_ledger_and_customer() {
        let db = test_db();
        let sink = MemorySink::default();
        seed_product(&db, "CAB-1", 2500, 10);

        let sale = record_sale(&db, &sink, &request("CAB-1", 3), at(10, 9)).unwrap();
        assert_eq!(sale.total, Money::from_units(75));
        assert_eq!(sink.sale_ids(), vec![sale.id]);
        assert_eq!(stock_of(&db, "CAB-1"), 7);
        assert_eq!(ledger::day_total(&db, sale.date).unwrap(), Money::from_units(75));

        let entries = ledger::entries_for(&db, sale.date).unwrap();
        assert_eq!(entries[0].sale_id, Some(sale.id));

        let name: String = db
            .lock()
            .unwrap()
            .query_row("SELECT name FROM customers WHERE cpf = '123.456.789-01'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "Ana");
    }

    #[test]
    fn test_sale_applies_discount() {
        let db = test_db();
        let sink = MemorySink::default();
        seed_product(&db, "P", 10000, 5);
        let mut req = request("P", 1);
        req.discount = Discount::TenPercent;
        let sale = record_sale(&db, &sink, &req, at(10, 9)).unwrap();
        assert_eq!(sale.total, Money::from_units(90));
    }

    #[test]
    fn test_sale_rejects_bad_quantity_and_unknown_product() {
        let db = test_db();
        let sink = MemorySink::default();
        seed_product(&db, "P", 1000, 2);

        assert!(matches!(
            record_sale(&db, &sink, &request("P", 0), at(10, 9)),
            Err(PosError::Validation(_))
        ));
        assert!(matches!(
            record_sale(&db, &sink, &request("P", 3), at(10, 9)),
            Err(PosError::Validation(msg)) if msg.contains("only 2")
        ));
        assert!(matches!(
            record_sale(&db, &sink, &request("NOPE", 1), at(10, 9)),
            Err(PosError::NotFound(_))
        ));
        assert_eq!(stock_of(&db, "P"), 2);
        assert_eq!(ledger::day_total(&db, at(10, 9).date()).unwrap(), Money::ZERO);
    }

    #[test]
    fn test_first_sale_of_a_day_closes_the_previous_day() {
        let db = test_db();
        let sink = MemorySink::default();
        seed_product(&db, "P", 1000, 10);

        record_sale(&db, &sink, &request("P", 1), at(9, 18)).unwrap();
        record_sale(&db, &sink, &request("P", 2), at(10, 9)).unwrap();

        let closed = ledger::closing_for(&db, at(9, 0).date()).unwrap().unwrap();
        assert_eq!(closed.total, Money::from_units(10));
        assert_eq!(sink.summaries().len(), 1);
        assert_eq!(sink.summaries()[0].sales.len(), 1);
    }

    #[test]
    fn test_upgrade_defaults_name_and_records_reason() {
        let db = test_db();
        let sink = MemorySink::default();
        let req = UpgradeRequest {
            customer_name: "  ".into(),
            cpf: "".into(),
            phone: "".into(),
            description: "RAM upgrade 8GB".into(),
            amount: Money::from_units(150),
            payment: Some(PaymentMethod::Card),
        };
        let sale = record_upgrade(&db, &sink, &req, at(10, 11)).unwrap();
        assert_eq!(sale.customer_name, NO_NAME);
        assert!(sale.is_upgrade);

        let entries = ledger::entries_for(&db, sale.date).unwrap();
        assert_eq!(entries[0].kind, EntryKind::Upgrade);
        assert_eq!(entries[0].reason.as_deref(), Some("Upgrade - Card"));

        let bad = UpgradeRequest {
            amount: Money::ZERO,
            ..req
        };
        assert!(record_upgrade(&db, &sink, &bad, at(10, 11)).is_err());
    }

    #[test]
    fn test_reversal_restocks_and_refunds_on_sale_date() {
        let db = test_db();
        let sink = MemorySink::default();
        seed_product(&db, "P", 4000, 5);
        let sale = record_sale(&db, &sink, &request("P", 2), at(10, 9)).unwrap();

        reverse_sale(&db, sale.id, at(10, 16)).unwrap();

        assert_eq!(stock_of(&db, "P"), 5);
        assert!(matches!(get_sale(&db, sale.id), Err(PosError::NotFound(_))));
        let entries = ledger::entries_for(&db, sale.date).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].kind, EntryKind::Refund);
        assert_eq!(entries[1].amount, Money::from_units(-80));
        assert_eq!(entries[1].reason.as_deref(), Some(format!("Reversal of sale #{}", sale.id).as_str()));
        assert_eq!(ledger::day_total(&db, sale.date).unwrap(), Money::ZERO);
    }

    #[test]
    fn test_reversal_of_closed_day_is_refused() {
        let db = test_db();
        let sink = MemorySink::default();
        seed_product(&db, "P", 4000, 5);
        let sale = record_sale(&db, &sink, &request("P", 1), at(10, 9)).unwrap();
        ledger::close_day(&db, &sink, sale.date).unwrap();

        let err = reverse_sale(&db, sale.id, at(10, 17)).unwrap_err();
        assert!(matches!(err, PosError::DayClosed(ref d) if d == "10/05/2024"));
        assert_eq!(stock_of(&db, "P"), 4);
        assert!(get_sale(&db, sale.id).is_ok());
    }

    #[test]
    fn test_closed_day_refuses_sales_and_upgrades() {
        let db = test_db();
        let sink = MemorySink::default();
        seed_product(&db, "P", 4000, 5);
        let sale = record_sale(&db, &sink, &request("P", 1), at(10, 9)).unwrap();
        ledger::close_day(&db, &sink, sale.date).unwrap();

        let err = record_sale(&db, &sink, &request("P", 1), at(10, 17)).unwrap_err();
        assert!(matches!(err, PosError::DayClosed(_)));
        assert_eq!(stock_of(&db, "P"), 4);

        let upgrade = UpgradeRequest {
            customer_name: "Bia".into(),
            cpf: "".into(),
            phone: "".into(),
            description: "SSD install".into(),
            amount: Money::from_units(90),
            payment: None,
        };
        let err = record_upgrade(&db, &sink, &upgrade, at(10, 18)).unwrap_err();
        assert!(matches!(err, PosError::DayClosed(_)));

        assert_eq!(sales_for_day(&db, sale.date, None).unwrap().len(), 1);
        assert_eq!(
            ledger::closing_for(&db, sale.date).unwrap().unwrap().total,
            Money::from_units(40)
        );
    }

    #[test]
    fn test_day_listing_filters_by_payment() {
        let db = test_db();
        let sink = MemorySink::default();
        seed_product(&db, "P", 1000, 10);
        record_sale(&db, &sink, &request("P", 1), at(10, 9)).unwrap();
        let mut cash = request("P", 1);
        cash.payment = PaymentMethod::Cash;
        record_sale(&db, &sink, &cash, at(10, 10)).unwrap();

        let all = sales_for_day(&db, at(10, 0).date(), None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].payment, PaymentMethod::Cash);
        let pix = sales_for_day(&db, at(10, 0).date(), Some(PaymentMethod::Pix)).unwrap();
        assert_eq!(pix.len(), 1);
    }

    #[test]
    fn test_parses_operator_payment_names() {
        assert_eq!(PaymentMethod::parse("Cartão"), Some(PaymentMethod::Card));
        assert_eq!(PaymentMethod::parse(" dinheiro "), Some(PaymentMethod::Cash));
        assert_eq!(PaymentMethod::parse("PIX"), Some(PaymentMethod::Pix));
        assert_eq!(PaymentMethod::parse("boleto"), None);
        assert_eq!(PaymentMethod::from_stored("Upgrade - PIX"), PaymentMethod::Other);
    }
}
