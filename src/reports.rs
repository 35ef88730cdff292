//! End-of-day summaries and the other store reports.
//!
//! [`DaySummary`] is built from the rows of one date while the close
//! transaction is still open, so it always matches what is being archived.
//! The [`ReportSink`] turns it into an external artifact; the close only
//! commits once the sink has succeeded.

use std::path::PathBuf;

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{info, warn};

use crate::backup;
use crate::db::DbState;
use crate::documents::{DocumentKind, DocumentStore, RULE, STORE_NAME};
use crate::error::PosResult;
use crate::format;
use crate::ledger::{self, DayClosing, EntryKind};
use crate::money::Money;
use crate::notify::Notifier;
use crate::sales::{PaymentMethod, Sale};

// ---------------------------------------------------------------------------
// Day summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaleLine {
    pub time: String,
    pub customer: String,
    pub product: String,
    pub quantity: i64,
    pub payment: PaymentMethod,
    pub total: Money,
    pub is_upgrade: bool,
}

/// Money that left the drawer (refund or outflow), shown as a positive value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CashLine {
    pub time: String,
    pub reason: String,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaySummary {
    pub date: NaiveDate,
    /// Newest first.
    pub sales: Vec<SaleLine>,
    /// One row per payment method, in display order.
    pub totals_by_method: Vec<(PaymentMethod, Money)>,
    pub sales_total: Money,
    pub upgrades_total: Money,
    pub service_total: Money,
    pub refunds: Vec<CashLine>,
    pub refunds_total: Money,
    pub outflows: Vec<CashLine>,
    pub outflows_total: Money,
    /// Sum of the ledger rows for the date.
    pub net_total: Money,
    pub entry_count: usize,
}

impl DaySummary {
    pub fn build(conn: &Connection, date: NaiveDate) -> PosResult<Self> {
        let sales = sales_on(conn, date)?;

        let mut totals_by_method: Vec<(PaymentMethod, Money)> =
            PaymentMethod::ALL.iter().map(|m| (*m, Money::ZERO)).collect();
        for line in &sales {
            if let Some(slot) = totals_by_method.iter_mut().find(|(m, _)| *m == line.payment) {
                slot.1 += line.total;
            }
        }
        let sales_total = sales.iter().map(|s| s.total).sum();
        let upgrades_total = sales.iter().filter(|s| s.is_upgrade).map(|s| s.total).sum();

        let entries = ledger::entries_on(conn, date)?;
        let mut service_total = Money::ZERO;
        let mut refunds = Vec::new();
        let mut outflows = Vec::new();
        for entry in entries.iter().rev() {
            let line = || CashLine {
                time: format::time_str(entry.time),
                reason: entry.reason.clone().unwrap_or_else(|| "(no reason)".to_string()),
                amount: entry.amount.abs(),
            };
            match entry.kind {
                EntryKind::Service => service_total += entry.amount,
                EntryKind::Refund => refunds.push(line()),
                EntryKind::Outflow => outflows.push(line()),
                EntryKind::Sale | EntryKind::Upgrade => {}
            }
        }

        Ok(Self {
            date,
            totals_by_method,
            sales_total,
            upgrades_total,
            service_total,
            refunds_total: refunds.iter().map(|l| l.amount).sum(),
            outflows_total: outflows.iter().map(|l| l.amount).sum(),
            net_total: entries.iter().map(|e| e.amount).sum(),
            entry_count: entries.len(),
            sales,
            refunds,
            outflows,
        })
    }
}

fn sales_on(conn: &Connection, date: NaiveDate) -> PosResult<Vec<SaleLine>> {
    let mut stmt = conn.prepare(
        "SELECT sale_time, customer_name, product_name, quantity, payment_method, total_cents, is_upgrade
         FROM sales WHERE sale_date = ?1
         ORDER BY sale_time DESC, id DESC",
    )?;
    let rows = stmt
        .query_map(params![date], |row| {
            Ok(SaleLine {
                time: row.get(0)?,
                customer: row.get(1)?,
                product: row.get(2)?,
                quantity: row.get(3)?,
                payment: PaymentMethod::from_stored(&row.get::<_, String>(4)?),
                total: row.get(5)?,
                is_upgrade: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub fn render_day_summary(summary: &DaySummary) -> String {
    let mut out = String::new();
    let date = format::br_date(summary.date);
    out.push_str(&format!("{STORE_NAME}\nSales report - {date}\n{RULE}\n"));

    if summary.sales.is_empty() {
        out.push_str("No sales recorded on this day.\n");
    } else {
        out.push_str(&format!(
            "{:<9} {:<24} {:<24} {:>4} {:<6} {:>14}\n",
            "Time", "Customer", "Product", "Qty", "Pay", "Total"
        ));
        for s in &summary.sales {
            out.push_str(&format!(
                "{:<9} {:<24} {:<24} {:>4} {:<6} {:>14}\n",
                s.time,
                truncate(&s.customer, 24),
                truncate(&s.product, 24),
                s.quantity,
                s.payment.label(),
                s.total.to_string()
            ));
        }
    }

    out.push_str(&format!("{RULE}\nTotals by payment method:\n"));
    for (method, total) in &summary.totals_by_method {
        out.push_str(&format!("  {}: {total}\n", method.label()));
    }
    out.push_str(&format!("Sales total: {}\n", summary.sales_total));
    out.push_str(&format!("  of which upgrades: {}\n", summary.upgrades_total));
    out.push_str(&format!("Approved service orders: {}\n", summary.service_total));

    for (title, lines, total, empty) in [
        ("Refunds", &summary.refunds, summary.refunds_total, "No refunds on this day."),
        ("Outflows", &summary.outflows, summary.outflows_total, "No outflows on this day."),
    ] {
        out.push_str(&format!("{RULE}\n{title}\n"));
        if lines.is_empty() {
            out.push_str(empty);
            out.push('\n');
        }
        for line in lines.iter() {
            out.push_str(&format!(
                "{:<9} {:<48} {:>14}\n",
                line.time,
                truncate(&line.reason, 48),
                line.amount.to_string()
            ));
        }
        out.push_str(&format!("Total {}: {total}\n", title.to_lowercase()));
    }

    out.push_str(&format!("{RULE}\nNet cash total: {}\n", summary.net_total));
    out
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Receives what the store produces as it runs: the summary of each day
/// being closed, the end of each close, and every committed sale.
///
/// An error from [`write_day_summary`](ReportSink::write_day_summary)
/// aborts the close, leaving the day's entries in place. The other hooks
/// run after the fact and cannot fail the operation.
pub trait ReportSink: Send + Sync {
    fn write_day_summary(&self, summary: &DaySummary) -> PosResult<Option<PathBuf>>;

    /// The close of `date` has committed. `conn` is still locked by the
    /// caller.
    fn day_closed(&self, _conn: &Connection, _date: NaiveDate) {}

    /// A sale or upgrade has committed.
    fn sale_recorded(&self, _sale: &Sale) {}
}

/// One-line announcement of a sale for the owner's chat.
pub fn sale_message(sale: &Sale) -> String {
    let what = if sale.is_upgrade { "Upgrade" } else { "Sale" };
    let customer = if sale.customer_name.is_empty() {
        String::new()
    } else {
        format!(" for {}", sale.customer_name)
    };
    format!(
        "{what} #{}: {} x{}{customer}, {} ({}) at {}",
        sale.id,
        sale.product_name,
        sale.quantity,
        sale.total,
        sale.payment.label(),
        sale.time
    )
}

/// Writes `reports/day_report_<dd-mm-YYYY>.txt` and forwards it to the
/// owner's chat when notifications are configured. When the document
/// store has a backup folder, every committed close is followed by a full
/// backup.
#[derive(Debug, Clone)]
pub struct FileReportSink {
    documents: DocumentStore,
    notifier: Option<Notifier>,
}

impl FileReportSink {
    pub fn new(documents: DocumentStore) -> Self {
        Self {
            documents,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Option<Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

impl ReportSink for FileReportSink {
    fn write_day_summary(&self, summary: &DaySummary) -> PosResult<Option<PathBuf>> {
        let name = format!("day_report_{}.txt", format::file_date(summary.date));
        let path = self
            .documents
            .save(DocumentKind::Report, &name, &render_day_summary(summary))?;

        if let Some(notifier) = &self.notifier {
            notifier.send_document(
                path.clone(),
                Some(format!(
                    "Cash closed for {}: {}",
                    format::br_date(summary.date),
                    summary.net_total
                )),
            );
        }
        Ok(Some(path))
    }

    fn day_closed(&self, conn: &Connection, date: NaiveDate) {
        let Some(cfg) = self.documents.backup_config() else {
            return;
        };
        let now = chrono::Local::now().naive_local();
        let report = backup::run_full_backup_on(conn, cfg, self.documents.data_dir(), now);
        if !report.is_clean() {
            warn!(date = %date, failures = report.failures.len(), "Backup after close incomplete");
        }
    }

    fn sale_recorded(&self, sale: &Sale) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(sale_message(sale));
        }
    }
}

// ---------------------------------------------------------------------------
// Monthly closings / upgrades
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyClosings {
    pub year: i32,
    pub month: u32,
    pub days: Vec<DayClosing>,
    pub total: Money,
}

pub fn monthly_closings(db: &DbState, year: i32, month: u32) -> PosResult<MonthlyClosings> {
    let days = ledger::closings_for_month(db, year, month)?;
    let total = days.iter().map(|d| d.total).sum();
    Ok(MonthlyClosings {
        year,
        month,
        days,
        total,
    })
}

pub fn render_monthly_closings(report: &MonthlyClosings) -> String {
    let mut out = format!(
        "{STORE_NAME}\nCash closings - {:02}/{}\n{RULE}\n",
        report.month, report.year
    );
    if report.days.is_empty() {
        out.push_str("No closings this month.\n");
    }
    for day in &report.days {
        out.push_str(&format!(
            "{:<12} {:>6} entries {:>16}\n",
            format::br_date(day.date),
            day.entry_count,
            day.total.to_string()
        ));
    }
    out.push_str(&format!("{RULE}\nMonth total: {}\n", report.total));
    out
}

/// Write the monthly closings report and return its path.
pub fn write_monthly_closings(
    db: &DbState,
    documents: &DocumentStore,
    year: i32,
    month: u32,
) -> PosResult<PathBuf> {
    let report = monthly_closings(db, year, month)?;
    let name = format!("closings_{year}-{month:02}.txt");
    let path = documents.save(DocumentKind::Report, &name, &render_monthly_closings(&report))?;
    info!(year, month, days = report.days.len(), "Monthly closings report written");
    Ok(path)
}

pub fn render_upgrades(date: NaiveDate, upgrades: &[SaleLine]) -> String {
    let mut out = format!(
        "{STORE_NAME}\nUpgrades report - {}\n{RULE}\n",
        format::br_date(date)
    );
    if upgrades.is_empty() {
        out.push_str("No upgrades recorded on this day.\n");
    }
    for u in upgrades {
        out.push_str(&format!(
            "{:<9} {:<24} {:<30} {:<6} {:>14}\n",
            u.time,
            truncate(&u.customer, 24),
            truncate(&u.product, 30),
            u.payment.label(),
            u.total.to_string()
        ));
    }
    let total: Money = upgrades.iter().map(|u| u.total).sum();
    out.push_str(&format!("{RULE}\nUpgrades total: {total}\n"));
    out
}

/// Write the upgrades report for `date` (the day it names, not today).
pub fn write_upgrades_report(db: &DbState, documents: &DocumentStore, date: NaiveDate) -> PosResult<PathBuf> {
    let upgrades: Vec<SaleLine> = {
        let conn = db.lock()?;
        sales_on(&conn, date)?
            .into_iter()
            .filter(|s| s.is_upgrade)
            .collect()
    };
    let name = format!("upgrades_{}.txt", format::file_date(date));
    documents.save(DocumentKind::Report, &name, &render_upgrades(date, &upgrades))
}

// ---------------------------------------------------------------------------
// Test sinks
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupConfig, BackupKind};
    use crate::db::test_db;
    use crate::notify::test_support::RecordingChannel;
    use crate::sales::{self, Discount, SaleRequest};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 10).unwrap()
    }

    fn seed_sale(conn: &Connection, time: &str, customer: &str, method: &str, cents: i64, upgrade: bool) {
        conn.execute(
            "INSERT INTO sales (customer_name, cpf, product_code, product_name, quantity, total_cents,
                                payment_method, is_upgrade, sale_date, sale_time)
             VALUES (?1, '', 'P1', 'Cable', 1, ?2, ?3, ?4, ?5, ?6)",
            params![customer, cents, method, upgrade, day(), time],
        )
        .unwrap();
        let kind = if upgrade { "upgrade" } else { "sale" };
        conn.execute(
            "INSERT INTO cash_entries (amount_cents, kind, entry_date, entry_time) VALUES (?1, ?2, ?3, ?4)",
            params![cents, kind, day(), time],
        )
        .unwrap();
    }

    fn seed_cash(conn: &Connection, time: &str, kind: &str, cents: i64, reason: &str) {
        conn.execute(
            "INSERT INTO cash_entries (amount_cents, kind, entry_date, entry_time, reason)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![cents, kind, day(), time, reason],
        )
        .unwrap();
    }

    #[test]
    fn test_summary_groups_by_method_and_kind() {
        let db = test_db();
        let conn = db.lock().unwrap();
        seed_sale(&conn, "09:00:00", "Ana", "pix", 10000, false);
        seed_sale(&conn, "10:00:00", "Bia", "card", 5000, false);
        seed_sale(&conn, "11:00:00", "Caio", "pix", 3000, true);
        seed_cash(&conn, "12:00:00", "service", 4000, "");
        seed_cash(&conn, "13:00:00", "outflow", -2000, "delivery");
        seed_cash(&conn, "14:00:00", "refund", -1000, "Reversal of sale #9");

        let summary = DaySummary::build(&conn, day()).unwrap();
        assert_eq!(summary.sales.len(), 3);
        assert_eq!(summary.sales[0].customer, "Caio");
        assert_eq!(summary.sales_total, Money::from_units(180));
        assert_eq!(summary.upgrades_total, Money::from_units(30));
        assert_eq!(summary.service_total, Money::from_units(40));
        assert_eq!(summary.outflows_total, Money::from_units(20));
        assert_eq!(summary.refunds_total, Money::from_units(10));
        assert_eq!(summary.net_total, Money::from_units(190));
        assert_eq!(summary.entry_count, 6);

        let pix = summary
            .totals_by_method
            .iter()
            .find(|(m, _)| *m == PaymentMethod::Pix)
            .unwrap();
        assert_eq!(pix.1, Money::from_units(130));
    }

    #[test]
    fn test_rendered_summary_lists_outflow_reasons() {
        let db = test_db();
        let conn = db.lock().unwrap();
        seed_cash(&conn, "09:00:00", "sale", 10000, "");
        seed_cash(&conn, "13:00:00", "outflow", -2000, "delivery");

        let text = render_day_summary(&DaySummary::build(&conn, day()).unwrap());
        assert!(text.contains("Sales report - 10/05/2024"));
        assert!(text.contains("No sales recorded on this day."));
        assert!(text.contains("delivery"));
        assert!(text.contains("Net cash total: R$ 80.00"));
    }

    #[test]
    fn test_file_sink_writes_named_report() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db();
        let conn = db.lock().unwrap();
        seed_cash(&conn, "09:00:00", "sale", 13000, "");
        let summary = DaySummary::build(&conn, day()).unwrap();

        let sink = FileReportSink::new(DocumentStore::new(dir.path()));
        let path = sink.write_day_summary(&summary).unwrap().unwrap();
        assert_eq!(path, dir.path().join("reports/day_report_10-05-2024.txt"));
        assert!(std::fs::read_to_string(path).unwrap().contains("R$ 130.00"));
    }

    #[test]
    fn test_upgrades_report_uses_requested_date() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db();
        {
            let conn = db.lock().unwrap();
            seed_sale(&conn, "11:00:00", "Caio", "cash", 3000, true);
            seed_sale(&conn, "12:00:00", "Ana", "cash", 1000, false);
        }
        let path = write_upgrades_report(&db, &DocumentStore::new(dir.path()), day()).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("Caio"));
        assert!(!text.contains("Ana"));
        assert!(text.contains("Upgrades total: R$ 30.00"));
    }

    #[test]
    fn test_committed_close_is_followed_by_a_full_backup() {
        let dir = tempfile::tempdir().unwrap();
        let backup_cfg = BackupConfig::new(dir.path().join("backup"));
        let documents = DocumentStore::new(dir.path().join("data")).with_backup(backup_cfg.clone());
        let sink = FileReportSink::new(documents);
        let db = test_db();
        seed_cash(&db.lock().unwrap(), "09:00:00", "sale", 13000, "");

        assert!(ledger::close_day(&db, &sink, day()).unwrap().is_closed());

        let snapshots: Vec<_> = std::fs::read_dir(backup_cfg.dir(BackupKind::Database))
            .unwrap()
            .collect();
        assert_eq!(snapshots.len(), 1);
        assert!(backup_cfg
            .dir(BackupKind::Reports)
            .join("day_report_10-05-2024.txt")
            .exists());
    }

    #[test]
    fn test_backup_failure_after_close_keeps_the_close() {
        let dir = tempfile::tempdir().unwrap();
        // a file where the backup folder should be
        let blocked = dir.path().join("backup");
        std::fs::write(&blocked, "not a folder").unwrap();
        let documents = DocumentStore::new(dir.path().join("data")).with_backup(BackupConfig::new(&blocked));
        let sink = FileReportSink::new(documents);
        let db = test_db();
        seed_cash(&db.lock().unwrap(), "09:00:00", "sale", 2500, "");

        assert!(ledger::close_day(&db, &sink, day()).unwrap().is_closed());
        assert_eq!(
            ledger::closing_for(&db, day()).unwrap().unwrap().total,
            Money::from_units(25)
        );
        assert!(ledger::entries_for(&db, day()).unwrap().is_empty());
    }

    #[test]
    fn test_file_sink_announces_sales_and_day_reports() {
        let dir = tempfile::tempdir().unwrap();
        let channel = RecordingChannel::default();
        let sink = FileReportSink::new(DocumentStore::new(dir.path()))
            .with_notifier(Some(Notifier::with_channel(channel.clone())));
        let db = test_db();
        db.lock()
            .unwrap()
            .execute(
                "INSERT INTO products (code, name, kind, cost_cents, price_cents, stock)
                 VALUES ('CAB-1', 'USB cable', 'accessory', 500, 2500, 10)",
                [],
            )
            .unwrap();

        let req = SaleRequest {
            customer_name: "Ana".into(),
            cpf: "".into(),
            product_code: "CAB-1".into(),
            quantity: 2,
            payment: PaymentMethod::Pix,
            discount: Discount::None,
        };
        let sale = sales::record_sale(&db, &sink, &req, day().and_hms_opt(9, 30, 0).unwrap()).unwrap();
        ledger::close_day(&db, &sink, day()).unwrap();

        assert!(channel.wait_until(|c| c.messages().len() == 1 && c.documents().len() == 1));
        assert_eq!(
            channel.messages()[0],
            format!("Sale #{}: USB cable x2 for Ana, R$ 50.00 (PIX) at 09:30:00", sale.id)
        );
        let (path, caption) = &channel.documents()[0];
        assert!(path.ends_with("reports/day_report_10-05-2024.txt"));
        assert_eq!(caption.as_deref(), Some("Cash closed for 10/05/2024: R$ 50.00"));
    }
}
