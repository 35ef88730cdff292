//! Customer-facing documents: the sale receipt and the service-order slip.

use std::path::PathBuf;

use crate::documents::{DocumentKind, DocumentStore, RULE, STORE_NAME};
use crate::error::PosResult;
use crate::format;
use crate::sales::Sale;
use crate::service_orders::ServiceOrder;

pub fn render_sale_receipt(sale: &Sale) -> String {
    let customer = if sale.customer_name.is_empty() {
        "-"
    } else {
        sale.customer_name.as_str()
    };
    let lines = [
        STORE_NAME.to_string(),
        RULE.to_string(),
        format!("Receipt #{}", sale.id),
        format!("Customer: {customer}"),
        format!("Product: {}", sale.product_name),
        format!("Quantity: {}", sale.quantity),
        format!("Payment: {}", sale.payment.label()),
        format!("Total: {}", sale.total),
        format!("Date: {}", format::br_date(sale.date)),
        format!("Time: {}", sale.time),
        RULE.to_string(),
        "Thank you for your business!".to_string(),
    ];
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Write `receipts/receipt_<timestamp>_<id>.txt`.
pub fn write_sale_receipt(documents: &DocumentStore, sale: &Sale) -> PosResult<PathBuf> {
    let stamp = format!(
        "{}_{}",
        sale.date.format("%Y%m%d"),
        sale.time.replace(':', "")
    );
    let name = format!("receipt_{stamp}_{}.txt", sale.id);
    documents.save(DocumentKind::Receipt, &name, &render_sale_receipt(sale))
}

pub fn render_service_order_slip(order: &ServiceOrder) -> String {
    let lines = [
        format!("{STORE_NAME} - SERVICE ORDER"),
        RULE.to_string(),
        format!("Order no.: {}", order.order_number),
        format!("Customer: {}", order.name),
        format!("CPF: {}", order.cpf),
        format!("Phone: {}", order.phone),
        format!("Description: {}", order.description),
        format!("Amount: {}", order.amount),
        format!("Date: {}", format::br_date(order.date)),
        RULE.to_string(),
    ];
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Write `service_orders/os_<number>.txt`.
pub fn write_service_order_slip(documents: &DocumentStore, order: &ServiceOrder) -> PosResult<PathBuf> {
    let name = format!("os_{}.txt", order.order_number);
    documents.save(DocumentKind::ServiceOrder, &name, &render_service_order_slip(order))
}
