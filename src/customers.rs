//! Customer registry keyed by CPF.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::format;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub cpf: String,
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
}

fn row_to_customer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Customer> {
    Ok(Customer {
        cpf: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        email: row.get(3)?,
    })
}

/// Insert or overwrite the customer with this CPF. CPF and phone are
/// stored in their masked form.
pub fn upsert_customer(db: &DbState, customer: &Customer) -> PosResult<Customer> {
    let cpf = format::format_cpf(&customer.cpf);
    let name = customer.name.trim().to_string();
    if cpf.is_empty() || name.is_empty() {
        return Err(PosError::validation("CPF and name are required"));
    }
    let email = customer
        .email
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string);
    if let Some(e) = &email {
        if !e.contains('@') {
            return Err(PosError::validation(format!("invalid e-mail: {e}")));
        }
    }
    let saved = Customer {
        cpf,
        name,
        phone: format::format_phone(&customer.phone),
        email,
    };

    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO customers (cpf, name, phone, email) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(cpf) DO UPDATE SET name = excluded.name, phone = excluded.phone, email = excluded.email",
        params![saved.cpf, saved.name, saved.phone, saved.email],
    )?;
    info!(cpf = %saved.cpf, "Customer saved");
    Ok(saved)
}

/// Look up by CPF, masked or not.
pub fn get_customer(db: &DbState, cpf: &str) -> PosResult<Option<Customer>> {
    let conn = db.lock()?;
    Ok(conn
        .query_row(
            "SELECT cpf, name, phone, email FROM customers WHERE cpf = ?1 OR cpf = ?2",
            params![cpf.trim(), format::format_cpf(cpf)],
            row_to_customer,
        )
        .optional()?)
}

/// Customers whose name contains `query` (case-insensitive), by name.
/// An empty query lists everyone.
pub fn search_customers(db: &DbState, query: &str) -> PosResult<Vec<Customer>> {
    let conn = db.lock()?;
    let pattern = format!("%{}%", query.trim());
    let mut stmt = conn.prepare(
        "SELECT cpf, name, phone, email FROM customers
         WHERE name LIKE ?1 ORDER BY name COLLATE NOCASE",
    )?;
    let rows = stmt
        .query_map(params![pattern], row_to_customer)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_customers(db: &DbState) -> PosResult<Vec<Customer>> {
    search_customers(db, "")
}
