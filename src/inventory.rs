//! Product catalogue and stock levels.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth;
use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StockLevel {
    /// 5 units or fewer.
    Low,
    /// 6 or 7 units.
    Warning,
    Ok,
}

impl StockLevel {
    pub fn for_stock(stock: i64) -> Self {
        match stock {
            i64::MIN..=5 => StockLevel::Low,
            6..=7 => StockLevel::Warning,
            _ => StockLevel::Ok,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub code: String,
    pub name: String,
    pub kind: String,
    pub cost: Money,
    pub price: Money,
    pub stock: i64,
}

impl Product {
    pub fn stock_level(&self) -> StockLevel {
        StockLevel::for_stock(self.stock)
    }

    fn normalized(&self) -> PosResult<Product> {
        let product = Product {
            code: self.code.trim().to_string(),
            name: self.name.trim().to_string(),
            kind: self.kind.trim().to_string(),
            ..self.clone()
        };
        if product.code.is_empty() || product.name.is_empty() || product.kind.is_empty() {
            return Err(PosError::validation("code, name and type are required"));
        }
        if product.cost.is_negative() || product.price.is_negative() {
            return Err(PosError::validation("cost and price cannot be negative"));
        }
        if product.stock < 0 {
            return Err(PosError::validation("stock cannot be negative"));
        }
        Ok(product)
    }
}

fn row_to_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        code: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        cost: row.get(3)?,
        price: row.get(4)?,
        stock: row.get(5)?,
    })
}

pub fn add_product(db: &DbState, product: &Product) -> PosResult<Product> {
    let product = product.normalized()?;
    let conn = db.lock()?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO products (code, name, kind, cost_cents, price_cents, stock)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            product.code,
            product.name,
            product.kind,
            product.cost,
            product.price,
            product.stock
        ],
    )?;
    if inserted == 0 {
        return Err(PosError::Conflict(format!("product code {} already exists", product.code)));
    }
    info!(code = %product.code, stock = product.stock, "Product added");
    Ok(product)
}

/// Overwrite name, type, prices and stock of an existing product.
pub fn update_product(db: &DbState, product: &Product) -> PosResult<Product> {
    let product = product.normalized()?;
    let conn = db.lock()?;
    let updated = conn.execute(
        "UPDATE products SET name = ?2, kind = ?3, cost_cents = ?4, price_cents = ?5, stock = ?6
         WHERE code = ?1",
        params![
            product.code,
            product.name,
            product.kind,
            product.cost,
            product.price,
            product.stock
        ],
    )?;
    if updated == 0 {
        return Err(PosError::not_found(format!("product {}", product.code)));
    }
    info!(code = %product.code, "Product updated");
    Ok(product)
}

pub fn delete_product(db: &DbState, actor: &str, code: &str) -> PosResult<()> {
    let conn = db.lock()?;
    auth::require_admin_on(&conn, actor)?;
    let deleted = conn.execute("DELETE FROM products WHERE code = ?1", params![code.trim()])?;
    if deleted == 0 {
        return Err(PosError::not_found(format!("product {code}")));
    }
    info!(code = %code, by = %actor, "Product deleted");
    Ok(())
}

pub fn get_product(db: &DbState, code: &str) -> PosResult<Product> {
    let conn = db.lock()?;
    conn.query_row(
        "SELECT code, name, kind, cost_cents, price_cents, stock FROM products WHERE code = ?1",
        params![code.trim()],
        row_to_product,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found(format!("product {code}")))
}

pub fn list_products(db: &DbState) -> PosResult<Vec<Product>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT code, name, kind, cost_cents, price_cents, stock FROM products ORDER BY name COLLATE NOCASE",
    )?;
    let rows = stmt
        .query_map([], row_to_product)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Products at [`StockLevel::Low`], lowest stock first.
pub fn low_stock(db: &DbState) -> PosResult<Vec<Product>> {
    let mut products: Vec<Product> = list_products(db)?
        .into_iter()
        .filter(|p| p.stock_level() == StockLevel::Low)
        .collect();
    products.sort_by_key(|p| p.stock);
    Ok(products)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{self, PasswordPolicy};
    use crate::db::test_db;

    fn product(code: &str, stock: i64) -> Product {
        Product {
            code: code.into(),
            name: format!("Item {code}"),
            kind: "Accessory".into(),
            cost: Money::from_units(5),
            price: Money::from_units(12),
            stock,
        }
    }

    #[test]
    fn test_classifies_stock_levels() {
        assert_eq!(StockLevel::for_stock(0), StockLevel::Low);
        assert_eq!(StockLevel::for_stock(5), StockLevel::Low);
        assert_eq!(StockLevel::for_stock(6), StockLevel::Warning);
        assert_eq!(StockLevel::for_stock(7), StockLevel::Warning);
        assert_eq!(StockLevel::for_stock(8), StockLevel::Ok);
    }

    #[test]
    fn test_duplicate_code_is_a_conflict() {
        let db = test_db();
        add_product(&db, &product("A1", 3)).unwrap();
        assert!(matches!(add_product(&db, &product(" A1 ", 9)), Err(PosError::Conflict(_))));
        assert_eq!(get_product(&db, "A1").unwrap().stock, 3);
    }

    #[test]
    fn test_validates_required_fields() {
        let db = test_db();
        let mut p = product("B1", 1);
        p.name = "  ".into();
        assert!(add_product(&db, &p).is_err());
        let mut p = product("B2", -1);
        p.name = "x".into();
        assert!(add_product(&db, &p).is_err());
    }

    #[test]
    fn test_update_and_list() {
        let db = test_db();
        add_product(&db, &product("C1", 2)).unwrap();
        add_product(&db, &product("C2", 20)).unwrap();

        let mut edited = product("C1", 6);
        edited.name = "Charger".into();
        update_product(&db, &edited).unwrap();
        assert_eq!(get_product(&db, "C1").unwrap().stock_level(), StockLevel::Warning);

        let names: Vec<_> = list_products(&db).unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["Charger".to_string(), "Item C2".to_string()]);
        assert!(matches!(update_product(&db, &product("ZZ", 1)), Err(PosError::NotFound(_))));
    }

    #[test]
    fn test_low_stock_lists_only_low_items() {
        let db = test_db();
        add_product(&db, &product("L1", 4)).unwrap();
        add_product(&db, &product("L2", 1)).unwrap();
        add_product(&db, &product("OK", 30)).unwrap();
        let codes: Vec<_> = low_stock(&db).unwrap().into_iter().map(|p| p.code).collect();
        assert_eq!(codes, vec!["L2".to_string(), "L1".to_string()]);
    }

    #[test]
    fn test_only_admins_delete_products() {
        let db = test_db();
        let policy = PasswordPolicy::for_tests();
        auth::create_user(&db, &policy, "clerk", "pw-clerk", false).unwrap();
        auth::create_user(&db, &policy, "boss", "pw-boss", true).unwrap();
        add_product(&db, &product("D1", 1)).unwrap();

        assert!(matches!(
            delete_product(&db, "clerk", "D1"),
            Err(PosError::PermissionDenied(_))
        ));
        delete_product(&db, "boss", "D1").unwrap();
        assert!(get_product(&db, "D1").is_err());
    }
}
