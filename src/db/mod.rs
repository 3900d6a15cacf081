use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::error::Error as StdError;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{
    Amount, ExpenseCategory, FixedCost, Invoice, InvoiceKind, NewFixedCost, NewInvoice, ProcessingLog,
};

const INVOICE_COLUMNS: &str =
    "id, owner, kind, amount, counterparty, issue_date, document_ref, is_manual, created_at";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new<P: AsRef<Path>>(db_path: P) -> SqlResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> SqlResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> SqlResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let mut db = Database { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&mut self) -> SqlResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        let migrations = [
            (
                "001_create_invoices.sql",
                include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations/001_create_invoices.sql")),
            ),
            (
                "002_create_fixed_costs.sql",
                include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations/002_create_fixed_costs.sql")),
            ),
            (
                "003_create_settings_and_processing_logs.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/003_create_settings_and_processing_logs.sql"
                )),
            ),
        ];

        for (name, sql) in migrations {
            let applied: Option<String> = self
                .conn
                .query_row(
                    "SELECT name FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            if applied.is_none() {
                let tx = self.conn.transaction()?;
                tx.execute_batch(sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, datetime('now'))",
                    params![name],
                )?;
                tx.commit()?;
                tracing::debug!(migration = name, "Applied migration");
            }
        }

        Ok(())
    }

    pub fn insert_invoice(&self, owner: &str, invoice: &NewInvoice) -> SqlResult<Invoice> {
        insert_invoice_with(&self.conn, owner, invoice, Utc::now())
    }

    /// Inserts every invoice in one transaction: either all rows land or none do.
    pub fn insert_invoices(&mut self, owner: &str, invoices: &[NewInvoice]) -> SqlResult<Vec<Invoice>> {
        let tx = self.conn.transaction()?;
        let created_at = Utc::now();
        let mut inserted = Vec::with_capacity(invoices.len());
        for invoice in invoices {
            inserted.push(insert_invoice_with(&tx, owner, invoice, created_at)?);
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get_invoices(&self, owner: &str, kind: Option<InvoiceKind>) -> SqlResult<Vec<Invoice>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS}
             FROM invoices
             WHERE owner = ?1 AND (?2 IS NULL OR kind = ?2)
             ORDER BY created_at DESC, rowid DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner, kind.map(|k| k.as_str())], invoice_from_row)?;
        rows.collect()
    }

    pub fn get_recent_invoices(&self, owner: &str, limit: usize) -> SqlResult<Vec<Invoice>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS}
             FROM invoices
             WHERE owner = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner, limit as i64], invoice_from_row)?;
        rows.collect()
    }

    pub fn get_invoice(&self, owner: &str, id: Uuid) -> SqlResult<Option<Invoice>> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE owner = ?1 AND id = ?2");
        self.conn
            .query_row(&sql, params![owner, id.to_string()], invoice_from_row)
            .optional()
    }

    /// Returns false when nothing matched the owner and id.
    pub fn delete_invoice(&self, owner: &str, id: Uuid) -> SqlResult<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM invoices WHERE owner = ?1 AND id = ?2",
            params![owner, id.to_string()],
        )?;
        Ok(deleted > 0)
    }

    pub fn insert_fixed_cost(&self, owner: &str, cost: &NewFixedCost) -> SqlResult<FixedCost> {
        let fixed_cost = FixedCost {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            category: cost.category,
            monthly_amount: cost.monthly_amount,
            created_at: Utc::now(),
        };
        self.conn.execute(
            "INSERT INTO fixed_costs (id, owner, category, monthly_amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                fixed_cost.id.to_string(),
                fixed_cost.owner,
                fixed_cost.category.as_str(),
                fixed_cost.monthly_amount.to_string(),
                fixed_cost.created_at,
            ],
        )?;
        Ok(fixed_cost)
    }

    pub fn get_fixed_costs(&self, owner: &str) -> SqlResult<Vec<FixedCost>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner, category, monthly_amount, created_at
             FROM fixed_costs
             WHERE owner = ?1
             ORDER BY created_at DESC, rowid DESC",
        )?;

        let rows = stmt.query_map(params![owner], |row| {
            Ok(FixedCost {
                id: parse_column(row, 0, Uuid::from_str)?,
                owner: row.get(1)?,
                category: parse_column(row, 2, ExpenseCategory::from_str)?,
                monthly_amount: parse_column(row, 3, Amount::from_str)?,
                created_at: row.get(4)?,
            })
        })?;

        rows.collect()
    }

    pub fn delete_fixed_cost(&self, owner: &str, id: Uuid) -> SqlResult<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM fixed_costs WHERE owner = ?1 AND id = ?2",
            params![owner, id.to_string()],
        )?;
        Ok(deleted > 0)
    }

    pub fn set_setting(&self, owner: &str, key: &str, value: &str) -> SqlResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (owner, key, value, updated_at) VALUES (?1, ?2, ?3, datetime('now'))",
            params![owner, key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, owner: &str, key: &str) -> SqlResult<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM settings WHERE owner = ?1 AND key = ?2")?;
        stmt.query_row(params![owner, key], |row| row.get(0)).optional()
    }

    pub fn log_processing(
        &self,
        owner: &str,
        process_type: &str,
        status: &str,
        message: Option<&str>,
    ) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO processing_logs (id, owner, process_type, status, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                owner,
                process_type,
                status,
                message,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_processing_logs(&self, owner: &str, limit: usize) -> SqlResult<Vec<ProcessingLog>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, process_type, status, message, created_at
             FROM processing_logs
             WHERE owner = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![owner, limit as i64], |row| {
            Ok(ProcessingLog {
                id: parse_column(row, 0, Uuid::from_str)?,
                process_type: row.get(1)?,
                status: row.get(2)?,
                message: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;

        rows.collect()
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> SqlResult<()> {
        self.conn.execute_batch(sql)
    }
}

fn insert_invoice_with(
    conn: &Connection,
    owner: &str,
    invoice: &NewInvoice,
    created_at: DateTime<Utc>,
) -> SqlResult<Invoice> {
    let stored = Invoice {
        id: Uuid::new_v4(),
        owner: owner.to_string(),
        kind: invoice.kind,
        amount: invoice.amount,
        counterparty: invoice.counterparty.trim().to_string(),
        issue_date: invoice.issue_date,
        document_ref: invoice.document_ref.clone(),
        created_at,
        is_manual: invoice.is_manual,
    };

    conn.execute(
        "INSERT INTO invoices (
            id, owner, kind, amount, counterparty, issue_date, document_ref, is_manual, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            stored.id.to_string(),
            stored.owner,
            stored.kind.as_str(),
            stored.amount.to_string(),
            stored.counterparty,
            stored.issue_date,
            stored.document_ref,
            stored.is_manual,
            stored.created_at,
        ],
    )?;
    Ok(stored)
}

fn invoice_from_row(row: &Row<'_>) -> SqlResult<Invoice> {
    Ok(Invoice {
        id: parse_column(row, 0, Uuid::from_str)?,
        owner: row.get(1)?,
        kind: parse_column(row, 2, InvoiceKind::from_str)?,
        amount: parse_column(row, 3, Amount::from_str)?,
        counterparty: row.get(4)?,
        issue_date: row.get::<_, NaiveDate>(5)?,
        document_ref: row.get(6)?,
        is_manual: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// Reads a TEXT column and parses it, surfacing parse failures as conversion errors.
fn parse_column<T, E, F>(row: &Row<'_>, idx: usize, parse: F) -> SqlResult<T>
where
    F: FnOnce(&str) -> Result<T, E>,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}
