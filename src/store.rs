use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use rusqlite::{params, Connection, OptionalExtension as _};

use crate::models::{Asset, Invoice, SignedDelegation};
use ethers::types::{Address, U256};
use std::str::FromStr as _;

/// Persistence surface consumed by the observer, the sweeper and the
/// request-handling layer. Implementations must be safe to share across
/// the two periodic tasks.
pub trait InvoiceStore: Send + Sync {
    fn insert(&self, invoice: &Invoice) -> Result<()>;
    fn get(&self, id: &str) -> Result<Option<Invoice>>;
    fn delete(&self, id: &str) -> Result<bool>;
    fn list(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>>;

    /// Unfulfilled invoices whose expiration has not passed, optionally
    /// restricted to one asset.
    fn list_pending(&self, now_ms: i64, asset: Option<&Asset>) -> Result<Vec<Invoice>>;

    /// Fulfilled but not yet swept invoices.
    fn list_sweep_candidates(&self) -> Result<Vec<Invoice>>;

    /// Conditional transition to fulfilled. Returns false if the invoice is
    /// already fulfilled or has expired; this closes the race where an
    /// invoice expires between the pending read and this write.
    fn mark_fulfilled(&self, id: &str, now_ms: i64) -> Result<bool>;

    /// Conditional transition to swept. Only ever succeeds on a fulfilled,
    /// unswept invoice, so `swept` implies `fulfilled` at all times.
    fn mark_swept(&self, id: &str) -> Result<bool>;

    /// Last block height fully processed by the observer.
    fn cursor(&self) -> Result<u64>;

    /// Persist the cursor. Monotonic: a lower height than the stored one is
    /// ignored.
    fn set_cursor(&self, height: u64) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct InvoiceFilter {
    pub asset: Option<Asset>,
    pub fulfilled: Option<bool>,
    pub swept: Option<bool>,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug)]
pub struct SqliteInvoiceStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    start_block: u64,
}

const INVOICE_COLUMNS: &str = r#"
  invoice_id,
  amount,
  asset,
  receiving_address,
  authorization,
  expiration,
  description,
  fulfilled,
  swept,
  created_at
"#;

impl SqliteInvoiceStore {
    /// Open (creating if needed) the invoice database. `start_block` seeds
    /// the scan cursor on first run.
    pub fn open(path: PathBuf, start_block: u64) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create invoice store dir {}", dir.display()))?;
            }
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            start_block,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("invoice store mutex poisoned"))
    }
}

impl InvoiceStore for SqliteInvoiceStore {
    fn insert(&self, invoice: &Invoice) -> Result<()> {
        let authorization = invoice
            .authorization
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serialize delegation")?;

        self.lock()?
            .execute(
                r#"
INSERT INTO invoices (
  invoice_id,
  amount,
  asset,
  receiving_address,
  authorization,
  expiration,
  description,
  fulfilled,
  swept,
  created_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
"#,
                params![
                    &invoice.id,
                    invoice.amount.to_string(),
                    invoice.asset.as_str(),
                    format!("{:#x}", invoice.receiving_address),
                    authorization,
                    invoice.expiration,
                    &invoice.description,
                    invoice.fulfilled,
                    invoice.swept,
                    invoice.created_at,
                ],
            )
            .with_context(|| format!("insert invoice {}", invoice.id))?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Invoice>> {
        self.lock()?
            .query_row(
                &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_id = ?1"),
                params![id],
                row_to_invoice,
            )
            .optional()
            .with_context(|| format!("get invoice {}", id))
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let rows = self
            .lock()?
            .execute("DELETE FROM invoices WHERE invoice_id = ?1", params![id])
            .with_context(|| format!("delete invoice {}", id))?;
        Ok(rows == 1)
    }

    fn list(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(asset) = &filter.asset {
            clauses.push("asset = ?");
            values.push(Box::new(asset.as_str().to_string()));
        }
        if let Some(fulfilled) = filter.fulfilled {
            clauses.push("fulfilled = ?");
            values.push(Box::new(fulfilled));
        }
        if let Some(swept) = filter.swept {
            clauses.push("swept = ?");
            values.push(Box::new(swept));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let page_size = filter.page_size.max(1);
        // Widen before multiplying; page is caller-supplied and may be huge.
        let offset = i64::from(filter.page.saturating_sub(1)) * i64::from(page_size);
        values.push(Box::new(i64::from(page_size)));
        values.push(Box::new(offset));

        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices {where_clause} \
             ORDER BY created_at DESC LIMIT ? OFFSET ?"
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).context("prepare list invoices")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), row_to_invoice)
            .context("query list invoices")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read invoice row")?);
        }
        Ok(out)
    }

    fn list_pending(&self, now_ms: i64, asset: Option<&Asset>) -> Result<Vec<Invoice>> {
        let conn = self.lock()?;
        let mut out = Vec::new();
        match asset {
            Some(asset) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {INVOICE_COLUMNS} FROM invoices \
                         WHERE fulfilled = 0 AND expiration >= ?1 AND asset = ?2"
                    ))
                    .context("prepare list pending")?;
                let rows = stmt
                    .query_map(params![now_ms, asset.as_str()], row_to_invoice)
                    .context("query pending invoices")?;
                for row in rows {
                    out.push(row.context("read invoice row")?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {INVOICE_COLUMNS} FROM invoices \
                         WHERE fulfilled = 0 AND expiration >= ?1"
                    ))
                    .context("prepare list pending")?;
                let rows = stmt
                    .query_map(params![now_ms], row_to_invoice)
                    .context("query pending invoices")?;
                for row in rows {
                    out.push(row.context("read invoice row")?);
                }
            }
        }
        Ok(out)
    }

    fn list_sweep_candidates(&self) -> Result<Vec<Invoice>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {INVOICE_COLUMNS} FROM invoices WHERE fulfilled = 1 AND swept = 0"
            ))
            .context("prepare list sweep candidates")?;
        let rows = stmt
            .query_map([], row_to_invoice)
            .context("query sweep candidates")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read invoice row")?);
        }
        Ok(out)
    }

    fn mark_fulfilled(&self, id: &str, now_ms: i64) -> Result<bool> {
        let rows = self
            .lock()?
            .execute(
                "UPDATE invoices SET fulfilled = 1 \
                 WHERE invoice_id = ?1 AND fulfilled = 0 AND expiration >= ?2",
                params![id, now_ms],
            )
            .with_context(|| format!("mark invoice fulfilled {}", id))?;
        Ok(rows == 1)
    }

    fn mark_swept(&self, id: &str) -> Result<bool> {
        let rows = self
            .lock()?
            .execute(
                "UPDATE invoices SET swept = 1 \
                 WHERE invoice_id = ?1 AND fulfilled = 1 AND swept = 0",
                params![id],
            )
            .with_context(|| format!("mark invoice swept {}", id))?;
        Ok(rows == 1)
    }

    fn cursor(&self) -> Result<u64> {
        let value: Option<String> = self
            .lock()?
            .query_row(
                "SELECT value FROM meta WHERE key = 'scan_cursor'",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("get scan cursor")?;

        match value {
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("invalid scan cursor value: {v}")),
            None => Ok(self.start_block),
        }
    }

    fn set_cursor(&self, height: u64) -> Result<()> {
        // The connection mutex makes the read-compare-write atomic within
        // this process; the cursor never moves backwards.
        let conn = self.lock()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'scan_cursor'",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("get scan cursor")?;

        if let Some(v) = current {
            let current = v
                .parse::<u64>()
                .with_context(|| format!("invalid scan cursor value: {v}"))?;
            if height < current {
                return Ok(());
            }
        }

        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('scan_cursor', ?1)",
            params![height.to_string()],
        )
        .context("set scan cursor")?;
        Ok(())
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS invoices (
  invoice_id TEXT PRIMARY KEY,
  amount TEXT NOT NULL,
  asset TEXT NOT NULL,
  receiving_address TEXT NOT NULL,
  authorization TEXT,
  expiration INTEGER NOT NULL,
  description TEXT,
  fulfilled INTEGER NOT NULL DEFAULT 0,
  swept INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS invoices_pending_idx ON invoices(fulfilled, expiration);
CREATE INDEX IF NOT EXISTS invoices_sweep_idx ON invoices(fulfilled, swept);
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#,
    )
    .context("create tables")?;
    Ok(())
}

fn row_to_invoice(row: &rusqlite::Row<'_>) -> rusqlite::Result<Invoice> {
    let amount_str: String = row.get(1)?;
    let amount = U256::from_dec_str(&amount_str).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("invalid amount {amount_str}").into(),
        )
    })?;

    let asset_str: String = row.get(2)?;

    let address_str: String = row.get(3)?;
    let receiving_address = Address::from_str(&address_str).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("invalid receiving address {address_str}").into(),
        )
    })?;

    let authorization_str: Option<String> = row.get(4)?;
    let authorization: Option<SignedDelegation> = authorization_str
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("invalid delegation: {e}").into(),
            )
        })?;

    Ok(Invoice {
        id: row.get(0)?,
        amount,
        asset: Asset::parse(&asset_str),
        receiving_address,
        authorization,
        expiration: row.get(5)?,
        description: row.get(6)?,
        fulfilled: row.get(7)?,
        swept: row.get(8)?,
        created_at: row.get(9)?,
    })
}
