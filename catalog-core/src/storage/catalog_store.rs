use crate::error::{CatalogError, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// An item joined with its category name, as served to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: i64,
    pub name: String,
    pub category: String,
    #[serde(rename = "imageName")]
    pub image_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedItem {
    pub id: i64,
    pub category_id: i64,
}

#[derive(Debug, Clone)]
pub struct CatalogStoreOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl Default for CatalogStoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

const GATE_OPEN: u8 = 0;
const GATE_COMMITTING: u8 = 1;
const GATE_CANCELLED: u8 = 2;

/// Settles, exactly once, whether a pending write transaction commits or is
/// abandoned. Shared between the blocking writer and whoever gave up waiting
/// on it.
#[derive(Debug, Clone, Default)]
pub struct CommitGate(Arc<AtomicU8>);

impl CommitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the commit. False once the gate has been cancelled.
    pub fn begin_commit(&self) -> bool {
        self.transition(GATE_COMMITTING)
    }

    /// Abandon the write. False if the commit already started.
    pub fn cancel(&self) -> bool {
        self.transition(GATE_CANCELLED)
    }

    fn transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(GATE_OPEN, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

const SELECT_ITEMS: &str = "SELECT items.id, items.name, categories.category_name, items.image_name
     FROM items
     INNER JOIN categories ON items.category_id = categories.category_id";

type SqliteConn = PooledConnection<SqliteConnectionManager>;

pub struct CatalogStore {
    pool: Pool<SqliteConnectionManager>,
}

impl CatalogStore {
    pub fn open(db_path: &Path, options: &CatalogStoreOptions) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| {
                CatalogError::Write(format!(
                    "failed to create database directory {:?}: {}",
                    parent, error
                ))
            })?;
        }

        let busy_timeout = options.busy_timeout;
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });

        let pool = Pool::builder()
            .max_size(options.max_connections)
            .build(manager)
            .map_err(|error| {
                CatalogError::Query(format!(
                    "failed to open database {:?}: {}",
                    db_path, error
                ))
            })?;

        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn read_conn(&self) -> Result<SqliteConn> {
        self.pool
            .get()
            .map_err(|error| CatalogError::Query(format!("no database connection: {}", error)))
    }

    fn write_conn(&self) -> Result<SqliteConn> {
        self.pool
            .get()
            .map_err(|error| CatalogError::Write(format!("no database connection: {}", error)))
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.write_conn()?;

        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(write_error)?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(write_error)?;

        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS categories (
                category_id INTEGER PRIMARY KEY AUTOINCREMENT,
                category_name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                category_id INTEGER NOT NULL REFERENCES categories(category_id),
                image_name TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_items_category_id ON items(category_id);",
        )
        .map_err(write_error)?;

        // Older databases were created without the unique name constraint and
        // may hold duplicate categories. Fold each name onto its lowest id
        // before the unique index goes on.
        tx.execute_batch(
            "CREATE TEMP TABLE category_duplicates AS
                SELECT dup.category_id AS duplicate_id, MIN(keep.category_id) AS keep_id
                FROM categories AS dup
                JOIN categories AS keep ON keep.category_name = dup.category_name
                GROUP BY dup.category_id
                HAVING dup.category_id <> MIN(keep.category_id);

            UPDATE items
                SET category_id = (
                    SELECT keep_id FROM category_duplicates
                    WHERE duplicate_id = items.category_id
                )
                WHERE category_id IN (SELECT duplicate_id FROM category_duplicates);

            DELETE FROM categories
                WHERE category_id IN (SELECT duplicate_id FROM category_duplicates);

            DROP TABLE temp.category_duplicates;

            CREATE UNIQUE INDEX IF NOT EXISTS idx_categories_name
                ON categories(category_name);",
        )
        .map_err(write_error)?;

        tx.commit().map_err(write_error)?;

        Ok(())
    }

    /// Round-trip a trivial statement through the pool.
    pub fn ping(&self) -> Result<()> {
        let conn = self.read_conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(query_error)?;
        Ok(())
    }

    /// Find-or-create a category by name.
    ///
    /// A single upsert against the unique name, so concurrent callers racing
    /// on a new name all observe the same id.
    pub fn resolve_category_id(&self, name: &str) -> Result<i64> {
        let conn = self.write_conn()?;
        resolve_category(&conn, name).map_err(write_error)
    }

    pub fn insert_item(&self, name: &str, category_id: i64, image_name: &str) -> Result<i64> {
        let name = required_field("name", name)?;
        let conn = self.write_conn()?;

        conn.execute(
            "INSERT INTO items (name, category_id, image_name) VALUES (?1, ?2, ?3)",
            params![name, category_id, image_name],
        )
        .map_err(write_error)?;

        Ok(conn.last_insert_rowid())
    }

    /// Resolve the category and insert the item in one transaction.
    pub fn create_item(&self, name: &str, category: &str, image_name: &str) -> Result<CreatedItem> {
        self.create_item_gated(name, category, image_name, &CommitGate::new())
    }

    /// Like [`CatalogStore::create_item`], but the transaction only commits
    /// if `gate` has not been cancelled by then. A cancelled gate rolls the
    /// category and the item back together.
    pub fn create_item_gated(
        &self,
        name: &str,
        category: &str,
        image_name: &str,
        gate: &CommitGate,
    ) -> Result<CreatedItem> {
        let name = required_field("name", name)?;
        let category = required_field("category", category)?;

        let mut conn = self.write_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(write_error)?;

        let category_id = resolve_category(&tx, category).map_err(write_error)?;
        tx.execute(
            "INSERT INTO items (name, category_id, image_name) VALUES (?1, ?2, ?3)",
            params![name, category_id, image_name],
        )
        .map_err(write_error)?;
        let id = tx.last_insert_rowid();

        if !gate.begin_commit() {
            // dropping the transaction rolls it back
            return Err(CatalogError::Write("write abandoned before commit".to_string()));
        }
        tx.commit().map_err(write_error)?;

        Ok(CreatedItem { id, category_id })
    }

    /// All items with a joinable category, ordered by id.
    pub fn list_items(&self) -> Result<Vec<ItemRecord>> {
        let conn = self.read_conn()?;
        let sql = format!("{} ORDER BY items.id ASC", SELECT_ITEMS);
        query_items(&conn, &sql, [])
    }

    /// Items whose name contains `keyword` (ASCII case-insensitive), ordered by id.
    /// `%` and `_` in the keyword match literally.
    pub fn search_items(&self, keyword: &str) -> Result<Vec<ItemRecord>> {
        let conn = self.read_conn()?;
        let sql = format!(
            "{} WHERE items.name LIKE '%' || ?1 || '%' ESCAPE '\\' ORDER BY items.id ASC",
            SELECT_ITEMS
        );
        query_items(&conn, &sql, [escape_like(keyword)])
    }

    pub fn get_item(&self, id: i64) -> Result<Option<ItemRecord>> {
        let conn = self.read_conn()?;
        let sql = format!("{} WHERE items.id = ?1", SELECT_ITEMS);

        conn.query_row(&sql, [id], item_from_row)
            .optional()
            .map_err(query_error)
    }

    pub fn get_image_name(&self, id: i64) -> Result<Option<String>> {
        let conn = self.read_conn()?;

        conn.query_row(
            "SELECT image_name FROM items WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()
        .map_err(query_error)
    }
}

fn resolve_category(conn: &Connection, name: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "INSERT INTO categories (category_name) VALUES (?1)
         ON CONFLICT(category_name) DO UPDATE SET category_name = excluded.category_name
         RETURNING category_id",
        [name],
        |row| row.get(0),
    )
}

fn query_items<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<ItemRecord>> {
    let mut stmt = conn.prepare(sql).map_err(query_error)?;
    let rows = stmt.query_map(params, item_from_row).map_err(query_error)?;

    let mut items = Vec::new();
    for row in rows {
        items.push(row.map_err(query_error)?);
    }

    Ok(items)
}

fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRecord> {
    Ok(ItemRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        image_name: row.get(3)?,
    })
}

fn escape_like(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len());
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Trimmed `value`, or a validation error naming `field` when nothing is left.
pub(crate) fn required_field<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CatalogError::Validation(format!("{} is required", field)));
    }
    Ok(trimmed)
}

fn query_error(error: rusqlite::Error) -> CatalogError {
    CatalogError::Query(error.to_string())
}

fn write_error(error: rusqlite::Error) -> CatalogError {
    CatalogError::Write(error.to_string())
}
