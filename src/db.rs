use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Connect to the catalog database, creating it (and its parent directory)
/// on first run. WAL keeps concurrent pipeline runs from blocking readers.
pub async fn connect() -> Result<SqlitePool, sqlx::Error> {
    let db_path = std::env::var("PRICEBOOK_DB_PATH").unwrap_or_else(|_| "data/pricebook.db".into());

    if let Some(parent) = std::path::Path::new(&db_path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    bootstrap_schema(&pool).await?;
    Ok(pool)
}

/// In-memory pool for tests. A single connection, or each handle would see
/// its own empty database.
#[cfg(test)]
pub async fn connect_memory() -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    bootstrap_schema(&pool).await?;
    Ok(pool)
}

pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            parent_id INTEGER REFERENCES categories(id),
            needs_review INTEGER NOT NULL DEFAULT 1,
            is_active INTEGER NOT NULL DEFAULT 1,
            origin_supplier_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The serialization point for concurrent category creation: one node per
    // (parent, normalized name), roots folded onto 0.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_categories_parent_name
            ON categories (COALESCE(parent_id, 0), normalized_name)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            supplier_id INTEGER NOT NULL,
            job_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            price_primary REAL NOT NULL,
            price_secondary REAL,
            category_id INTEGER REFERENCES categories(id),
            foreign_currency TEXT,
            sheet_name TEXT NOT NULL,
            row_index INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS parsing_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            row_reference TEXT,
            error_kind TEXT NOT NULL,
            message TEXT NOT NULL,
            raw_payload TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Safe fallback target for taxonomy write contention; creating it here
    // means the conflict path never has to create it under load.
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO categories
            (name, normalized_name, parent_id, needs_review, is_active, created_at, updated_at)
        VALUES ('Uncategorized', 'uncategorized', NULL, 1, 1, ?, ?)
        "#,
    )
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    Ok(())
}
