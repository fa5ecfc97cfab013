use crate::models::{ExtractedProduct, ParsingLogDraft};
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("category creation conflict under parent {parent:?} for `{name}`")]
    CreationConflict { parent: Option<i64>, name: String },
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CategoryRow {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub needs_review: bool,
    pub is_active: bool,
}

/// All catalog persistence: the category tree, persisted items, and the
/// append-only parsing log.
#[derive(Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
}

impl CatalogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Active siblings under `parent_id` (`None` = roots). Always read from
    /// the database: the review workflow mutates this table between runs.
    pub async fn children_of(&self, parent_id: Option<i64>) -> Result<Vec<CategoryRow>, StoreError> {
        let rows = sqlx::query_as::<_, CategoryRow>(
            r#"
            SELECT id, name, parent_id, needs_review, is_active
            FROM categories
            WHERE COALESCE(parent_id, 0) = COALESCE(?, 0) AND is_active = 1
            ORDER BY id
            "#,
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Transactional fetch-or-create keyed on `(parent, normalized name)`.
    /// Concurrent runs racing on the same name are resolved by the unique
    /// index plus the re-check after the insert: exactly one row survives and
    /// both callers get it. Returns whether this call created the row.
    pub async fn fetch_or_create_category(
        &self,
        parent_id: Option<i64>,
        name: &str,
        normalized: &str,
        supplier_id: i64,
    ) -> Result<(CategoryRow, bool), StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(existing) = find_in_tx(&mut tx, parent_id, normalized).await? {
            tx.commit().await?;
            return Ok((existing, false));
        }

        let now = Utc::now().to_rfc3339();
        let inserted = sqlx::query(
            r#"
            INSERT INTO categories
                (name, normalized_name, parent_id, needs_review, is_active,
                 origin_supplier_id, created_at, updated_at)
            VALUES (?, ?, ?, 1, 1, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(name)
        .bind(normalized)
        .bind(parent_id)
        .bind(supplier_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        let created = inserted.rows_affected() == 1;

        let row = find_in_tx(&mut tx, parent_id, normalized)
            .await?
            .ok_or_else(|| StoreError::CreationConflict {
                parent: parent_id,
                name: name.to_string(),
            })?;
        tx.commit().await?;
        Ok((row, created))
    }

    /// The well-known fallback node seeded at schema bootstrap.
    pub async fn uncategorized(&self) -> Result<CategoryRow, StoreError> {
        let row = sqlx::query_as::<_, CategoryRow>(
            r#"
            SELECT id, name, parent_id, needs_review, is_active
            FROM categories
            WHERE parent_id IS NULL AND normalized_name = 'uncategorized'
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row),
            None => {
                let (row, _) = self
                    .fetch_or_create_category(None, "Uncategorized", "uncategorized", 0)
                    .await?;
                Ok(row)
            }
        }
    }

    pub async fn append_parsing_logs(
        &self,
        job_id: &str,
        drafts: &[ParsingLogDraft],
    ) -> Result<(), StoreError> {
        if drafts.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for draft in drafts {
            sqlx::query(
                r#"
                INSERT INTO parsing_log
                    (job_id, chunk_index, row_reference, error_kind, message, raw_payload, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(job_id)
            .bind(draft.chunk_index)
            .bind(&draft.row_reference)
            .bind(draft.error_kind.as_str())
            .bind(&draft.message)
            .bind(&draft.raw_payload)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Commit the deduplicated, category-resolved records in one transaction.
    pub async fn persist_items(
        &self,
        job_id: &str,
        supplier_id: i64,
        items: &[(ExtractedProduct, Option<i64>)],
    ) -> Result<u64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for (product, category_id) in items {
            sqlx::query(
                r#"
                INSERT INTO catalog_items
                    (supplier_id, job_id, name, description, price_primary, price_secondary,
                     category_id, foreign_currency, sheet_name, row_index, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(supplier_id)
            .bind(job_id)
            .bind(&product.name)
            .bind(&product.description)
            .bind(product.price_primary)
            .bind(product.price_secondary)
            .bind(category_id)
            .bind(&product.foreign_currency)
            .bind(&product.source.sheet)
            .bind(product.source.row as i64)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(items.len() as u64)
    }

    #[cfg(test)]
    pub async fn count_items(&self, job_id: &str) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM catalog_items WHERE job_id = ?")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    #[cfg(test)]
    pub async fn count_log_entries(&self, job_id: &str, kind: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM parsing_log WHERE job_id = ? AND error_kind = ?",
        )
        .bind(job_id)
        .bind(kind)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    #[cfg(test)]
    pub async fn category_by_id(&self, id: i64) -> Result<Option<CategoryRow>, StoreError> {
        let row = sqlx::query_as::<_, CategoryRow>(
            "SELECT id, name, parent_id, needs_review, is_active FROM categories WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

async fn find_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    parent_id: Option<i64>,
    normalized: &str,
) -> Result<Option<CategoryRow>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, name, parent_id, needs_review, is_active
        FROM categories
        WHERE COALESCE(parent_id, 0) = COALESCE(?, 0) AND normalized_name = ?
        "#,
    )
    .bind(parent_id)
    .bind(normalized)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|row| CategoryRow {
        id: row.get("id"),
        name: row.get("name"),
        parent_id: row.get("parent_id"),
        needs_review: row.get("needs_review"),
        is_active: row.get("is_active"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_memory;

    #[tokio::test]
    async fn fetch_or_create_is_idempotent_per_parent_and_name() {
        let store = CatalogStore::new(connect_memory().await.unwrap());
        let (first, created) = store
            .fetch_or_create_category(None, "Electronics", "electronics", 7)
            .await
            .unwrap();
        assert!(created);
        assert!(first.needs_review);

        let (second, created_again) = store
            .fetch_or_create_category(None, "Electronics", "electronics", 7)
            .await
            .unwrap();
        assert!(!created_again);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn same_name_under_different_parents_makes_distinct_nodes() {
        let store = CatalogStore::new(connect_memory().await.unwrap());
        let (root, _) = store
            .fetch_or_create_category(None, "Tools", "tools", 1)
            .await
            .unwrap();
        let (child, _) = store
            .fetch_or_create_category(Some(root.id), "Tools", "tools", 1)
            .await
            .unwrap();
        assert_ne!(root.id, child.id);
        assert_eq!(child.parent_id, Some(root.id));
    }

    #[tokio::test]
    async fn uncategorized_fallback_exists_after_bootstrap() {
        let store = CatalogStore::new(connect_memory().await.unwrap());
        let fallback = store.uncategorized().await.unwrap();
        assert_eq!(fallback.parent_id, None);
        assert_eq!(fallback.name, "Uncategorized");
    }

    #[tokio::test]
    async fn children_excludes_soft_disabled_nodes() {
        let pool = connect_memory().await.unwrap();
        let store = CatalogStore::new(pool.clone());
        let (row, _) = store
            .fetch_or_create_category(None, "Legacy", "legacy", 1)
            .await
            .unwrap();
        sqlx::query("UPDATE categories SET is_active = 0 WHERE id = ?")
            .bind(row.id)
            .execute(&pool)
            .await
            .unwrap();
        let roots = store.children_of(None).await.unwrap();
        assert!(roots.iter().all(|c| c.id != row.id));
    }

    #[tokio::test]
    async fn persist_items_commits_every_record_with_category() {
        let store = CatalogStore::new(connect_memory().await.unwrap());
        let (category, _) = store
            .fetch_or_create_category(None, "Tools", "tools", 3)
            .await
            .unwrap();
        let product = crate::models::ExtractedProduct {
            name: "Claw Hammer".into(),
            description: Some("16oz".into()),
            price_primary: 12.5,
            price_secondary: Some(8.0),
            category_path: vec!["Tools".into()],
            source: crate::models::SourceRowRef {
                sheet: "Upload".into(),
                row: 4,
                raw: vec!["Claw Hammer".into(), "12.50".into()],
            },
            chunk_index: 0,
            foreign_currency: None,
        };
        let persisted = store
            .persist_items("job-9", 3, &[(product, Some(category.id))])
            .await
            .unwrap();
        assert_eq!(persisted, 1);
        assert_eq!(store.count_items("job-9").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn parsing_logs_are_appended_with_kind() {
        let store = CatalogStore::new(connect_memory().await.unwrap());
        store
            .append_parsing_logs(
                "job-1",
                &[ParsingLogDraft {
                    chunk_index: 2,
                    row_reference: Some("Upload!9".into()),
                    error_kind: crate::models::ErrorKind::RejectedField,
                    message: "missing price_primary".into(),
                    raw_payload: None,
                }],
            )
            .await
            .unwrap();
        assert_eq!(
            store
                .count_log_entries("job-1", "rejected_field")
                .await
                .unwrap(),
            1
        );
    }
}
