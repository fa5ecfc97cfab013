pub mod store;

pub use store::{CatalogStore, CategoryRow, StoreError};

use crate::models::{ErrorKind, ParsingLogDraft};
use serde::Serialize;
use std::collections::HashMap;
use strsim::jaro_winkler;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchAction {
    Matched,
    Created,
    Skipped,
}

/// One level's resolution outcome, kept for the stage report.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryMatchResult {
    pub extracted_name: String,
    pub matched_id: Option<i64>,
    pub similarity_score: f64,
    pub action: MatchAction,
    pub needs_review: bool,
    pub resolved_parent_id: Option<i64>,
}

#[derive(Debug)]
pub struct PathResolution {
    pub leaf_id: Option<i64>,
    pub matches: Vec<CategoryMatchResult>,
    pub logs: Vec<ParsingLogDraft>,
}

/// Token-order-insensitive similarity on a 0-100 scale, case- and
/// whitespace-normalized.
pub fn similarity(a: &str, b: &str) -> f64 {
    jaro_winkler(&token_sort(a), &token_sort(b)) * 100.0
}

fn token_sort(value: &str) -> String {
    let mut tokens: Vec<String> = value
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();
    tokens.sort();
    tokens.join(" ")
}

pub fn normalize_name(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Maps extracted category paths onto the persistent taxonomy, creating
/// review-flagged nodes where nothing similar enough exists. The sibling
/// cache only spans one pipeline run and is dropped for a parent whenever a
/// node is created under it.
pub struct CategoryNormalizer {
    store: CatalogStore,
    threshold: f64,
    siblings: HashMap<Option<i64>, Vec<CategoryRow>>,
}

impl CategoryNormalizer {
    pub fn new(store: CatalogStore, threshold: f64) -> Self {
        Self {
            store,
            threshold,
            siblings: HashMap::new(),
        }
    }

    /// Resolve one root-to-leaf path. Parents are resolved strictly before
    /// their children, so no orphaned node can be produced. Write contention
    /// is retried once; after that the product is parked under the
    /// `Uncategorized` fallback instead of blocking the file.
    pub async fn resolve_path(
        &mut self,
        path: &[String],
        supplier_id: i64,
        chunk_index: i64,
        row_reference: Option<String>,
    ) -> Result<PathResolution, StoreError> {
        let mut resolution = PathResolution {
            leaf_id: None,
            matches: Vec::new(),
            logs: Vec::new(),
        };
        let mut parent: Option<i64> = None;

        for level in path {
            let extracted = level.trim();
            if extracted.is_empty() {
                continue;
            }

            let siblings = self.siblings_of(parent).await?;
            let best = siblings
                .iter()
                .map(|sibling| (similarity(extracted, &sibling.name), sibling))
                .max_by(|a, b| a.0.total_cmp(&b.0));

            if let Some((score, sibling)) = best
                && score >= self.threshold
            {
                debug!(
                    target = "pricebook.taxonomy",
                    extracted = extracted,
                    matched = %sibling.name,
                    score = score,
                    "category matched"
                );
                resolution.matches.push(CategoryMatchResult {
                    extracted_name: extracted.to_string(),
                    matched_id: Some(sibling.id),
                    similarity_score: score,
                    action: MatchAction::Matched,
                    needs_review: sibling.needs_review,
                    resolved_parent_id: parent,
                });
                parent = Some(sibling.id);
                continue;
            }

            let best_score = best.map(|(score, _)| score).unwrap_or(0.0);
            match self.create_with_retry(parent, extracted, supplier_id).await {
                Ok((row, created)) => {
                    resolution.matches.push(CategoryMatchResult {
                        extracted_name: extracted.to_string(),
                        matched_id: Some(row.id),
                        similarity_score: if created { best_score } else { 100.0 },
                        action: if created {
                            MatchAction::Created
                        } else {
                            // Another run created it between our fuzzy pass
                            // and the insert.
                            MatchAction::Matched
                        },
                        needs_review: row.needs_review,
                        resolved_parent_id: parent,
                    });
                    parent = Some(row.id);
                }
                Err(StoreError::CreationConflict { .. }) => {
                    let fallback = self.store.uncategorized().await?;
                    warn!(
                        target = "pricebook.taxonomy",
                        extracted = extracted,
                        parent = ?parent,
                        "category creation conflict persisted; using fallback"
                    );
                    resolution.logs.push(ParsingLogDraft {
                        chunk_index,
                        row_reference: row_reference.clone(),
                        error_kind: ErrorKind::CategoryCreationConflict,
                        message: format!(
                            "contended creation of `{extracted}` under {parent:?}; assigned to fallback"
                        ),
                        raw_payload: None,
                    });
                    resolution.matches.push(CategoryMatchResult {
                        extracted_name: extracted.to_string(),
                        matched_id: Some(fallback.id),
                        similarity_score: 0.0,
                        action: MatchAction::Skipped,
                        needs_review: true,
                        resolved_parent_id: None,
                    });
                    resolution.leaf_id = Some(fallback.id);
                    return Ok(resolution);
                }
                Err(other) => return Err(other),
            }
        }

        resolution.leaf_id = parent;
        Ok(resolution)
    }

    async fn create_with_retry(
        &mut self,
        parent: Option<i64>,
        name: &str,
        supplier_id: i64,
    ) -> Result<(CategoryRow, bool), StoreError> {
        let normalized = normalize_name(name);
        let first = self
            .store
            .fetch_or_create_category(parent, name, &normalized, supplier_id)
            .await;
        let outcome = match first {
            Err(StoreError::CreationConflict { .. }) => {
                // Re-read siblings and try once more before falling back.
                self.siblings.remove(&parent);
                self.store
                    .fetch_or_create_category(parent, name, &normalized, supplier_id)
                    .await
            }
            other => other,
        }?;
        // Whatever happened, the sibling list under this parent is stale now.
        self.siblings.remove(&parent);
        Ok(outcome)
    }

    async fn siblings_of(&mut self, parent: Option<i64>) -> Result<Vec<CategoryRow>, StoreError> {
        if let Some(cached) = self.siblings.get(&parent) {
            return Ok(cached.clone());
        }
        let rows = self.store.children_of(parent).await?;
        self.siblings.insert(parent, rows.clone());
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_memory;

    async fn normalizer(threshold: f64) -> CategoryNormalizer {
        let store = CatalogStore::new(connect_memory().await.unwrap());
        CategoryNormalizer::new(store, threshold)
    }

    #[test]
    fn similarity_is_token_order_insensitive() {
        assert_eq!(similarity("Hand Tools", "tools  hand"), 100.0);
    }

    #[test]
    fn close_singular_plural_names_score_above_threshold() {
        assert!(similarity("Motorcycle", "Motorcycles") >= 85.0);
        assert!(similarity("Motorcycle", "Garden Furniture") < 85.0);
    }

    #[tokio::test]
    async fn near_match_resolves_to_existing_node() {
        let mut normalizer = normalizer(85.0).await;
        let (existing, _) = normalizer
            .store
            .fetch_or_create_category(None, "Motorcycles", "motorcycles", 1)
            .await
            .unwrap();

        let resolution = normalizer
            .resolve_path(&["Motorcycle".to_string()], 1, 0, None)
            .await
            .unwrap();
        assert_eq!(resolution.leaf_id, Some(existing.id));
        assert_eq!(resolution.matches[0].action, MatchAction::Matched);

        // No sibling was added next to the existing node.
        let roots = normalizer.store.children_of(None).await.unwrap();
        let motorcycle_like = roots
            .iter()
            .filter(|c| c.name.to_lowercase().starts_with("motorcycle"))
            .count();
        assert_eq!(motorcycle_like, 1);
    }

    #[tokio::test]
    async fn unmatched_levels_create_review_flagged_chain() {
        let mut normalizer = normalizer(85.0).await;
        let path = vec![
            "Electronics".to_string(),
            "Networking".to_string(),
            "Routers".to_string(),
        ];
        let resolution = normalizer.resolve_path(&path, 42, 0, None).await.unwrap();

        assert_eq!(resolution.matches.len(), 3);
        assert!(resolution
            .matches
            .iter()
            .all(|m| m.action == MatchAction::Created && m.needs_review));

        // Walk leaf to root: every parent must exist and be the node the
        // previous level resolved.
        let leaf = resolution.leaf_id.unwrap();
        let leaf_row = normalizer
            .store
            .category_by_id(leaf)
            .await
            .unwrap()
            .unwrap();
        let mid_row = normalizer
            .store
            .category_by_id(leaf_row.parent_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        let root_row = normalizer
            .store
            .category_by_id(mid_row.parent_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(root_row.parent_id, None);
        assert_eq!(root_row.name, "Electronics");
        assert_eq!(mid_row.name, "Networking");
        assert_eq!(leaf_row.name, "Routers");
    }

    #[tokio::test]
    async fn second_product_reuses_freshly_created_nodes() {
        let mut normalizer = normalizer(85.0).await;
        let first = normalizer
            .resolve_path(&["Garden".to_string(), "Hoses".to_string()], 1, 0, None)
            .await
            .unwrap();
        let second = normalizer
            .resolve_path(&["Garden".to_string(), "Hoses".to_string()], 1, 1, None)
            .await
            .unwrap();
        assert_eq!(first.leaf_id, second.leaf_id);
        // Exactly one "Garden" root regardless of how many products used it.
        let roots = normalizer.store.children_of(None).await.unwrap();
        assert_eq!(roots.iter().filter(|c| c.name == "Garden").count(), 1);
    }

    #[tokio::test]
    async fn empty_path_resolves_to_no_category() {
        let mut normalizer = normalizer(85.0).await;
        let resolution = normalizer.resolve_path(&[], 1, 0, None).await.unwrap();
        assert_eq!(resolution.leaf_id, None);
        assert!(resolution.matches.is_empty());
    }
}
