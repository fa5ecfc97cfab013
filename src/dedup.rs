use crate::models::ExtractedProduct;
use std::collections::HashMap;
use tracing::warn;

/// Prices within this band are "the same product listed twice"; wider gaps
/// mean distinct SKUs sharing a display name.
const PRICE_BAND: f64 = 0.01;

#[derive(Debug)]
pub struct DedupOutcome {
    pub kept: Vec<ExtractedProduct>,
    pub removed: u64,
}

/// Remove redundant records produced within one file. Key: normalized name.
/// Among records sharing a key with prices within 1% of each other, the
/// first occurrence in file order (chunk index, then sheet row) survives.
/// Divergent prices keep every record and only warn, so legitimately
/// different SKUs are never silently destroyed. Idempotent.
pub fn deduplicate(mut products: Vec<ExtractedProduct>) -> DedupOutcome {
    products.sort_by(|a, b| {
        (a.chunk_index, a.source.row).cmp(&(b.chunk_index, b.source.row))
    });

    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, product) in products.iter().enumerate() {
        groups.entry(dedup_key(&product.name)).or_default().push(idx);
    }

    let mut drop = vec![false; products.len()];
    let mut removed = 0u64;
    for (key, indices) in &groups {
        if indices.len() < 2 {
            continue;
        }
        let prices: Vec<f64> = indices.iter().map(|i| products[*i].price_primary).collect();
        if within_band(&prices) {
            for idx in &indices[1..] {
                drop[*idx] = true;
                removed += 1;
            }
        } else {
            warn!(
                target = "pricebook.pipeline",
                key = %key,
                count = indices.len(),
                "records share a name but diverge in price; keeping all"
            );
        }
    }

    let kept = products
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| !drop[*idx])
        .map(|(_, product)| product)
        .collect();
    DedupOutcome { kept, removed }
}

fn dedup_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn within_band(prices: &[f64]) -> bool {
    let min = prices.iter().copied().fold(f64::INFINITY, f64::min);
    let max = prices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if min == 0.0 {
        return max == 0.0;
    }
    (max - min) / min <= PRICE_BAND + f64::EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceRowRef;

    fn product(name: &str, price: f64, chunk_index: usize, row: u32) -> ExtractedProduct {
        ExtractedProduct {
            name: name.to_string(),
            description: None,
            price_primary: price,
            price_secondary: None,
            category_path: vec![],
            source: SourceRowRef {
                sheet: "Upload".into(),
                row,
                raw: vec![],
            },
            chunk_index,
            foreign_currency: None,
        }
    }

    #[test]
    fn equal_priced_duplicates_keep_first_in_file_order() {
        let out = deduplicate(vec![
            product("Widget", 10.0, 1, 260),
            product("widget ", 10.0, 0, 120),
        ]);
        assert_eq!(out.kept.len(), 1);
        assert_eq!(out.removed, 1);
        assert_eq!(out.kept[0].chunk_index, 0);
        assert_eq!(out.kept[0].source.row, 120);
    }

    #[test]
    fn prices_within_one_percent_are_duplicates() {
        let out = deduplicate(vec![
            product("Widget", 100.0, 0, 2),
            product("Widget", 100.9, 0, 3),
        ]);
        assert_eq!(out.kept.len(), 1);
        assert_eq!(out.removed, 1);
    }

    #[test]
    fn divergent_prices_keep_all_records() {
        let out = deduplicate(vec![
            product("Widget", 100.0, 0, 2),
            product("Widget", 103.0, 0, 3),
        ]);
        assert_eq!(out.kept.len(), 2);
        assert_eq!(out.removed, 0);
    }

    #[test]
    fn key_ignores_case_and_inner_whitespace() {
        let out = deduplicate(vec![
            product("Steel  Pipe 20mm", 5.0, 0, 2),
            product("steel pipe 20MM", 5.0, 0, 3),
        ]);
        assert_eq!(out.kept.len(), 1);
    }

    #[test]
    fn zero_priced_pair_counts_as_duplicate() {
        let out = deduplicate(vec![
            product("Sample", 0.0, 0, 2),
            product("Sample", 0.0, 0, 3),
        ]);
        assert_eq!(out.kept.len(), 1);
    }

    #[test]
    fn zero_against_nonzero_is_divergent() {
        let out = deduplicate(vec![
            product("Sample", 0.0, 0, 2),
            product("Sample", 9.0, 0, 3),
        ]);
        assert_eq!(out.kept.len(), 2);
    }

    #[test]
    fn dedup_is_idempotent() {
        let first = deduplicate(vec![
            product("Widget", 10.0, 0, 2),
            product("Widget", 10.0, 0, 3),
            product("Gadget", 4.0, 0, 4),
            product("Gadget", 9.0, 0, 5),
        ]);
        let kept = first.kept.clone();
        let second = deduplicate(kept);
        assert_eq!(second.removed, 0);
        assert_eq!(second.kept.len(), first.kept.len());
    }

    #[test]
    fn distinct_names_are_untouched() {
        let out = deduplicate(vec![
            product("Widget", 10.0, 0, 2),
            product("Gadget", 10.0, 0, 3),
        ]);
        assert_eq!(out.kept.len(), 2);
        assert_eq!(out.removed, 0);
    }
}
