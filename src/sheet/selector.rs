use strsim::jaro_winkler;
use tracing::info;

/// Metadata the selector decides over. Already loaded; no IO happens here.
#[derive(Debug, Clone)]
pub struct SheetSummary {
    pub name: String,
    /// Rows after the header that contain at least one non-empty cell.
    pub data_rows: usize,
    pub header: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SheetSelection {
    pub sheets: Vec<String>,
    pub rationale: String,
}

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Ordered by precedence: an "upload-ready" designation beats generic
    /// "products"/"catalog" names.
    pub priority_names: Vec<String>,
    pub blocklist: Vec<String>,
}

impl SelectorConfig {
    pub fn from_env() -> Self {
        Self {
            priority_names: list_from_env(
                "PRIORITY_SHEET_NAMES",
                &[
                    "upload",
                    "upload-ready",
                    "for upload",
                    "products",
                    "catalog",
                    "price list",
                ],
            ),
            blocklist: list_from_env(
                "SHEET_NAME_BLOCKLIST",
                &[
                    "instructions",
                    "instruction",
                    "readme",
                    "metadata",
                    "notes",
                    "legend",
                    "contacts",
                    "info",
                ],
            ),
        }
    }
}

fn list_from_env(key: &str, defaults: &[&str]) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| defaults.iter().map(|s| s.to_string()).collect())
}

const NEAR_MATCH_FLOOR: f64 = 0.92;

/// Decide which sheets actually contain product rows. Pure and
/// deterministic; the rationale is logged and mirrored into the stage report.
pub fn select_sheets(summaries: &[SheetSummary], config: &SelectorConfig) -> SheetSelection {
    let candidates: Vec<&SheetSummary> = summaries.iter().filter(|s| s.data_rows > 0).collect();

    // Priority pass: the first list entry that matches any non-empty sheet
    // wins, and only its matches are selected.
    for priority in &config.priority_names {
        let matched: Vec<String> = candidates
            .iter()
            .filter(|summary| near_match(&normalize_name(&summary.name), priority))
            .map(|summary| summary.name.clone())
            .collect();
        if !matched.is_empty() {
            let rationale = format!(
                "priority name `{priority}` matched {sheets:?}; other sheets skipped",
                sheets = matched
            );
            info!(target = "pricebook.pipeline", %rationale, "sheet selection");
            return SheetSelection {
                sheets: matched,
                rationale,
            };
        }
    }

    // Fallback pass: every non-empty sheet that is not a metadata /
    // instructions tab.
    let mut selected = Vec::new();
    let mut skipped = Vec::new();
    for summary in &candidates {
        let normalized = normalize_name(&summary.name);
        let blocked = config
            .blocklist
            .iter()
            .any(|term| normalized.contains(term.as_str()) || near_match(&normalized, term));
        if blocked {
            skipped.push(summary.name.clone());
        } else {
            selected.push(summary.name.clone());
        }
    }

    let empty_count = summaries.len() - candidates.len();
    let rationale = format!(
        "no priority sheet; selected {selected:?}, blocklisted {skipped:?}, empty {empty_count}"
    );
    info!(target = "pricebook.pipeline", %rationale, "sheet selection");
    SheetSelection {
        sheets: selected,
        rationale,
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn near_match(normalized: &str, wanted: &str) -> bool {
    normalized == wanted || jaro_winkler(normalized, wanted) >= NEAR_MATCH_FLOOR
}
