use crate::extract::chunker::RowWindow;
use crate::models::{ErrorKind, ExtractedProduct, ParsingLogDraft, SourceRowRef};
use crate::sheet::SerializedTable;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// The response failed the window schema outright; the extractor retries
/// these before giving up on the window.
#[derive(Debug, Error)]
#[error("window response failed schema validation: {0}")]
pub struct SchemaError(pub String);

/// What one window's response became after validation: accepted records plus
/// a log draft per dropped or suspicious one.
#[derive(Debug, Default)]
pub struct WindowExtraction {
    pub products: Vec<ExtractedProduct>,
    pub logs: Vec<ParsingLogDraft>,
}

#[derive(Debug, Deserialize)]
struct WindowResponse {
    products: Vec<RawProduct>,
}

#[derive(Debug, Deserialize, Clone)]
struct RawProduct {
    #[serde(default)]
    row: Option<u32>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    price_primary: Option<Value>,
    #[serde(default)]
    price_secondary: Option<Value>,
    #[serde(default)]
    category_path: Option<Vec<String>>,
    #[serde(default)]
    split_confidence: Option<f64>,
    #[serde(default)]
    foreign_currency: Option<String>,
}

const NAME_MAX_CHARS: usize = 500;
const LOW_SPLIT_CONFIDENCE: f64 = 0.5;

/// Validate one window's raw response text. Top-level schema problems are a
/// `SchemaError` (retryable); per-record problems become `rejected_field`
/// log drafts and the run continues.
pub fn parse_window_response(
    text: &str,
    table: &SerializedTable,
    window: &RowWindow,
    chunk_index: usize,
) -> Result<WindowExtraction, SchemaError> {
    let cleaned = strip_markdown_fence(text);
    let response: WindowResponse =
        serde_json::from_str(&cleaned).map_err(|err| SchemaError(err.to_string()))?;

    let mut out = WindowExtraction::default();
    for raw in response.products {
        let source = resolve_source(table, window, raw.row);

        let name = raw
            .name
            .as_deref()
            .map(normalize_whitespace)
            .unwrap_or_default();
        if name.is_empty() {
            out.logs.push(reject(chunk_index, &source, &raw, "missing name"));
            continue;
        }
        let name = truncate_chars(&name, NAME_MAX_CHARS);

        let Some(price_primary) = raw.price_primary.as_ref().and_then(parse_price) else {
            out.logs
                .push(reject(chunk_index, &source, &raw, "missing price_primary"));
            continue;
        };
        if price_primary < 0.0 {
            out.logs
                .push(reject(chunk_index, &source, &raw, "negative price_primary"));
            continue;
        }

        let price_secondary = raw
            .price_secondary
            .as_ref()
            .and_then(parse_price)
            .filter(|p| *p >= 0.0);

        let category_path: Vec<String> = raw
            .category_path
            .clone()
            .unwrap_or_default()
            .iter()
            .map(|level| normalize_whitespace(level))
            .filter(|level| !level.is_empty())
            .collect();

        if let Some(confidence) = raw.split_confidence
            && confidence < LOW_SPLIT_CONFIDENCE
        {
            out.logs.push(ParsingLogDraft {
                chunk_index: chunk_index as i64,
                row_reference: Some(source.label()),
                error_kind: ErrorKind::Validation,
                message: format!("low-confidence composite split ({confidence:.2}) for `{name}`"),
                raw_payload: serde_json::to_string(&cleaned_raw(&raw)).ok(),
            });
        }

        let description = raw
            .description
            .as_deref()
            .map(normalize_whitespace)
            .filter(|d| !d.is_empty());

        out.products.push(ExtractedProduct {
            name,
            description,
            price_primary: round_two(price_primary),
            price_secondary: price_secondary.map(round_two),
            category_path,
            source,
            chunk_index,
            foreign_currency: raw
                .foreign_currency
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_uppercase),
        });
    }

    Ok(out)
}

fn resolve_source(table: &SerializedTable, window: &RowWindow, row: Option<u32>) -> SourceRowRef {
    match row.and_then(|wanted| window.rows.iter().find(|r| r.row == wanted)) {
        Some(found) => SourceRowRef {
            sheet: table.sheet.clone(),
            row: found.row,
            raw: found.cells.clone(),
        },
        None => SourceRowRef {
            sheet: table.sheet.clone(),
            row: row.unwrap_or(0),
            raw: Vec::new(),
        },
    }
}

fn reject(
    chunk_index: usize,
    source: &SourceRowRef,
    raw: &RawProduct,
    message: &str,
) -> ParsingLogDraft {
    ParsingLogDraft {
        chunk_index: chunk_index as i64,
        row_reference: Some(source.label()),
        error_kind: ErrorKind::RejectedField,
        message: message.to_string(),
        raw_payload: serde_json::to_string(&cleaned_raw(raw)).ok(),
    }
}

fn cleaned_raw(raw: &RawProduct) -> Value {
    serde_json::json!({
        "row": raw.row,
        "name": raw.name,
        "price_primary": raw.price_primary,
        "price_secondary": raw.price_secondary,
        "category_path": raw.category_path,
    })
}

/// Accept numbers or strings; strings may still carry currency symbols or
/// thousands separators the model failed to strip.
fn parse_price(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                cleaned.parse::<f64>().ok()
            }
        }
        _ => None,
    }
}

pub(crate) fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        value.to_string()
    } else {
        value.chars().take(max).collect()
    }
}

fn round_two(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub(crate) fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::chunker::windows;
    use crate::sheet::SerializedRow;

    fn table() -> SerializedTable {
        SerializedTable {
            sheet: "Upload".into(),
            header: vec!["Name".into(), "Price".into()],
            rows: vec![
                SerializedRow {
                    row: 2,
                    cells: vec!["Widget".into(), "10.00".into()],
                },
                SerializedRow {
                    row: 3,
                    cells: vec!["Gadget".into(), "$1,299.00".into()],
                },
            ],
        }
    }

    fn single_window(table: &SerializedTable) -> RowWindow {
        windows(&table.rows, 250, 40).remove(0)
    }

    #[test]
    fn valid_record_is_extracted_with_source_reference() {
        let table = table();
        let window = single_window(&table);
        let text = r#"{"products":[{"row":2,"name":"  Widget  ","price_primary":10,
            "category_path":["Tools","Hand Tools"]}]}"#;
        let out = parse_window_response(text, &table, &window, 0).unwrap();
        assert_eq!(out.products.len(), 1);
        let product = &out.products[0];
        assert_eq!(product.name, "Widget");
        assert_eq!(product.price_primary, 10.0);
        assert_eq!(product.source.row, 2);
        assert_eq!(product.source.raw, vec!["Widget", "10.00"]);
        assert_eq!(product.category_path, vec!["Tools", "Hand Tools"]);
        assert!(out.logs.is_empty());
    }

    #[test]
    fn string_price_with_currency_noise_parses() {
        let table = table();
        let window = single_window(&table);
        let text = r#"{"products":[{"row":3,"name":"Gadget","price_primary":"$1,299.00"}]}"#;
        let out = parse_window_response(text, &table, &window, 0).unwrap();
        assert_eq!(out.products[0].price_primary, 1299.0);
    }

    #[test]
    fn empty_name_is_rejected_with_exactly_one_log() {
        let table = table();
        let window = single_window(&table);
        let text = r#"{"products":[{"row":2,"name":"   ","price_primary":10}]}"#;
        let out = parse_window_response(text, &table, &window, 4).unwrap();
        assert!(out.products.is_empty());
        assert_eq!(out.logs.len(), 1);
        assert_eq!(out.logs[0].error_kind, ErrorKind::RejectedField);
        assert_eq!(out.logs[0].chunk_index, 4);
        assert_eq!(out.logs[0].row_reference.as_deref(), Some("Upload!2"));
    }

    #[test]
    fn missing_price_is_rejected_not_defaulted() {
        let table = table();
        let window = single_window(&table);
        let text = r#"{"products":[{"row":2,"name":"Widget","price_primary":null}]}"#;
        let out = parse_window_response(text, &table, &window, 0).unwrap();
        assert!(out.products.is_empty());
        assert_eq!(out.logs.len(), 1);
        assert!(out.logs[0].message.contains("price_primary"));
    }

    #[test]
    fn low_confidence_split_is_logged_but_kept() {
        let table = table();
        let window = single_window(&table);
        let text = r#"{"products":[{"row":2,"name":"Widget","price_primary":10,
            "split_confidence":0.3}]}"#;
        let out = parse_window_response(text, &table, &window, 0).unwrap();
        assert_eq!(out.products.len(), 1);
        assert_eq!(out.logs.len(), 1);
        assert_eq!(out.logs[0].error_kind, ErrorKind::Validation);
    }

    #[test]
    fn markdown_fence_is_stripped() {
        let table = table();
        let window = single_window(&table);
        let text = "```json\n{\"products\":[{\"row\":2,\"name\":\"Widget\",\"price_primary\":10}]}\n```";
        let out = parse_window_response(text, &table, &window, 0).unwrap();
        assert_eq!(out.products.len(), 1);
    }

    #[test]
    fn non_json_response_is_a_schema_error() {
        let table = table();
        let window = single_window(&table);
        let err = parse_window_response("here are your products!", &table, &window, 0);
        assert!(err.is_err());
    }

    #[test]
    fn prices_round_to_two_decimals() {
        let table = table();
        let window = single_window(&table);
        let text = r#"{"products":[{"row":2,"name":"Widget","price_primary":10.005,
            "price_secondary":7.499}]}"#;
        let out = parse_window_response(text, &table, &window, 0).unwrap();
        assert_eq!(out.products[0].price_primary, 10.01);
        assert_eq!(out.products[0].price_secondary, Some(7.5));
    }

    #[test]
    fn foreign_currency_is_flagged_not_converted() {
        let table = table();
        let window = single_window(&table);
        let text = r#"{"products":[{"row":2,"name":"Widget","price_primary":10,
            "foreign_currency":"eur"}]}"#;
        let out = parse_window_response(text, &table, &window, 0).unwrap();
        assert_eq!(out.products[0].foreign_currency.as_deref(), Some("EUR"));
    }
}
