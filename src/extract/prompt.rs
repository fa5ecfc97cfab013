use crate::extract::chunker::RowWindow;
use crate::llm::LlmMessage;
use crate::sheet::SerializedTable;
use serde_json::json;

pub(crate) const SYSTEM_PROMPT: &str = r#"
You are a price-list extraction agent. You receive one window of a supplier
price list rendered as a pipe-delimited table whose first line is the header
row. Respond with a single JSON object {"products": [...]} where each entry
has: "row" (the 1-based sheet row the record came from), "name",
"description" (or null), "price_primary" (the sale/retail price),
"price_secondary" (wholesale, or null), "category_path" (array of category
names from root to leaf, or []), "split_confidence" (0-1, only when you split
a composite cell into several fields), "foreign_currency" (ISO code, only
when the row is priced in a currency other than the stated local one).

Rules: do not invent values; leave missing fields null. Strip currency
symbols and thousands separators from prices. Prices without a currency
marker are in the local currency. Do not convert foreign-currency prices;
report the currency code instead. When one cell combines category, name and
specification text, split it into the separate fields in this same response.
Skip section headings, subtotals and decorative rows. Output JSON only.
"#;

/// Build the two-message prompt for one window. The header line rides along
/// in every window so column semantics survive chunking.
pub fn window_messages(
    table: &SerializedTable,
    window: &RowWindow,
    local_currency: &str,
) -> Vec<LlmMessage> {
    let payload = json!({
        "sheet": table.sheet,
        "columns": table.header,
        "local_currency": local_currency,
        "window_index": window.index,
        "first_sheet_row": window.rows.first().map(|r| r.row),
        "last_sheet_row": window.rows.last().map(|r| r.row),
        "table": table.render_window(&window.rows),
    });

    vec![
        LlmMessage {
            role: "system".into(),
            content: SYSTEM_PROMPT.into(),
        },
        LlmMessage {
            role: "user".into(),
            content: payload.to_string(),
        },
    ]
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
                    cells: vec!["Gadget".into(), "12.50".into()],
                },
            ],
        }
    }

    #[test]
    fn every_window_carries_the_header() {
        let table = table();
        let wins = windows(&table.rows, 1, 0);
        assert_eq!(wins.len(), 2);
        for win in &wins {
            let messages = window_messages(&table, win, "USD");
            assert_eq!(messages.len(), 2);
            assert!(messages[1].content.contains("| Name | Price |"));
        }
    }

    #[test]
    fn payload_names_the_local_currency_and_bounds() {
        let table = table();
        let wins = windows(&table.rows, 10, 2);
        let content = &window_messages(&table, &wins[0], "EUR")[1].content;
        let value: serde_json::Value = serde_json::from_str(content).unwrap();
        assert_eq!(value["local_currency"], "EUR");
        assert_eq!(value["first_sheet_row"], 2);
        assert_eq!(value["last_sheet_row"], 3);
    }
}
