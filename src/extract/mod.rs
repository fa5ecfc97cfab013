pub mod chunker;
pub mod parser;
pub mod prompt;

use crate::extract::chunker::RowWindow;
use crate::extract::parser::{WindowExtraction, parse_window_response};
use crate::llm::{LlmClient, LlmError};
use crate::models::{ErrorKind, ExtractedProduct, ParsingLogDraft};
use crate::sheet::SerializedTable;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

/// Bounded retry with exponential backoff for the inference call. Defaults
/// follow the 2s/4s/8s ladder; jitter keeps concurrent runs from thundering.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let max_attempts = std::env::var("EXTRACT_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(3);
        let backoff_base = std::env::var("EXTRACT_BACKOFF_BASE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v >= 1)
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(2));
        Self {
            max_attempts,
            backoff_base,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1));
        let jitter = rand::rng().random_range(0..250);
        exp + Duration::from_millis(jitter)
    }
}

/// Fatal for the whole run: the gateway never answered on any attempt, so
/// every later window would fail the same way.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("inference gateway unreachable: {0}")]
    GatewayUnreachable(String),
}

/// Result of driving one window through the gateway, retries included.
#[derive(Debug)]
pub struct WindowOutcome {
    pub chunk_index: usize,
    pub owned_rows: usize,
    pub products: Vec<ExtractedProduct>,
    pub logs: Vec<ParsingLogDraft>,
    /// The window exhausted its retries; its owned rows count as failures.
    pub failed: bool,
}

pub struct ChunkedExtractor {
    llm: Arc<LlmClient>,
    retry: RetryPolicy,
    local_currency: String,
}

impl ChunkedExtractor {
    pub fn new(llm: Arc<LlmClient>, retry: RetryPolicy, local_currency: String) -> Self {
        Self {
            llm,
            retry,
            local_currency,
        }
    }

    /// Extract one window. Transport errors and schema failures are retried
    /// up to the policy limit; an exhausted window is recorded and the run
    /// continues, except when the gateway was unreachable on every attempt.
    pub async fn extract_window(
        &self,
        table: &SerializedTable,
        window: &RowWindow,
    ) -> Result<WindowOutcome, ExtractError> {
        let messages = prompt::window_messages(table, window, &self.local_currency);
        let mut last_failure: Option<(ErrorKind, String, Option<String>)> = None;
        let mut transport_failures = 0u32;

        for attempt in 1..=self.retry.max_attempts {
            match self.llm.chat(&messages).await {
                Ok(response) => {
                    match parse_window_response(&response.text, table, window, window.index) {
                        Ok(extraction) => {
                            return Ok(self.success(window, extraction));
                        }
                        Err(err) => {
                            warn!(
                                target = "pricebook.llm",
                                sheet = %table.sheet,
                                chunk_index = window.index,
                                attempt,
                                error = %err,
                                "window response failed schema validation"
                            );
                            last_failure = Some((
                                ErrorKind::MalformedResponse,
                                err.to_string(),
                                Some(response.text),
                            ));
                        }
                    }
                }
                Err(err @ LlmError::MissingGateway) => {
                    return Err(ExtractError::GatewayUnreachable(err.to_string()));
                }
                Err(err) => {
                    warn!(
                        target = "pricebook.llm",
                        sheet = %table.sheet,
                        chunk_index = window.index,
                        attempt,
                        error = %err,
                        "inference call failed"
                    );
                    let kind = match &err {
                        LlmError::Timeout(_) => ErrorKind::Timeout,
                        LlmError::Http(_) => {
                            transport_failures += 1;
                            ErrorKind::Timeout
                        }
                        _ => ErrorKind::MalformedResponse,
                    };
                    last_failure = Some((kind, err.to_string(), None));
                }
            }

            if attempt < self.retry.max_attempts {
                sleep(self.retry.delay(attempt)).await;
            }
        }

        if transport_failures == self.retry.max_attempts {
            let message = last_failure
                .map(|(_, message, _)| message)
                .unwrap_or_else(|| "no response".into());
            return Err(ExtractError::GatewayUnreachable(message));
        }

        let (error_kind, message, raw_payload) = last_failure.unwrap_or((
            ErrorKind::MalformedResponse,
            "window produced no usable response".into(),
            None,
        ));
        Ok(WindowOutcome {
            chunk_index: window.index,
            owned_rows: window.owned_rows,
            products: Vec::new(),
            logs: vec![ParsingLogDraft {
                chunk_index: window.index as i64,
                row_reference: None,
                error_kind,
                message,
                raw_payload,
            }],
            failed: true,
        })
    }

    fn success(&self, window: &RowWindow, extraction: WindowExtraction) -> WindowOutcome {
        WindowOutcome {
            chunk_index: window.index,
            owned_rows: window.owned_rows,
            products: extraction.products,
            logs: extraction.logs,
            failed: false,
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct MergeStats {
    pub successful: u64,
    pub failed: u64,
    pub failed_windows: u64,
}

/// Merge every window outcome of one file. A row extracted by two adjacent
/// windows (the overlap case) keeps the earlier window's occurrence only;
/// the tie-break is chunk order, never wall-clock completion order.
pub fn merge_outcomes(
    mut outcomes: Vec<WindowOutcome>,
) -> (Vec<ExtractedProduct>, Vec<ParsingLogDraft>, MergeStats) {
    outcomes.sort_by_key(|o| o.chunk_index);

    let mut seen_rows: HashSet<(String, u32)> = HashSet::new();
    let mut products = Vec::new();
    let mut logs = Vec::new();
    let mut stats = MergeStats::default();

    for outcome in outcomes {
        if outcome.failed {
            stats.failed_windows += 1;
            stats.failed += outcome.owned_rows as u64;
        }
        for product in outcome.products {
            let keep = product.source.row == 0
                || seen_rows.insert((product.source.sheet.clone(), product.source.row));
            if keep {
                products.push(product);
            }
        }
        stats.failed += outcome
            .logs
            .iter()
            .filter(|log| log.error_kind == ErrorKind::RejectedField)
            .count() as u64;
        logs.extend(outcome.logs);
    }

    stats.successful = products.len() as u64;
    (products, logs, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceRowRef;

    fn product(sheet: &str, row: u32, chunk_index: usize, name: &str) -> ExtractedProduct {
        ExtractedProduct {
            name: name.to_string(),
            description: None,
            price_primary: 10.0,
            price_secondary: None,
            category_path: vec![],
            source: SourceRowRef {
                sheet: sheet.to_string(),
                row,
                raw: vec![],
            },
            chunk_index,
            foreign_currency: None,
        }
    }

    fn outcome(chunk_index: usize, owned_rows: usize, products: Vec<ExtractedProduct>) -> WindowOutcome {
        WindowOutcome {
            chunk_index,
            owned_rows,
            products,
            logs: Vec::new(),
            failed: false,
        }
    }

    #[test]
    fn boundary_duplicate_keeps_earlier_window_occurrence() {
        // A 300-row table split 250/40: sheet row 260 sits in both windows.
        let w0 = outcome(0, 250, vec![product("Upload", 260, 0, "Boundary Widget")]);
        let w1 = outcome(1, 50, vec![product("Upload", 260, 1, "Boundary Widget")]);
        let (products, _, stats) = merge_outcomes(vec![w1, w0]);
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].chunk_index, 0);
        assert_eq!(stats.successful, 1);
    }

    #[test]
    fn failed_window_charges_only_owned_rows() {
        let w0 = outcome(0, 250, vec![product("Upload", 2, 0, "A")]);
        let mut w1 = outcome(1, 50, vec![]);
        w1.failed = true;
        w1.logs.push(ParsingLogDraft {
            chunk_index: 1,
            row_reference: None,
            error_kind: ErrorKind::MalformedResponse,
            message: "bad json".into(),
            raw_payload: None,
        });
        let (products, logs, stats) = merge_outcomes(vec![w0, w1]);
        assert_eq!(products.len(), 1);
        assert_eq!(stats.failed, 50);
        assert_eq!(stats.failed_windows, 1);
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn rejected_rows_count_as_failures() {
        let mut w0 = outcome(0, 100, vec![]);
        w0.logs.push(ParsingLogDraft {
            chunk_index: 0,
            row_reference: Some("Upload!5".into()),
            error_kind: ErrorKind::RejectedField,
            message: "missing price_primary".into(),
            raw_payload: None,
        });
        let (_, _, stats) = merge_outcomes(vec![w0]);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.failed_windows, 0);
    }

    #[test]
    fn rows_without_references_are_never_merged_away() {
        let w0 = outcome(0, 10, vec![product("Upload", 0, 0, "A")]);
        let w1 = outcome(1, 10, vec![product("Upload", 0, 1, "B")]);
        let (products, _, _) = merge_outcomes(vec![w0, w1]);
        assert_eq!(products.len(), 2);
    }
}
