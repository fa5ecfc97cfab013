use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

/// Body of `POST /analyze/file`. The courier has already staged `file_path`
/// on shared storage; this service never downloads anything itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AnalyzeFileRequest {
    pub file_path: String,
    pub supplier_id: i64,
    /// Correlation id from the upstream queue. Blank means we mint one.
    #[serde(default)]
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: String,
    pub status: String,
}

/// Payload of `GET /analyze/status/{job_id}`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: String,
    pub progress_percent: u8,
    pub total_rows: Option<u64>,
    pub successful_extractions: Option<u64>,
    pub failed_extractions: Option<u64>,
    pub duplicates_removed: Option<u64>,
    pub current_phase: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Where a record came from, kept verbatim for debugging and for the
/// parsing log. `row` is the 1-based physical sheet row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRowRef {
    pub sheet: String,
    pub row: u32,
    pub raw: Vec<String>,
}

impl SourceRowRef {
    pub fn label(&self) -> String {
        format!("{}!{}", self.sheet, self.row)
    }
}

/// One validated product record. A candidate missing `name` or
/// `price_primary` after normalization never becomes one of these.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedProduct {
    pub name: String,
    pub description: Option<String>,
    /// Sale/retail price, non-negative, rounded to 2 decimal places.
    pub price_primary: f64,
    /// Wholesale price, when the sheet carries one.
    pub price_secondary: Option<f64>,
    /// Root-to-leaf category names as extracted, trimmed and non-empty.
    pub category_path: Vec<String>,
    pub source: SourceRowRef,
    /// Originating window; the dedup tie-break uses this, not completion order.
    pub chunk_index: usize,
    /// Set when the row priced in a non-local currency; flagged for manual
    /// review instead of converted.
    pub foreign_currency: Option<String>,
}

/// Aggregate outcome of the extraction stages for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub sheets: Vec<String>,
    pub total_rows: u64,
    pub successful_count: u64,
    pub failed_count: u64,
    pub duplicates_removed: u64,
}

impl ExtractionResult {
    pub fn success_rate(&self) -> f64 {
        if self.total_rows == 0 {
            0.0
        } else {
            self.successful_count as f64 / self.total_rows as f64
        }
    }
}

/// Parsing-log taxonomy. Append-only; one row per dropped record, failed
/// window, or taxonomy write that fell back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Timeout,
    MalformedResponse,
    RejectedField,
    CategoryCreationConflict,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::RejectedField => "rejected_field",
            ErrorKind::CategoryCreationConflict => "category_creation_conflict",
        }
    }
}

/// A parsing-log row before it reaches the store (no job id yet; the
/// orchestrator stamps that when it flushes).
#[derive(Debug, Clone, Serialize)]
pub struct ParsingLogDraft {
    pub chunk_index: i64,
    pub row_reference: Option<String>,
    pub error_kind: ErrorKind,
    pub message: String,
    pub raw_payload: Option<String>,
}

/// Per-stage transcript entry, mirrored into the final report so a caller
/// can audit what each stage decided and how long it took.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_zero_rows_is_zero() {
        let result = ExtractionResult {
            sheets: vec![],
            total_rows: 0,
            successful_count: 0,
            failed_count: 0,
            duplicates_removed: 0,
        };
        assert_eq!(result.success_rate(), 0.0);
    }

    #[test]
    fn success_rate_partial() {
        let result = ExtractionResult {
            sheets: vec!["Sheet1".into()],
            total_rows: 10,
            successful_count: 9,
            failed_count: 1,
            duplicates_removed: 0,
        };
        assert!((result.success_rate() - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn error_kind_wire_names() {
        assert_eq!(ErrorKind::MalformedResponse.as_str(), "malformed_response");
        assert_eq!(
            serde_json::to_string(&ErrorKind::RejectedField).unwrap(),
            "\"rejected_field\""
        );
    }
}
