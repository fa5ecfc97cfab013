use crate::dedup;
use crate::extract::{ChunkedExtractor, RetryPolicy, chunker, merge_outcomes};
use crate::llm::{LlmClient, LlmConfig};
use crate::models::{
    AnalyzeFileRequest, ExtractedProduct, ExtractionResult, ParsingLogDraft, StageReport,
};
use crate::sheet::selector::SelectorConfig;
use crate::sheet::{self, SheetSummary, select_sheets, serialize_sheet};
use crate::taxonomy::{CatalogStore, CategoryNormalizer, MatchAction};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

/// The externally visible state machine. Transitions are strictly forward;
/// a failed run is re-invoked from `pending` on the original file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    #[default]
    Pending,
    SelectingSheets,
    Serializing,
    Extracting,
    NormalizingCategories,
    Deduplicating,
    Persisting,
    Complete,
    CompletedWithErrors,
    Failed,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Pending => "pending",
            PipelinePhase::SelectingSheets => "selecting_sheets",
            PipelinePhase::Serializing => "serializing",
            PipelinePhase::Extracting => "extracting",
            PipelinePhase::NormalizingCategories => "normalizing_categories",
            PipelinePhase::Deduplicating => "deduplicating",
            PipelinePhase::Persisting => "persisting",
            PipelinePhase::Complete => "complete",
            PipelinePhase::CompletedWithErrors => "completed_with_errors",
            PipelinePhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelinePhase::Complete | PipelinePhase::CompletedWithErrors | PipelinePhase::Failed
        )
    }
}

/// Live progress, published after every chunk and stage transition so a
/// poller can show "N of M rows processed" rather than a bare percentage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressSnapshot {
    pub phase: PipelinePhase,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub successful_extractions: u64,
    pub failed_extractions: u64,
    pub duplicates_removed: u64,
    pub message: Option<String>,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> u8 {
        match self.phase {
            PipelinePhase::Pending => 0,
            PipelinePhase::SelectingSheets => 5,
            PipelinePhase::Serializing => 10,
            PipelinePhase::Extracting => {
                if self.total_rows == 0 {
                    15
                } else {
                    let span = 60.0 * self.processed_rows as f64 / self.total_rows as f64;
                    15 + span.min(60.0) as u8
                }
            }
            PipelinePhase::NormalizingCategories => 80,
            PipelinePhase::Deduplicating => 85,
            PipelinePhase::Persisting => 90,
            PipelinePhase::Complete
            | PipelinePhase::CompletedWithErrors
            | PipelinePhase::Failed => 100,
        }
    }
}

/// Per-run wiring between the orchestrator and its supervisor: where
/// progress goes and how cancellation reaches us. The flag is only checked
/// between chunks; an in-flight inference call drains naturally.
#[derive(Clone)]
pub struct RunContext {
    pub job_id: String,
    cancel: Arc<AtomicBool>,
    progress: watch::Sender<ProgressSnapshot>,
}

impl RunContext {
    pub fn new(
        job_id: String,
        cancel: Arc<AtomicBool>,
        progress: watch::Sender<ProgressSnapshot>,
    ) -> Self {
        Self {
            job_id,
            cancel,
            progress,
        }
    }

    /// Detached context for tests and one-off invocations.
    pub fn standalone(job_id: &str) -> (Self, watch::Receiver<ProgressSnapshot>) {
        let (tx, rx) = watch::channel(ProgressSnapshot::default());
        (
            Self::new(job_id.to_string(), Arc::new(AtomicBool::new(false)), tx),
            rx,
        )
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn publish(&self, snapshot: ProgressSnapshot) {
        self.progress.send_replace(snapshot);
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Internal,
    Cancelled,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn cancelled(stage: &'static str) -> Self {
        Self {
            stage,
            message: "cancelled by caller".into(),
            kind: PipelineErrorKind::Cancelled,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub window_rows: usize,
    pub overlap_rows: usize,
    /// 0-100; fuzzy matches at or above it resolve to the existing node.
    pub similarity_threshold: f64,
    /// Success-rate floor below which nothing is persisted.
    pub partial_floor: f64,
    pub local_currency: String,
    pub selector: SelectorConfig,
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            window_rows: env_usize("ANALYZE_WINDOW_ROWS", 250),
            overlap_rows: env_usize("ANALYZE_OVERLAP_ROWS", 40),
            similarity_threshold: env_f64("CATEGORY_MATCH_THRESHOLD", 85.0),
            partial_floor: env_f64("SUCCESS_RATE_FLOOR", 0.8),
            local_currency: std::env::var("LOCAL_CURRENCY").unwrap_or_else(|_| "USD".into()),
            selector: SelectorConfig::from_env(),
            retry: RetryPolicy::from_env(),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

/// Final job outcome: counts, terminal status and the per-stage transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub job_id: String,
    pub supplier_id: i64,
    pub status: PipelinePhase,
    pub result: ExtractionResult,
    pub persisted_items: u64,
    pub categories_created: u64,
    pub stages: Vec<StageReport>,
}

/// Derive the terminal status from extraction counts. `failed` means nothing
/// from the run is persisted; `completed_with_errors` commits the successful
/// subset.
pub fn terminal_status(result: &ExtractionResult, partial_floor: f64) -> PipelinePhase {
    let rate = result.success_rate();
    if result.total_rows > 0 && rate >= 1.0 {
        PipelinePhase::Complete
    } else if rate >= partial_floor {
        PipelinePhase::CompletedWithErrors
    } else {
        PipelinePhase::Failed
    }
}

#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    pub llm: Arc<LlmClient>,
    pub store: CatalogStore,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, store: CatalogStore) -> Self {
        let llm = LlmClient::new(LlmConfig::from_env());
        Self {
            config: Arc::new(config),
            llm: Arc::new(llm),
            store,
        }
    }

    /// Process one staged file end to end. Row- and chunk-level problems are
    /// logged and absorbed; only file-level conditions surface as `Err`.
    pub async fn run(
        &self,
        request: AnalyzeFileRequest,
        ctx: RunContext,
    ) -> Result<AnalysisReport, PipelineError> {
        let result = self.run_inner(&request, &ctx).await;
        if let Err(err) = &result {
            ctx.publish(ProgressSnapshot {
                phase: PipelinePhase::Failed,
                message: Some(format!("{}: {}", err.stage(), err.detail())),
                ..ProgressSnapshot::default()
            });
        }
        result
    }

    async fn run_inner(
        &self,
        request: &AnalyzeFileRequest,
        ctx: &RunContext,
    ) -> Result<AnalysisReport, PipelineError> {
        let config = self.config.clone();
        let mut stages: Vec<StageReport> = Vec::new();
        let mut snapshot = ProgressSnapshot::default();
        ctx.publish(snapshot.clone());

        if ctx.cancelled() {
            return Err(PipelineError::cancelled("pending"));
        }

        // -- selecting_sheets ------------------------------------------------
        snapshot.phase = PipelinePhase::SelectingSheets;
        ctx.publish(snapshot.clone());
        let started = Instant::now();

        let grids = sheet::load_workbook(PathBuf::from(&request.file_path))
            .await
            .map_err(|err| PipelineError::invalid_input("selecting_sheets", err.to_string()))?;
        let summaries: Vec<SheetSummary> = grids.iter().map(summarize).collect();
        let selection = select_sheets(&summaries, &config.selector);
        if selection.sheets.is_empty() {
            return Err(PipelineError::invalid_input(
                "selecting_sheets",
                format!("sheet_selection_failed: {}", selection.rationale),
            ));
        }
        record_stage(
            &mut stages,
            "select_sheets",
            started,
            json!({
                "available": summaries.iter().map(|s| &s.name).collect::<Vec<_>>(),
                "selected": selection.sheets.clone(),
                "rationale": selection.rationale.clone(),
            }),
        );

        // -- serializing -----------------------------------------------------
        snapshot.phase = PipelinePhase::Serializing;
        ctx.publish(snapshot.clone());
        let started = Instant::now();

        let tables: Vec<_> = grids
            .iter()
            .filter(|grid| selection.sheets.contains(&grid.name))
            .map(serialize_sheet)
            .collect();
        let total_rows: u64 = tables.iter().map(|t| t.rows.len() as u64).sum();
        snapshot.total_rows = total_rows;
        ctx.publish(snapshot.clone());
        record_stage(
            &mut stages,
            "serialize",
            started,
            json!({
                "sheets": tables.iter().map(|t| &t.sheet).collect::<Vec<_>>(),
                "total_rows": total_rows,
            }),
        );

        // -- extracting ------------------------------------------------------
        snapshot.phase = PipelinePhase::Extracting;
        ctx.publish(snapshot.clone());
        let started = Instant::now();

        let extractor = ChunkedExtractor::new(
            self.llm.clone(),
            config.retry.clone(),
            config.local_currency.clone(),
        );
        let mut outcomes = Vec::new();
        let mut chunk_base = 0usize;
        for table in &tables {
            let mut windows =
                chunker::windows(&table.rows, config.window_rows, config.overlap_rows);
            for window in &mut windows {
                window.index += chunk_base;
            }
            chunk_base += windows.len();

            for window in &windows {
                if ctx.cancelled() {
                    return Err(PipelineError::cancelled("extracting"));
                }
                let outcome = extractor
                    .extract_window(table, window)
                    .await
                    .map_err(|err| PipelineError::internal("extracting", err.to_string()))?;

                snapshot.processed_rows += window.owned_rows as u64;
                snapshot.successful_extractions += outcome.products.len() as u64;
                if outcome.failed {
                    snapshot.failed_extractions += outcome.owned_rows as u64;
                }
                crate::metrics::chunk_processed(&table.sheet, window.index, outcome.products.len());
                ctx.publish(snapshot.clone());
                outcomes.push(outcome);
            }
        }

        let window_count = outcomes.len();
        let (products, mut logs, stats) = merge_outcomes(outcomes);
        let mut result = ExtractionResult {
            sheets: selection.sheets.clone(),
            total_rows,
            successful_count: stats.successful,
            failed_count: stats.failed,
            duplicates_removed: 0,
        };
        snapshot.successful_extractions = stats.successful;
        snapshot.failed_extractions = stats.failed;
        ctx.publish(snapshot.clone());
        record_stage(
            &mut stages,
            "extract",
            started,
            json!({
                "windows": window_count,
                "failed_windows": stats.failed_windows,
                "successful": stats.successful,
                "failed": stats.failed,
            }),
        );

        // Thresholds are judged on raw extraction, before any taxonomy
        // writes: a run that is going to fail must not mutate shared state.
        if terminal_status(&result, config.partial_floor) == PipelinePhase::Failed {
            self.flush_logs(&ctx.job_id, &logs).await;
            snapshot.phase = PipelinePhase::Failed;
            snapshot.message = Some(format!(
                "success rate {:.2} below floor {:.2}",
                result.success_rate(),
                config.partial_floor
            ));
            ctx.publish(snapshot.clone());
            warn!(
                target = "pricebook.pipeline",
                job_id = %ctx.job_id,
                success_rate = result.success_rate(),
                "run failed threshold; nothing persisted"
            );
            return Ok(AnalysisReport {
                job_id: ctx.job_id.clone(),
                supplier_id: request.supplier_id,
                status: PipelinePhase::Failed,
                result,
                persisted_items: 0,
                categories_created: 0,
                stages,
            });
        }

        // -- normalizing_categories ------------------------------------------
        snapshot.phase = PipelinePhase::NormalizingCategories;
        ctx.publish(snapshot.clone());
        let started = Instant::now();

        let mut normalizer =
            CategoryNormalizer::new(self.store.clone(), config.similarity_threshold);
        let unique_paths: HashSet<Vec<String>> = products
            .iter()
            .map(|p| p.category_path.clone())
            .filter(|path| !path.is_empty())
            .collect();
        let mut path_leaves: HashMap<Vec<String>, Option<i64>> = HashMap::new();
        let mut categories_created = 0u64;
        let mut matched = 0u64;
        for path in unique_paths {
            let resolution = normalizer
                .resolve_path(&path, request.supplier_id, 0, None)
                .await
                .map_err(|err| {
                    PipelineError::internal("normalizing_categories", err.to_string())
                })?;
            categories_created += resolution
                .matches
                .iter()
                .filter(|m| m.action == MatchAction::Created)
                .count() as u64;
            matched += resolution
                .matches
                .iter()
                .filter(|m| m.action == MatchAction::Matched)
                .count() as u64;
            logs.extend(resolution.logs);
            path_leaves.insert(path, resolution.leaf_id);
        }
        record_stage(
            &mut stages,
            "normalize_categories",
            started,
            json!({
                "paths": path_leaves.len(),
                "matched_levels": matched,
                "created_levels": categories_created,
            }),
        );

        // -- deduplicating ---------------------------------------------------
        snapshot.phase = PipelinePhase::Deduplicating;
        ctx.publish(snapshot.clone());
        let started = Instant::now();

        let outcome = dedup::deduplicate(products);
        result.duplicates_removed = outcome.removed;
        snapshot.duplicates_removed = outcome.removed;
        ctx.publish(snapshot.clone());
        record_stage(
            &mut stages,
            "deduplicate",
            started,
            json!({ "removed": outcome.removed, "kept": outcome.kept.len() }),
        );

        // -- persisting ------------------------------------------------------
        if ctx.cancelled() {
            return Err(PipelineError::cancelled("persisting"));
        }
        snapshot.phase = PipelinePhase::Persisting;
        ctx.publish(snapshot.clone());
        let started = Instant::now();

        self.flush_logs(&ctx.job_id, &logs).await;
        let items: Vec<(ExtractedProduct, Option<i64>)> = outcome
            .kept
            .into_iter()
            .map(|product| {
                let leaf = path_leaves
                    .get(&product.category_path)
                    .copied()
                    .flatten();
                (product, leaf)
            })
            .collect();
        let persisted = self
            .store
            .persist_items(&ctx.job_id, request.supplier_id, &items)
            .await
            .map_err(|err| PipelineError::internal("persisting", err.to_string()))?;
        record_stage(
            &mut stages,
            "persist",
            started,
            json!({ "items": persisted, "log_entries": logs.len() }),
        );

        let status = terminal_status(&result, config.partial_floor);
        snapshot.phase = status;
        snapshot.message = None;
        ctx.publish(snapshot.clone());
        info!(
            target = "pricebook.pipeline",
            job_id = %ctx.job_id,
            status = status.as_str(),
            total_rows = result.total_rows,
            successful = result.successful_count,
            failed = result.failed_count,
            duplicates_removed = result.duplicates_removed,
            persisted = persisted,
            "analysis finished"
        );

        Ok(AnalysisReport {
            job_id: ctx.job_id.clone(),
            supplier_id: request.supplier_id,
            status,
            result,
            persisted_items: persisted,
            categories_created,
            stages,
        })
    }

    /// The parsing log is the audit trail; it is written even for runs that
    /// end `failed`, since it is what lets someone fix the file and retry.
    async fn flush_logs(&self, job_id: &str, logs: &[ParsingLogDraft]) {
        if let Err(err) = self.store.append_parsing_logs(job_id, logs).await {
            warn!(
                target = "pricebook.pipeline",
                job_id = %job_id,
                error = %err,
                "failed to append parsing log entries"
            );
        }
    }
}

fn summarize(grid: &sheet::SheetGrid) -> SheetSummary {
    let header_idx = grid
        .rows
        .iter()
        .position(|row| row.iter().any(|cell| !cell.is_empty()));
    let (header, data_rows) = match header_idx {
        Some(idx) => (
            grid.rows[idx].clone(),
            grid.rows[idx + 1..]
                .iter()
                .filter(|row| row.iter().any(|cell| !cell.is_empty()))
                .count(),
        ),
        None => (Vec::new(), 0),
    };
    SheetSummary {
        name: grid.name.clone(),
        data_rows,
        header,
    }
}

fn record_stage(
    stages: &mut Vec<StageReport>,
    name: &'static str,
    started: Instant,
    output: serde_json::Value,
) {
    let elapsed_ms = started.elapsed().as_millis();
    crate::metrics::stage_elapsed(name, elapsed_ms);
    stages.push(StageReport::new(name, elapsed_ms, output));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_memory;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            window_rows: 250,
            overlap_rows: 40,
            similarity_threshold: 85.0,
            partial_floor: 0.8,
            local_currency: "USD".into(),
            selector: SelectorConfig {
                priority_names: vec!["upload".into()],
                blocklist: vec!["instructions".into()],
            },
            retry: RetryPolicy {
                max_attempts: 1,
                backoff_base: std::time::Duration::from_millis(1),
            },
        }
    }

    async fn test_pipeline() -> Pipeline {
        let pool = connect_memory().await.unwrap();
        Pipeline::new(test_config(), CatalogStore::new(pool))
    }

    fn result(total: u64, successful: u64) -> ExtractionResult {
        ExtractionResult {
            sheets: vec!["Upload".into()],
            total_rows: total,
            successful_count: successful,
            failed_count: total.saturating_sub(successful),
            duplicates_removed: 0,
        }
    }

    #[test]
    fn phase_names_are_snake_case_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&PipelinePhase::SelectingSheets).unwrap(),
            "\"selecting_sheets\""
        );
        assert_eq!(PipelinePhase::CompletedWithErrors.as_str(), "completed_with_errors");
    }

    #[test]
    fn status_is_complete_only_at_full_success() {
        assert_eq!(terminal_status(&result(100, 100), 0.8), PipelinePhase::Complete);
        assert_eq!(
            terminal_status(&result(100, 99), 0.8),
            PipelinePhase::CompletedWithErrors
        );
    }

    #[test]
    fn status_at_the_partial_floor_is_completed_with_errors() {
        assert_eq!(
            terminal_status(&result(100, 80), 0.8),
            PipelinePhase::CompletedWithErrors
        );
        assert_eq!(terminal_status(&result(100, 79), 0.8), PipelinePhase::Failed);
    }

    #[test]
    fn zero_rows_is_a_failed_run() {
        assert_eq!(terminal_status(&result(0, 0), 0.8), PipelinePhase::Failed);
    }

    #[test]
    fn progress_percent_tracks_extraction() {
        let mut snapshot = ProgressSnapshot {
            phase: PipelinePhase::Extracting,
            total_rows: 200,
            processed_rows: 100,
            ..ProgressSnapshot::default()
        };
        assert_eq!(snapshot.percent(), 45);
        snapshot.processed_rows = 200;
        assert_eq!(snapshot.percent(), 75);
        snapshot.phase = PipelinePhase::Complete;
        assert_eq!(snapshot.percent(), 100);
    }

    #[tokio::test]
    async fn missing_file_fails_in_sheet_selection() {
        let pipeline = test_pipeline().await;
        let (ctx, _rx) = RunContext::standalone("job-missing");
        let err = pipeline
            .run(
                AnalyzeFileRequest {
                    file_path: "/nonexistent/pricelist.xlsx".into(),
                    supplier_id: 1,
                    job_id: "job-missing".into(),
                },
                ctx,
            )
            .await
            .expect_err("unreadable file is fatal");
        assert_eq!(err.stage(), "selecting_sheets");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn pre_cancelled_run_never_starts() {
        let pipeline = test_pipeline().await;
        let (ctx, rx) = RunContext::standalone("job-cancel");
        ctx.cancel_flag().store(true, Ordering::Relaxed);
        let err = pipeline
            .run(
                AnalyzeFileRequest {
                    file_path: "/nonexistent/pricelist.xlsx".into(),
                    supplier_id: 1,
                    job_id: "job-cancel".into(),
                },
                ctx,
            )
            .await
            .expect_err("cancelled before work");
        assert_eq!(err.kind(), PipelineErrorKind::Cancelled);
        assert_eq!(rx.borrow().phase, PipelinePhase::Failed);
    }

    #[tokio::test]
    async fn failed_run_publishes_failed_snapshot() {
        let pipeline = test_pipeline().await;
        let (ctx, rx) = RunContext::standalone("job-snap");
        let _ = pipeline
            .run(
                AnalyzeFileRequest {
                    file_path: "/nonexistent/pricelist.xlsx".into(),
                    supplier_id: 1,
                    job_id: "job-snap".into(),
                },
                ctx,
            )
            .await;
        let snapshot = rx.borrow();
        assert_eq!(snapshot.phase, PipelinePhase::Failed);
        assert!(snapshot.message.as_deref().unwrap_or("").contains("selecting_sheets"));
    }
}
