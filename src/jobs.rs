use crate::models::{AnalyzeFileRequest, ApiError, JobStatusResponse};
use crate::pipeline::{AnalysisReport, Pipeline, PipelinePhase, ProgressSnapshot, RunContext};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};
use tracing::info;
use uuid::Uuid;

/// One worker task drains the queue; each file is one long-lived multi-step
/// run. Externally fire-and-poll, internally sequential.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    entries: Arc<Mutex<HashMap<String, JobEntry>>>,
}

struct Job {
    id: String,
    request: AnalyzeFileRequest,
    cancel: Arc<AtomicBool>,
    progress_tx: watch::Sender<ProgressSnapshot>,
}

struct JobEntry {
    state: JobState,
    progress: watch::Receiver<ProgressSnapshot>,
    cancel: Arc<AtomicBool>,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { report: AnalysisReport },
    Failed { error: String, stage: String },
}

impl JobState {
    fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed { .. } | JobState::Failed { .. })
    }
}

impl JobQueue {
    pub fn spawn(pipeline: Pipeline) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let entries: Arc<Mutex<HashMap<String, JobEntry>>> = Arc::new(Mutex::new(HashMap::new()));
        let entries_bg = entries.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                {
                    let mut guard = entries_bg.lock().await;
                    if let Some(entry) = guard.get_mut(&job.id) {
                        entry.state = JobState::Running;
                    }
                }

                let ctx = RunContext::new(job.id.clone(), job.cancel.clone(), job.progress_tx);
                let result = pipeline.run(job.request, ctx).await;

                let mut guard = entries_bg.lock().await;
                let Some(entry) = guard.get_mut(&job.id) else {
                    continue;
                };
                match result {
                    Ok(report) => {
                        entry.state = JobState::Completed { report };
                    }
                    Err(err) => {
                        entry.state = JobState::Failed {
                            error: err.detail().to_string(),
                            stage: err.stage().to_string(),
                        };
                    }
                }
            }
        });

        (Self { tx, entries }, handle)
    }

    /// Register a job and hand it to the worker. The caller's `job_id` is
    /// the key; resubmitting an id is only allowed once the previous run is
    /// terminal (a failed run restarts from `pending`, never mid-way).
    pub async fn enqueue(&self, mut request: AnalyzeFileRequest) -> Result<String, ApiError> {
        if request.job_id.trim().is_empty() {
            request.job_id = Uuid::new_v4().to_string();
        }
        let id = request.job_id.clone();

        let cancel = Arc::new(AtomicBool::new(false));
        let (progress_tx, progress_rx) = watch::channel(ProgressSnapshot::default());
        {
            let mut guard = self.entries.lock().await;
            if let Some(existing) = guard.get(&id)
                && !existing.state.is_terminal()
            {
                return Err(ApiError {
                    error: "job_already_active".into(),
                    detail: Some(format!("job `{id}` is still queued or running")),
                });
            }
            guard.insert(
                id.clone(),
                JobEntry {
                    state: JobState::Queued,
                    progress: progress_rx,
                    cancel: cancel.clone(),
                },
            );
        }

        let job = Job {
            id: id.clone(),
            request,
            cancel,
            progress_tx,
        };
        self.tx.send(job).await.map_err(|_| ApiError {
            error: "queue_send_failed".into(),
            detail: Some("worker not available".into()),
        })?;
        info!(target = "pricebook.api", job_id = %id, "analysis job queued");
        Ok(id)
    }

    pub async fn status(&self, id: &str) -> Option<JobStatusResponse> {
        let guard = self.entries.lock().await;
        let entry = guard.get(id)?;
        Some(match &entry.state {
            JobState::Queued => JobStatusResponse {
                job_id: id.to_string(),
                status: PipelinePhase::Pending.as_str().to_string(),
                progress_percent: 0,
                total_rows: None,
                successful_extractions: None,
                failed_extractions: None,
                duplicates_removed: None,
                current_phase: None,
                message: None,
            },
            JobState::Running => {
                let snapshot = entry.progress.borrow().clone();
                JobStatusResponse {
                    job_id: id.to_string(),
                    status: snapshot.phase.as_str().to_string(),
                    progress_percent: snapshot.percent(),
                    total_rows: Some(snapshot.total_rows),
                    successful_extractions: Some(snapshot.successful_extractions),
                    failed_extractions: Some(snapshot.failed_extractions),
                    duplicates_removed: Some(snapshot.duplicates_removed),
                    current_phase: Some(snapshot.phase.as_str().to_string()),
                    message: snapshot.message.clone(),
                }
            }
            JobState::Completed { report } => JobStatusResponse {
                job_id: id.to_string(),
                status: report.status.as_str().to_string(),
                progress_percent: 100,
                total_rows: Some(report.result.total_rows),
                successful_extractions: Some(report.result.successful_count),
                failed_extractions: Some(report.result.failed_count),
                duplicates_removed: Some(report.result.duplicates_removed),
                current_phase: None,
                message: None,
            },
            JobState::Failed { error, stage } => JobStatusResponse {
                job_id: id.to_string(),
                status: PipelinePhase::Failed.as_str().to_string(),
                progress_percent: 100,
                total_rows: None,
                successful_extractions: None,
                failed_extractions: None,
                duplicates_removed: None,
                current_phase: Some(stage.clone()),
                message: Some(error.clone()),
            },
        })
    }

    /// Flip the cancellation flag. The orchestrator notices between chunks;
    /// an in-flight inference call drains or times out naturally.
    pub async fn cancel(&self, id: &str) -> bool {
        let guard = self.entries.lock().await;
        match guard.get(id) {
            Some(entry) if !entry.state.is_terminal() => {
                entry.cancel.store(true, Ordering::Relaxed);
                info!(target = "pricebook.api", job_id = %id, "cancellation requested");
                true
            }
            _ => false,
        }
    }
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}
