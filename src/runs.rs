//! In-process registry of whole-pipeline runs.
//!
//! At most one run is active at a time. Starting a second run while one is
//! in flight hands back the active run's id instead of a new one.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use crate::stages::{OutcomeStatus, StageOutcome};

/// Finished runs kept for lookup; older ones are forgotten.
const MAX_FINISHED_RUNS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcomes: Vec<StageOutcome>,
    /// Set when the run ended without producing outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct Registry {
    active: Option<Uuid>,
    runs: HashMap<Uuid, RunRecord>,
    finished: VecDeque<Uuid>,
}

#[derive(Clone, Default)]
pub struct RunTracker {
    inner: Arc<Mutex<Registry>>,
}

impl RunTracker {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// A panic in one handler must not wedge the tracker for everyone else.
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new run, or return `Err(active_id)` if one is in flight.
    pub fn try_begin(&self) -> Result<Uuid, Uuid> {
        // ---
        let mut reg = self.lock();
        if let Some(active) = reg.active {
            return Err(active);
        }

        let id = Uuid::new_v4();
        reg.active = Some(id);
        reg.runs.insert(
            id,
            RunRecord {
                id,
                status: RunStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                outcomes: Vec::new(),
                error: None,
            },
        );
        Ok(id)
    }

    /// Drive `run` on its own task and record how it ended.
    ///
    /// The active slot is released even if `run` panics; the run is then
    /// recorded as failed with the panic message.
    pub fn spawn<F>(&self, id: Uuid, run: F) -> JoinHandle<()>
    where
        F: Future<Output = Vec<StageOutcome>> + Send + 'static,
    {
        // ---
        let tracker = self.clone();
        let span = tracing::info_span!("pipeline_run", %id);

        tokio::spawn(
            async move {
                match tokio::spawn(run.in_current_span()).await {
                    Ok(outcomes) => {
                        info!(stages = outcomes.len(), "Pipeline run finished");
                        tracker.finish(id, outcomes);
                    }
                    Err(e) => {
                        let reason = panic_message(e);
                        error!(%reason, "Pipeline run aborted");
                        tracker.abort(id, reason);
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Record the stage outcomes and release the active slot.
    pub fn finish(&self, id: Uuid, outcomes: Vec<StageOutcome>) {
        // ---
        let failed = outcomes.iter().any(|o| o.status == OutcomeStatus::Error);
        let status = if failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        self.close(id, status, outcomes, None);
    }

    /// Mark a run failed without outcomes and release the active slot.
    pub fn abort(&self, id: Uuid, reason: String) {
        self.close(id, RunStatus::Failed, Vec::new(), Some(reason));
    }

    fn close(
        &self,
        id: Uuid,
        status: RunStatus,
        outcomes: Vec<StageOutcome>,
        error: Option<String>,
    ) {
        // ---
        let mut reg = self.lock();
        if reg.active == Some(id) {
            reg.active = None;
        }

        let Some(record) = reg.runs.get_mut(&id) else {
            return;
        };
        record.status = status;
        record.finished_at = Some(Utc::now());
        record.outcomes = outcomes;
        record.error = error;

        reg.finished.push_back(id);
        while reg.finished.len() > MAX_FINISHED_RUNS {
            if let Some(oldest) = reg.finished.pop_front() {
                reg.runs.remove(&oldest);
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<RunRecord> {
        self.lock().runs.get(&id).cloned()
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    // ---
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .map(|msg| format!("pipeline run panicked: {msg}"))
        .unwrap_or_else(|| "pipeline run panicked".to_string())
}
