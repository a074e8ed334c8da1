//! Process-wide table of active and completed runs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use factory_protocol::ExecutionResult;
use factory_protocol::RunRecord;
use factory_protocol::RunStatus;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::FactoryError;
use crate::store::RunStore;

struct RunEntry {
    record: RunRecord,
    shutdown: CancellationToken,
}

/// Registry of runs in this coordinator process. Owns the process-wide
/// abort token; every run's shutdown token is a child of it, so aborting
/// the process cancels every run, which in turn cancels every task.
pub struct RunRegistry {
    runs: RwLock<HashMap<String, RunEntry>>,
    abort_all: CancellationToken,
    store: Arc<RunStore>,
}

impl RunRegistry {
    pub fn new(store: Arc<RunStore>) -> Arc<Self> {
        Arc::new(Self {
            runs: RwLock::new(HashMap::new()),
            abort_all: CancellationToken::new(),
            store,
        })
    }

    /// Cancels every active run at once.
    pub fn abort_all(&self) {
        self.abort_all.cancel();
    }

    /// Registers a new run in `running` state and returns its shutdown
    /// token.
    pub async fn begin_run(&self, run_id: &str) -> CancellationToken {
        let shutdown = self.abort_all.child_token();
        let record = RunRecord::new(run_id);
        self.store.write_run_snapshot(&record).await;
        let mut runs = self.runs.write().await;
        runs.insert(
            run_id.to_string(),
            RunEntry {
                record,
                shutdown: shutdown.clone(),
            },
        );
        shutdown
    }

    /// Appends one child result to its run.
    pub async fn record_result(&self, run_id: &str, result: ExecutionResult) {
        let snapshot = {
            let mut runs = self.runs.write().await;
            let Some(entry) = runs.get_mut(run_id) else {
                tracing::warn!(run_id, "result for unknown run dropped");
                return;
            };
            entry.record.results.push(result);
            entry.record.clone()
        };
        self.store.write_run_snapshot(&snapshot).await;
    }

    /// Moves a run to a terminal status. Rejects transitions out of a
    /// terminal state.
    pub async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), FactoryError> {
        let snapshot = {
            let mut runs = self.runs.write().await;
            let entry = runs
                .get_mut(run_id)
                .ok_or_else(|| FactoryError::UnknownRun(run_id.to_string()))?;
            if !entry.record.status.can_transition_to(status) {
                return Err(FactoryError::InvalidTransition {
                    from: entry.record.status,
                    to: status,
                });
            }
            entry.record.status = status;
            entry.record.completed_at = Some(Utc::now());
            entry.record.error = error;
            entry.record.clone()
        };
        self.store.write_run_snapshot(&snapshot).await;
        Ok(())
    }

    /// Fires a running run's shutdown token. Returns false when the run
    /// is unknown or already terminal.
    pub async fn cancel(&self, run_id: &str) -> bool {
        let runs = self.runs.read().await;
        match runs.get(run_id) {
            Some(entry) if entry.record.status == RunStatus::Running => {
                tracing::info!(run_id, "cancelling run");
                entry.shutdown.cancel();
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, run_id: &str) -> Option<RunRecord> {
        let runs = self.runs.read().await;
        runs.get(run_id).map(|entry| entry.record.clone())
    }

    /// All runs, running first, most recent first within each group.
    pub async fn get_all(&self) -> Vec<RunRecord> {
        let runs = self.runs.read().await;
        let mut records: Vec<RunRecord> = runs.values().map(|entry| entry.record.clone()).collect();
        sort_records(&mut records);
        records
    }

    pub async fn get_active(&self) -> Vec<RunRecord> {
        self.get_all()
            .await
            .into_iter()
            .filter(|record| record.status == RunStatus::Running)
            .collect()
    }
}

/// Running runs first, then by recency.
pub fn sort_records(records: &mut [RunRecord]) {
    records.sort_by(|a, b| {
        let a_running = a.status == RunStatus::Running;
        let b_running = b.status == RunStatus::Running;
        b_running
            .cmp(&a_running)
            .then_with(|| b.started_at.cmp(&a.started_at))
    });
}
