//! Runs user-supplied orchestration programs against a bound factory.
//!
//! Execution is gated: a program can spawn arbitrarily many child
//! processes, so it never runs unattended. An optional preflight check
//! over the program source is advisory only; its diagnostics are logged
//! and execution proceeds.

use std::sync::Arc;

use async_trait::async_trait;
use factory_protocol::ExecutionResult;
use factory_protocol::LogLevel;
use factory_protocol::RunStatus;

use crate::config::FactoryConfig;
use crate::error::FactoryError;
use crate::registry::RunRegistry;
use crate::runtime::Factory;
use crate::runtime::SpawnInput;
use crate::store::RunStore;

/// A user-supplied orchestration program. The factory handed to `run` is
/// the sole orchestration entry point available to it.
#[async_trait]
pub trait Program: Send + Sync {
    /// One-line summary shown at the confirmation step.
    fn describe(&self) -> String;

    /// Raw program source, when one exists, for the preflight check.
    fn source(&self) -> Option<&str> {
        None
    }

    async fn run(&self, factory: Arc<Factory>) -> anyhow::Result<serde_json::Value>;
}

/// Explicit user approval before a program may execute.
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    async fn confirm(&self, summary: &str) -> bool;
}

/// Gate that approves everything; for non-interactive callers that have
/// already collected approval.
pub struct AutoApprove;

#[async_trait]
impl ConfirmationGate for AutoApprove {
    async fn confirm(&self, _summary: &str) -> bool {
        true
    }
}

/// Static check over a program's source. Advisory: a failing check
/// surfaces its diagnostic but never blocks execution.
pub trait Preflight: Send + Sync {
    fn check(&self, source: &str) -> Result<(), String>;
}

/// What a finished program execution produced.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub run_id: String,
    pub status: RunStatus,
    /// The program's return value, when it completed.
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Every child result recorded for the run.
    pub results: Vec<ExecutionResult>,
}

pub struct ProgramExecutor {
    config: Arc<FactoryConfig>,
    store: Arc<RunStore>,
    registry: Arc<RunRegistry>,
    gate: Arc<dyn ConfirmationGate>,
    preflight: Option<Arc<dyn Preflight>>,
}

impl ProgramExecutor {
    pub fn new(
        config: Arc<FactoryConfig>,
        store: Arc<RunStore>,
        registry: Arc<RunRegistry>,
        gate: Arc<dyn ConfirmationGate>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            gate,
            preflight: None,
        }
    }

    pub fn with_preflight(mut self, preflight: Arc<dyn Preflight>) -> Self {
        self.preflight = Some(preflight);
        self
    }

    /// Runs `program` as one run: confirmation, advisory preflight, a
    /// fresh factory, then a terminal status once every spawned task has
    /// settled.
    pub async fn execute(&self, program: &dyn Program) -> Result<ExecuteOutcome, FactoryError> {
        if !self.gate.confirm(&program.describe()).await {
            return Err(FactoryError::ConfirmationRejected);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let shutdown = self.registry.begin_run(&run_id).await;
        self.store.ensure_run_dir(&run_id).await?;
        self.store
            .log(
                &run_id,
                LogLevel::Info,
                "run:start",
                Some(serde_json::json!({"program": program.describe()})),
            )
            .await;

        if let (Some(preflight), Some(source)) = (&self.preflight, program.source()) {
            if let Err(diagnostic) = preflight.check(source) {
                tracing::warn!(run_id, "preflight diagnostics: {diagnostic}");
                self.store
                    .log(
                        &run_id,
                        LogLevel::Warn,
                        "preflight:diagnostics",
                        Some(serde_json::json!({"diagnostic": diagnostic})),
                    )
                    .await;
            }
        }

        let factory = Factory::new(
            &run_id,
            self.config.clone(),
            self.store.clone(),
            self.registry.clone(),
            shutdown.clone(),
        );

        let program_run = program.run(factory.clone());
        tokio::pin!(program_run);
        let program_outcome = tokio::select! {
            outcome = &mut program_run => Some(outcome),
            () = shutdown.cancelled() => None,
        };

        let (status, value, error) = match program_outcome {
            Some(Ok(value)) => {
                // Drain tasks the program left unawaited; the run is not
                // terminal until all of them settle.
                factory.shutdown(false).await;
                if shutdown.is_cancelled() {
                    (RunStatus::Cancelled, Some(value), None)
                } else {
                    (RunStatus::Done, Some(value), None)
                }
            }
            Some(Err(err)) => {
                factory.shutdown(true).await;
                let err = FactoryError::Program(err.to_string());
                (RunStatus::Failed, None, Some(err.to_string()))
            }
            None => {
                factory.shutdown(true).await;
                (RunStatus::Cancelled, None, None)
            }
        };

        self.registry.finish_run(&run_id, status, error.clone()).await?;
        self.store
            .log(
                &run_id,
                LogLevel::Info,
                "run:finish",
                Some(serde_json::json!({"status": status.to_string()})),
            )
            .await;

        let results = self
            .registry
            .get(&run_id)
            .await
            .map(|record| record.results)
            .unwrap_or_default();
        Ok(ExecuteOutcome {
            run_id,
            status,
            value,
            error,
            results,
        })
    }

    /// Direct single delegation: one run, one spawn, one result. No
    /// confirmation gate, since the caller states the task explicitly.
    pub async fn spawn_direct(&self, input: SpawnInput) -> Result<ExecutionResult, FactoryError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let shutdown = self.registry.begin_run(&run_id).await;
        let factory = Factory::new(
            &run_id,
            self.config.clone(),
            self.store.clone(),
            self.registry.clone(),
            shutdown.clone(),
        );
        match factory.spawn(input).await {
            Ok(handle) => {
                let result = handle.wait().await;
                let status = if shutdown.is_cancelled() {
                    RunStatus::Cancelled
                } else if result.is_success() {
                    RunStatus::Done
                } else {
                    RunStatus::Failed
                };
                self.registry
                    .finish_run(&run_id, status, result.failure_reason())
                    .await?;
                Ok(result)
            }
            Err(err) => {
                self.registry
                    .finish_run(&run_id, RunStatus::Failed, Some(err.to_string()))
                    .await?;
                Err(err)
            }
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }
}
