//! Error taxonomy for the factory runtime.
//!
//! Per-child failures are never surfaced through this enum: they are
//! captured into that child's `ExecutionResult` so one failing child
//! cannot abort its siblings. These variants cover validation, state and
//! process-level errors thrown at the call site that caused them.

use factory_protocol::RunStatus;

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("invalid spawn input: {0}")]
    InvalidInput(String),
    #[error("spawn depth {depth} exceeds the configured maximum of {max}")]
    DepthExceeded { depth: u32, max: u32 },
    #[error("task {task_id} failed: {reason}")]
    TaskFailed { task_id: u64, reason: String },
    #[error("run `{0}` not found")]
    UnknownRun(String),
    #[error("run status transition {from} -> {to} is invalid")]
    InvalidTransition { from: RunStatus, to: RunStatus },
    #[error("program execution was not confirmed")]
    ConfirmationRejected,
    #[error("program failed: {0}")]
    Program(String),
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("child process error: {0}")]
    Process(#[source] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FactoryError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
