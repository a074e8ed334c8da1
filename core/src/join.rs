//! Fan-out/fan-in combinators with concurrency-group instrumentation.
//!
//! The wait-for-all combinator is an explicitly scoped decorator on the
//! factory, not a global patch: a wait over a collection containing one
//! or more task handles logs `group:start` before the wait and
//! `group:done` / `group:failed` once it settles. Collections with no
//! task handles pass through with no events and unchanged results, so
//! the instrumentation is transparent and concurrent runs can never
//! observe each other's groups.

use factory_protocol::ExecutionResult;
use factory_protocol::LogLevel;

use crate::error::FactoryError;
use crate::runtime::Factory;
use crate::runtime::TaskHandle;

/// Input to a wait-for-all: a plain value or a pending child result.
/// Dispatch is on the tag, never on runtime shape.
#[derive(Clone)]
pub enum JoinInput {
    Value(serde_json::Value),
    Task(TaskHandle),
}

impl From<serde_json::Value> for JoinInput {
    fn from(value: serde_json::Value) -> Self {
        JoinInput::Value(value)
    }
}

impl From<TaskHandle> for JoinInput {
    fn from(handle: TaskHandle) -> Self {
        JoinInput::Task(handle)
    }
}

/// Settled counterpart of [`JoinInput`], input order preserved.
#[derive(Debug, Clone)]
pub enum JoinOutcome {
    Value(serde_json::Value),
    Task(ExecutionResult),
}

impl JoinOutcome {
    pub fn as_task(&self) -> Option<&ExecutionResult> {
        match self {
            JoinOutcome::Task(result) => Some(result),
            JoinOutcome::Value(_) => None,
        }
    }
}

impl Factory {
    /// Waits for every input concurrently and escalates if any task
    /// member settled unsuccessfully.
    pub async fn join_all(&self, inputs: Vec<JoinInput>) -> Result<Vec<JoinOutcome>, FactoryError> {
        let outcomes = self.join_all_settled(inputs).await;
        for outcome in &outcomes {
            if let JoinOutcome::Task(result) = outcome {
                if let Some(reason) = result.failure_reason() {
                    return Err(FactoryError::TaskFailed {
                        task_id: result.task_id,
                        reason,
                    });
                }
            }
        }
        Ok(outcomes)
    }

    /// Waits for every input concurrently and returns all outcomes,
    /// successful or not. This is the path a program uses when it wants
    /// to inspect failures itself.
    pub async fn join_all_settled(&self, inputs: Vec<JoinInput>) -> Vec<JoinOutcome> {
        let members: Vec<u64> = inputs
            .iter()
            .filter_map(|input| match input {
                JoinInput::Task(handle) => Some(handle.task_id()),
                JoinInput::Value(_) => None,
            })
            .collect();
        let group_id = if members.is_empty() {
            None
        } else {
            Some(self.next_group_id())
        };

        if let Some(group_id) = group_id {
            self.log(
                LogLevel::Info,
                "group:start",
                Some(serde_json::json!({
                    "group_id": group_id,
                    "member_count": members.len(),
                    "members": members,
                })),
            )
            .await;
        }

        let waits = inputs.into_iter().map(|input| async move {
            match input {
                JoinInput::Value(value) => JoinOutcome::Value(value),
                JoinInput::Task(handle) => JoinOutcome::Task(handle.wait().await),
            }
        });
        let outcomes = futures::future::join_all(waits).await;

        if let Some(group_id) = group_id {
            let failed: Vec<u64> = outcomes
                .iter()
                .filter_map(JoinOutcome::as_task)
                .filter(|result| !result.is_success())
                .map(|result| result.task_id)
                .collect();
            let (message, level) = if failed.is_empty() {
                ("group:done", LogLevel::Info)
            } else {
                ("group:failed", LogLevel::Warn)
            };
            self.log(
                level,
                message,
                Some(serde_json::json!({
                    "group_id": group_id,
                    "failed_members": failed,
                })),
            )
            .await;
        }

        outcomes
    }
}
