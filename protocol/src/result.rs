//! Per-task execution outcome and usage accounting.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::stream::StreamUsage;

/// Exit code placeholder while a task is still in flight.
pub const EXIT_CODE_PENDING: i32 = -1;

/// Token and cost accounting for one child agent. Counters only ever grow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
    /// Current context-window occupancy as last reported by the child.
    /// Monotone: a smaller report never shrinks the recorded value.
    pub context_used: u64,
    /// Number of assistant turns observed so far.
    pub turns: u32,
}

impl UsageStats {
    /// Folds one assistant message's usage into the accumulator.
    pub fn absorb(&mut self, usage: &StreamUsage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cache_read_tokens += usage.cache_read_input_tokens;
        self.cache_write_tokens += usage.cache_creation_input_tokens;
        if let Some(cost) = usage.cost_usd {
            self.cost_usd += cost;
        }
        let occupancy = usage
            .context_used
            .unwrap_or(usage.input_tokens + usage.cache_read_input_tokens);
        self.context_used = self.context_used.max(occupancy);
    }
}

/// One child agent's outcome.
///
/// Created empty at launch, mutated incrementally as output lines are
/// parsed, and frozen once the child process exits. Published by value
/// through progress callbacks and the task handle's shared future.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Sequential id, unique within the owning run.
    pub task_id: u64,
    /// Role label for the child agent.
    pub agent: String,
    /// The assignment text delegated to the child.
    pub task: String,
    /// `-1` until the process has exited, `0` on success.
    pub exit_code: i32,
    /// Concatenation of all assistant text observed so far, in emission
    /// order.
    pub text: String,
    /// Location of the persisted transcript, when persistence is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_path: Option<PathBuf>,
    pub usage: UsageStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub stderr: String,
}

impl ExecutionResult {
    /// A fresh, unresolved result for a task that is about to launch.
    pub fn pending(task_id: u64, agent: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            task_id,
            agent: agent.into(),
            task: task.into(),
            exit_code: EXIT_CODE_PENDING,
            text: String::new(),
            session_path: None,
            usage: UsageStats::default(),
            stop_reason: None,
            error_message: None,
            stderr: String::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.exit_code != EXIT_CODE_PENDING
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Short human-readable failure reason, if the task did not succeed.
    pub fn failure_reason(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        Some(match &self.error_message {
            Some(message) => format!("exit {}: {message}", self.exit_code),
            None => format!("exit {}", self.exit_code),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn usage(input: u64, output: u64, context: Option<u64>) -> StreamUsage {
        StreamUsage {
            input_tokens: input,
            output_tokens: output,
            cache_read_input_tokens: 0,
            cache_creation_input_tokens: 0,
            cost_usd: None,
            context_used: context,
        }
    }

    #[test]
    fn usage_accumulates_additively() {
        let mut stats = UsageStats::default();
        stats.absorb(&usage(10, 5, Some(100)));
        stats.absorb(&usage(20, 7, Some(250)));
        assert_eq!(stats.input_tokens, 30);
        assert_eq!(stats.output_tokens, 12);
        assert_eq!(stats.context_used, 250);
    }

    #[test]
    fn context_occupancy_never_decreases() {
        let mut stats = UsageStats::default();
        stats.absorb(&usage(0, 0, Some(500)));
        stats.absorb(&usage(0, 0, Some(100)));
        assert_eq!(stats.context_used, 500);
    }

    #[test]
    fn pending_result_is_unresolved() {
        let result = ExecutionResult::pending(1, "worker", "do the thing");
        assert_eq!(result.exit_code, EXIT_CODE_PENDING);
        assert!(!result.is_resolved());
        assert!(!result.is_success());
        assert_eq!(result.failure_reason(), Some("exit -1".to_string()));
    }
}
