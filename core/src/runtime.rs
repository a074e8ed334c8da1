//! Per-run factory runtime: the API through which an orchestrator or a
//! user program issues child spawns.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use factory_protocol::ExecutionResult;
use factory_protocol::LogLevel;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::FactoryConfig;
use crate::error::FactoryError;
use crate::launcher;
use crate::launcher::Launch;
use crate::launcher::LaunchSpec;
use crate::launcher::ProgressFn;
use crate::registry::RunRegistry;
use crate::store::RunStore;

/// A spawn request.
#[derive(Clone, Default)]
pub struct SpawnInput {
    /// Role label for the child agent.
    pub agent: String,
    /// Assignment text; must be non-empty.
    pub task: String,
    /// Optional system prompt.
    pub prompt: Option<String>,
    /// Model id; falls back to the configured default.
    pub model: Option<String>,
    /// Working directory for the child; defaults to the coordinator's.
    pub cwd: Option<PathBuf>,
    pub tools: Vec<String>,
    pub step: Option<String>,
    /// Caller-owned cancellation; linked so whichever of this, the run's
    /// shutdown, or the process-wide abort fires first wins.
    pub cancel: Option<CancellationToken>,
    pub on_progress: Option<ProgressFn>,
}

/// A future-like reference to an in-flight `ExecutionResult`.
///
/// The result future is shared: repeated or concurrent waits on the same
/// handle all observe the one cached result.
#[derive(Clone)]
pub struct TaskHandle {
    task_id: u64,
    result: Shared<BoxFuture<'static, ExecutionResult>>,
}

// The shared result future is not debuggable; print what a reader can
// act on.
impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl TaskHandle {
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// Waits for the child to settle. Idempotent across repeated waits.
    pub async fn wait(&self) -> ExecutionResult {
        self.result.clone().await
    }

    /// Whether the child has already settled.
    pub fn is_settled(&self) -> bool {
        self.result.peek().is_some()
    }
}

/// The per-run factory. Issues task handles, enforces the spawn depth
/// limit, and relays cancellation into running launches.
pub struct Factory {
    run_id: String,
    depth: u32,
    config: Arc<FactoryConfig>,
    store: Arc<RunStore>,
    registry: Arc<RunRegistry>,
    shutdown: CancellationToken,
    next_task_id: AtomicU64,
    next_group_id: AtomicU64,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl Factory {
    pub fn new(
        run_id: impl Into<String>,
        config: Arc<FactoryConfig>,
        store: Arc<RunStore>,
        registry: Arc<RunRegistry>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let depth = config.depth;
        Arc::new(Self {
            run_id: run_id.into(),
            depth,
            config,
            store,
            registry,
            shutdown,
            next_task_id: AtomicU64::new(0),
            next_group_id: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub(crate) fn next_group_id(&self) -> u64 {
        self.next_group_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Writes one event to this run's observability log.
    pub async fn log(&self, level: LogLevel, message: &str, data: Option<serde_json::Value>) {
        self.store.log(&self.run_id, level, message, data).await;
    }

    /// Writes a named artifact under this run's directory.
    pub async fn artifact(
        &self,
        relative_path: &str,
        content: &[u8],
    ) -> Result<Option<PathBuf>, FactoryError> {
        self.store.artifact(&self.run_id, relative_path, content).await
    }

    /// Launches one child agent for `input` and returns its handle.
    ///
    /// Validation and depth violations fail fast here; anything that goes
    /// wrong after the process starts is captured into the task's
    /// `ExecutionResult` instead.
    pub async fn spawn(&self, input: SpawnInput) -> Result<TaskHandle, FactoryError> {
        if input.task.trim().is_empty() {
            return Err(FactoryError::InvalidInput(
                "task must not be empty".to_string(),
            ));
        }
        let model = input
            .model
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| self.config.model.clone());
        if model.trim().is_empty() {
            return Err(FactoryError::InvalidInput(
                "model must not be empty".to_string(),
            ));
        }
        if self.depth >= self.config.max_depth {
            return Err(FactoryError::DepthExceeded {
                depth: self.depth + 1,
                max: self.config.max_depth,
            });
        }

        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.shutdown.child_token();
        // The relay lives exactly as long as the launch: it is aborted
        // once the child settles, so uncancelled tokens leak nothing.
        let relay = input.cancel.map(|signal| {
            let linked = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = signal.cancelled() => linked.cancel(),
                    () = linked.cancelled() => {}
                }
            })
        });

        let agent = input.agent.clone();
        let task = input.task.clone();
        let cwd = match input.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };
        let launch = Launch {
            run_id: self.run_id.clone(),
            task_id,
            spec: LaunchSpec {
                agent: input.agent,
                task: input.task,
                prompt: input.prompt,
                model: model.clone(),
                cwd,
                tools: input.tools,
                step: input.step,
            },
            run_dir: self.store.run_dir(&self.run_id),
            child_depth: self.depth + 1,
        };

        tracing::info!(
            run_id = self.run_id,
            task_id,
            agent,
            model,
            "spawning child agent"
        );
        self.log(
            LogLevel::Info,
            "task:spawn",
            Some(serde_json::json!({"task_id": task_id, "agent": agent, "model": model})),
        )
        .await;

        let config = self.config.clone();
        let store = self.store.clone();
        let registry = self.registry.clone();
        let run_id = self.run_id.clone();
        let on_progress = input.on_progress;
        let join = tokio::spawn(async move {
            let result = launcher::launch(launch, config, cancel, on_progress).await;
            if let Some(relay) = relay {
                relay.abort();
            }
            let (level, message) = if result.is_success() {
                (LogLevel::Info, "task:done")
            } else {
                (LogLevel::Warn, "task:failed")
            };
            store
                .log(
                    &run_id,
                    level,
                    message,
                    Some(serde_json::json!({
                        "task_id": result.task_id,
                        "exit_code": result.exit_code,
                        "stop_reason": result.stop_reason,
                    })),
                )
                .await;
            registry.record_result(&run_id, result.clone()).await;
            result
        });

        let result = async move {
            match join.await {
                Ok(result) => result,
                Err(err) => {
                    let mut failed = ExecutionResult::pending(task_id, agent, task);
                    failed.exit_code = 1;
                    failed.error_message = Some(format!("launch task aborted: {err}"));
                    failed
                }
            }
        }
        .boxed()
        .shared();

        let handle = TaskHandle { task_id, result };
        self.tasks.lock().await.push(handle.clone());
        Ok(handle)
    }

    /// Number of issued tasks that have not yet settled.
    pub async fn active_count(&self) -> usize {
        let tasks = self.tasks.lock().await;
        tasks.iter().filter(|handle| !handle.is_settled()).count()
    }

    /// Ends the run: with `cancel_running`, every active launch is
    /// signalled for termination first. In both modes this waits for
    /// every tracked task to settle before returning, re-scanning for
    /// tasks spawned while draining, so no task is abandoned mid-flight.
    pub async fn shutdown(&self, cancel_running: bool) -> Vec<ExecutionResult> {
        if cancel_running {
            self.shutdown.cancel();
        }
        let mut results = Vec::new();
        let mut drained = 0usize;
        loop {
            let snapshot: Vec<TaskHandle> = self.tasks.lock().await.clone();
            if snapshot.len() == drained {
                break;
            }
            for handle in &snapshot[drained..] {
                results.push(handle.wait().await);
            }
            drained = snapshot.len();
        }
        results
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}
