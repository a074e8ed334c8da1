//! Durable, append-only observability store.
//!
//! One directory per run holds `events.jsonl`, the per-task output and
//! pid files written by launches, artifacts produced by programs, and a
//! best-effort `run.json` snapshot of the run record for external tools.

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use factory_protocol::LogEvent;
use factory_protocol::LogLevel;
use factory_protocol::RunRecord;
use tokio::io::AsyncWriteExt;

use crate::error::FactoryError;

const EVENTS_FILE: &str = "events.jsonl";
const RUN_SNAPSHOT_FILE: &str = "run.json";
const ARTIFACTS_DIR: &str = "artifacts";

#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub async fn ensure_run_dir(&self, run_id: &str) -> Result<PathBuf, FactoryError> {
        let dir = self.run_dir(run_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| FactoryError::io(&dir, err))?;
        Ok(dir)
    }

    /// Appends one event to the run's log. Best effort: the runtime never
    /// fails a task because its observability write failed.
    pub async fn log(
        &self,
        run_id: &str,
        level: LogLevel,
        message: &str,
        data: Option<serde_json::Value>,
    ) {
        let event = LogEvent::new(run_id, level, message, data);
        if let Err(err) = self.append_event(&event).await {
            tracing::warn!(run_id, message, "failed to append observability event: {err}");
        }
    }

    async fn append_event(&self, event: &LogEvent) -> Result<(), FactoryError> {
        let dir = self.ensure_run_dir(&event.run_id).await?;
        let path = dir.join(EVENTS_FILE);
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| FactoryError::io(&path, err))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| FactoryError::io(&path, err))?;
        Ok(())
    }

    /// Writes a named artifact under the run's artifact directory and
    /// returns its resolved location, or `None` if the relative path is
    /// invalid (absolute, or attempts to escape the run directory).
    pub async fn artifact(
        &self,
        run_id: &str,
        relative_path: &str,
        content: &[u8],
    ) -> Result<Option<PathBuf>, FactoryError> {
        let Some(safe) = sanitize_relative(relative_path) else {
            return Ok(None);
        };
        let path = self.run_dir(run_id).join(ARTIFACTS_DIR).join(safe);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| FactoryError::io(parent, err))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|err| FactoryError::io(&path, err))?;
        Ok(Some(path))
    }

    /// Best-effort scan of a run's event log. Missing files and
    /// unparseable lines yield an empty or partial result, never an
    /// error.
    pub async fn read_events(&self, run_id: &str) -> Vec<LogEvent> {
        let path = self.run_dir(run_id).join(EVENTS_FILE);
        let Ok(contents) = tokio::fs::read_to_string(&path).await else {
            return Vec::new();
        };
        contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Persists a snapshot of the run record so out-of-process tools can
    /// list runs without talking to the coordinator.
    pub async fn write_run_snapshot(&self, record: &RunRecord) {
        let Ok(dir) = self.ensure_run_dir(&record.run_id).await else {
            return;
        };
        let path = dir.join(RUN_SNAPSHOT_FILE);
        match serde_json::to_vec_pretty(record) {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::write(&path, bytes).await {
                    tracing::warn!(run_id = record.run_id, "failed to write run snapshot: {err}");
                }
            }
            Err(err) => {
                tracing::warn!(run_id = record.run_id, "failed to encode run snapshot: {err}");
            }
        }
    }

    /// Best-effort scan of every persisted run snapshot under the root.
    pub async fn read_run_snapshots(&self) -> Vec<RunRecord> {
        let Ok(mut entries) = tokio::fs::read_dir(&self.root).await else {
            return Vec::new();
        };
        let mut records = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path().join(RUN_SNAPSHOT_FILE);
            let Ok(contents) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            if let Ok(record) = serde_json::from_str(&contents) {
                records.push(record);
            }
        }
        records
    }
}

/// Accepts only plain relative paths: no absolute paths, no `..`, no
/// root/prefix components.
fn sanitize_relative(relative_path: &str) -> Option<PathBuf> {
    let path = Path::new(relative_path);
    if relative_path.is_empty() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() { None } else { Some(out) }
}
