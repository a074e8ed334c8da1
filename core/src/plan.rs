//! Declarative orchestration plans.
//!
//! A plan is the built-in program shape: a sequence of stages, each a
//! parallel group of task definitions. Stages run in order; the tasks of
//! one stage fan out together and are collected through the factory's
//! settled combinator.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::error::FactoryError;
use crate::executor::Preflight;
use crate::executor::Program;
use crate::join::JoinInput;
use crate::join::JoinOutcome;
use crate::runtime::Factory;
use crate::runtime::SpawnInput;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub name: Option<String>,
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    #[serde(default)]
    pub name: Option<String>,
    pub tasks: Vec<TaskDef>,
    /// Escalate (failing the run) as soon as this stage has a failed
    /// member; later stages do not run.
    #[serde(default)]
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub agent: String,
    pub task: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl TaskDef {
    fn to_spawn_input(&self, step: Option<String>) -> SpawnInput {
        SpawnInput {
            agent: self.agent.clone(),
            task: self.task.clone(),
            prompt: self.prompt.clone(),
            model: self.model.clone(),
            tools: self.tools.clone(),
            step,
            ..SpawnInput::default()
        }
    }
}

impl Plan {
    /// Parses TOML first, then JSON, so both file flavors work.
    pub fn parse(source: &str) -> Result<Self, FactoryError> {
        if let Ok(plan) = toml::from_str::<Plan>(source) {
            return Ok(plan);
        }
        serde_json::from_str::<Plan>(source)
            .map_err(|err| FactoryError::InvalidPlan(format!("not valid TOML or JSON: {err}")))
    }

    /// Semantic diagnostics. An empty vector means the plan is clean.
    pub fn diagnostics(&self) -> Vec<String> {
        let mut diagnostics = Vec::new();
        if self.stages.is_empty() {
            diagnostics.push("plan has no stages".to_string());
        }
        for (stage_index, stage) in self.stages.iter().enumerate() {
            let label = stage
                .name
                .clone()
                .unwrap_or_else(|| format!("stage {stage_index}"));
            if stage.tasks.is_empty() {
                diagnostics.push(format!("{label}: no tasks"));
            }
            for (task_index, task) in stage.tasks.iter().enumerate() {
                if task.task.trim().is_empty() {
                    diagnostics.push(format!("{label}, task {task_index}: empty task text"));
                }
                if task.agent.trim().is_empty() {
                    diagnostics.push(format!("{label}, task {task_index}: empty agent"));
                }
            }
        }
        diagnostics
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|stage| stage.tasks.len()).sum()
    }
}

/// A plan wrapped as an executable [`Program`].
pub struct PlanProgram {
    source: String,
    plan: Plan,
}

impl PlanProgram {
    pub fn from_source(source: impl Into<String>) -> Result<Self, FactoryError> {
        let source = source.into();
        let plan = Plan::parse(&source)?;
        Ok(Self { source, plan })
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }
}

#[async_trait]
impl Program for PlanProgram {
    fn describe(&self) -> String {
        let name = self.plan.name.as_deref().unwrap_or("unnamed plan");
        format!(
            "{name}: {} stage(s), {} task(s)",
            self.plan.stages.len(),
            self.plan.task_count()
        )
    }

    fn source(&self) -> Option<&str> {
        Some(&self.source)
    }

    async fn run(&self, factory: Arc<Factory>) -> anyhow::Result<serde_json::Value> {
        let mut stage_reports = Vec::new();
        for (stage_index, stage) in self.plan.stages.iter().enumerate() {
            let mut inputs = Vec::with_capacity(stage.tasks.len());
            for task in &stage.tasks {
                let handle = factory
                    .spawn(task.to_spawn_input(stage.name.clone()))
                    .await?;
                inputs.push(JoinInput::from(handle));
            }
            let outcomes = factory.join_all_settled(inputs).await;

            let mut failed = Vec::new();
            let mut task_reports = Vec::new();
            for outcome in &outcomes {
                if let JoinOutcome::Task(result) = outcome {
                    if !result.is_success() {
                        failed.push(result.task_id);
                    }
                    task_reports.push(serde_json::json!({
                        "task_id": result.task_id,
                        "agent": result.agent,
                        "exit_code": result.exit_code,
                        "text": result.text,
                    }));
                }
            }
            stage_reports.push(serde_json::json!({
                "stage": stage.name.clone().unwrap_or_else(|| stage_index.to_string()),
                "failed": failed,
                "tasks": task_reports,
            }));

            if stage.fail_fast && !failed.is_empty() {
                anyhow::bail!(
                    "stage {} failed: task(s) {failed:?} did not succeed",
                    stage.name.clone().unwrap_or_else(|| stage_index.to_string())
                );
            }
        }
        Ok(serde_json::json!({"stages": stage_reports}))
    }
}

/// Static preflight for plan sources: parse and report semantic
/// diagnostics without executing anything.
pub struct PlanPreflight;

impl Preflight for PlanPreflight {
    fn check(&self, source: &str) -> Result<(), String> {
        let plan = Plan::parse(source).map_err(|err| err.to_string())?;
        let diagnostics = plan.diagnostics();
        if diagnostics.is_empty() {
            Ok(())
        } else {
            Err(diagnostics.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    const TOML_PLAN: &str = r#"
name = "review"

[[stages]]
name = "analyze"
fail_fast = true

[[stages.tasks]]
agent = "reviewer"
task = "review the diff"

[[stages.tasks]]
agent = "tester"
task = "run the tests"

[[stages]]
name = "summarize"

[[stages.tasks]]
agent = "writer"
task = "summarize findings"
"#;

    #[test]
    fn parses_toml_plan() {
        let plan = Plan::parse(TOML_PLAN).expect("parse");
        assert_eq!(plan.stages.len(), 2);
        assert_eq!(plan.task_count(), 3);
        assert!(plan.stages[0].fail_fast);
        assert!(plan.diagnostics().is_empty());
    }

    #[test]
    fn parses_json_plan() {
        let source = r#"{"stages":[{"tasks":[{"agent":"a","task":"t"}]}]}"#;
        let plan = Plan::parse(source).expect("parse");
        assert_eq!(plan.task_count(), 1);
    }

    #[test]
    fn preflight_reports_semantic_diagnostics() {
        let source = r#"{"stages":[{"tasks":[{"agent":"","task":"  "}]},{"tasks":[]}]}"#;
        let diagnostic = PlanPreflight.check(source).expect_err("must report");
        assert!(diagnostic.contains("empty task text"));
        assert!(diagnostic.contains("empty agent"));
        assert!(diagnostic.contains("no tasks"));
    }

    #[test]
    fn preflight_rejects_unparseable_source() {
        assert!(PlanPreflight.check("definitely not a plan").is_err());
    }

    #[test]
    fn describe_names_the_plan() {
        let program = PlanProgram::from_source(TOML_PLAN).expect("parse");
        assert_eq!(program.describe(), "review: 2 stage(s), 3 task(s)");
    }
}
