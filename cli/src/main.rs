//! `factory`: host-facing surface for the subagent orchestration
//! runtime: direct delegation, plan execution behind a confirmation
//! prompt, run status listing, and the external pid-file cancel utility.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use clap::Subcommand;
use factory_core::FactoryConfig;
use factory_core::PlanPreflight;
use factory_core::PlanProgram;
use factory_core::ProgramExecutor;
use factory_core::RunRegistry;
use factory_core::RunStore;
use factory_core::SpawnInput;
use factory_core::executor::AutoApprove;
use factory_core::executor::ConfirmationGate;
use factory_core::registry::sort_records;
use factory_protocol::RunRecord;
use factory_protocol::RunStatus;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "factory", about = "Spawn and orchestrate child agent processes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Delegate a single task to one child agent and print its result.
    Spawn {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long = "tool")]
        tools: Vec<String>,
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
    /// Execute an orchestration plan (TOML or JSON) as one run.
    Run {
        plan: PathBuf,
        /// Skip the interactive confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    /// List runs, active first.
    Status {
        /// Include completed runs.
        #[arg(long)]
        all: bool,
    },
    /// Signal every recorded child pid of a run to terminate.
    Cancel { run_id: String },
}

struct StdinConfirm;

#[async_trait]
impl ConfirmationGate for StdinConfirm {
    async fn confirm(&self, summary: &str) -> bool {
        eprintln!("About to execute {summary}. Proceed? [y/N]");
        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        if reader.read_line(&mut line).await.is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let home = FactoryConfig::default_home();
    let config = Arc::new(FactoryConfig::load(&home)?);
    let store = Arc::new(RunStore::new(config.runs_root.clone()));
    let registry = RunRegistry::new(store.clone());

    match cli.command {
        Command::Spawn {
            agent,
            task,
            model,
            prompt,
            tools,
            cwd,
        } => {
            let executor =
                ProgramExecutor::new(config, store, registry, Arc::new(AutoApprove));
            let result = executor
                .spawn_direct(SpawnInput {
                    agent,
                    task,
                    model,
                    prompt,
                    tools,
                    cwd,
                    ..SpawnInput::default()
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
        }
        Command::Run { plan, yes } => {
            let source = tokio::fs::read_to_string(&plan)
                .await
                .with_context(|| format!("failed to read plan {}", plan.display()))?;
            let program = PlanProgram::from_source(source)?;
            let gate: Arc<dyn ConfirmationGate> = if yes {
                Arc::new(AutoApprove)
            } else {
                Arc::new(StdinConfirm)
            };
            let executor = ProgramExecutor::new(config, store, registry, gate)
                .with_preflight(Arc::new(PlanPreflight));
            let abort = executor.registry().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, aborting active runs");
                    abort.abort_all();
                }
            });
            let outcome = executor.execute(&program).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "run_id": outcome.run_id,
                    "status": outcome.status.to_string(),
                    "value": outcome.value,
                    "error": outcome.error,
                }))?
            );
            if outcome.status != RunStatus::Done {
                std::process::exit(1);
            }
        }
        Command::Status { all } => {
            let mut records = store.read_run_snapshots().await;
            sort_records(&mut records);
            if !all {
                records.retain(|record| record.status == RunStatus::Running);
            }
            if records.is_empty() {
                println!("no runs");
            }
            for record in records {
                print!("{}", render_record(&record));
            }
        }
        Command::Cancel { run_id } => {
            let signalled = signal_run_children(&store, &run_id).await?;
            println!("signalled {signalled} child process(es) of run {run_id}");
        }
    }
    Ok(())
}

/// One run as a listing block: a header line, then one row per child.
fn render_record(record: &RunRecord) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<10} {}  started {}  tasks {}",
        record.status,
        record.run_id,
        record.started_at.format("%Y-%m-%d %H:%M:%S"),
        record.results.len(),
    );
    if let Some(error) = &record.error {
        let _ = writeln!(out, "    error: {error}");
    }
    for result in &record.results {
        let exit = if result.is_resolved() {
            format!("exit {}", result.exit_code)
        } else {
            "pending".to_string()
        };
        let _ = writeln!(out, "    task {:<4} {:<12} {exit}", result.task_id, result.agent);
    }
    out
}

/// External cancel path: reads every `<task_id>.pid` sidecar under the
/// run directory and delivers a graceful termination signal. Tolerates a
/// missing run directory and stale or half-written pid files.
async fn signal_run_children(store: &RunStore, run_id: &str) -> anyhow::Result<usize> {
    let run_dir = store.run_dir(run_id);
    let Ok(mut entries) = tokio::fs::read_dir(&run_dir).await else {
        return Ok(0);
    };
    let mut signalled = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("pid") {
            continue;
        }
        let Ok(contents) = tokio::fs::read_to_string(&path).await else {
            continue;
        };
        let Some(pid) = parse_pid(&contents) else {
            tracing::warn!("skipping malformed pid file {}", path.display());
            continue;
        };
        if send_term(pid) {
            signalled += 1;
        }
    }
    Ok(signalled)
}

fn parse_pid(contents: &str) -> Option<i32> {
    contents.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

#[cfg(unix)]
fn send_term(pid: i32) -> bool {
    // SAFETY: plain signal delivery; a vanished pid is reported by errno.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    rc == 0
}

#[cfg(not(unix))]
fn send_term(_pid: i32) -> bool {
    false
}
