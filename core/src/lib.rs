//! Subagent orchestration runtime.
//!
//! This crate lets one coordinating process spawn, track, and collect
//! results from independent child agent processes. Children are launched
//! detached so they survive the coordinator; all post-start knowledge
//! comes from polling their output and pid files. Orchestration programs
//! fan work out through a per-run [`Factory`] and are executed behind a
//! confirmation gate by the [`executor::ProgramExecutor`].

pub mod config;
pub mod error;
pub mod executor;
pub mod join;
pub mod launcher;
pub mod plan;
pub mod registry;
pub mod runtime;
pub mod store;

pub use config::FactoryConfig;
pub use error::FactoryError;
pub use executor::ProgramExecutor;
pub use join::JoinInput;
pub use join::JoinOutcome;
pub use plan::Plan;
pub use plan::PlanPreflight;
pub use plan::PlanProgram;
pub use registry::RunRegistry;
pub use runtime::Factory;
pub use runtime::SpawnInput;
pub use runtime::TaskHandle;
pub use store::RunStore;
