//! Data model shared between the factory runtime, its launcher, and the
//! host-facing status surface.
//!
//! Everything in this crate is plain serde data with no I/O: execution
//! results, run records, the line-delimited child stream grammar, and
//! observability events.

pub mod observability;
pub mod result;
pub mod run;
pub mod stream;

pub use observability::LogEvent;
pub use observability::LogLevel;
pub use result::ExecutionResult;
pub use result::UsageStats;
pub use run::RunRecord;
pub use run::RunStatus;
pub use stream::StreamEvent;
