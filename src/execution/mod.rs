pub mod context;
pub mod scheduler;

pub use context::{ExecutionContext, ExecutionOptions};
pub use scheduler::{run_network, RunSummary, Scheduler};
